/// Binance trade stream feeding the live trade buffer
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::data::trade_buffer::ConcurrentTradeBuffer;
use crate::error::{CandleError, Result};
use crate::types::Print;

const WS_URL: &str = "wss://stream.binance.com:9443/ws";

#[derive(Debug, Deserialize)]
struct WsTrade {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Decode one `<symbol>@trade` message into `(symbol, print)`.
/// Anything else on the socket (subscription acks, other events) is `None`.
pub fn parse_trade_message(text: &str) -> Option<(String, Print)> {
    let trade: WsTrade = serde_json::from_str(text).ok()?;
    if trade.event != "trade" {
        return None;
    }
    let price = trade.price.parse::<f64>().ok().filter(|p| p.is_finite())?;
    let size = trade.quantity.parse::<f64>().ok().filter(|q| q.is_finite())?;
    Some((trade.symbol, Print::trade(trade.trade_time, price, size)))
}

pub struct TradeFeed {
    url: String,
    symbol: String,
    buffer: Arc<ConcurrentTradeBuffer>,
    is_connected: Arc<RwLock<bool>>,
}

impl TradeFeed {
    pub fn binance(symbol: &str, buffer: Arc<ConcurrentTradeBuffer>) -> Self {
        let url = format!("{}/{}@trade", WS_URL, symbol.to_lowercase());
        Self::with_url(url, symbol, buffer)
    }

    pub fn with_url(url: impl Into<String>, symbol: &str, buffer: Arc<ConcurrentTradeBuffer>) -> Self {
        TradeFeed {
            url: url.into(),
            symbol: symbol.to_uppercase(),
            buffer,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    /// Connect and spawn the reader task. The buffer is marked complete from
    /// the moment the socket opens.
    pub async fn connect(&self) -> Result<JoinHandle<()>> {
        info!("🔌 Connecting to trade stream {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| CandleError::exchange(None, format!("websocket connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        self.buffer
            .mark_coverage(&self.symbol, Utc::now().timestamp_millis())
            .await;
        {
            let mut connected = self.is_connected.write().await;
            *connected = true;
        }
        info!("✅ Trade stream connected for {}", self.symbol);

        let buffer = Arc::clone(&self.buffer);
        let is_connected = Arc::clone(&self.is_connected);
        let symbol = self.symbol.clone();

        let handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_trade_message(&text) {
                        Some((trade_symbol, print)) if trade_symbol == symbol => {
                            buffer.push(&symbol, print).await;
                        }
                        Some((other, _)) => debug!("Ignoring trade for {}", other),
                        None => debug!("Ignoring stream message: {}", text),
                    },
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to answer ping: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        warn!("Trade stream closed by server");
                        break;
                    }
                    Err(e) => {
                        error!("Trade stream error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // The tape has a hole from here on; drop it so it is not trusted.
            buffer.clear(&symbol).await;
            let mut connected = is_connected.write().await;
            *connected = false;
            warn!("Trade stream reader task ended for {}", symbol);
        });

        Ok(handle)
    }
}
