/// Main entry point for the candle feed
/// Usage: cargo run --release -- [config.toml]
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candlefeed::{
    config::{load_config, AppConfig},
    data::{CandleStream, ConcurrentTradeBuffer},
    exchange::TradeFeed,
};

/// Roughly an hour of a busy Binance pair
const TRADE_BUFFER_CAPACITY: usize = 200_000;

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    init_logging(&config);

    info!("🚀 candlefeed starting");
    info!(
        "   {} {} every {}",
        config.exchange.kind, config.exchange.instrument, config.exchange.granularity
    );

    let mut stream = CandleStream::new(config.supplier()?);

    // Optional live trade stream
    let mut feed_task = None;
    if config.live.use_trade_feed {
        let buffer = Arc::new(ConcurrentTradeBuffer::new(TRADE_BUFFER_CAPACITY));
        let feed = TradeFeed::binance(&config.exchange.instrument, Arc::clone(&buffer));
        match feed.connect().await {
            Ok(handle) => {
                feed_task = Some(handle);
                stream = stream.with_live_buffer(buffer);
            }
            Err(e) => warn!("⚠️  Trade feed unavailable, polling instead: {}", e),
        }
    }

    // Backfill
    let outcome = stream.historical_candles(config.backfill.count).await?;
    info!(
        "📊 {} candles loaded ({:?})",
        outcome.candles.len(),
        outcome.status
    );
    if let Some(last) = outcome.candles.last() {
        info!("   last closed: {}", last);
    }

    // Live polling until Ctrl-C
    let mut ticker = tokio::time::interval(Duration::from_secs(config.live.poll_interval_secs));
    let mut current_period = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match stream.current_candle().await {
                    Ok(candle) => {
                        if current_period.is_some_and(|open| open != candle.open_time) {
                            match stream.historical_candles(1).await {
                                Ok(closed) => {
                                    if let Some(last) = closed.candles.last() {
                                        info!("🕯️  closed: {}", last);
                                    }
                                }
                                Err(e) => warn!("⚠️  Could not load the closed candle: {}", e),
                            }
                        }
                        current_period = Some(candle.open_time);

                        if candle.has_data() {
                            info!(
                                "⏱️  {} O:{:.5} H:{:.5} L:{:.5} C:{:.5} V:{:.4}",
                                candle.open_time,
                                candle.open,
                                candle.high,
                                candle.low,
                                candle.close,
                                candle.volume
                            );
                        } else {
                            info!("⏱️  {} no prints yet", candle.open_time);
                        }
                    }
                    Err(e) => error!("❌ Current candle unavailable: {} ({})", e, e.error_code()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl-C received, shutting down");
                break;
            }
        }
    }

    if let Some(handle) = feed_task {
        handle.abort();
    }
    info!("👋 candlefeed stopped (session {})", stream.session_id());
    Ok(())
}
