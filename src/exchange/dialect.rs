/// Per-exchange request building and payload decoding
use std::sync::Arc;

use crate::data::cursor::CursorToken;
use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, RawResponse};
use crate::exchange::granularity::{self, sub_period_granularity};
use crate::exchange::{binance::BinanceDialect, coinbase::CoinbaseDialect, oanda::OandaDialect};
use crate::types::{Candle, ExchangeKind, Granularity, GranularitySet, Print};

/// Longest in-progress window rebuilt from the raw trade tape; longer
/// windows use sub-period candles.
pub const TRADE_WINDOW_SECS: i64 = 3600;

/// How the in-progress period is rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InProgressPlan {
    Trades,
    SubCandles(Granularity),
}

/// One page of the trade tape and the cursor for the next one
#[derive(Debug, Clone, PartialEq)]
pub struct TradePage {
    pub prints: Vec<Print>,
    pub next: Option<CursorToken>,
}

pub trait Dialect: Send + Sync {
    fn exchange(&self) -> ExchangeKind;

    /// Earliest epoch second the exchange serves history for
    fn earliest_data(&self) -> i64;

    /// Most candles one historical request may return
    fn max_page_size(&self) -> usize;

    fn supported_granularities(&self) -> GranularitySet {
        granularity::supported_granularities(self.exchange())
    }

    /// Up to `limit` candles opening before `end_exclusive`, newest first
    /// from the exchange's point of view.
    fn candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        end_exclusive: i64,
        limit: usize,
    ) -> Result<ApiRequest>;

    /// Sub-period candles covering `[from_secs, to_secs)`
    fn sub_candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        from_secs: i64,
        to_secs: i64,
    ) -> Result<ApiRequest>;

    /// Decode a candle page in ascending `open_time` order. Candles the
    /// exchange flags as still forming are dropped unless
    /// `include_incomplete` is set.
    fn decode_candles(
        &self,
        granularity: Granularity,
        response: &RawResponse,
        include_incomplete: bool,
    ) -> Result<Vec<Candle>>;

    fn supports_trades(&self) -> bool {
        false
    }

    fn trade_request(
        &self,
        _instrument: &str,
        _window_start_ms: i64,
        _now_ms: i64,
        _cursor: Option<&CursorToken>,
    ) -> Result<ApiRequest> {
        Err(no_trade_tape(self.exchange()))
    }

    /// Decode one trade page, keeping prints inside `[window_start_ms, now_ms)`
    fn decode_trades(
        &self,
        _response: &RawResponse,
        _window_start_ms: i64,
        _now_ms: i64,
    ) -> Result<TradePage> {
        Err(no_trade_tape(self.exchange()))
    }

    fn in_progress_plan(&self, period: Granularity, elapsed_secs: i64) -> InProgressPlan {
        if self.supports_trades() && elapsed_secs <= TRADE_WINDOW_SECS {
            return InProgressPlan::Trades;
        }
        self.sub_candle_plan(period, elapsed_secs)
    }

    fn sub_candle_plan(&self, period: Granularity, elapsed_secs: i64) -> InProgressPlan {
        let sub = sub_period_granularity(self.exchange(), period, elapsed_secs).unwrap_or(period);
        InProgressPlan::SubCandles(sub)
    }
}

fn no_trade_tape(exchange: ExchangeKind) -> CandleError {
    CandleError::config(format!("{} exposes no public trade tape", exchange))
}

pub fn dialect_for(exchange: ExchangeKind) -> Arc<dyn Dialect> {
    match exchange {
        ExchangeKind::Oanda => Arc::new(OandaDialect),
        ExchangeKind::Binance => Arc::new(BinanceDialect),
        ExchangeKind::Coinbase => Arc::new(CoinbaseDialect),
    }
}
