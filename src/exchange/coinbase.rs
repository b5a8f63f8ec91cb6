/// Coinbase Exchange product candles and trades
use serde_json::Value;

use crate::data::cursor::CursorToken;
use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, RawResponse};
use crate::exchange::dialect::{Dialect, TradePage};
use crate::exchange::wire;
use crate::types::{Candle, ExchangeKind, Granularity, Print};
use crate::utils::epoch_to_rfc3339;

/// 2015-01-24, first BTC-USD candle
const EARLIEST_DATA: i64 = 1_422_144_000;
const MAX_CANDLES: usize = 300;
const MAX_TRADES: usize = 1000;

pub struct CoinbaseDialect;

fn candles_path(instrument: &str) -> String {
    format!("/products/{}/candles", instrument)
}

/// `[time, low, high, open, close, volume]`
fn decode_bucket(granularity: Granularity, record: &Value) -> Result<Candle> {
    let context = "coinbase candle";
    Candle::new(
        wire::epoch_secs(wire::column(record, 0, context)?, context)?,
        granularity,
        wire::decimal(wire::column(record, 3, context)?, context)?,
        wire::decimal(wire::column(record, 2, context)?, context)?,
        wire::decimal(wire::column(record, 1, context)?, context)?,
        wire::decimal(wire::column(record, 4, context)?, context)?,
        wire::decimal(wire::column(record, 5, context)?, context)?,
    )
}

impl Dialect for CoinbaseDialect {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Coinbase
    }

    fn earliest_data(&self) -> i64 {
        EARLIEST_DATA
    }

    fn max_page_size(&self) -> usize {
        MAX_CANDLES
    }

    fn candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        end_exclusive: i64,
        limit: usize,
    ) -> Result<ApiRequest> {
        let secs = granularity.as_secs();
        let limit = limit.clamp(1, MAX_CANDLES) as i64;
        // Both bounds are inclusive open times on Coinbase
        let start = end_exclusive - limit * secs;
        let end = end_exclusive - secs;
        Ok(ApiRequest::get(candles_path(instrument))
            .param("granularity", secs)
            .param("start", epoch_to_rfc3339(start)?)
            .param("end", epoch_to_rfc3339(end)?))
    }

    fn sub_candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        from_secs: i64,
        to_secs: i64,
    ) -> Result<ApiRequest> {
        Ok(ApiRequest::get(candles_path(instrument))
            .param("granularity", granularity.as_secs())
            .param("start", epoch_to_rfc3339(from_secs)?)
            .param("end", epoch_to_rfc3339(to_secs)?))
    }

    fn decode_candles(
        &self,
        granularity: Granularity,
        response: &RawResponse,
        _include_incomplete: bool,
    ) -> Result<Vec<Candle>> {
        let records = wire::array(&response.body, None, "coinbase candles")?;
        let mut candles = records
            .iter()
            .map(|record| decode_bucket(granularity, record))
            .collect::<Result<Vec<_>>>()?;
        candles.sort_by_key(Candle::open_time);
        Ok(candles)
    }

    fn supports_trades(&self) -> bool {
        true
    }

    fn trade_request(
        &self,
        instrument: &str,
        _window_start_ms: i64,
        _now_ms: i64,
        cursor: Option<&CursorToken>,
    ) -> Result<ApiRequest> {
        let request = ApiRequest::get(format!("/products/{}/trades", instrument))
            .param("limit", MAX_TRADES);
        match cursor {
            None => Ok(request),
            Some(CursorToken::After(after)) => Ok(request.param("after", after)),
            Some(other) => Err(CandleError::config(format!(
                "unexpected Coinbase trade cursor {:?}",
                other
            ))),
        }
    }

    /// Trades arrive newest first; paging walks backwards until the oldest
    /// trade on a page predates the window.
    fn decode_trades(
        &self,
        response: &RawResponse,
        window_start_ms: i64,
        now_ms: i64,
    ) -> Result<TradePage> {
        let context = "coinbase trade";
        let records = wire::array(&response.body, None, "coinbase trades")?;

        let mut prints = Vec::with_capacity(records.len());
        let mut oldest = i64::MAX;
        for record in records {
            let time_ms = wire::epoch_ms(wire::field(record, "time", context)?, context)?;
            let price = wire::decimal(wire::field(record, "price", context)?, context)?;
            let size = wire::decimal(wire::field(record, "size", context)?, context)?;

            oldest = oldest.min(time_ms);
            if time_ms >= window_start_ms && time_ms < now_ms {
                prints.push(Print::trade(time_ms, price, size));
            }
        }

        let needs_more = !records.is_empty() && oldest >= window_start_ms;
        let next = if needs_more {
            match &response.continuation {
                Some(after) => Some(CursorToken::After(after.clone())),
                None => {
                    return Err(CandleError::parse(
                        "coinbase trades: missing cb-after header",
                        &format!("{} trades, oldest at {}", records.len(), oldest),
                    ))
                }
            }
        } else {
            None
        };

        Ok(TradePage { prints, next })
    }
}
