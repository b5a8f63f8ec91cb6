/// Binance spot klines and aggregate trades
use serde_json::Value;

use crate::data::cursor::CursorToken;
use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, RawResponse};
use crate::exchange::dialect::{Dialect, TradePage};
use crate::exchange::wire;
use crate::types::{Candle, ExchangeKind, Granularity, Print};

/// 2017-07-14, first spot kline
const EARLIEST_DATA: i64 = 1_500_004_800;
const MAX_KLINES: usize = 1000;
const MAX_TRADES: usize = 1000;

pub struct BinanceDialect;

/// Binance kline interval: `1m`, `15m`, `4h`, `1d`
pub fn interval_code(granularity: Granularity) -> Result<String> {
    let secs = granularity.as_secs();
    let code = match secs {
        s if s >= 60 && s < 3600 && s % 60 == 0 => format!("{}m", s / 60),
        s if s >= 3600 && s < 86_400 && s % 3600 == 0 => format!("{}h", s / 3600),
        86_400 => "1d".to_string(),
        _ => {
            return Err(CandleError::config(format!(
                "no Binance interval for {}s",
                secs
            )))
        }
    };
    Ok(code)
}

/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, ...]`
fn decode_kline(granularity: Granularity, record: &Value) -> Result<Candle> {
    let context = "binance kline";
    let open_time = wire::epoch_secs(wire::column(record, 0, context)?, context)?;
    let volume = wire::decimal(wire::column(record, 5, context)?, context)?;
    let vwap = match record.get(7) {
        Some(quote) if volume > 0.0 => Some(wire::decimal(quote, context)? / volume),
        _ => None,
    };

    let candle = Candle::new(
        open_time,
        granularity,
        wire::decimal(wire::column(record, 1, context)?, context)?,
        wire::decimal(wire::column(record, 2, context)?, context)?,
        wire::decimal(wire::column(record, 3, context)?, context)?,
        wire::decimal(wire::column(record, 4, context)?, context)?,
        volume,
    )?;
    Ok(candle.with_vwap(vwap))
}

impl Dialect for BinanceDialect {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    fn earliest_data(&self) -> i64 {
        EARLIEST_DATA
    }

    fn max_page_size(&self) -> usize {
        MAX_KLINES
    }

    fn candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        end_exclusive: i64,
        limit: usize,
    ) -> Result<ApiRequest> {
        Ok(ApiRequest::get("/api/v3/klines")
            .param("symbol", instrument)
            .param("interval", interval_code(granularity)?)
            .param("endTime", end_exclusive * 1000 - 1)
            .param("limit", limit.clamp(1, MAX_KLINES)))
    }

    fn sub_candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        from_secs: i64,
        to_secs: i64,
    ) -> Result<ApiRequest> {
        Ok(ApiRequest::get("/api/v3/klines")
            .param("symbol", instrument)
            .param("interval", interval_code(granularity)?)
            .param("startTime", from_secs * 1000)
            .param("endTime", to_secs * 1000 - 1)
            .param("limit", MAX_KLINES))
    }

    fn decode_candles(
        &self,
        granularity: Granularity,
        response: &RawResponse,
        _include_incomplete: bool,
    ) -> Result<Vec<Candle>> {
        let records = wire::array(&response.body, None, "binance klines")?;
        let mut candles = records
            .iter()
            .map(|record| decode_kline(granularity, record))
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
        window_start_ms: i64,
        now_ms: i64,
        cursor: Option<&CursorToken>,
    ) -> Result<ApiRequest> {
        let request = ApiRequest::get("/api/v3/aggTrades")
            .param("symbol", instrument)
            .param("limit", MAX_TRADES);
        match cursor {
            None => Ok(request
                .param("startTime", window_start_ms)
                .param("endTime", now_ms - 1)),
            Some(CursorToken::Sequence(from_id)) => Ok(request.param("fromId", from_id)),
            Some(other) => Err(CandleError::config(format!(
                "unexpected Binance trade cursor {:?}",
                other
            ))),
        }
    }

    fn decode_trades(
        &self,
        response: &RawResponse,
        window_start_ms: i64,
        now_ms: i64,
    ) -> Result<TradePage> {
        let context = "binance aggTrade";
        let records = wire::array(&response.body, None, "binance aggTrades")?;

        let mut prints = Vec::with_capacity(records.len());
        let mut last_id = None;
        let mut last_time = i64::MIN;
        for record in records {
            // `T` is always epoch milliseconds
            let time_ms = wire::integer(wire::field(record, "T", context)?, context)?;
            let price = wire::decimal(wire::field(record, "p", context)?, context)?;
            let size = wire::decimal(wire::field(record, "q", context)?, context)?;
            let id = wire::integer(wire::field(record, "a", context)?, context)?;

            last_id = Some(last_id.map_or(id, |prev: i64| prev.max(id)));
            last_time = last_time.max(time_ms);
            if time_ms >= window_start_ms && time_ms < now_ms {
                prints.push(Print::trade(time_ms, price, size));
            }
        }

        let next = match last_id {
            Some(id) if records.len() >= MAX_TRADES && last_time < now_ms => {
                Some(CursorToken::Sequence(id + 1))
            }
            _ => None,
        };

        Ok(TradePage { prints, next })
    }
}
