/// Oanda v20 instrument candles
use serde_json::Value;

use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, RawResponse};
use crate::exchange::dialect::Dialect;
use crate::exchange::wire;
use crate::types::{Candle, ExchangeKind, Granularity};
use crate::utils::epoch_to_rfc3339;

/// 2005-01-01, the start of Oanda's served candle history
const EARLIEST_DATA: i64 = 1_104_537_600;
const MAX_COUNT: usize = 5000;

pub struct OandaDialect;

/// Oanda granularity code: `S5`, `M15`, `H4`, `D`, `W`
pub fn granularity_code(granularity: Granularity) -> Result<String> {
    let secs = granularity.as_secs();
    let code = match secs {
        s if s < 60 => format!("S{}", s),
        s if s < 3600 => format!("M{}", s / 60),
        s if s < 86_400 => format!("H{}", s / 3600),
        86_400 => "D".to_string(),
        604_800 => "W".to_string(),
        _ => {
            return Err(CandleError::config(format!(
                "no Oanda granularity code for {}s",
                secs
            )))
        }
    };
    Ok(code)
}

fn candles_path(instrument: &str) -> String {
    format!("/v3/instruments/{}/candles", instrument)
}

/// Align daily and weekly candles to UTC midnight / Thursday so every
/// open time sits on an epoch multiple of the granularity.
fn aligned(request: ApiRequest) -> ApiRequest {
    request
        .param("price", "M")
        .param("dailyAlignment", 0)
        .param("alignmentTimezone", "UTC")
        .param("weeklyAlignment", "Thursday")
}

/// Requests always ask for `price=M`, so a record without `mid` is malformed.
fn decode_one(granularity: Granularity, record: &Value) -> Result<(Candle, bool)> {
    let context = "oanda candle";
    let open_time = wire::epoch_secs(wire::field(record, "time", context)?, context)?;
    let complete = record.get("complete").and_then(Value::as_bool).unwrap_or(true);

    let prices = record
        .get("mid")
        .filter(|mid| mid.is_object())
        .ok_or_else(|| CandleError::parse("oanda candle: missing mid", &record.to_string()))?;

    let candle = Candle::new(
        open_time,
        granularity,
        wire::decimal(wire::field(prices, "o", context)?, context)?,
        wire::decimal(wire::field(prices, "h", context)?, context)?,
        wire::decimal(wire::field(prices, "l", context)?, context)?,
        wire::decimal(wire::field(prices, "c", context)?, context)?,
        wire::decimal(wire::field(record, "volume", context)?, context)?,
    )?;
    Ok((candle, complete))
}

impl Dialect for OandaDialect {
    fn exchange(&self) -> ExchangeKind {
        ExchangeKind::Oanda
    }

    fn earliest_data(&self) -> i64 {
        EARLIEST_DATA
    }

    fn max_page_size(&self) -> usize {
        MAX_COUNT
    }

    fn candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        end_exclusive: i64,
        limit: usize,
    ) -> Result<ApiRequest> {
        Ok(aligned(ApiRequest::get(candles_path(instrument)))
            .param("granularity", granularity_code(granularity)?)
            .param("to", epoch_to_rfc3339(end_exclusive)?)
            .param("count", limit.clamp(1, MAX_COUNT)))
    }

    fn sub_candle_request(
        &self,
        instrument: &str,
        granularity: Granularity,
        from_secs: i64,
        to_secs: i64,
    ) -> Result<ApiRequest> {
        let span = ((to_secs - from_secs) / granularity.as_secs()).max(0) as usize + 1;
        Ok(aligned(ApiRequest::get(candles_path(instrument)))
            .param("granularity", granularity_code(granularity)?)
            .param("from", epoch_to_rfc3339(from_secs)?)
            .param("count", span.clamp(1, MAX_COUNT)))
    }

    fn decode_candles(
        &self,
        granularity: Granularity,
        response: &RawResponse,
        include_incomplete: bool,
    ) -> Result<Vec<Candle>> {
        let records = wire::array(&response.body, Some("candles"), "oanda candles")?;
        let mut candles = Vec::with_capacity(records.len());
        for record in records {
            let (candle, complete) = decode_one(granularity, record)?;
            if complete || include_incomplete {
                candles.push(candle);
            }
        }
        candles.sort_by_key(Candle::open_time);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const H1: Granularity = Granularity::from_secs(3600);

    #[test]
    fn test_granularity_codes() {
        assert_eq!(granularity_code(Granularity::from_secs(5)).unwrap(), "S5");
        assert_eq!(granularity_code(Granularity::from_secs(900)).unwrap(), "M15");
        assert_eq!(granularity_code(Granularity::from_secs(14_400)).unwrap(), "H4");
        assert_eq!(granularity_code(Granularity::from_secs(86_400)).unwrap(), "D");
        assert_eq!(granularity_code(Granularity::from_secs(604_800)).unwrap(), "W");
        assert!(granularity_code(Granularity::from_secs(172_800)).is_err());
    }

    #[test]
    fn test_candle_request() {
        let request = OandaDialect
            .candle_request("EUR_USD", H1, 1_476_716_400, 200)
            .unwrap();
        assert_eq!(request.path, "/v3/instruments/EUR_USD/candles");
        assert_eq!(request.query_value("granularity"), Some("H1"));
        assert_eq!(request.query_value("to"), Some("2016-10-17T15:00:00Z"));
        assert_eq!(request.query_value("count"), Some("200"));
        assert_eq!(request.query_value("price"), Some("M"));
    }

    #[test]
    fn test_decode_drops_incomplete() {
        let response = RawResponse::new(json!({
            "instrument": "EUR_USD",
            "granularity": "H1",
            "candles": [
                {"complete": true, "volume": 1520, "time": "2016-10-17T14:00:00.000000000Z",
                 "mid": {"o": "1.09910", "h": "1.10020", "l": "1.09850", "c": "1.09990"}},
                {"complete": true, "volume": 980, "time": "2016-10-17T13:00:00.000000000Z",
                 "mid": {"o": "1.09800", "h": "1.09950", "l": "1.09790", "c": "1.09910"}},
                {"complete": false, "volume": 12, "time": "2016-10-17T15:00:00.000000000Z",
                 "mid": {"o": "1.09990", "h": "1.10000", "l": "1.09980", "c": "1.09995"}}
            ]
        }));

        let candles = OandaDialect.decode_candles(H1, &response, false).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time(), 1_476_709_200);
        assert_eq!(candles[1].open_time(), 1_476_712_800);
        assert_eq!(candles[1].close(), 1.0999);
        assert_eq!(candles[1].volume(), 1520.0);

        let all = OandaDialect.decode_candles(H1, &response, true).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_decode_rejects_malformed_price() {
        let response = RawResponse::new(json!({
            "candles": [{"complete": true, "volume": 1, "time": "2016-10-17T14:00:00Z",
                         "mid": {"o": "x", "h": "1", "l": "1", "c": "1"}}]
        }));
        assert!(matches!(
            OandaDialect.decode_candles(H1, &response, false),
            Err(CandleError::Parse { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_record_without_mid() {
        let response = RawResponse::new(json!({
            "candles": [
                {"complete": true, "volume": 10, "time": "2016-10-17T12:00:00Z",
                 "mid": {"o": "1.1", "h": "1.2", "l": "1.0", "c": "1.1"}},
                {"complete": true, "volume": 10, "time": "2016-10-17T13:00:00Z"},
                {"complete": true, "volume": 10, "time": "2016-10-17T14:00:00Z",
                 "mid": {"o": "1.1", "h": "1.2", "l": "1.0", "c": "1.1"}}
            ]
        }));
        match OandaDialect.decode_candles(H1, &response, false) {
            Err(CandleError::Parse { context, .. }) => assert!(context.contains("missing mid")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_trade_tape_unavailable() {
        assert!(!OandaDialect.supports_trades());
        assert!(OandaDialect.trade_request("EUR_USD", 0, 1, None).is_err());
    }
}
