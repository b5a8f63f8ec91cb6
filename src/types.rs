/// Core type definitions for candle ingestion
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CandleError, Result};

/// Sentinel price meaning "no print observed yet in this period".
pub const NO_DATA: f64 = -1.0;

/// Exchange families with a supported wire dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Oanda,
    Binance,
    Coinbase,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Oanda => "oanda",
            ExchangeKind::Binance => "binance",
            ExchangeKind::Coinbase => "coinbase",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle duration in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Granularity(u32);

impl Granularity {
    pub const fn from_secs(secs: u32) -> Self {
        Granularity(secs)
    }

    pub fn as_secs(&self) -> i64 {
        self.0 as i64
    }

    /// Start of the period containing `epoch_secs`
    pub fn align_down(&self, epoch_secs: i64) -> i64 {
        let secs = self.as_secs();
        epoch_secs.div_euclid(secs) * secs
    }

    pub fn is_aligned(&self, epoch_secs: i64) -> bool {
        epoch_secs.rem_euclid(self.as_secs()) == 0
    }

    /// Short chart label such as `5m`, `4h`, `1d` or `1w`
    pub fn label(&self) -> String {
        let secs = self.0;
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m", secs / 60)
        } else if secs < 86_400 {
            format!("{}h", secs / 3600)
        } else if secs < 604_800 {
            format!("{}d", secs / 86_400)
        } else if secs < 2_592_000 {
            format!("{}w", secs / 604_800)
        } else {
            format!("{}mo", secs / 2_592_000)
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Ordered, immutable set of supported durations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranularitySet(BTreeSet<Granularity>);

impl GranularitySet {
    pub fn from_secs(secs: &[u32]) -> Self {
        GranularitySet(secs.iter().copied().map(Granularity::from_secs).collect())
    }

    pub fn contains(&self, granularity: Granularity) -> bool {
        self.0.contains(&granularity)
    }

    pub fn iter(&self) -> impl Iterator<Item = Granularity> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn finest(&self) -> Option<Granularity> {
        self.0.iter().next().copied()
    }

    /// Supported duration nearest to `ideal_secs`; ties go to the finer one.
    pub fn closest_to(&self, ideal_secs: i64) -> Option<Granularity> {
        self.0
            .iter()
            .copied()
            .min_by_key(|g| ((g.as_secs() - ideal_secs).abs(), g.as_secs()))
    }
}

/// Completed (or placeholder) OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CandleRecord")]
pub struct Candle {
    open_time: i64,
    granularity: Granularity,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    volume_weighted_average_price: Option<f64>,
    is_placeholder: bool,
}

impl Candle {
    /// Build a candle from exchange data, enforcing OHLC invariants.
    pub fn new(
        open_time: i64,
        granularity: Granularity,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self> {
        if granularity.as_secs() <= 0 {
            return Err(CandleError::parse(
                "candle",
                &format!("zero granularity at {}", open_time),
            ));
        }
        let values = [open, high, low, close, volume];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CandleError::parse(
                "candle",
                &format!("non-finite value at {}: {:?}", open_time, values),
            ));
        }
        if !granularity.is_aligned(open_time) {
            return Err(CandleError::parse(
                "candle",
                &format!("open time {} not aligned to {}", open_time, granularity),
            ));
        }
        if low > open.min(close) || high < open.max(close) || low > high {
            return Err(CandleError::parse(
                "candle",
                &format!(
                    "OHLC out of order at {}: o={} h={} l={} c={}",
                    open_time, open, high, low, close
                ),
            ));
        }
        if volume < 0.0 {
            return Err(CandleError::parse(
                "candle",
                &format!("negative volume {} at {}", volume, open_time),
            ));
        }

        Ok(Candle {
            open_time,
            granularity,
            open,
            high,
            low,
            close,
            volume,
            volume_weighted_average_price: None,
            is_placeholder: false,
        })
    }

    /// Synthetic candle keeping the time axis contiguous across a gap
    pub fn placeholder(open_time: i64, granularity: Granularity, last_close: f64) -> Self {
        Candle {
            open_time,
            granularity,
            open: last_close,
            high: last_close,
            low: last_close,
            close: last_close,
            volume: 0.0,
            volume_weighted_average_price: None,
            is_placeholder: true,
        }
    }

    pub fn with_vwap(mut self, vwap: Option<f64>) -> Self {
        self.volume_weighted_average_price = vwap.filter(|v| v.is_finite() && *v > 0.0);
        self
    }

    pub fn open_time(&self) -> i64 {
        self.open_time
    }

    pub fn close_time(&self) -> i64 {
        self.open_time + self.granularity.as_secs()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn open(&self) -> f64 {
        self.open
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn close(&self) -> f64 {
        self.close
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn vwap(&self) -> Option<f64> {
        self.volume_weighted_average_price
    }

    pub fn is_placeholder(&self) -> bool {
        self.is_placeholder
    }
}

/// Serialized form of a candle; deserialization goes back through the same
/// checks as exchange data
#[derive(Deserialize)]
struct CandleRecord {
    open_time: i64,
    granularity: Granularity,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    volume_weighted_average_price: Option<f64>,
    #[serde(default)]
    is_placeholder: bool,
}

impl TryFrom<CandleRecord> for Candle {
    type Error = CandleError;

    fn try_from(record: CandleRecord) -> Result<Self> {
        let candle = Candle::new(
            record.open_time,
            record.granularity,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
        )?;
        if !record.is_placeholder {
            return Ok(candle.with_vwap(record.volume_weighted_average_price));
        }

        let flat = [candle.open, candle.high, candle.low].iter().all(|p| *p == candle.close);
        if !flat || candle.volume != 0.0 {
            return Err(CandleError::parse(
                "candle",
                &format!("placeholder at {} carries trading data", record.open_time),
            ));
        }
        Ok(Candle::placeholder(candle.open_time, candle.granularity, candle.close))
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} O:{:.5} H:{:.5} L:{:.5} C:{:.5} V:{:.4}{}",
            self.open_time,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            if self.is_placeholder { " (placeholder)" } else { "" }
        )
    }
}

/// Snapshot of the still-open period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InProgressCandle {
    pub open_time: i64,
    pub granularity: Granularity,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub last_trade_price: f64,
    pub as_of: DateTime<Utc>,
}

impl InProgressCandle {
    /// Period with no observed prints
    pub fn empty(open_time: i64, granularity: Granularity, as_of: DateTime<Utc>) -> Self {
        InProgressCandle {
            open_time,
            granularity,
            open: NO_DATA,
            high: NO_DATA,
            low: NO_DATA,
            close: NO_DATA,
            volume: 0.0,
            last_trade_price: NO_DATA,
            as_of,
        }
    }

    pub fn has_data(&self) -> bool {
        self.open != NO_DATA
    }

    pub fn close_time(&self) -> i64 {
        self.open_time + self.granularity.as_secs()
    }
}

/// One observed trade, quote or sub-period candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Print {
    pub time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub size: f64,
}

impl Print {
    pub fn trade(time_ms: i64, price: f64, size: f64) -> Self {
        Print {
            time_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            size,
        }
    }

    pub fn from_candle(candle: &Candle) -> Self {
        Print {
            time_ms: candle.open_time() * 1000,
            open: candle.open(),
            high: candle.high(),
            low: candle.low(),
            close: candle.close(),
            size: candle.volume(),
        }
    }
}
