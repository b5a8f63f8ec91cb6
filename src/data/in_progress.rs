/// Rebuild the still-open candle from an unordered feed of prints
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{Granularity, InProgressCandle, Print};

/// Running OHLCV for one period, seeded by the first print seen
#[derive(Debug, Clone)]
struct PartialCandle {
    open_at_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close_at_ms: i64,
    close: f64,
    volume: f64,
    print_count: usize,
}

impl PartialCandle {
    fn new(print: &Print) -> Self {
        PartialCandle {
            open_at_ms: print.time_ms,
            open: print.open,
            high: print.high,
            low: print.low,
            close_at_ms: print.time_ms,
            close: print.close,
            volume: print.size,
            print_count: 1,
        }
    }

    fn update(&mut self, print: &Print) {
        // Strictly earlier replaces the open, so equal timestamps keep the first seen
        if print.time_ms < self.open_at_ms {
            self.open_at_ms = print.time_ms;
            self.open = print.open;
        }
        // Equal timestamps move the close to the last seen
        if print.time_ms >= self.close_at_ms {
            self.close_at_ms = print.time_ms;
            self.close = print.close;
        }
        self.high = self.high.max(print.high);
        self.low = self.low.min(print.low);
        self.volume += print.size;
        self.print_count += 1;
    }

    fn to_candle(&self, open_time: i64, granularity: Granularity, as_of: DateTime<Utc>) -> InProgressCandle {
        InProgressCandle {
            open_time,
            granularity,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            last_trade_price: self.close,
            as_of,
        }
    }
}

/// Fold `prints` falling inside `[period_start, min(now, period_end))` into
/// one in-progress candle. Input order does not matter: open comes from the
/// earliest timestamp and close from the latest. With no print in the window
/// every price is the no-data sentinel.
pub fn reconstruct(
    prints: &[Print],
    period_start: i64,
    granularity: Granularity,
    now: DateTime<Utc>,
) -> InProgressCandle {
    let start_ms = period_start * 1000;
    let end_ms = now
        .timestamp_millis()
        .min((period_start + granularity.as_secs()) * 1000);

    let mut partial: Option<PartialCandle> = None;
    let mut ignored = 0usize;
    for print in prints {
        if print.time_ms < start_ms || print.time_ms >= end_ms {
            ignored += 1;
            continue;
        }
        match partial.as_mut() {
            Some(candle) => candle.update(print),
            None => partial = Some(PartialCandle::new(print)),
        }
    }

    match partial {
        Some(candle) => {
            debug!(
                "In-progress {} @ {} from {} prints ({} outside window)",
                granularity, period_start, candle.print_count, ignored
            );
            candle.to_candle(period_start, granularity, now)
        }
        None => InProgressCandle::empty(period_start, granularity, now),
    }
}
