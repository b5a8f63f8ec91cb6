/// Deduplicated, gap-filled candle series built up page by page
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::types::{Candle, Granularity};

pub struct SeriesBuilder {
    granularity: Granularity,
    candles: BTreeMap<i64, Candle>,
}

impl SeriesBuilder {
    pub fn new(granularity: Granularity) -> Self {
        SeriesBuilder {
            granularity,
            candles: BTreeMap::new(),
        }
    }

    /// Merge a fetched page. A candle whose `open_time` is already present
    /// replaces the stored one: the latest fetch wins.
    pub fn insert_page(&mut self, page: &[Candle]) {
        let mut replaced = 0;
        for candle in page {
            if candle.granularity() != self.granularity {
                warn!(
                    "Dropping {} candle at {} from a {} series",
                    candle.granularity(),
                    candle.open_time(),
                    self.granularity
                );
                continue;
            }
            if self.candles.insert(candle.open_time(), candle.clone()).is_some() {
                replaced += 1;
            }
        }
        if replaced > 0 {
            debug!("{} duplicate candles replaced by newer copies", replaced);
        }
    }

    pub fn oldest_open_time(&self) -> Option<i64> {
        self.candles.keys().next().copied()
    }

    pub fn newest_open_time(&self) -> Option<i64> {
        self.candles.keys().next_back().copied()
    }

    /// Number of candles `assemble` would produce, placeholders included
    pub fn contiguous_len(&self) -> usize {
        match (self.oldest_open_time(), self.newest_open_time()) {
            (Some(oldest), Some(newest)) => ((newest - oldest) / self.granularity.as_secs()) as usize + 1,
            _ => 0,
        }
    }

    /// Ascending, one candle per period from the oldest to the newest fetched
    /// candle. Holes are filled with placeholders carrying the previous close.
    pub fn assemble(&self) -> Vec<Candle> {
        let step = self.granularity.as_secs();
        let mut out = Vec::with_capacity(self.contiguous_len());
        let mut previous: Option<&Candle> = None;

        for candle in self.candles.values() {
            if let Some(prev) = previous {
                let mut missing = prev.open_time() + step;
                while missing < candle.open_time() {
                    out.push(Candle::placeholder(missing, self.granularity, prev.close()));
                    missing += step;
                }
            }
            out.push(candle.clone());
            previous = Some(candle);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn clear(&mut self) {
        self.candles.clear();
    }
}
