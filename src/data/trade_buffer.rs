/// Trade buffer for streamed prints
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::Print;

/// Recent prints for one instrument and the instant from which the tape is
/// known to be complete.
#[derive(Debug)]
struct Tape {
    prints: VecDeque<Print>,
    covered_from_ms: i64,
}

/// Buffer for storing recent prints per instrument
pub struct TradeBuffer {
    tapes: HashMap<String, Tape>,
    capacity: usize,
}

impl TradeBuffer {
    pub fn new(capacity: usize) -> Self {
        TradeBuffer {
            tapes: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record that every print for `symbol` from `from_ms` on will be pushed.
    /// Called when a feed (re)connects; earlier prints are discarded.
    pub fn mark_coverage(&mut self, symbol: &str, from_ms: i64) {
        let capacity = self.capacity;
        let tape = self.tapes.entry(symbol.to_string()).or_insert_with(|| Tape {
            prints: VecDeque::with_capacity(capacity),
            covered_from_ms: from_ms,
        });
        tape.prints.clear();
        tape.covered_from_ms = from_ms;
    }

    /// Add a print to the buffer
    pub fn push(&mut self, symbol: &str, print: Print) {
        let capacity = self.capacity;
        let tape = self.tapes.entry(symbol.to_string()).or_insert_with(|| Tape {
            prints: VecDeque::with_capacity(capacity),
            covered_from_ms: print.time_ms,
        });

        if tape.prints.len() >= capacity {
            if let Some(evicted) = tape.prints.pop_front() {
                tape.covered_from_ms = tape.covered_from_ms.max(evicted.time_ms + 1);
            }
        }
        tape.prints.push_back(print);
    }

    /// Get the last print for an instrument
    pub fn get_last(&self, symbol: &str) -> Option<&Print> {
        self.tapes.get(symbol)?.prints.back()
    }

    /// True when no print at or after `start_ms` has been evicted or missed
    pub fn covers(&self, symbol: &str, start_ms: i64) -> bool {
        self.tapes
            .get(symbol)
            .map_or(false, |tape| tape.covered_from_ms <= start_ms)
    }

    /// Prints inside `[start_ms, end_ms)`, in arrival order
    pub fn window(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<Print> {
        match self.tapes.get(symbol) {
            Some(tape) => tape
                .prints
                .iter()
                .filter(|p| p.time_ms >= start_ms && p.time_ms < end_ms)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.tapes.get(symbol).map_or(0, |tape| tape.prints.len())
    }

    /// Clear buffer for an instrument
    pub fn clear(&mut self, symbol: &str) {
        self.tapes.remove(symbol);
    }
}

/// Thread-safe trade buffer shared between a feed task and the stream
pub struct ConcurrentTradeBuffer {
    buffer: Arc<RwLock<TradeBuffer>>,
}

impl ConcurrentTradeBuffer {
    pub fn new(capacity: usize) -> Self {
        ConcurrentTradeBuffer {
            buffer: Arc::new(RwLock::new(TradeBuffer::new(capacity))),
        }
    }

    pub async fn mark_coverage(&self, symbol: &str, from_ms: i64) {
        let mut buffer = self.buffer.write().await;
        buffer.mark_coverage(symbol, from_ms);
    }

    pub async fn push(&self, symbol: &str, print: Print) {
        let mut buffer = self.buffer.write().await;
        buffer.push(symbol, print);
    }

    /// Prints inside `[start_ms, end_ms)`, or `None` when the buffer cannot
    /// vouch for a complete tape from `start_ms`.
    pub async fn complete_window(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Option<Vec<Print>> {
        let buffer = self.buffer.read().await;
        if buffer.covers(symbol, start_ms) {
            Some(buffer.window(symbol, start_ms, end_ms))
        } else {
            None
        }
    }

    pub async fn len(&self, symbol: &str) -> usize {
        let buffer = self.buffer.read().await;
        buffer.len(symbol)
    }

    pub async fn clear(&self, symbol: &str) {
        let mut buffer = self.buffer.write().await;
        buffer.clear(symbol);
    }
}
