/// Token bucket rate limiter and per-exchange request budget
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::types::ExchangeKind;

pub struct RateLimiter {
    capacity: u32,
    tokens: Arc<Mutex<u32>>,
    refill_rate: Duration,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let capacity = requests_per_second.max(1);
        RateLimiter {
            capacity,
            tokens: Arc::new(Mutex::new(capacity)),
            refill_rate: Duration::from_secs(1),
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Try to acquire a token, returns true if successful
    pub async fn try_acquire(&self) -> bool {
        self.refill().await;

        let mut tokens = self.tokens.lock().await;
        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then acquire it
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().await {
                return;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Refill tokens based on elapsed time
    async fn refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= self.refill_rate {
            let periods = (elapsed.as_secs_f64() / self.refill_rate.as_secs_f64()) as u32;

            let mut tokens = self.tokens.lock().await;
            *tokens = tokens
                .saturating_add(periods.saturating_mul(self.capacity))
                .min(self.capacity);
            *last_refill = now;
        }
    }

    /// Get current available tokens
    pub async fn available(&self) -> u32 {
        self.refill().await;
        let tokens = self.tokens.lock().await;
        *tokens
    }
}

/// Concurrency and request-rate budget shared by every fetch sequence
/// talking to one exchange.
pub struct ExchangeLimiter {
    exchange: ExchangeKind,
    in_flight: Arc<Semaphore>,
    max_concurrent: usize,
    rate: RateLimiter,
}

impl ExchangeLimiter {
    pub fn new(exchange: ExchangeKind, max_concurrent: usize, requests_per_second: u32) -> Self {
        let max_concurrent = max_concurrent.max(1);
        ExchangeLimiter {
            exchange,
            in_flight: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            rate: RateLimiter::new(requests_per_second),
        }
    }

    /// Published public-endpoint limits, kept conservative.
    pub fn for_exchange(exchange: ExchangeKind) -> Self {
        match exchange {
            ExchangeKind::Oanda => ExchangeLimiter::new(exchange, 4, 20),
            ExchangeKind::Binance => ExchangeLimiter::new(exchange, 6, 10),
            ExchangeKind::Coinbase => ExchangeLimiter::new(exchange, 3, 3),
        }
    }

    /// Wait for a concurrency slot and a rate token. The slot is released
    /// when the returned permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the limiter is alive.
            Err(_) => unreachable!("exchange limiter semaphore closed"),
        };
        self.rate.acquire().await;
        debug!(
            "{} request slot acquired ({} free)",
            self.exchange,
            self.in_flight.available_permits()
        );
        permit
    }

    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn requests_per_second(&self) -> u32 {
        self.rate.capacity
    }
}
