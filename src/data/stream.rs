/// Consumer-facing candle stream for one instrument
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::in_progress::reconstruct;
use crate::data::supplier::{Backfill, BackfillOutcome, CandleDataSupplier};
use crate::data::trade_buffer::ConcurrentTradeBuffer;
use crate::error::Result;
use crate::types::{ExchangeKind, Granularity, GranularitySet, InProgressCandle};
use crate::utils::current_period_start;

pub struct CandleStream {
    session_id: Uuid,
    supplier: CandleDataSupplier,
    granularity_tx: watch::Sender<Granularity>,
    last_good: Option<InProgressCandle>,
    live_buffer: Option<Arc<ConcurrentTradeBuffer>>,
}

impl CandleStream {
    pub fn new(supplier: CandleDataSupplier) -> Self {
        let session_id = Uuid::new_v4();
        let (granularity_tx, _) = watch::channel(supplier.granularity());
        info!(
            "📈 Candle stream {} opened: {} {} {}",
            session_id,
            supplier.exchange(),
            supplier.instrument(),
            supplier.granularity()
        );
        CandleStream {
            session_id,
            supplier,
            granularity_tx,
            last_good: None,
            live_buffer: None,
        }
    }

    /// Fold streamed trades for the current period instead of polling,
    /// whenever the buffer holds a complete tape for it.
    pub fn with_live_buffer(mut self, buffer: Arc<ConcurrentTradeBuffer>) -> Self {
        self.live_buffer = Some(buffer);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.supplier.exchange()
    }

    pub fn instrument(&self) -> &str {
        self.supplier.instrument()
    }

    pub fn granularity(&self) -> Granularity {
        self.supplier.granularity()
    }

    pub fn supported_granularities(&self) -> GranularitySet {
        self.supplier.supported_granularities()
    }

    /// The `count` most recent completed candles
    pub async fn historical_candles(&self, count: usize) -> Result<BackfillOutcome> {
        self.historical_candles_until(count, Utc::now()).await
    }

    /// The `count` completed candles before the period containing `now`
    pub async fn historical_candles_until(
        &self,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<BackfillOutcome> {
        let outcome = self.backfill(count, now)?.collect().await?;
        info!(
            "[{}] {} historical candles ({:?}, {} pages, {} retries)",
            self.session_id,
            outcome.candles.len(),
            outcome.status,
            outcome.pages,
            outcome.retries
        );
        Ok(outcome)
    }

    /// Lazy page-by-page access to the same history
    pub fn backfill(&self, count: usize, now: DateTime<Utc>) -> Result<Backfill> {
        let end = current_period_start(now, self.granularity());
        self.supplier.fetch_historical(count, end)
    }

    pub async fn current_candle(&mut self) -> Result<InProgressCandle> {
        self.current_candle_at(Utc::now()).await
    }

    /// Candle for the period containing `now`. When the exchange cannot be
    /// reached the previous good candle of the same period is returned
    /// instead; the error only surfaces when there is none.
    pub async fn current_candle_at(&mut self, now: DateTime<Utc>) -> Result<InProgressCandle> {
        let granularity = self.granularity();
        let period_start = current_period_start(now, granularity);

        if let Some(buffer) = &self.live_buffer {
            let key = self.supplier.instrument().to_uppercase();
            let start_ms = period_start * 1000;
            if let Some(prints) = buffer
                .complete_window(&key, start_ms, now.timestamp_millis())
                .await
            {
                debug!("[{}] current candle from {} buffered trades", self.session_id, prints.len());
                let candle = reconstruct(&prints, period_start, granularity, now);
                self.last_good = Some(candle.clone());
                return Ok(candle);
            }
        }

        match self.supplier.fetch_in_progress(period_start, now).await {
            Ok(candle) => {
                self.last_good = Some(candle.clone());
                Ok(candle)
            }
            Err(e) => match &self.last_good {
                Some(previous) if previous.open_time == period_start => {
                    warn!(
                        "⚠️  [{}] current candle refresh failed ({}), keeping value as of {}",
                        self.session_id,
                        e.error_code(),
                        previous.as_of
                    );
                    Ok(previous.clone())
                }
                _ => Err(e),
            },
        }
    }

    /// Switch granularity. In-progress state is discarded and subscribers
    /// are told so they can restart their backfill.
    pub fn set_granularity(&mut self, granularity: Granularity) -> Result<()> {
        if granularity == self.granularity() {
            return Ok(());
        }
        self.supplier = self.supplier.with_granularity(granularity)?;
        self.last_good = None;
        self.granularity_tx.send_replace(granularity);
        info!("[{}] granularity changed to {}", self.session_id, granularity);
        Ok(())
    }

    pub fn subscribe_granularity(&self) -> watch::Receiver<Granularity> {
        self.granularity_tx.subscribe()
    }
}
