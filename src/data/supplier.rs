/// Historical backfill and in-progress candle supply for one instrument
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use tracing::{debug, error, info, warn};

use crate::data::cursor::{CursorState, CursorToken, CursorTracker, PaginationCursor};
use crate::data::in_progress::reconstruct;
use crate::data::series::SeriesBuilder;
use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, Connector, RawResponse};
use crate::exchange::dialect::{dialect_for, Dialect, InProgressPlan, TradePage};
use crate::exchange::granularity::{self, sub_period_granularity};
use crate::types::{Candle, ExchangeKind, Granularity, GranularitySet, InProgressCandle, Print};
use crate::utils::{ExchangeLimiter, RetryPolicy};

/// Trade pages read for one in-progress rebuild before switching to
/// sub-period candles
const DEFAULT_TRADE_PAGE_LIMIT: u32 = 20;

/// Shared request path: limiter slot, connector call, retry on transient
/// failures.
#[derive(Clone)]
struct Fetcher {
    connector: Arc<dyn Connector>,
    dialect: Arc<dyn Dialect>,
    limiter: Arc<ExchangeLimiter>,
    retry: RetryPolicy,
}

impl Fetcher {
    async fn send(&self, request: &ApiRequest, what: &str) -> Result<(RawResponse, u32)> {
        let connector = &self.connector;
        let limiter = &self.limiter;
        self.retry
            .run(what, || async move {
                let _permit = limiter.acquire().await;
                connector.request(request).await
            })
            .await
    }

    async fn fetch_candles(
        &self,
        instrument: &str,
        granularity: Granularity,
        end_exclusive: i64,
        limit: usize,
    ) -> Result<(Vec<Candle>, u32)> {
        let request = self
            .dialect
            .candle_request(instrument, granularity, end_exclusive, limit)?;
        let (response, retries) = self.send(&request, "candle page").await?;
        let candles = self.dialect.decode_candles(granularity, &response, false)?;
        Ok((candles, retries))
    }
}

/// Why a backfill stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The requested number of candles was produced
    CountReached,
    /// The exchange has no older data
    HistoryExhausted,
}

/// Where a backfill stands when its outcome is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStatus {
    /// More pages remain to be fetched
    Running,
    /// The last page request failed; the candles are discarded
    Failed,
    Finished(Termination),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillOutcome {
    /// Ascending, contiguous, at most the requested count
    pub candles: Vec<Candle>,
    pub status: BackfillStatus,
    pub pages: u32,
    pub retries: u32,
}

/// Candle supply for one (exchange, instrument, granularity)
pub struct CandleDataSupplier {
    fetcher: Fetcher,
    instrument: String,
    granularity: Granularity,
    page_size: Option<usize>,
    trade_page_limit: u32,
}

impl CandleDataSupplier {
    pub fn new(
        connector: Arc<dyn Connector>,
        dialect: Arc<dyn Dialect>,
        limiter: Arc<ExchangeLimiter>,
        retry: RetryPolicy,
        instrument: impl Into<String>,
        granularity: Granularity,
    ) -> Result<Self> {
        let instrument = instrument.into();
        if instrument.trim().is_empty() {
            return Err(CandleError::config("instrument must not be empty"));
        }
        if connector.exchange() != dialect.exchange() {
            return Err(CandleError::config(format!(
                "{} connector paired with {} dialect",
                connector.exchange(),
                dialect.exchange()
            )));
        }
        granularity::validate(dialect.exchange(), granularity)?;

        Ok(CandleDataSupplier {
            fetcher: Fetcher {
                connector,
                dialect,
                limiter,
                retry,
            },
            instrument,
            granularity,
            page_size: None,
            trade_page_limit: DEFAULT_TRADE_PAGE_LIMIT,
        })
    }

    /// Supplier with the exchange's own dialect, published limits and the
    /// default retry policy
    pub fn for_exchange(
        connector: Arc<dyn Connector>,
        instrument: impl Into<String>,
        granularity: Granularity,
    ) -> Result<Self> {
        let exchange = connector.exchange();
        Self::new(
            connector,
            dialect_for(exchange),
            Arc::new(ExchangeLimiter::for_exchange(exchange)),
            RetryPolicy::default(),
            instrument,
            granularity,
        )
    }

    /// Same connector, limiter and instrument at another granularity
    pub fn with_granularity(&self, granularity: Granularity) -> Result<Self> {
        granularity::validate(self.exchange(), granularity)?;
        Ok(CandleDataSupplier {
            fetcher: self.fetcher.clone(),
            instrument: self.instrument.clone(),
            granularity,
            page_size: self.page_size,
            trade_page_limit: self.trade_page_limit,
        })
    }

    /// Request at most `candles` per historical page (never more than the
    /// exchange allows)
    pub fn with_page_size(mut self, candles: usize) -> Self {
        self.page_size = Some(candles.max(1));
        self
    }

    pub fn with_trade_page_limit(mut self, pages: u32) -> Self {
        self.trade_page_limit = pages.max(1);
        self
    }

    pub fn exchange(&self) -> ExchangeKind {
        self.fetcher.dialect.exchange()
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn supported_granularities(&self) -> GranularitySet {
        self.fetcher.dialect.supported_granularities()
    }

    /// Lazy backfill of up to `count` completed candles closing at or before
    /// `end_exclusive`. Nothing is requested until the first page is pulled.
    pub fn fetch_historical(&self, count: usize, end_exclusive: i64) -> Result<Backfill> {
        if count == 0 {
            return Err(CandleError::config("backfill count must be positive"));
        }
        let end = self.granularity.align_down(end_exclusive);
        info!(
            "📥 Backfill {} {} {}: {} candles before {}",
            self.exchange(),
            self.instrument,
            self.granularity,
            count,
            end
        );
        let page_size = self
            .page_size
            .unwrap_or(usize::MAX)
            .min(self.fetcher.dialect.max_page_size());
        Ok(Backfill {
            fetcher: self.fetcher.clone(),
            instrument: self.instrument.clone(),
            granularity: self.granularity,
            count,
            page_size,
            end_exclusive: end,
            tracker: CursorTracker::new(),
            series: SeriesBuilder::new(self.granularity),
            emitted_from: None,
            termination: None,
            retries: 0,
        })
    }

    /// Rebuild the candle for the period opening at `period_start` from what
    /// the exchange has seen up to `now`. Either every request succeeds and a
    /// fresh candle is returned, or the error is returned and nothing else.
    pub async fn fetch_in_progress(
        &self,
        period_start: i64,
        now: DateTime<Utc>,
    ) -> Result<InProgressCandle> {
        let granularity = self.granularity;
        if !granularity.is_aligned(period_start) {
            return Err(CandleError::config(format!(
                "period start {} is not aligned to {}",
                period_start, granularity
            )));
        }

        let start_ms = period_start * 1000;
        let end_ms = now
            .timestamp_millis()
            .min((period_start + granularity.as_secs()) * 1000);
        if end_ms <= start_ms {
            return Ok(InProgressCandle::empty(period_start, granularity, now));
        }
        let elapsed_secs = (end_ms - start_ms) / 1000;

        let dialect = &self.fetcher.dialect;
        let plan = dialect.in_progress_plan(granularity, elapsed_secs);
        debug!(
            "In-progress {} {} @ {}: {:?} after {}s",
            self.instrument, granularity, period_start, plan, elapsed_secs
        );

        let prints = match plan {
            InProgressPlan::Trades => match self.fetch_trades(start_ms, end_ms).await? {
                Some(prints) => prints,
                None => {
                    let sub = sub_period_granularity(self.exchange(), granularity, elapsed_secs)
                        .unwrap_or(granularity);
                    warn!(
                        "⚠️  Trade tape for {} exceeds {} pages, rebuilding from {} candles",
                        self.instrument, self.trade_page_limit, sub
                    );
                    self.fetch_sub_candles(sub, period_start, end_ms).await?
                }
            },
            InProgressPlan::SubCandles(sub) => {
                self.fetch_sub_candles(sub, period_start, end_ms).await?
            }
        };

        Ok(reconstruct(&prints, period_start, granularity, now))
    }

    /// Walk the trade tape for `[start_ms, end_ms)`. `None` when the page
    /// budget runs out first.
    async fn fetch_trades(&self, start_ms: i64, end_ms: i64) -> Result<Option<Vec<Print>>> {
        let mut tracker = CursorTracker::new();
        let mut prints = Vec::new();
        let seed = PaginationCursor::new(CursorToken::Time(end_ms), end_ms);

        loop {
            if tracker.pages() >= self.trade_page_limit {
                return Ok(None);
            }
            let guard = tracker.begin_fetch(seed.clone())?;
            let cursor = match &guard.cursor().token {
                CursorToken::Time(_) => None,
                token => Some(token.clone()),
            };

            match self.fetch_trade_page(start_ms, end_ms, cursor.as_ref()).await {
                Ok(page) => {
                    prints.extend(page.prints);
                    match page.next {
                        Some(next) => guard.advance(next),
                        None => {
                            guard.exhaust();
                            debug!("{} trades over {} pages", prints.len(), tracker.pages());
                            return Ok(Some(prints));
                        }
                    }
                }
                Err(e) => {
                    guard.fail();
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_trade_page(
        &self,
        start_ms: i64,
        end_ms: i64,
        cursor: Option<&CursorToken>,
    ) -> Result<TradePage> {
        let dialect = &self.fetcher.dialect;
        let request = dialect.trade_request(&self.instrument, start_ms, end_ms, cursor)?;
        let (response, _) = self.fetcher.send(&request, "trade page").await?;
        dialect.decode_trades(&response, start_ms, end_ms)
    }

    async fn fetch_sub_candles(
        &self,
        sub: Granularity,
        period_start: i64,
        end_ms: i64,
    ) -> Result<Vec<Print>> {
        let dialect = &self.fetcher.dialect;
        let to_secs = (end_ms + 999).div_euclid(1000);
        let request = dialect.sub_candle_request(&self.instrument, sub, period_start, to_secs)?;
        let (response, _) = self.fetcher.send(&request, "sub-period candles").await?;
        let candles = dialect.decode_candles(sub, &response, true)?;
        Ok(candles.iter().map(Print::from_candle).collect())
    }
}

/// A lazy, finite, restartable walk backwards through history, one page
/// per request.
pub struct Backfill {
    fetcher: Fetcher,
    instrument: String,
    granularity: Granularity,
    count: usize,
    page_size: usize,
    end_exclusive: i64,
    tracker: CursorTracker,
    series: SeriesBuilder,
    /// Oldest open time already handed out by `next_page`
    emitted_from: Option<i64>,
    termination: Option<Termination>,
    retries: u32,
}

impl Backfill {
    /// Fetch the next older page. Returns the candles it adds to the front
    /// of the series (placeholders included, ascending), or `None` once the
    /// sequence has terminated.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Candle>>> {
        if self.termination.is_some() {
            return Ok(None);
        }

        let Backfill {
            fetcher,
            instrument,
            granularity,
            count,
            page_size,
            end_exclusive,
            tracker,
            series,
            emitted_from,
            termination,
            retries,
        } = self;
        let granularity = *granularity;
        let count = *count;
        let end_exclusive = *end_exclusive;

        // Idle here means a fresh start or an abandoned earlier attempt
        if tracker.state() == CursorState::Idle {
            series.clear();
            *emitted_from = None;
            *retries = 0;
        }

        let seed = PaginationCursor::new(CursorToken::Time(end_exclusive), end_exclusive);
        let guard = tracker.begin_fetch(seed)?;
        let page_end = match guard.cursor().token.clone() {
            CursorToken::Time(t) => t,
            other => {
                let err = CandleError::config(format!("unexpected candle cursor {:?}", other));
                guard.fail();
                return Err(err);
            }
        };

        let limit = count
            .saturating_sub(series.contiguous_len())
            .clamp(1, *page_size);

        let (page, page_retries) = match fetcher
            .fetch_candles(instrument, granularity, page_end, limit)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(
                    "❌ Backfill {} {} failed at {}: {} ({})",
                    instrument,
                    granularity,
                    page_end,
                    e,
                    e.error_code()
                );
                guard.fail();
                series.clear();
                *emitted_from = None;
                return Err(e);
            }
        };
        *retries += page_retries;

        let page: Vec<Candle> = page
            .into_iter()
            .filter(|c| c.open_time() < page_end && c.close_time() <= end_exclusive)
            .collect();

        let Some(oldest) = page.first().map(Candle::open_time) else {
            guard.exhaust();
            *termination = Some(Termination::HistoryExhausted);
            info!("Backfill {} {}: history exhausted before {}", instrument, granularity, page_end);
            return Ok(None);
        };

        series.insert_page(&page);
        let assembled = series.assemble();
        let kept = &assembled[assembled.len().saturating_sub(count)..];
        let added: Vec<Candle> = kept
            .iter()
            .filter(|c| emitted_from.map_or(true, |from| c.open_time() < from))
            .cloned()
            .collect();
        if let Some(first) = kept.first() {
            *emitted_from = Some(first.open_time());
        }

        if series.contiguous_len() >= count {
            guard.complete();
            *termination = Some(Termination::CountReached);
            info!("✅ Backfill {} {}: {} candles", instrument, granularity, count);
        } else if oldest <= fetcher.dialect.earliest_data() {
            guard.exhaust();
            *termination = Some(Termination::HistoryExhausted);
            info!(
                "Backfill {} {}: reached earliest data at {} with {} candles",
                instrument,
                granularity,
                oldest,
                series.contiguous_len()
            );
        } else {
            guard.advance(CursorToken::Time(oldest));
            debug!(
                "Backfill {} {}: {} of {} candles, next page before {}",
                instrument,
                granularity,
                series.contiguous_len(),
                count,
                oldest
            );
        }

        Ok(Some(added))
    }

    /// Drive the sequence to its end
    pub async fn collect(&mut self) -> Result<BackfillOutcome> {
        while self.next_page().await?.is_some() {}
        Ok(self.outcome())
    }

    /// Everything fetched so far, ascending and trimmed to the requested count
    pub fn outcome(&self) -> BackfillOutcome {
        let assembled = self.series.assemble();
        let skip = assembled.len().saturating_sub(self.count);
        BackfillOutcome {
            candles: assembled.into_iter().skip(skip).collect(),
            status: self.status(),
            pages: self.tracker.pages(),
            retries: self.retries,
        }
    }

    /// Pages as a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Candle>>> {
        stream::unfold(Some(self), |state| async move {
            let mut backfill = state?;
            match backfill.next_page().await {
                Ok(Some(page)) => Some((Ok(page), Some(backfill))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Start over from scratch, ending at `end_exclusive`
    pub fn restart(&mut self, end_exclusive: i64) {
        self.tracker.reset();
        self.series.clear();
        self.emitted_from = None;
        self.termination = None;
        self.retries = 0;
        self.end_exclusive = self.granularity.align_down(end_exclusive);
    }

    pub fn tracker(&self) -> &CursorTracker {
        &self.tracker
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn status(&self) -> BackfillStatus {
        match self.termination {
            Some(termination) => BackfillStatus::Finished(termination),
            None if self.tracker.state() == CursorState::Failed => BackfillStatus::Failed,
            None => BackfillStatus::Running,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    use crate::exchange::mock::MockConnector;

    const H1: Granularity = Granularity::from_secs(3600);
    const T: i64 = 1_699_999_200;

    fn kline(open_time: i64, close: f64) -> Value {
        json!([
            open_time * 1000,
            "100.0",
            "110.0",
            "90.0",
            close.to_string(),
            "5.0",
            open_time * 1000 + 3_599_999,
            "500.0",
            10,
            "1.0",
            "100.0",
            "0"
        ])
    }

    fn supplier(mock: Arc<MockConnector>, exchange: ExchangeKind) -> CandleDataSupplier {
        CandleDataSupplier::new(
            mock,
            dialect_for(exchange),
            Arc::new(ExchangeLimiter::new(exchange, 4, 1000)),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            "BTCUSDT",
            H1,
        )
        .unwrap()
    }

    fn at(epoch_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch_secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_two_page_backfill() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 7200, 101.0), kline(T - 3600, 102.0)]))
                .respond(json!([kline(T - 10_800, 100.0)])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance);

        let outcome = supplier.fetch_historical(3, T).unwrap().collect().await.unwrap();

        let times: Vec<i64> = outcome.candles.iter().map(Candle::open_time).collect();
        assert_eq!(times, vec![T - 10_800, T - 7200, T - 3600]);
        assert_eq!(outcome.status, BackfillStatus::Finished(Termination::CountReached));
        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.retries, 0);

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query_value("limit"), Some("3"));
        let second_end = ((T - 7200) * 1000 - 1).to_string();
        assert_eq!(requests[1].query_value("endTime"), Some(second_end.as_str()));
        assert_eq!(requests[1].query_value("limit"), Some("1"));
    }

    #[tokio::test]
    async fn test_page_size_caps_requests() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 7200, 101.0), kline(T - 3600, 102.0)]))
                .respond(json!([kline(T - 14_400, 99.0), kline(T - 10_800, 100.0)])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance).with_page_size(2);

        let outcome = supplier.fetch_historical(4, T).unwrap().collect().await.unwrap();
        assert_eq!(outcome.candles.len(), 4);
        assert_eq!(outcome.pages, 2);
        assert!(mock.requests().iter().all(|r| r.query_value("limit") == Some("2")));
    }

    #[tokio::test]
    async fn test_rate_limited_page_is_retried() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .fail(Some(429), "Too many requests")
                .respond(json!([kline(T - 3600, 101.0)])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance);

        let outcome = supplier.fetch_historical(1, T).unwrap().collect().await.unwrap();
        assert_eq!(outcome.candles.len(), 1);
        assert_eq!(outcome.retries, 1);
        assert_eq!(mock.request_count(), 2);
    }

    #[tokio::test]
    async fn test_forming_candle_is_excluded() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 3600, 101.0), kline(T, 105.0)])),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        // end falls mid-period: the candle opening at T has not closed
        let outcome = supplier.fetch_historical(1, T + 1800).unwrap().collect().await.unwrap();
        assert_eq!(outcome.candles.len(), 1);
        assert_eq!(outcome.candles[0].open_time(), T - 3600);
        assert!(outcome.candles.iter().all(|c| c.close_time() <= T + 1800));
    }

    #[tokio::test]
    async fn test_empty_page_exhausts_history() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 3600, 101.0)]))
                .respond(json!([])),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        let mut backfill = supplier.fetch_historical(50, T).unwrap();
        let outcome = backfill.collect().await.unwrap();
        assert_eq!(outcome.status, BackfillStatus::Finished(Termination::HistoryExhausted));
        assert_eq!(outcome.candles.len(), 1);
        assert_eq!(backfill.tracker().state(), CursorState::Exhausted);
        assert!(backfill.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_earliest_data_boundary() {
        let earliest = dialect_for(ExchangeKind::Binance).earliest_data();
        let end = earliest + 7200;
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(earliest, 100.0), kline(earliest + 3600, 101.0)])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance);

        let outcome = supplier.fetch_historical(10, end).unwrap().collect().await.unwrap();
        assert_eq!(outcome.status, BackfillStatus::Finished(Termination::HistoryExhausted));
        assert_eq!(outcome.candles.len(), 2);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_gap_across_pages_is_filled() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 3600, 102.0)]))
                .respond(json!([kline(T - 14_400, 99.0)])),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        let mut backfill = supplier.fetch_historical(4, T).unwrap();
        let first = backfill.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        let second = backfill.next_page().await.unwrap().unwrap();
        let times: Vec<i64> = second.iter().map(Candle::open_time).collect();
        assert_eq!(times, vec![T - 14_400, T - 10_800, T - 7200]);
        assert!(second[1].is_placeholder());
        assert_eq!(second[1].close(), 99.0);
        assert_eq!(backfill.termination(), Some(Termination::CountReached));
    }

    #[tokio::test]
    async fn test_failure_discards_cursor() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 3600, 102.0)]))
                .fail(Some(400), "Invalid symbol."),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        let mut backfill = supplier.fetch_historical(5, T).unwrap();
        backfill.next_page().await.unwrap().unwrap();
        let partial = backfill.outcome();
        assert_eq!(partial.status, BackfillStatus::Running);
        assert_eq!(partial.candles.len(), 1);
        assert_eq!(backfill.tracker().state(), CursorState::Advancing);

        let err = backfill.collect().await.unwrap_err();
        assert!(matches!(err, CandleError::Exchange { status_code: Some(400), .. }));
        assert_eq!(backfill.tracker().state(), CursorState::Failed);
        let failed = backfill.outcome();
        assert_eq!(failed.status, BackfillStatus::Failed);
        assert!(failed.candles.is_empty());
        assert!(backfill.tracker().cursor().is_none());
        assert!(backfill.next_page().await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_page_is_parse_error() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance).respond(json!({"unexpected": true})),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);
        let err = supplier.fetch_historical(5, T).unwrap().collect().await.unwrap_err();
        assert!(matches!(err, CandleError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_restart_repeats_the_sequence() {
        let page = json!([kline(T - 7200, 101.0), kline(T - 3600, 102.0)]);
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(page.clone())
                .respond(page),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        let mut backfill = supplier.fetch_historical(2, T).unwrap();
        let first = backfill.collect().await.unwrap();
        backfill.restart(T);
        let second = backfill.collect().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_fresh_cursor() {
        let mock = Arc::new(MockConnector::hanging(ExchangeKind::Binance));
        let supplier = supplier(mock, ExchangeKind::Binance);

        let mut backfill = supplier.fetch_historical(5, T).unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), backfill.next_page()).await;
        assert!(cancelled.is_err());
        assert_eq!(backfill.tracker().snapshot(), CursorTracker::new().snapshot());
    }

    #[tokio::test]
    async fn test_stream_of_pages() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!([kline(T - 3600, 102.0)]))
                .respond(json!([kline(T - 7200, 101.0)])),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);

        let pages: Vec<Result<Vec<Candle>>> =
            supplier.fetch_historical(2, T).unwrap().into_stream().collect().await;
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.as_ref().map_or(false, |c| c.len() == 1)));
    }

    #[tokio::test]
    async fn test_invalid_construction() {
        let mock = Arc::new(MockConnector::new(ExchangeKind::Binance));
        let limiter = Arc::new(ExchangeLimiter::new(ExchangeKind::Binance, 1, 10));

        let mismatched = CandleDataSupplier::new(
            mock.clone(),
            dialect_for(ExchangeKind::Oanda),
            Arc::clone(&limiter),
            RetryPolicy::none(),
            "BTCUSDT",
            H1,
        );
        assert!(matches!(mismatched, Err(CandleError::Configuration(_))));

        let unsupported = CandleDataSupplier::for_exchange(
            mock.clone(),
            "BTCUSDT",
            Granularity::from_secs(5),
        );
        assert!(matches!(unsupported, Err(CandleError::Configuration(_))));

        let empty = CandleDataSupplier::for_exchange(mock.clone(), " ", H1);
        assert!(matches!(empty, Err(CandleError::Configuration(_))));

        let supplier = CandleDataSupplier::for_exchange(mock.clone(), "BTCUSDT", H1).unwrap();
        assert!(supplier.fetch_historical(0, T).is_err());
        assert_eq!(mock.request_count(), 0);
    }

    fn oanda_candle(time: &str, close: &str) -> Value {
        json!({"complete": true, "volume": 12, "time": time,
               "mid": {"o": "1.0700", "h": "1.0750", "l": "1.0650", "c": close}})
    }

    #[tokio::test]
    async fn test_oanda_multi_page_backfill() {
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Oanda)
                .respond(json!({"instrument": "EUR_USD", "granularity": "H1", "candles": [
                    oanda_candle("2023-11-14T20:00:00.000000000Z", "1.0710"),
                    oanda_candle("2023-11-14T21:00:00.000000000Z", "1.0720")
                ]}))
                .respond(json!({"instrument": "EUR_USD", "granularity": "H1", "candles": [
                    oanda_candle("2023-11-14T19:00:00.000000000Z", "1.0700")
                ]})),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Oanda).with_page_size(2);

        let outcome = supplier.fetch_historical(3, T).unwrap().collect().await.unwrap();
        let times: Vec<i64> = outcome.candles.iter().map(Candle::open_time).collect();
        assert_eq!(times, vec![T - 10_800, T - 7200, T - 3600]);
        assert_eq!(outcome.status, BackfillStatus::Finished(Termination::CountReached));
        assert!(outcome.candles.iter().all(|c| !c.is_placeholder()));

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query_value("to"), Some("2023-11-14T22:00:00Z"));
        assert_eq!(requests[0].query_value("count"), Some("2"));
        assert_eq!(requests[1].query_value("to"), Some("2023-11-14T20:00:00Z"));
        assert_eq!(requests[1].query_value("count"), Some("1"));
    }

    #[tokio::test]
    async fn test_oanda_record_without_prices_fails_the_backfill() {
        let mock = Arc::new(MockConnector::new(ExchangeKind::Oanda).respond(json!({"candles": [
            oanda_candle("2023-11-14T19:00:00Z", "1.0700"),
            {"complete": true, "volume": 12, "time": "2023-11-14T20:00:00Z"},
            oanda_candle("2023-11-14T21:00:00Z", "1.0720")
        ]})));
        let supplier = supplier(mock, ExchangeKind::Oanda);

        let mut backfill = supplier.fetch_historical(3, T).unwrap();
        let err = backfill.collect().await.unwrap_err();
        assert!(matches!(err, CandleError::Parse { .. }));
        assert_eq!(backfill.outcome().status, BackfillStatus::Failed);
        assert!(backfill.outcome().candles.is_empty());
    }

    #[tokio::test]
    async fn test_coinbase_backfill_uses_inclusive_window() {
        // [time, low, high, open, close, volume], newest first
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Coinbase)
                .respond(json!([
                    [T - 3600, 95.0, 110.0, 100.0, 105.0, 2.5],
                    [T - 7200, 94.0, 101.0, 98.0, 100.0, 1.5]
                ]))
                .respond(json!([[T - 10_800, 90.0, 99.0, 92.0, 98.0, 3.0]])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Coinbase).with_page_size(2);

        let outcome = supplier.fetch_historical(3, T).unwrap().collect().await.unwrap();
        let closes: Vec<f64> = outcome.candles.iter().map(Candle::close).collect();
        assert_eq!(closes, vec![98.0, 100.0, 105.0]);
        assert_eq!(outcome.candles[2].open(), 100.0);
        assert_eq!(outcome.candles[2].low(), 95.0);
        assert_eq!(outcome.status, BackfillStatus::Finished(Termination::CountReached));

        let requests = mock.requests();
        assert_eq!(requests[0].path, "/products/BTCUSDT/candles");
        assert_eq!(requests[0].query_value("granularity"), Some("3600"));
        assert_eq!(requests[0].query_value("start"), Some("2023-11-14T20:00:00Z"));
        assert_eq!(requests[0].query_value("end"), Some("2023-11-14T21:00:00Z"));
        assert_eq!(requests[1].query_value("start"), Some("2023-11-14T19:00:00Z"));
        assert_eq!(requests[1].query_value("end"), Some("2023-11-14T19:00:00Z"));
    }

    #[tokio::test]
    async fn test_coinbase_trade_tape_follows_after_marker() {
        let trade = |id: u64, time: &str, price: &str, size: &str| {
            json!({"trade_id": id, "side": "buy", "time": time, "price": price, "size": size})
        };
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Coinbase)
                .respond_with(
                    RawResponse::new(json!([
                        trade(12, "2023-11-14T22:09:00.120Z", "105.00", "1.0"),
                        trade(11, "2023-11-14T22:05:00Z", "103.00", "2.0")
                    ]))
                    .with_continuation("11"),
                )
                .respond_with(
                    RawResponse::new(json!([
                        trade(10, "2023-11-14T22:02:00Z", "101.00", "0.5"),
                        trade(9, "2023-11-14T21:59:00Z", "150.00", "9.0")
                    ]))
                    .with_continuation("9"),
                ),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Coinbase);

        let candle = supplier.fetch_in_progress(T, at(T + 600)).await.unwrap();
        assert_eq!(candle.open, 101.0);
        assert_eq!(candle.close, 105.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 101.0);
        assert_eq!(candle.volume, 3.5);

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, "/products/BTCUSDT/trades");
        assert_eq!(requests[0].query_value("after"), None);
        assert_eq!(requests[1].query_value("after"), Some("11"));
    }

    #[tokio::test]
    async fn test_coinbase_trade_page_without_marker_is_parse_error() {
        let mock = Arc::new(MockConnector::new(ExchangeKind::Coinbase).respond(json!([
            {"trade_id": 3, "side": "sell", "time": "2023-11-14T22:03:00Z", "price": "100", "size": "1"}
        ])));
        let supplier = supplier(mock, ExchangeKind::Coinbase);
        assert!(matches!(
            supplier.fetch_in_progress(T, at(T + 600)).await,
            Err(CandleError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_progress_from_trades() {
        let start_ms = T * 1000;
        let mock = Arc::new(MockConnector::new(ExchangeKind::Binance).respond(json!([
            {"a": 1, "p": "100", "q": "1", "T": start_ms + 10_000},
            {"a": 2, "p": "90", "q": "1", "T": start_ms + 5_000},
            {"a": 3, "p": "95", "q": "1", "T": start_ms + 20_000}
        ])));
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance);

        let candle = supplier.fetch_in_progress(T, at(T + 600)).await.unwrap();
        assert_eq!(candle.open, 90.0);
        assert_eq!(candle.close, 95.0);
        assert_eq!(candle.high, 100.0);
        assert_eq!(candle.low, 90.0);
        assert_eq!(candle.volume, 3.0);
        assert_eq!(mock.requests()[0].path, "/api/v3/aggTrades");
    }

    #[tokio::test]
    async fn test_in_progress_from_sub_candles() {
        let mock = Arc::new(MockConnector::new(ExchangeKind::Oanda).respond(json!({
            "candles": [
                {"complete": true, "volume": 4, "time": "2023-11-14T22:00:00Z",
                 "mid": {"o": "1.0700", "h": "1.0720", "l": "1.0690", "c": "1.0710"}},
                {"complete": false, "volume": 2, "time": "2023-11-14T22:00:10Z",
                 "mid": {"o": "1.0710", "h": "1.0730", "l": "1.0705", "c": "1.0725"}}
            ]
        })));
        let supplier = CandleDataSupplier::new(
            mock.clone(),
            dialect_for(ExchangeKind::Oanda),
            Arc::new(ExchangeLimiter::new(ExchangeKind::Oanda, 4, 1000)),
            RetryPolicy::none(),
            "EUR_USD",
            H1,
        )
        .unwrap();

        let candle = supplier.fetch_in_progress(T, at(T + 15)).await.unwrap();
        assert_eq!(candle.open, 1.07);
        assert_eq!(candle.high, 1.073);
        assert_eq!(candle.low, 1.069);
        assert_eq!(candle.close, 1.0725);
        assert_eq!(candle.volume, 6.0);
        assert_eq!(mock.requests()[0].query_value("granularity"), Some("S5"));
    }

    #[tokio::test]
    async fn test_trade_page_cap_falls_back_to_sub_candles() {
        let start_ms = T * 1000;
        let full_page: Vec<Value> = (0..1000)
            .map(|i| json!({"a": i, "p": "100", "q": "1", "T": start_ms + i}))
            .collect();
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!(full_page))
                .respond(json!([kline_minute(T, 99.0), kline_minute(T + 60, 101.0)])),
        );
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance).with_trade_page_limit(1);

        let candle = supplier.fetch_in_progress(T, at(T + 600)).await.unwrap();
        assert_eq!(candle.close, 101.0);

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].path, "/api/v3/klines");
        assert_eq!(requests[1].query_value("interval"), Some("1m"));
    }

    fn kline_minute(open_time: i64, close: f64) -> Value {
        json!([
            open_time * 1000,
            close.to_string(),
            close.to_string(),
            close.to_string(),
            close.to_string(),
            "1.0",
            open_time * 1000 + 59_999,
            "100.0",
            1,
            "0",
            "0",
            "0"
        ])
    }

    #[tokio::test]
    async fn test_in_progress_is_atomic() {
        let start_ms = T * 1000;
        let full_page: Vec<Value> = (0..1000)
            .map(|i| json!({"a": i, "p": "100", "q": "1", "T": start_ms + i}))
            .collect();
        let mock = Arc::new(
            MockConnector::new(ExchangeKind::Binance)
                .respond(json!(full_page))
                .fail(Some(418), "banned"),
        );
        let supplier = supplier(mock, ExchangeKind::Binance);
        assert!(supplier.fetch_in_progress(T, at(T + 600)).await.is_err());
    }

    #[tokio::test]
    async fn test_in_progress_rejects_misaligned_period() {
        let mock = Arc::new(MockConnector::new(ExchangeKind::Binance));
        let supplier = supplier(Arc::clone(&mock), ExchangeKind::Binance);
        assert!(matches!(
            supplier.fetch_in_progress(T + 1, at(T + 600)).await,
            Err(CandleError::Configuration(_))
        ));
        assert_eq!(mock.request_count(), 0);

        let before_open = supplier.fetch_in_progress(T, at(T - 5)).await.unwrap();
        assert!(!before_open.has_data());
    }
}
