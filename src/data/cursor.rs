/// Continuation state for one paginated fetch sequence
///
/// `Idle -> Fetching -> {Advancing, Exhausted, Failed}`, with
/// `Advancing -> Fetching` for every further page. The cursor captured when a
/// fetch begins is never touched while the request is in flight; only the
/// outcome of that request replaces it. A fetch that is dropped before it
/// resolves (the caller's future was cancelled) puts the tracker back to a
/// fresh `Idle`, so restarting is indistinguishable from starting anew.
use tracing::debug;

use crate::error::{CandleError, Result};

/// Exchange-specific continuation marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorToken {
    /// Fetch items strictly before this epoch value
    Time(i64),
    /// Fetch items from this exchange-assigned id on
    Sequence(i64),
    /// Opaque older-page marker handed back by the exchange
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    pub token: CursorToken,
    /// Exclusive end of the window the sequence was started for
    pub window_end: i64,
}

impl PaginationCursor {
    pub fn new(token: CursorToken, window_end: i64) -> Self {
        PaginationCursor { token, window_end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    #[default]
    Idle,
    Fetching,
    Advancing,
    Exhausted,
    Failed,
}

impl CursorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CursorState::Exhausted | CursorState::Failed)
    }
}

/// Read-only view for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub state: CursorState,
    pub cursor: Option<PaginationCursor>,
    pub pages: u32,
}

#[derive(Debug, Default)]
pub struct CursorTracker {
    state: CursorState,
    cursor: Option<PaginationCursor>,
    pages: u32,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn cursor(&self) -> Option<&PaginationCursor> {
        self.cursor.as_ref()
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            state: self.state,
            cursor: self.cursor.clone(),
            pages: self.pages,
        }
    }

    /// Drop any cursor and return to a fresh `Idle`
    pub fn reset(&mut self) {
        self.state = CursorState::Idle;
        self.cursor = None;
        self.pages = 0;
    }

    /// Start fetching one page. From `Idle` the sequence is seeded with
    /// `seed`; from `Advancing` the stored cursor is used and `seed` ignored.
    pub fn begin_fetch(&mut self, seed: PaginationCursor) -> Result<FetchGuard<'_>> {
        let cursor = match (self.state, &self.cursor) {
            (CursorState::Idle, _) => seed,
            (CursorState::Advancing, Some(cursor)) => cursor.clone(),
            (CursorState::Advancing, None) => {
                return Err(CandleError::config("advancing cursor lost its token"))
            }
            (CursorState::Fetching, _) => {
                return Err(CandleError::config("a page fetch is already in flight"))
            }
            (state, _) => {
                return Err(CandleError::config(format!(
                    "fetch sequence is {:?}; reset before fetching again",
                    state
                )))
            }
        };

        debug!("Fetching page {} from {:?}", self.pages + 1, cursor.token);
        self.state = CursorState::Fetching;
        self.cursor = Some(cursor.clone());

        Ok(FetchGuard {
            tracker: self,
            cursor,
            resolved: false,
        })
    }
}

/// One in-flight page. Exactly one of the resolving methods should be
/// called; dropping the guard unresolved abandons the whole sequence.
pub struct FetchGuard<'a> {
    tracker: &'a mut CursorTracker,
    cursor: PaginationCursor,
    resolved: bool,
}

impl<'a> FetchGuard<'a> {
    /// Cursor captured when the fetch began
    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    /// Page succeeded and more data remains before `next`
    pub fn advance(mut self, next: CursorToken) {
        self.resolved = true;
        self.tracker.state = CursorState::Advancing;
        self.tracker.cursor = Some(PaginationCursor::new(next, self.cursor.window_end));
        self.tracker.pages += 1;
    }

    /// Page succeeded and the exchange has nothing older
    pub fn exhaust(mut self) {
        self.resolved = true;
        self.tracker.state = CursorState::Exhausted;
        self.tracker.cursor = None;
        self.tracker.pages += 1;
    }

    /// Page succeeded and the caller has everything it asked for
    pub fn complete(mut self) {
        self.resolved = true;
        self.tracker.state = CursorState::Idle;
        self.tracker.cursor = None;
        self.tracker.pages += 1;
    }

    /// Request or decode failed; the cursor is discarded
    pub fn fail(mut self) {
        self.resolved = true;
        self.tracker.state = CursorState::Failed;
        self.tracker.cursor = None;
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            debug!("Page fetch abandoned at {:?}, resetting cursor", self.cursor.token);
            self.tracker.reset();
        }
    }
}
