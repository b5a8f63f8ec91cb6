pub mod cursor;
pub mod series;
pub mod in_progress;
pub mod trade_buffer;
pub mod supplier;
pub mod stream;

pub use cursor::{CursorState, CursorToken, CursorTracker, PaginationCursor};
pub use in_progress::reconstruct;
pub use series::SeriesBuilder;
pub use stream::CandleStream;
pub use supplier::{Backfill, BackfillOutcome, BackfillStatus, CandleDataSupplier, Termination};
pub use trade_buffer::{ConcurrentTradeBuffer, TradeBuffer};
