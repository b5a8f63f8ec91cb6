pub mod rate_limiter;
pub mod retry;
pub mod time;

pub use rate_limiter::{ExchangeLimiter, RateLimiter};
pub use retry::RetryPolicy;
pub use time::*;
