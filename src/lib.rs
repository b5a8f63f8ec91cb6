pub mod types;
pub mod error;
pub mod exchange;
pub mod data;
pub mod config;
pub mod utils;

pub use types::*;
pub use error::{CandleError, Result};
pub use config::AppConfig;
