pub mod connector;
pub mod http;
pub mod wire;
pub mod granularity;
pub mod dialect;
pub mod oanda;
pub mod binance;
pub mod coinbase;
pub mod feed;

#[cfg(test)]
pub mod mock;

pub use connector::{ApiRequest, Connector, HttpMethod, RawResponse};
pub use dialect::{dialect_for, Dialect, InProgressPlan, TradePage};
pub use feed::TradeFeed;
pub use granularity::{supported_granularities, validate};
pub use http::{Credentials, HttpConnector};
