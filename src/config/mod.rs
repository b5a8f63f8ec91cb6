/// Application configuration
pub mod loader;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::data::CandleDataSupplier;
use crate::error::{CandleError, Result};
use crate::exchange::{dialect_for, Credentials, HttpConnector};
use crate::types::{ExchangeKind, Granularity};
use crate::utils::{ExchangeLimiter, RetryPolicy};

pub use loader::{from_toml_str, load_config};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub backfill: BackfillSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub live: LiveSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSection {
    pub kind: ExchangeKind,
    pub instrument: String,
    /// Candle duration in seconds
    pub granularity: Granularity,
}

// Debug is derived on the parent; keep secrets out of it.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialsSection {
    /// Oanda personal access token
    pub token: Option<String>,
    pub api_key: Option<String>,
    /// Coinbase issues this base64 encoded
    pub api_secret: Option<String>,
    /// Coinbase API key passphrase
    pub passphrase: Option<String>,
    /// Oanda practice (fxTrade Practice) host
    #[serde(default)]
    pub practice: bool,
}

impl std::fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "***"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("practice", &self.practice)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillSection {
    pub count: usize,
    /// Candles per request; the exchange maximum when unset
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl Default for BackfillSection {
    fn default() -> Self {
        BackfillSection {
            count: 200,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        RetrySection {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

/// Missing values fall back to the exchange's published limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_concurrent_requests: Option<usize>,
    pub requests_per_second: Option<u32>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for LimitsSection {
    fn default() -> Self {
        LimitsSection {
            max_concurrent_requests: None,
            requests_per_second: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSection {
    pub poll_interval_secs: u64,
    /// Binance only: fold the websocket trade stream instead of polling
    #[serde(default)]
    pub use_trade_feed: bool,
}

impl Default for LiveSection {
    fn default() -> Self {
        LiveSection {
            poll_interval_secs: 5,
            use_trade_feed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn limiter(&self) -> ExchangeLimiter {
        let kind = self.exchange.kind;
        let published = ExchangeLimiter::for_exchange(kind);
        match (self.limits.max_concurrent_requests, self.limits.requests_per_second) {
            (None, None) => published,
            (concurrent, rate) => ExchangeLimiter::new(
                kind,
                concurrent.unwrap_or(published.max_concurrent()),
                rate.unwrap_or(published.requests_per_second()),
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs)
    }

    pub fn connector(&self) -> Result<HttpConnector> {
        let creds = &self.credentials;
        let timeout = self.request_timeout();
        match self.exchange.kind {
            ExchangeKind::Oanda => {
                let token = creds.token.clone().ok_or_else(|| {
                    CandleError::config("credentials.token is required for oanda")
                })?;
                HttpConnector::oanda(token, creds.practice, timeout)
            }
            ExchangeKind::Binance => HttpConnector::binance(creds.api_key.clone(), timeout),
            ExchangeKind::Coinbase => {
                let credentials = match (&creds.api_key, &creds.api_secret, &creds.passphrase) {
                    (Some(key), Some(secret), Some(passphrase)) => {
                        Credentials::coinbase(key.as_str(), secret, passphrase.as_str())?
                    }
                    _ => Credentials::None,
                };
                HttpConnector::coinbase(credentials, timeout)
            }
        }
    }

    /// Supplier wired with this configuration's connector, limits and retries
    pub fn supplier(&self) -> Result<CandleDataSupplier> {
        let supplier = CandleDataSupplier::new(
            Arc::new(self.connector()?),
            dialect_for(self.exchange.kind),
            Arc::new(self.limiter()),
            self.retry_policy(),
            self.exchange.instrument.clone(),
            self.exchange.granularity,
        )?;
        Ok(match self.backfill.page_size {
            Some(size) => supplier.with_page_size(size),
            None => supplier,
        })
    }
}
