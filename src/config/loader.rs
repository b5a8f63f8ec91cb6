/// Configuration loading from TOML file
use std::path::Path;

use crate::config::AppConfig;
use crate::error::{CandleError, Result};
use crate::exchange::granularity;
use crate::types::ExchangeKind;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CandleError::config(format!("Failed to read config file: {}", e)))?;

    from_toml_str(&content)
}

pub fn from_toml_str(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)
        .map_err(|e| CandleError::config(format!("Failed to parse config: {}", e)))?;

    // Validate config
    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate market selection
    if config.exchange.instrument.trim().is_empty() {
        return Err(CandleError::config("exchange.instrument is empty"));
    }
    granularity::validate(config.exchange.kind, config.exchange.granularity)?;

    if config.exchange.kind == ExchangeKind::Oanda && config.credentials.token.is_none() {
        return Err(CandleError::config("credentials.token is required for oanda"));
    }
    if config.exchange.kind == ExchangeKind::Coinbase {
        let creds = &config.credentials;
        let given = [&creds.api_key, &creds.api_secret, &creds.passphrase]
            .iter()
            .filter(|value| value.is_some())
            .count();
        if given != 0 && given != 3 {
            return Err(CandleError::config(
                "coinbase needs credentials.api_key, credentials.api_secret and credentials.passphrase together",
            ));
        }
    }

    // Validate budgets
    if config.backfill.count == 0 {
        return Err(CandleError::config("backfill.count must be > 0"));
    }
    if config.backfill.page_size == Some(0) {
        return Err(CandleError::config("backfill.page_size must be > 0"));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(CandleError::config(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            config.retry.base_delay_ms, config.retry.max_delay_ms
        )));
    }
    if config.limits.max_concurrent_requests == Some(0) {
        return Err(CandleError::config("limits.max_concurrent_requests must be > 0"));
    }
    if config.limits.requests_per_second == Some(0) {
        return Err(CandleError::config("limits.requests_per_second must be > 0"));
    }
    if config.limits.request_timeout_secs == 0 {
        return Err(CandleError::config("limits.request_timeout_secs must be > 0"));
    }

    // Validate live polling
    if config.live.poll_interval_secs == 0 {
        return Err(CandleError::config("live.poll_interval_secs must be > 0"));
    }
    if config.live.use_trade_feed && config.exchange.kind != ExchangeKind::Binance {
        return Err(CandleError::config(format!(
            "live.use_trade_feed is only available on binance, not {}",
            config.exchange.kind
        )));
    }

    Ok(())
}
