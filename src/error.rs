/// Centralized error types for candle ingestion
use thiserror::Error;

/// Longest payload fragment kept on a parse error.
const FRAGMENT_LIMIT: usize = 240;

#[derive(Error, Debug)]
pub enum CandleError {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Exchange Errors
    #[error("Exchange error ({}): {message}", status_label(.status_code))]
    Exchange {
        status_code: Option<u16>,
        message: String,
    },

    // Data Errors
    #[error("Parse error in {context}: {fragment}")]
    Parse { context: String, fragment: String },

    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CandleError>,
    },
}

pub type Result<T> = std::result::Result<T, CandleError>;

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {}", code),
        None => "transport".to_string(),
    }
}

impl CandleError {
    pub fn config(message: impl Into<String>) -> Self {
        CandleError::Configuration(message.into())
    }

    pub fn exchange(status_code: Option<u16>, message: impl Into<String>) -> Self {
        CandleError::Exchange {
            status_code,
            message: message.into(),
        }
    }

    /// Build a parse error, keeping only a bounded fragment of the payload.
    pub fn parse(context: impl Into<String>, payload: &str) -> Self {
        let fragment = if payload.len() > FRAGMENT_LIMIT {
            let mut end = FRAGMENT_LIMIT;
            while !payload.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &payload[..end])
        } else {
            payload.to_string()
        };

        CandleError::Parse {
            context: context.into(),
            fragment,
        }
    }

    /// Check if the failed request may be issued again
    pub fn is_retryable(&self) -> bool {
        match self {
            CandleError::Exchange { status_code, .. } => match status_code {
                None => true,
                Some(429) => true,
                Some(code) => (500..600).contains(code),
            },
            _ => false,
        }
    }

    /// Check if the error came from a rate limit response
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            CandleError::Exchange {
                status_code: Some(429),
                ..
            }
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            CandleError::Configuration(_) => "CFG_001",
            CandleError::Exchange { status_code: None, .. } => "NET_001",
            CandleError::Exchange {
                status_code: Some(429),
                ..
            } => "EXCH_429",
            CandleError::Exchange { status_code: Some(code), .. } if *code >= 500 => "EXCH_5XX",
            CandleError::Exchange { .. } => "EXCH_4XX",
            CandleError::Parse { .. } => "DATA_001",
            CandleError::RetriesExhausted { .. } => "NET_002",
        }
    }
}

impl From<reqwest::Error> for CandleError {
    fn from(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            err.to_string()
        };
        CandleError::Exchange {
            status_code,
            message,
        }
    }
}
