/// HTTP connector for exchange REST APIs
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, Connector, HttpMethod, RawResponse};
use crate::types::ExchangeKind;

const OANDA_LIVE_URL: &str = "https://api-fxtrade.oanda.com";
const OANDA_PRACTICE_URL: &str = "https://api-fxpractice.oanda.com";
const BINANCE_URL: &str = "https://api.binance.com";
const COINBASE_URL: &str = "https://api.exchange.coinbase.com";

const USER_AGENT: &str = concat!("candlefeed/", env!("CARGO_PKG_VERSION"));

type HmacSha256 = Hmac<Sha256>;

/// Credential material injected once at construction
#[derive(Clone)]
pub enum Credentials {
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// API key sent in an exchange-specific header
    ApiKey(String),
    /// `CB-ACCESS-*` HMAC-SHA256 request signing; `secret` is the
    /// base64-decoded API secret
    Hmac {
        key: String,
        secret: Vec<u8>,
        passphrase: String,
    },
}

impl Credentials {
    /// Coinbase Exchange key. The secret is issued base64 encoded.
    pub fn coinbase(
        key: impl Into<String>,
        secret: &str,
        passphrase: impl Into<String>,
    ) -> Result<Self> {
        let secret = STANDARD
            .decode(secret.trim())
            .map_err(|e| CandleError::config(format!("coinbase api_secret is not base64: {}", e)))?;
        Ok(Credentials::Hmac {
            key: key.into(),
            secret,
            passphrase: passphrase.into(),
        })
    }
}

// Secrets must never reach the logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
            Credentials::ApiKey(_) => f.write_str("ApiKey(***)"),
            Credentials::Hmac { .. } => f.write_str("Hmac(***)"),
        }
    }
}

/// reqwest-backed connector for a single exchange
pub struct HttpConnector {
    client: Client,
    exchange: ExchangeKind,
    base_url: String,
    credentials: Credentials,
}

impl HttpConnector {
    pub fn new(
        exchange: ExchangeKind,
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CandleError::config(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CandleError::config("exchange base URL is empty"));
        }

        debug!("{} connector initialised (base_url={})", exchange, base_url);

        Ok(HttpConnector {
            client,
            exchange,
            base_url,
            credentials,
        })
    }

    pub fn oanda(token: impl Into<String>, practice: bool, timeout: Duration) -> Result<Self> {
        let base = if practice { OANDA_PRACTICE_URL } else { OANDA_LIVE_URL };
        Self::new(ExchangeKind::Oanda, base, Credentials::Bearer(token.into()), timeout)
    }

    pub fn binance(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let credentials = api_key.map(Credentials::ApiKey).unwrap_or(Credentials::None);
        Self::new(ExchangeKind::Binance, BINANCE_URL, credentials, timeout)
    }

    /// Public market data needs no key; pass `Credentials::None`
    pub fn coinbase(credentials: Credentials, timeout: Duration) -> Result<Self> {
        Self::new(ExchangeKind::Coinbase, COINBASE_URL, credentials, timeout)
    }

    fn build_url(&self, request: &ApiRequest) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|e| CandleError::config(format!("Invalid request URL: {}", e)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    /// Header carrying the older-page marker on paginated endpoints
    fn continuation_header(&self) -> Option<&'static str> {
        match self.exchange {
            ExchangeKind::Coinbase => Some("cb-after"),
            _ => None,
        }
    }

    /// base64 HMAC-SHA256 of `timestamp + METHOD + path?query + body`
    fn sign(
        secret: &[u8],
        timestamp: &str,
        method: HttpMethod,
        url: &Url,
        body: &str,
    ) -> Result<String> {
        let request_path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| CandleError::config(format!("HMAC error: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_str().as_bytes());
        mac.update(request_path.as_bytes());
        mac.update(body.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn request_body(request: &ApiRequest) -> Result<String> {
        match &request.body {
            Some(value) => serde_json::to_string(value)
                .map_err(|e| CandleError::config(format!("Unserializable request body: {}", e))),
            None => Ok(String::new()),
        }
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        request: &ApiRequest,
        url: &Url,
        body: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let builder = match &self.credentials {
            Credentials::None => builder,
            Credentials::Bearer(token) => builder.bearer_auth(token),
            Credentials::ApiKey(key) => builder.header("X-MBX-APIKEY", key),
            Credentials::Hmac {
                key,
                secret,
                passphrase,
            } => {
                let timestamp = chrono::Utc::now().timestamp().to_string();
                let signature = Self::sign(secret, &timestamp, request.method, url, body)?;
                builder
                    .header("CB-ACCESS-KEY", key)
                    .header("CB-ACCESS-TIMESTAMP", timestamp)
                    .header("CB-ACCESS-SIGN", signature)
                    .header("CB-ACCESS-PASSPHRASE", passphrase)
            }
        };
        Ok(builder)
    }
}

/// Pull a human-readable message out of an exchange error body
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["msg", "message", "errorMessage", "error"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn exchange(&self) -> ExchangeKind {
        self.exchange
    }

    async fn request(&self, request: &ApiRequest) -> Result<RawResponse> {
        let url = self.build_url(request)?;
        let body = Self::request_body(request)?;

        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };

        let mut builder = self
            .client
            .request(method, url.clone())
            .header("Accept", "application/json");
        if request.body.is_some() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body.clone());
        }
        let builder = self.authorize(builder, request, &url, &body)?;

        debug!("{} {} {}", self.exchange, request.method.as_str(), url.path());

        let response = builder.send().await?;
        let status = response.status();
        let continuation = self.continuation_header().and_then(|name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let text = response.text().await?;

        debug!(
            "{} response status: {}, {} bytes",
            self.exchange,
            status,
            text.len()
        );

        if status.as_u16() != 200 {
            return Err(CandleError::exchange(
                Some(status.as_u16()),
                error_message(&text),
            ));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            CandleError::parse(format!("{} {} ({})", self.exchange, url.path(), e), &text)
        })?;

        Ok(RawResponse { body, continuation })
    }
}
