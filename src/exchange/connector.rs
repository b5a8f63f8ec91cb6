/// Raw request contract shared by every exchange connector
use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::ExchangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// One exchange call: verb, path and optional query/body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        ApiRequest {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parsed HTTP 200 body plus the exchange's continuation header, if any
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub body: Value,
    pub continuation: Option<String>,
}

impl RawResponse {
    pub fn new(body: Value) -> Self {
        RawResponse {
            body,
            continuation: None,
        }
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }
}

/// Executes raw requests against one exchange. Implementations attach their
/// credentials to every request and never retry internally.
#[async_trait]
pub trait Connector: Send + Sync {
    fn exchange(&self) -> ExchangeKind;

    async fn request(&self, request: &ApiRequest) -> Result<RawResponse>;
}
