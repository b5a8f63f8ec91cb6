/// Scripted connector for tests
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CandleError, Result};
use crate::exchange::connector::{ApiRequest, Connector, RawResponse};
use crate::types::ExchangeKind;

/// Replays queued outcomes in order and records every request it sees.
/// An empty script answers with an empty JSON array.
pub struct MockConnector {
    exchange: ExchangeKind,
    script: Mutex<VecDeque<Result<RawResponse>>>,
    requests: Mutex<Vec<ApiRequest>>,
    hang: bool,
}

impl MockConnector {
    pub fn new(exchange: ExchangeKind) -> Self {
        MockConnector {
            exchange,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// Every request stays pending forever
    pub fn hanging(exchange: ExchangeKind) -> Self {
        MockConnector {
            hang: true,
            ..Self::new(exchange)
        }
    }

    pub fn respond(self, body: Value) -> Self {
        self.script.lock().unwrap().push_back(Ok(RawResponse::new(body)));
        self
    }

    pub fn respond_with(self, response: RawResponse) -> Self {
        self.script.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn fail(self, status_code: Option<u16>, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(CandleError::exchange(status_code, message)));
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn exchange(&self) -> ExchangeKind {
        self.exchange
    }

    async fn request(&self, request: &ApiRequest) -> Result<RawResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(RawResponse::new(Value::Array(Vec::new()))))
    }
}
