//! Scripted transport for tests: responses keyed by method and params.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcError;
use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::transport::RpcTransport;

#[derive(Default)]
struct Script {
    exact: HashMap<(String, String), Result<Value, JsonRpcError>>,
    by_method: HashMap<String, Result<Value, JsonRpcError>>,
    requests: Vec<JsonRpcRequest>,
    forced_id: Option<RpcId>,
    delay: Duration,
    down: bool,
}

/// An in-process node. Unscripted calls fail with an HTTP error.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

fn key(method: &str, params: &[Value]) -> (String, String) {
    (method.to_string(), Value::from(params.to_vec()).to_string())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut guard = match self.script.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Answer `method(params)` with `result`, replacing any earlier script.
    pub fn on(&self, method: &str, params: Vec<Value>, result: Value) {
        self.with_script(|s| s.exact.insert(key(method, &params), Ok(result)));
    }

    /// Answer `method(params)` with a node error.
    pub fn on_error(&self, method: &str, params: Vec<Value>, code: i64, message: &str) {
        let err = JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        };
        self.with_script(|s| s.exact.insert(key(method, &params), Err(err)));
    }

    /// Answer `method` with `result` whatever the params, unless an exact script matches.
    pub fn on_method(&self, method: &str, result: Value) {
        self.with_script(|s| s.by_method.insert(method.to_string(), Ok(result)));
    }

    pub fn forget(&self, method: &str, params: Vec<Value>) {
        self.with_script(|s| s.exact.remove(&key(method, &params)));
    }

    /// Stamp every response with this id instead of the request's.
    pub fn force_response_id(&self, id: Option<RpcId>) {
        self.with_script(|s| s.forced_id = id);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.with_script(|s| s.delay = delay);
    }

    /// While down, every call fails with an HTTP error.
    pub fn set_down(&self, down: bool) {
        self.with_script(|s| s.down = down);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<JsonRpcRequest> {
        self.with_script(|s| s.requests.clone())
    }

    pub fn count(&self, method: &str) -> usize {
        self.with_script(|s| s.requests.iter().filter(|r| r.method == method).count())
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError> {
        let (delay, down, answer, id) = self.with_script(|s| {
            s.requests.push(req.clone());
            let answer = s
                .exact
                .get(&key(&req.method, &req.params))
                .or_else(|| s.by_method.get(&req.method))
                .cloned();
            let id = s.forced_id.clone().unwrap_or_else(|| req.id.clone());
            (s.delay, s.down, answer, id)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if down {
            return Err(RpcError::Http("connection refused".into()));
        }
        match answer {
            Some(Ok(result)) => Ok(JsonRpcResponse::success(id, result)),
            Some(Err(error)) => Ok(JsonRpcResponse::failure(id, error)),
            None => Err(RpcError::Http(format!(
                "no scripted response for {}({})",
                req.method,
                Value::from(req.params.clone())
            ))),
        }
    }

    fn url(&self) -> &str {
        "mock://node"
    }
}
