//! The `RpcTransport` trait and the id-checking `RpcClient` on top of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RpcError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RpcId};

/// Moves one request to a node and back.
///
/// Object-safe, so peers hold it as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, RpcError>;

    /// Endpoint identifier for logs.
    fn url(&self) -> &str;
}

/// Issues calls with fresh correlation ids and a per-call deadline.
///
/// A response whose id differs from the request's is rejected as
/// [`RpcError::IdMismatch`].
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    version: JsonRpcVersion,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>, version: JsonRpcVersion, timeout: Duration) -> Self {
        // Seeded from the clock so ids do not repeat across restarts.
        let seed = chrono::Utc::now().timestamp_millis().max(1) as u64;
        Self {
            transport,
            version,
            timeout,
            next_id: AtomicU64::new(seed),
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Call `method` and return the raw result value.
    pub async fn call_value(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(self.version, id, method, params);
        let ms = self.timeout.as_millis() as u64;

        let resp = tokio::time::timeout(self.timeout, self.transport.send(req))
            .await
            .map_err(|_| RpcError::Timeout { ms })??;

        let expected = RpcId::Number(id);
        if resp.id != expected {
            tracing::warn!(
                url = %self.transport.url(),
                method,
                expected = %expected,
                actual = %resp.id,
                "Response id mismatch"
            );
            return Err(RpcError::IdMismatch {
                expected: expected.to_string(),
                actual: resp.id.to_string(),
            });
        }
        resp.into_result().map_err(RpcError::Rpc)
    }

    /// Call `method` and deserialize the result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, RpcError> {
        let value = self.call_value(method, params).await?;
        serde_json::from_value(value).map_err(RpcError::Deserialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    fn client(mock: Arc<MockTransport>) -> RpcClient {
        RpcClient::new(mock, JsonRpcVersion::V1, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn returns_typed_result() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getblockcount", vec![], json!(812_345));
        let height: u64 = client(mock.clone()).call("getblockcount", vec![]).await.unwrap();
        assert_eq!(height, 812_345);
        assert_eq!(mock.requests()[0].jsonrpc, "1.0");
    }

    #[tokio::test]
    async fn ids_are_unique_per_call() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getblockcount", vec![], json!(1));
        let c = client(mock.clone());
        c.call_value("getblockcount", vec![]).await.unwrap();
        c.call_value("getblockcount", vec![]).await.unwrap();
        let reqs = mock.requests();
        assert_ne!(reqs[0].id, reqs[1].id);
    }

    #[tokio::test]
    async fn mismatched_id_fails_call() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getblockcount", vec![], json!(1));
        mock.force_response_id(Some(RpcId::Number(0)));
        let err = client(mock).call_value("getblockcount", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::IdMismatch { .. }));
    }

    #[tokio::test]
    async fn slow_node_times_out() {
        let mock = Arc::new(MockTransport::new());
        mock.on("getblockcount", vec![], json!(1));
        mock.set_delay(Duration::from_millis(500));
        let err = client(mock).call_value("getblockcount", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { ms: 100 }));
    }

    #[tokio::test]
    async fn node_error_is_surfaced() {
        let mock = Arc::new(MockTransport::new());
        mock.on_error("getblockhash", vec![json!(9_999_999)], -8, "Block height out of range");
        let err = client(mock)
            .call_value("getblockhash", vec![json!(9_999_999)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(-8));
    }
}
