//! chainledger-rpc — JSON-RPC plumbing for ChainLedger peers.
//!
//! ```text
//! BitcoinPeer / EvmPeer
//!        └── RpcClient      (correlation ids, per-call timeout)
//!               └── RpcTransport
//!                      ├── HttpTransport (reqwest, basic auth, retry)
//!                      └── MockTransport (scripted, for tests)
//! ```

pub mod error;
pub mod http;
pub mod mock;
pub mod request;
pub mod retry;
pub mod transport;

pub use error::RpcError;
pub use http::{HttpConfig, HttpTransport};
pub use mock::MockTransport;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RpcId};
pub use retry::{RetryConfig, RetryPolicy};
pub use transport::{RpcClient, RpcTransport};
