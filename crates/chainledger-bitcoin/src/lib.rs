//! chainledger-bitcoin — UTXO-model chain support.
//!
//! - [`BitcoinPeer`]: [`PeerAdapter`](chainledger_core::PeerAdapter) over
//!   bitcoind JSON-RPC 1.0
//! - [`UtxoDecoder`]: verbose transaction JSON to inputs/outputs in satoshis
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chainledger_bitcoin::{BitcoinPeer, UtxoDecoder};
//! use chainledger_rpc::{HttpConfig, HttpTransport};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new("http://127.0.0.1:8332", HttpConfig::default())?;
//! let peer = BitcoinPeer::new(Arc::new(transport), Duration::from_secs(30));
//! let decoder = UtxoDecoder::new("btc");
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod decoder;
pub mod peer;

pub use command::BitcoinCommand;
pub use decoder::UtxoDecoder;
pub use peer::BitcoinPeer;
