//! chainledger-evm — account-model chain support.
//!
//! - [`EvmPeer`]: [`PeerAdapter`](chainledger_core::PeerAdapter) over
//!   Ethereum JSON-RPC 2.0, with optional receipt fetching
//! - [`AccountDecoder`]: native value transfers plus ERC-20 `transfer` /
//!   `transferFrom` calls to configured token contracts
//!
//! Balances on account-model chains are refreshed by the crawler's default
//! sync hook after every cycle that commits blocks.

pub mod command;
pub mod decoder;
pub mod peer;

pub use command::EvmCommand;
pub use decoder::AccountDecoder;
pub use peer::EvmPeer;
