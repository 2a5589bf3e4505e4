//! Reorg resolution: find the last block both sides agree on.
//!
//! The crawler notices a reorg when the hash it stored for its head height
//! differs from the peer's hash at that height. It then walks back one height
//! at a time, comparing stored and peer hashes, until they agree or the walk
//! exceeds `max_depth`. Everything above the agreed height is rolled back.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::peer::PeerAdapter;
use crate::store::{ChainStore, RollbackSummary};

/// Describes a resolved chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    pub chain_id: String,
    /// Head height at which the divergence was noticed.
    pub detected_at: u64,
    /// Last height where local and peer hashes agree. `None` if the
    /// divergence reaches below the first recorded block.
    pub common_ancestor: Option<u64>,
    /// Number of recorded blocks dropped.
    pub depth: u64,
    pub rollback: RollbackSummary,
}

/// Where the local and peer chains last agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestor {
    /// Hashes agree at this height.
    At(u64),
    /// No recorded block agrees; restart from the first recorded height.
    BeforeFirstBlock,
}

/// Walk back from `from_height` (exclusive) to the highest height whose stored
/// hash matches the peer's.
///
/// Fails with [`LedgerError::ReorgTooDeep`] if more than `max_depth` heights
/// would have to be dropped.
pub async fn find_common_ancestor(
    store: &dyn ChainStore,
    peer: &dyn PeerAdapter,
    chain_id: &str,
    from_height: u64,
    max_depth: u64,
) -> Result<Ancestor, LedgerError> {
    let mut height = from_height;
    let mut depth = 1;
    while height > 0 {
        height -= 1;
        let Some(local) = store.scanned_block(chain_id, height).await? else {
            return Ok(Ancestor::BeforeFirstBlock);
        };
        let peer_hash = peer.block_hash(height).await?;
        if peer_hash.as_deref() == Some(local.block_hash.as_str()) {
            return Ok(Ancestor::At(height));
        }
        depth += 1;
        if depth > max_depth {
            tracing::error!(chain = %chain_id, from_height, max_depth, "Reorg deeper than allowed");
            return Err(LedgerError::ReorgTooDeep {
                from: from_height,
                max_depth,
            });
        }
        tracing::debug!(chain = %chain_id, height, "Hash mismatch, walking back");
    }
    Ok(Ancestor::BeforeFirstBlock)
}

/// Find the common ancestor below `detected_at` and roll the store back to it.
pub async fn resolve(
    store: &dyn ChainStore,
    peer: &dyn PeerAdapter,
    chain_id: &str,
    detected_at: u64,
    max_depth: u64,
) -> Result<ReorgEvent, LedgerError> {
    let ancestor = find_common_ancestor(store, peer, chain_id, detected_at, max_depth).await?;
    let target = match ancestor {
        Ancestor::At(h) => Some(h),
        Ancestor::BeforeFirstBlock => None,
    };
    let rollback = store.rollback_to(chain_id, target).await?;
    let depth = rollback.blocks_removed as u64;

    tracing::warn!(
        chain = %chain_id,
        depth,
        at = detected_at,
        ancestor = ?target,
        transactions = rollback.transactions_removed,
        "Reorg detected, rolled back"
    );

    Ok(ReorgEvent {
        chain_id: chain_id.to_string(),
        detected_at,
        common_ancestor: target,
        depth,
        rollback,
    })
}
