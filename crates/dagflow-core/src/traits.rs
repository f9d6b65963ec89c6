//! Trait interfaces for the collaborators of the sync core.
//!
//! - [`ConsensusApi`]: block validation, storage and tip selection
//! - [`MiningManager`]: mempool and block-template manager
//!
//! Both are implemented outside this workspace by the full node. The
//! `testing` feature provides in-memory versions.

use crate::error::{ConsensusError, MempoolError};
use crate::types::{Block, BlockHeader, BlockInfo, BlockInsertionResult, Hash256, Transaction};

/// The DAG consensus engine as seen by the p2p layer.
///
/// All methods are synchronous and short; callers may hold a lock across
/// them but never across a network wait.
pub trait ConsensusApi: Send + Sync {
    /// Validate a full block and insert it into the DAG.
    ///
    /// Fails with [`RuleError::MissingParents`](crate::error::RuleError::MissingParents)
    /// when one or more parents are unknown.
    fn validate_and_insert_block(&self, block: &Block) -> Result<BlockInsertionResult, ConsensusError>;

    /// What consensus knows about `hash`.
    fn block_info(&self, hash: &Hash256) -> Result<BlockInfo, ConsensusError>;

    /// Whether consensus stores `hash`.
    ///
    /// Default implementation delegates to [`block_info`](Self::block_info).
    fn block_exists(&self, hash: &Hash256) -> Result<bool, ConsensusError> {
        Ok(self.block_info(hash)?.exists)
    }

    /// Header of the virtual block's selected parent (the node's selected tip).
    fn virtual_selected_parent(&self) -> Result<BlockHeader, ConsensusError>;

    /// Header of a stored block. Fails with `BlockNotFound` if unknown.
    fn block_header(&self, hash: &Hash256) -> Result<BlockHeader, ConsensusError>;

    /// A stored block with its transactions. `None` if unknown.
    fn block(&self, hash: &Hash256) -> Result<Option<Block>, ConsensusError>;

    /// Hashes of the blocks in the past of `high` (inclusive) that are not in
    /// the past of `low` (inclusive), in topological order, at most `max`.
    fn block_hashes_between(
        &self,
        low: &Hash256,
        high: &Hash256,
        max: usize,
    ) -> Result<Vec<Hash256>, ConsensusError>;

    /// The current pruning point.
    fn pruning_point(&self) -> Result<Hash256, ConsensusError>;
}

/// The mempool / mining manager as seen by the p2p layer.
pub trait MiningManager: Send + Sync {
    /// Remove the transactions of a newly accepted block from the mempool.
    ///
    /// Returns mempool orphans that became valid and were accepted as a result.
    fn handle_new_block_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<Vec<Transaction>, MempoolError>;

    /// Validate a transaction and insert it into the mempool.
    ///
    /// Returns every transaction accepted as a result: the transaction itself
    /// plus any orphans it unlocked.
    fn validate_and_insert_transaction(
        &self,
        transaction: Transaction,
        is_local: bool,
        allow_orphan: bool,
    ) -> Result<Vec<Transaction>, MempoolError>;

    /// A mempool transaction by ID.
    fn transaction(&self, id: &Hash256) -> Option<Transaction>;

    /// Whether the mempool holds `id`.
    ///
    /// Default implementation delegates to [`transaction`](Self::transaction).
    fn has_transaction(&self, id: &Hash256) -> bool {
        self.transaction(id).is_some()
    }

    /// Re-validate locally submitted transactions and return the IDs of
    /// those still valid, for periodic rebroadcast.
    fn revalidate_high_priority_transactions(&self) -> Result<Vec<Hash256>, MempoolError>;
}
