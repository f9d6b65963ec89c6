//! Error types surfaced by the consensus engine and the mempool.
use thiserror::Error;

use crate::types::Hash256;

/// A consensus rule violation. The block (or its sender) is at fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("block {0} already exists")] DuplicateBlock(Hash256),
    #[error("block {0} is known to be invalid")] KnownInvalid(Hash256),
    #[error("block is missing {} parents", .0.len())] MissingParents(Vec<Hash256>),
    #[error("block has no parents but is not genesis")] NoParents,
    #[error("block has no transactions")] NoTransactions,
    #[error("timestamp {timestamp} is too far in the future")] TimeTooFarInFuture { timestamp: i64 },
    #[error("invalid block: {0}")] InvalidBlock(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error(transparent)] Rule(#[from] RuleError),
    #[error("block not found: {0}")] BlockNotFound(Hash256),
    #[error("consensus internal: {0}")] Internal(String),
}

impl ConsensusError {
    /// The unknown parents, if this is a missing-parents rule error.
    pub fn missing_parents(&self) -> Option<&[Hash256]> {
        match self {
            ConsensusError::Rule(RuleError::MissingParents(missing)) => Some(missing),
            _ => None,
        }
    }

    /// Whether this is a rule violation (as opposed to an engine failure).
    pub fn is_rule_error(&self) -> bool {
        matches!(self, ConsensusError::Rule(_))
    }
}

/// A mempool rule violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxRuleError {
    #[error("transaction {0} already in mempool")] AlreadyInMempool(Hash256),
    #[error("transaction {0} is an orphan and orphans are not allowed")] OrphanNotAllowed(Hash256),
    #[error("double spend: {0}")] DoubleSpend(String),
    #[error("fee too low: {0}")] LowFee(u64),
    #[error("invalid transaction: {0}")] Invalid(String),
}

impl TxRuleError {
    /// Only transactions that could never be valid mark their relayer as
    /// misbehaving. Conflicts and policy rejections happen to honest peers.
    pub fn is_ban_worthy(&self) -> bool {
        matches!(self, TxRuleError::Invalid(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error(transparent)] Rule(#[from] TxRuleError),
    #[error("mempool internal: {0}")] Internal(String),
}
