//! Flow and flow-context errors.
//!
//! Every error that ends a flow is a [`FlowError`]. The variant is decided
//! where the error originates, so the dispatcher only has to match on it.

use dagflow_core::error::{ConsensusError, MempoolError};
use dagflow_core::types::Hash256;
use thiserror::Error;

use crate::peer::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// A route was closed deliberately (peer disconnect, local teardown or
    /// shutdown). Ends the flow without being an error.
    #[error("route closed")]
    RouteClosed,
    /// The peer violated the protocol. `ban` is decided by the detecting flow.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String, ban: bool },
    /// A bounded wait for a response expired.
    #[error("timeout: {0}")]
    Timeout(String),
    /// A broken local invariant. There is no safe recovery.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FlowError {
    /// A protocol violation that disconnects without banning.
    pub fn protocol(reason: impl Into<String>) -> Self {
        FlowError::Protocol {
            reason: reason.into(),
            ban: false,
        }
    }

    /// A protocol violation that bans the peer's address.
    pub fn ban(reason: impl Into<String>) -> Self {
        FlowError::Protocol {
            reason: reason.into(),
            ban: true,
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        FlowError::Timeout(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        FlowError::Fatal(reason.into())
    }

    /// Rule violations are the sender's fault; anything else is ours.
    pub fn from_consensus(err: ConsensusError, context: &str) -> Self {
        match err {
            ConsensusError::Rule(rule) => FlowError::ban(format!("{context}: {rule}")),
            other => FlowError::fatal(format!("{context}: {other}")),
        }
    }

    pub fn from_mempool(err: MempoolError, context: &str) -> Self {
        match err {
            MempoolError::Rule(rule) => FlowError::Protocol {
                ban: rule.is_ban_worthy(),
                reason: format!("{context}: {rule}"),
            },
            MempoolError::Internal(msg) => FlowError::fatal(format!("{context}: {msg}")),
        }
    }

    /// Whether this error ends a flow quietly.
    pub fn is_route_closed(&self) -> bool {
        matches!(self, FlowError::RouteClosed)
    }
}

impl From<ConsensusError> for FlowError {
    fn from(err: ConsensusError) -> Self {
        FlowError::from_consensus(err, "consensus")
    }
}

impl From<MempoolError> for FlowError {
    fn from(err: MempoolError) -> Self {
        FlowError::from_mempool(err, "mempool")
    }
}

/// Error returned by a callback registered on the flow context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Errors from [`FlowContext`](crate::flow_context::FlowContext) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("peer {0} is already connected")] DuplicatePeer(PeerId),
    #[error("block {0} is header-only")] HeaderOnlyBlock(Hash256),
    #[error(transparent)] Consensus(#[from] ConsensusError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error("handler failed: {0}")] Handler(#[from] HandlerError),
}

impl From<ContextError> for FlowError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::DuplicatePeer(id) => FlowError::protocol(format!("peer {id} is already connected")),
            ContextError::HeaderOnlyBlock(hash) => FlowError::ban(format!("block {hash} is header-only")),
            ContextError::Consensus(err) => FlowError::from(err),
            ContextError::Mempool(err) => FlowError::from(err),
            ContextError::Handler(err) => FlowError::fatal(format!("handler failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_core::error::{RuleError, TxRuleError};

    #[test]
    fn protocol_and_ban_constructors() {
        assert_eq!(
            FlowError::protocol("x"),
            FlowError::Protocol { reason: "x".into(), ban: false }
        );
        assert_eq!(
            FlowError::ban("y"),
            FlowError::Protocol { reason: "y".into(), ban: true }
        );
    }

    #[test]
    fn consensus_rule_errors_ban() {
        let err = FlowError::from_consensus(RuleError::NoTransactions.into(), "relay");
        assert!(matches!(err, FlowError::Protocol { ban: true, .. }));
    }

    #[test]
    fn consensus_internal_errors_are_fatal() {
        let err = FlowError::from(ConsensusError::Internal("db".into()));
        assert!(matches!(err, FlowError::Fatal(_)));
    }

    #[test]
    fn mempool_rule_errors_ban_only_when_worthy() {
        let soft = FlowError::from(MempoolError::from(TxRuleError::LowFee(1)));
        assert!(matches!(soft, FlowError::Protocol { ban: false, .. }));
        let hard = FlowError::from(MempoolError::from(TxRuleError::Invalid("script".into())));
        assert!(matches!(hard, FlowError::Protocol { ban: true, .. }));
    }

    #[test]
    fn context_errors_map_to_flow_errors() {
        let dup = FlowError::from(ContextError::DuplicatePeer(PeerId([1; 16])));
        assert!(matches!(dup, FlowError::Protocol { ban: false, .. }));
        let header_only = FlowError::from(ContextError::HeaderOnlyBlock(Hash256::ZERO));
        assert!(matches!(header_only, FlowError::Protocol { ban: true, .. }));
        let handler = FlowError::from(ContextError::Handler(HandlerError("rpc down".into())));
        assert!(matches!(handler, FlowError::Fatal(_)));
    }

    #[test]
    fn route_closed_is_quiet() {
        assert!(FlowError::RouteClosed.is_route_closed());
        assert!(!FlowError::timeout("ping").is_route_closed());
    }
}
