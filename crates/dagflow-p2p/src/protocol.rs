//! Message types exchanged between dagflow peers.
//!
//! Messages are transport-agnostic values. Each carries a [`MessageCommand`]
//! used by the router to pick the route (and therefore the flow) that
//! consumes it. Size limits are enforced by [`Message::validate`] before a
//! message reaches any flow.

use dagflow_core::constants::{
    MAX_INV_PER_TX_INV_MSG, MAX_REQUESTED_BLOCKS, MAX_REQUESTED_TRANSACTIONS,
};
use dagflow_core::types::{Block, Hash256, SubnetworkId, Transaction};
use std::fmt;

use crate::error::FlowError;
use crate::peer::PeerId;

/// Discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageCommand {
    Version,
    Verack,
    Ping,
    Pong,
    InvRelayBlock,
    RequestRelayBlocks,
    Block,
    InvTransactions,
    RequestTransactions,
    Transaction,
    TransactionNotFound,
    RequestSelectedTip,
    SelectedTip,
    RequestIbdBlocks,
    IbdBlock,
    DoneIbdBlocks,
    Reject,
}

impl fmt::Display for MessageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageCommand::Version => "version",
            MessageCommand::Verack => "verack",
            MessageCommand::Ping => "ping",
            MessageCommand::Pong => "pong",
            MessageCommand::InvRelayBlock => "invrelblk",
            MessageCommand::RequestRelayBlocks => "getrelblks",
            MessageCommand::Block => "block",
            MessageCommand::InvTransactions => "invtxs",
            MessageCommand::RequestTransactions => "gettxs",
            MessageCommand::Transaction => "tx",
            MessageCommand::TransactionNotFound => "txnotfound",
            MessageCommand::RequestSelectedTip => "getseltip",
            MessageCommand::SelectedTip => "seltip",
            MessageCommand::RequestIbdBlocks => "getibdblks",
            MessageCommand::IbdBlock => "ibdblock",
            MessageCommand::DoneIbdBlocks => "doneibdblks",
            MessageCommand::Reject => "reject",
        };
        f.write_str(name)
    }
}

/// Payload of the `Version` message sent first on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub protocol_version: u32,
    /// Network name; peers on different networks refuse each other.
    pub network: String,
    /// Random per-process identity used to detect self-connections and duplicates.
    pub id: PeerId,
    pub user_agent: String,
    /// The sender's selected tip at handshake time.
    pub selected_tip: Hash256,
    pub subnetwork_id: SubnetworkId,
    /// Sender's wall clock, milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// A p2p message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    /// Announces a block the sender has fully validated.
    InvRelayBlock(Hash256),
    RequestRelayBlocks(Vec<Hash256>),
    Block(Box<Block>),
    /// Announces transactions accepted into the sender's mempool.
    InvTransactions(Vec<Hash256>),
    RequestTransactions(Vec<Hash256>),
    Transaction(Box<Transaction>),
    TransactionNotFound(Hash256),
    RequestSelectedTip,
    SelectedTip(Hash256),
    /// Request the blocks in the past of `high` that are not in the past of `low`.
    RequestIbdBlocks { low: Hash256, high: Hash256 },
    IbdBlock(Box<Block>),
    DoneIbdBlocks,
    /// Sent before the sender drops the connection for a protocol violation.
    Reject(String),
}

impl Message {
    pub fn command(&self) -> MessageCommand {
        match self {
            Message::Version(_) => MessageCommand::Version,
            Message::Verack => MessageCommand::Verack,
            Message::Ping(_) => MessageCommand::Ping,
            Message::Pong(_) => MessageCommand::Pong,
            Message::InvRelayBlock(_) => MessageCommand::InvRelayBlock,
            Message::RequestRelayBlocks(_) => MessageCommand::RequestRelayBlocks,
            Message::Block(_) => MessageCommand::Block,
            Message::InvTransactions(_) => MessageCommand::InvTransactions,
            Message::RequestTransactions(_) => MessageCommand::RequestTransactions,
            Message::Transaction(_) => MessageCommand::Transaction,
            Message::TransactionNotFound(_) => MessageCommand::TransactionNotFound,
            Message::RequestSelectedTip => MessageCommand::RequestSelectedTip,
            Message::SelectedTip(_) => MessageCommand::SelectedTip,
            Message::RequestIbdBlocks { .. } => MessageCommand::RequestIbdBlocks,
            Message::IbdBlock(_) => MessageCommand::IbdBlock,
            Message::DoneIbdBlocks => MessageCommand::DoneIbdBlocks,
            Message::Reject(_) => MessageCommand::Reject,
        }
    }

    /// Validate message size limits.
    ///
    /// A violation is ban-worthy: honest peers never exceed them.
    pub fn validate(&self) -> Result<(), FlowError> {
        let (len, max) = match self {
            Message::InvTransactions(ids) => (ids.len(), MAX_INV_PER_TX_INV_MSG),
            Message::RequestTransactions(ids) => (ids.len(), MAX_REQUESTED_TRANSACTIONS),
            Message::RequestRelayBlocks(hashes) => (hashes.len(), MAX_REQUESTED_BLOCKS),
            _ => return Ok(()),
        };
        if len == 0 {
            return Err(FlowError::ban(format!("empty {} message", self.command())));
        }
        if len > max {
            return Err(FlowError::ban(format!(
                "{} carries {len} entries, max {max}",
                self.command()
            )));
        }
        Ok(())
    }
}
