//! # dagflow-p2p: peer-to-peer sync core.
//!
//! Runs the per-peer protocol flows of a blockDAG node against pluggable
//! consensus and mempool engines. A transport hands each connection to
//! [`FlowDispatcher::handle_connection`]; the flows of every peer share one
//! [`FlowContext`], which owns the peer set, the IBD coordinator, the orphan
//! pool, request deduplication and transaction propagation.
//!
//! [`memory::pipe`] wires two nodes together in-process.

pub mod ban_list;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod flow_context;
pub mod flows;
pub mod ibd;
pub mod memory;
pub mod orphans;
pub mod peer;
pub mod propagation;
pub mod protocol;
pub mod router;
pub mod shutdown;

pub use ban_list::BanList;
pub use config::FlowConfig;
pub use connection::{AddressBook, ConnectionHandle, NetConnection};
pub use dedup::{ClaimBatch, RequestedSet};
pub use dispatcher::{ErrorAction, FlowDispatcher, classify};
pub use error::{ContextError, FlowError, HandlerError};
pub use flow_context::{FlowContext, FlowHandlers};
pub use ibd::{IbdCoordinator, IbdStart, IbdState};
pub use orphans::{OrphanPool, UnorphanedBlock};
pub use peer::{Peer, PeerId};
pub use propagation::{RebroadcastTimer, TransactionPropagator};
pub use protocol::{Message, MessageCommand, VersionMessage};
pub use router::{IncomingRoute, OutgoingRoute, Router};
pub use shutdown::{ShutdownController, ShutdownSignal};
