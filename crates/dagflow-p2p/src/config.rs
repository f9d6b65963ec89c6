//! Configuration for the dagflow sync core.

use dagflow_core::constants::{
    DAG_TIME_STALENESS_MS, DEFAULT_OUTGOING_CAPACITY, DEFAULT_ROUTE_CAPACITY, IBD_ROUTE_CAPACITY,
    MAX_INV_PER_TX_INV_MSG, MAX_ORPHANS, MAX_ORPHAN_ROOTS_TO_REQUEST, NetworkType, PROTOCOL_VERSION,
    TX_PROPAGATION_INTERVAL_MS, TX_REBROADCAST_INTERVAL_SECS,
};
use dagflow_core::types::SubnetworkId;
use std::time::Duration;

/// Configuration shared by every flow of a node.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Network advertised and required in the handshake.
    pub network: NetworkType,
    /// Protocol version advertised in the handshake.
    pub protocol_version: u32,
    /// Free-form agent string advertised in the handshake.
    pub user_agent: String,
    /// Subnetwork this node follows. Native nodes accept any peer.
    pub subnetwork_id: SubnetworkId,
    /// Capacity of a flow's incoming route unless the flow asks for more.
    pub default_route_capacity: usize,
    /// Capacity of the route carrying IBD blocks.
    pub ibd_route_capacity: usize,
    /// Capacity of a connection's outgoing queue.
    pub outgoing_capacity: usize,
    /// Upper bound on the whole version/verack exchange.
    pub handshake_timeout: Duration,
    /// Upper bound on a single awaited response (pong, block, transaction).
    pub response_timeout: Duration,
    /// Interval between outgoing pings.
    pub ping_interval: Duration,
    /// Maximum IDs per transaction announcement.
    pub max_tx_inv_per_msg: usize,
    /// Minimum interval between transaction announcement flushes.
    pub tx_propagation_interval: Duration,
    /// Minimum interval between rebroadcasts of local transactions.
    pub tx_rebroadcast_interval: Duration,
    /// The node is current while its selected tip is younger than this.
    pub dag_time_staleness: Duration,
    /// Orphan pool bound.
    pub max_orphans: usize,
    /// Orphans with more missing roots than this start IBD instead.
    pub max_orphan_roots_to_request: usize,
    /// When false, ban-worthy violations only disconnect.
    pub enable_banning: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            protocol_version: PROTOCOL_VERSION,
            user_agent: format!("/dagflow:{}/", env!("CARGO_PKG_VERSION")),
            subnetwork_id: SubnetworkId::NATIVE,
            default_route_capacity: DEFAULT_ROUTE_CAPACITY,
            ibd_route_capacity: IBD_ROUTE_CAPACITY,
            outgoing_capacity: DEFAULT_OUTGOING_CAPACITY,
            handshake_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(120),
            max_tx_inv_per_msg: MAX_INV_PER_TX_INV_MSG,
            tx_propagation_interval: Duration::from_millis(TX_PROPAGATION_INTERVAL_MS),
            tx_rebroadcast_interval: Duration::from_secs(TX_REBROADCAST_INTERVAL_SECS),
            dag_time_staleness: Duration::from_millis(DAG_TIME_STALENESS_MS as u64),
            max_orphans: MAX_ORPHANS,
            max_orphan_roots_to_request: MAX_ORPHAN_ROOTS_TO_REQUEST,
            enable_banning: true,
        }
    }
}

impl FlowConfig {
    /// Configuration preset for mainnet.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Configuration preset for testnet.
    pub fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            ..Self::default()
        }
    }

    /// Configuration preset for local simulation: short timers, no banning.
    pub fn simnet() -> Self {
        Self {
            network: NetworkType::Simnet,
            handshake_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
            tx_propagation_interval: Duration::from_millis(50),
            tx_rebroadcast_interval: Duration::from_secs(5),
            enable_banning: false,
            ..Self::default()
        }
    }

    /// Staleness window in milliseconds, as compared against header timestamps.
    pub fn staleness_window_ms(&self) -> i64 {
        i64::try_from(self.dag_time_staleness.as_millis()).unwrap_or(i64::MAX)
    }
}
