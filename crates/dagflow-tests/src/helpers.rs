//! Shared helpers for multi-node tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use dagflow_core::constants::PROTOCOL_VERSION;
use dagflow_core::testing::{MemoryConsensus, MemoryMempool, genesis_block};
use dagflow_core::traits::ConsensusApi;
use dagflow_core::types::{Block, Hash256, SubnetworkId};
use dagflow_p2p::memory::pipe;
use dagflow_p2p::{BanList, FlowConfig, FlowContext, FlowDispatcher, FlowError, FlowHandlers, PeerId, VersionMessage};
use tokio::task::JoinHandle;

static NEXT_HOST: AtomicU16 = AtomicU16::new(1);

/// Simnet timers with banning on and immediate transaction announcements.
pub fn test_config() -> FlowConfig {
    FlowConfig {
        enable_banning: true,
        tx_propagation_interval: Duration::ZERO,
        tx_rebroadcast_interval: Duration::from_secs(3600),
        ..FlowConfig::simnet()
    }
}

/// A node with its own consensus, mempool and ban list.
pub struct TestNode {
    pub address: SocketAddr,
    pub consensus: Arc<MemoryConsensus>,
    pub mempool: Arc<MemoryMempool>,
    pub bans: Arc<BanList>,
    pub dispatcher: FlowDispatcher,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with(test_config(), FlowHandlers::new())
    }

    pub fn with(config: FlowConfig, handlers: FlowHandlers) -> Self {
        let host = NEXT_HOST.fetch_add(1, Ordering::Relaxed);
        let [hi, lo] = host.to_be_bytes();
        let address = SocketAddr::from(([10, 0, hi, lo], 16_111));
        let consensus = Arc::new(MemoryConsensus::new(genesis_block()));
        let mempool = Arc::new(MemoryMempool::new());
        let bans = Arc::new(BanList::new());
        let ctx = FlowContext::new(config, consensus.clone(), mempool.clone(), bans.clone(), handlers);
        Self {
            address,
            consensus,
            mempool,
            bans,
            dispatcher: FlowDispatcher::new(ctx),
        }
    }

    pub fn ctx(&self) -> &Arc<FlowContext> {
        self.dispatcher.context()
    }

    /// Insert blocks straight into consensus, bypassing the flow context.
    pub fn preload(&self, blocks: &[Block]) {
        for block in blocks {
            self.consensus
                .validate_and_insert_block(block)
                .expect("preloaded block inserts");
        }
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Both ends of a connection between two nodes.
pub struct Link {
    pub dialer: JoinHandle<Result<(), FlowError>>,
    pub listener: JoinHandle<Result<(), FlowError>>,
}

/// Connect `dialer` to `listener` over an in-memory pipe.
pub fn connect(dialer: &TestNode, listener: &TestNode) -> Link {
    let (outbound, inbound) = pipe(listener.address, dialer.address, 1_024);
    Link {
        dialer: dialer.dispatcher.spawn(outbound),
        listener: listener.dispatcher.spawn(inbound),
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until both nodes list each other as peers.
pub async fn wait_connected(a: &TestNode, b: &TestNode) {
    let connected = wait_for(Duration::from_secs(5), || {
        a.ctx().peer(&b.ctx().local_id()).is_some() && b.ctx().peer(&a.ctx().local_id()).is_some()
    })
    .await;
    assert!(connected, "nodes did not complete the handshake");
}

/// A `Version` as a well-behaved remote on `config`'s network would send it.
pub fn remote_version(config: &FlowConfig, id: PeerId, selected_tip: Hash256) -> VersionMessage {
    VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        network: config.network.name().to_string(),
        id,
        user_agent: "/scripted-peer/".into(),
        selected_tip,
        subnetwork_id: SubnetworkId::NATIVE,
        timestamp: 0,
    }
}
