//! State shared by every flow of every peer.
//!
//! The [`FlowContext`] is the only place where flows of different peers meet:
//! the peer set, the IBD coordinator, the orphan pool, the request dedup sets
//! and the transaction propagator all live here. It also hosts the
//! block- and transaction-acceptance pipelines so that relay, IBD and local
//! submission share one ordering.

use dagflow_core::error::ConsensusError;
use dagflow_core::time::unix_now_millis;
use dagflow_core::traits::{ConsensusApi, MiningManager};
use dagflow_core::types::{Block, BlockInsertionResult, Hash256, Transaction};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::connection::AddressBook;
use crate::dedup::RequestedSet;
use crate::error::{ContextError, HandlerError};
use crate::ibd::{IbdCoordinator, IbdStart};
use crate::orphans::OrphanPool;
use crate::peer::{Peer, PeerId};
use crate::propagation::{RebroadcastTimer, TransactionPropagator};
use crate::protocol::{Message, VersionMessage};
use crate::router::TryEnqueueError;
use crate::shutdown::{ShutdownController, ShutdownSignal};

pub type BlockAddedHandler =
    Box<dyn Fn(&Block, &BlockInsertionResult) -> Result<(), HandlerError> + Send + Sync>;
pub type TransactionsAddedHandler =
    Box<dyn Fn(&[Transaction]) -> Result<(), HandlerError> + Send + Sync>;
pub type PruningPointOverrideHandler = Box<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;

/// Callbacks into the rest of the node (RPC notifications, indexers).
#[derive(Default)]
pub struct FlowHandlers {
    on_block_added: Option<BlockAddedHandler>,
    on_transactions_added: Option<TransactionsAddedHandler>,
    on_pruning_point_utxo_set_override: Option<PruningPointOverrideHandler>,
}

impl FlowHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per newly accepted block, parents before children.
    pub fn on_block_added(
        mut self,
        handler: impl Fn(&Block, &BlockInsertionResult) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Self {
        self.on_block_added = Some(Box::new(handler));
        self
    }

    /// Called with every group of transactions accepted into the mempool.
    pub fn on_transactions_added(
        mut self,
        handler: impl Fn(&[Transaction]) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Self {
        self.on_transactions_added = Some(Box::new(handler));
        self
    }

    /// Called after an IBD session moved the pruning point.
    pub fn on_pruning_point_utxo_set_override(
        mut self,
        handler: impl Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Self {
        self.on_pruning_point_utxo_set_override = Some(Box::new(handler));
        self
    }
}

/// Cross-peer state and the acceptance pipelines.
pub struct FlowContext {
    config: FlowConfig,
    local_id: PeerId,
    consensus: Arc<dyn ConsensusApi>,
    mining: Arc<dyn MiningManager>,
    address_book: Arc<dyn AddressBook>,
    handlers: FlowHandlers,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    ibd: IbdCoordinator,
    orphans: Mutex<OrphanPool>,
    requested_blocks: Arc<RequestedSet>,
    requested_transactions: Arc<RequestedSet>,
    propagator: TransactionPropagator,
    rebroadcast: RebroadcastTimer,
    shutdown: ShutdownController,
}

impl FlowContext {
    pub fn new(
        config: FlowConfig,
        consensus: Arc<dyn ConsensusApi>,
        mining: Arc<dyn MiningManager>,
        address_book: Arc<dyn AddressBook>,
        handlers: FlowHandlers,
    ) -> Arc<Self> {
        let local_id = PeerId::random();
        info!(id = %local_id, network = config.network.name(), "flow_context: created");
        Arc::new(Self {
            ibd: IbdCoordinator::new(config.staleness_window_ms()),
            orphans: Mutex::new(OrphanPool::new(config.max_orphans)),
            requested_blocks: Arc::new(RequestedSet::new("blocks")),
            requested_transactions: Arc::new(RequestedSet::new("transactions")),
            propagator: TransactionPropagator::new(config.max_tx_inv_per_msg, config.tx_propagation_interval),
            rebroadcast: RebroadcastTimer::new(config.tx_rebroadcast_interval),
            shutdown: ShutdownController::new(),
            peers: RwLock::new(HashMap::new()),
            local_id,
            consensus,
            mining,
            address_book,
            handlers,
            config,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn consensus(&self) -> &dyn ConsensusApi {
        self.consensus.as_ref()
    }

    pub fn mining(&self) -> &dyn MiningManager {
        self.mining.as_ref()
    }

    pub fn address_book(&self) -> &dyn AddressBook {
        self.address_book.as_ref()
    }

    pub fn requested_blocks(&self) -> &Arc<RequestedSet> {
        &self.requested_blocks
    }

    pub fn requested_transactions(&self) -> &Arc<RequestedSet> {
        &self.requested_transactions
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// Wake every flow of every peer; they end with `RouteClosed`.
    pub fn shutdown(&self) {
        info!("flow_context: shutting down");
        self.shutdown.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// The version message this node sends in every handshake.
    pub fn local_version(&self) -> Result<VersionMessage, ConsensusError> {
        Ok(VersionMessage {
            protocol_version: self.config.protocol_version,
            network: self.config.network.name().to_string(),
            id: self.local_id,
            user_agent: self.config.user_agent.clone(),
            selected_tip: self.consensus.virtual_selected_parent()?.hash(),
            subnetwork_id: self.config.subnetwork_id,
            timestamp: unix_now_millis(),
        })
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<(), ContextError> {
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.id()) {
            return Err(ContextError::DuplicatePeer(peer.id()));
        }
        info!(%peer, outbound = peer.is_outbound(), "flow_context: peer added");
        peers.insert(peer.id(), peer);
        Ok(())
    }

    /// Remove a peer. If it held the IBD session, the session ends and
    /// another peer may be chosen.
    pub fn remove_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().remove(id);
        if let Some(peer) = &removed {
            info!(%peer, "flow_context: peer removed");
            self.finish_ibd(id);
        }
        removed
    }

    /// Connected peers, sorted by id.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id());
        peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Enqueue `message` to every peer without waiting.
    ///
    /// A peer whose outgoing queue is full is disconnected instead of
    /// slowing everyone else down. Returns the number of peers reached.
    pub fn broadcast(&self, message: Message) -> usize {
        let peers = self.peers.read();
        let mut reached = 0;
        for peer in peers.values() {
            match peer.outgoing().try_enqueue(message.clone()) {
                Ok(()) => reached += 1,
                Err(TryEnqueueError::Full) => {
                    warn!(%peer, command = %message.command(), "flow_context: outgoing queue full, disconnecting");
                    peer.disconnect();
                }
                Err(TryEnqueueError::Closed) => {
                    debug!(%peer, "flow_context: skipping closed peer");
                }
            }
        }
        reached
    }

    // ------------------------------------------------------------------
    // IBD
    // ------------------------------------------------------------------

    pub fn is_ibd_running(&self) -> bool {
        self.ibd.is_running()
    }

    pub fn ibd_peer(&self) -> Option<Arc<Peer>> {
        self.ibd.peer()
    }

    /// Start IBD with a peer that is ahead of us, if there is one.
    ///
    /// Returns whether a session was started by this call. With no
    /// candidate and a stale selected tip, asks every peer for its tip.
    pub fn try_start_ibd(&self) -> Result<bool, ContextError> {
        match self.ibd.try_start(|| self.peers(), self.consensus(), unix_now_millis())? {
            IbdStart::Started(peer) => {
                peer.request_ibd();
                Ok(true)
            }
            IbdStart::AlreadyRunning(_) => Ok(false),
            IbdStart::NoCandidate { dag_time_current } => {
                if !dag_time_current && self.peer_count() > 0 {
                    debug!("flow_context: selected tip is stale, requesting peer tips");
                    self.request_selected_tips();
                }
                Ok(false)
            }
        }
    }

    /// End the IBD session held by `peer` and look for another candidate.
    pub fn finish_ibd(&self, peer: &PeerId) {
        if self.ibd.finish(peer) {
            if let Err(e) = self.try_start_ibd() {
                warn!(error = %e, "flow_context: failed to restart IBD");
            }
        }
    }

    /// Ask every peer for its current selected tip.
    pub fn request_selected_tips(&self) -> usize {
        self.broadcast(Message::RequestSelectedTip)
    }

    // ------------------------------------------------------------------
    // Orphans
    // ------------------------------------------------------------------

    pub fn add_orphan(&self, block: Block) {
        let hash = block.hash();
        let evicted = self.orphans.lock().add_orphan(block);
        debug!(%hash, ?evicted, "flow_context: added orphan");
    }

    pub fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.orphans.lock().contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Unknown ancestors that must arrive before orphan `hash` can be inserted.
    pub fn orphan_roots(&self, hash: &Hash256) -> Result<Vec<Hash256>, ContextError> {
        Ok(self.orphans.lock().missing_roots(hash, self.consensus())?)
    }

    // ------------------------------------------------------------------
    // Block acceptance
    // ------------------------------------------------------------------

    /// Run the post-acceptance pipeline for a block consensus just inserted.
    ///
    /// Resolves the orphans it unlocks, feeds every accepted block's
    /// transactions to the mempool and reports each block to the handler in
    /// insertion order, then propagates the transactions the mempool
    /// accepted. Returns the hashes of all accepted blocks, `block` first.
    ///
    /// The first error stops the pipeline; blocks already reported stay
    /// reported.
    pub fn on_new_block_accepted(
        &self,
        block: &Block,
        insertion_result: BlockInsertionResult,
    ) -> Result<Vec<Hash256>, ContextError> {
        let unorphaned = self
            .orphans
            .lock()
            .unorphan_blocks_rooted_at(block.hash(), self.consensus())?;

        let mut accepted_hashes = Vec::with_capacity(1 + unorphaned.len());
        let mut accepted_transactions = Vec::new();

        accepted_hashes.push(block.hash());
        accepted_transactions.extend(self.mining.handle_new_block_transactions(&block.transactions)?);
        self.report_block_added(block, &insertion_result)?;

        for entry in &unorphaned {
            accepted_hashes.push(entry.block.hash());
            accepted_transactions
                .extend(self.mining.handle_new_block_transactions(&entry.block.transactions)?);
            self.report_block_added(&entry.block, &entry.insertion_result)?;
        }

        if !unorphaned.is_empty() {
            info!(root = %block.hash(), count = unorphaned.len(), "flow_context: unorphaned blocks");
        }

        self.propagate_after_blocks(accepted_transactions)?;
        Ok(accepted_hashes)
    }

    fn report_block_added(&self, block: &Block, result: &BlockInsertionResult) -> Result<(), ContextError> {
        if let Some(handler) = &self.handlers.on_block_added {
            handler(block, result)?;
        }
        Ok(())
    }

    /// Report and propagate transactions unlocked by new blocks, plus the
    /// periodic rebroadcast of local transactions when due. Nothing is
    /// announced during IBD.
    fn propagate_after_blocks(&self, accepted: Vec<Transaction>) -> Result<(), ContextError> {
        if !accepted.is_empty() {
            self.report_transactions_added(&accepted)?;
        }
        if self.is_ibd_running() {
            return Ok(());
        }
        let mut ids: Vec<Hash256> = accepted.iter().map(Transaction::id).collect();
        if self.rebroadcast.should_rebroadcast_at(Instant::now()) {
            let local = self.mining.revalidate_high_priority_transactions()?;
            debug!(count = local.len(), "flow_context: rebroadcasting local transactions");
            ids.extend(local);
        }
        if !ids.is_empty() {
            self.enqueue_transaction_ids_for_propagation(ids);
        }
        Ok(())
    }

    /// Validate and insert a locally mined block, then announce it.
    ///
    /// Only the new block is announced, not the orphans it unlocked.
    pub fn add_block(&self, block: Block) -> Result<(), ContextError> {
        if block.is_header_only() {
            return Err(ContextError::HeaderOnlyBlock(block.hash()));
        }
        let result = self.consensus.validate_and_insert_block(&block)?;
        self.on_new_block_accepted(&block, result)?;
        self.broadcast(Message::InvRelayBlock(block.hash()));
        Ok(())
    }

    /// Pruning point moved during IBD; let the node rebuild derived state.
    pub fn on_pruning_point_utxo_set_override(&self) -> Result<(), ContextError> {
        info!("flow_context: pruning point UTXO set overridden");
        if let Some(handler) = &self.handlers.on_pruning_point_utxo_set_override {
            handler()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction acceptance
    // ------------------------------------------------------------------

    /// Validate and insert a locally submitted transaction, then announce it.
    pub fn add_transaction(&self, transaction: Transaction, allow_orphan: bool) -> Result<(), ContextError> {
        let accepted = self
            .mining
            .validate_and_insert_transaction(transaction, true, allow_orphan)?;
        self.on_transactions_accepted(&accepted)
    }

    /// Report transactions the mempool accepted and queue them for announcement.
    pub fn on_transactions_accepted(&self, accepted: &[Transaction]) -> Result<(), ContextError> {
        if accepted.is_empty() {
            return Ok(());
        }
        self.report_transactions_added(accepted)?;
        self.enqueue_transaction_ids_for_propagation(accepted.iter().map(Transaction::id).collect());
        Ok(())
    }

    fn report_transactions_added(&self, transactions: &[Transaction]) -> Result<(), ContextError> {
        if let Some(handler) = &self.handlers.on_transactions_added {
            handler(transactions)?;
        }
        Ok(())
    }

    /// Add IDs to the propagation queue; announces them when a batch is due.
    /// Returns the number of announcement batches broadcast.
    pub fn enqueue_transaction_ids_for_propagation(&self, ids: Vec<Hash256>) -> usize {
        self.propagator.enqueue(ids, |batch| {
            self.broadcast(Message::InvTransactions(batch));
        })
    }

    pub fn pending_transaction_announcements(&self) -> usize {
        self.propagator.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_list::BanList;
    use crate::memory::{loopback_peer, loopback_peer_with_capacity};
    use dagflow_core::error::TxRuleError;
    use dagflow_core::testing::{
        MemoryConsensus, MemoryMempool, chain_on, child_of, genesis_block, sample_transaction,
    };
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    struct Fixture {
        ctx: Arc<FlowContext>,
        consensus: Arc<MemoryConsensus>,
        mempool: Arc<MemoryMempool>,
        genesis: Block,
    }

    fn fixture_with(config: FlowConfig, handlers: FlowHandlers) -> Fixture {
        let genesis = genesis_block();
        let consensus = Arc::new(MemoryConsensus::new(genesis.clone()));
        let mempool = Arc::new(MemoryMempool::new());
        let ctx = FlowContext::new(
            config,
            consensus.clone(),
            mempool.clone(),
            Arc::new(BanList::new()),
            handlers,
        );
        Fixture { ctx, consensus, mempool, genesis }
    }

    fn immediate_config() -> FlowConfig {
        FlowConfig {
            tx_propagation_interval: Duration::ZERO,
            tx_rebroadcast_interval: Duration::from_secs(3600),
            ..FlowConfig::simnet()
        }
    }

    fn fixture() -> Fixture {
        fixture_with(immediate_config(), FlowHandlers::new())
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    // ------------------------------------------------------------------
    // Peers and broadcast
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn duplicate_peer_rejected() {
        let f = fixture();
        let (peer, _rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer.clone()).unwrap();
        assert_eq!(
            f.ctx.add_peer(peer),
            Err(ContextError::DuplicatePeer(PeerId([1; 16])))
        );
        assert_eq!(f.ctx.peer_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let f = fixture();
        let (a, mut rx_a) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        let (b, mut rx_b) = loopback_peer(PeerId([2; 16]), f.genesis.hash());
        f.ctx.add_peer(a).unwrap();
        f.ctx.add_peer(b).unwrap();

        assert_eq!(f.ctx.broadcast(Message::Ping(5)), 2);
        assert_eq!(drain(&mut rx_a), vec![Message::Ping(5)]);
        assert_eq!(drain(&mut rx_b), vec![Message::Ping(5)]);
    }

    #[tokio::test]
    async fn broadcast_disconnects_slow_peer() {
        let f = fixture();
        let (slow, _rx) = loopback_peer_with_capacity(PeerId([1; 16]), f.genesis.hash(), 1);
        f.ctx.add_peer(slow.clone()).unwrap();

        assert_eq!(f.ctx.broadcast(Message::Ping(1)), 1);
        assert_eq!(f.ctx.broadcast(Message::Ping(2)), 0);
        assert!(!slow.is_connected());
    }

    // ------------------------------------------------------------------
    // Block acceptance
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn add_block_announces_block() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();

        let block = child_of(&f.genesis, 1);
        f.ctx.add_block(block.clone()).unwrap();

        assert!(f.consensus.contains(&block.hash()));
        assert_eq!(drain(&mut rx), vec![Message::InvRelayBlock(block.hash())]);
    }

    #[tokio::test]
    async fn add_block_announces_only_the_new_block() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();
        let chain = chain_on(&f.genesis, 2, 40);
        f.ctx.add_orphan(chain[1].clone());

        f.ctx.add_block(chain[0].clone()).unwrap();

        assert!(f.consensus.contains(&chain[1].hash()));
        assert_eq!(f.ctx.orphan_count(), 0);
        assert_eq!(drain(&mut rx), vec![Message::InvRelayBlock(chain[0].hash())]);
    }

    #[tokio::test]
    async fn add_block_rejects_header_only() {
        let f = fixture();
        let block = Block::from_header(child_of(&f.genesis, 1).header);
        let err = f.ctx.add_block(block.clone()).unwrap_err();
        assert_eq!(err, ContextError::HeaderOnlyBlock(block.hash()));
        assert!(!f.consensus.contains(&block.hash()));
    }

    #[tokio::test]
    async fn accepted_block_unorphans_and_reports_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = {
            let seen = seen.clone();
            FlowHandlers::new().on_block_added(move |block, _| {
                seen.lock().push(block.hash());
                Ok(())
            })
        };
        let f = fixture_with(immediate_config(), handlers);
        let chain = chain_on(&f.genesis, 3, 1);
        f.ctx.add_orphan(chain[2].clone());
        f.ctx.add_orphan(chain[1].clone());

        let result = f.consensus.validate_and_insert_block(&chain[0]).unwrap();
        let accepted = f.ctx.on_new_block_accepted(&chain[0], result).unwrap();

        let expected: Vec<Hash256> = chain.iter().map(Block::hash).collect();
        assert_eq!(accepted, expected);
        assert_eq!(*seen.lock(), expected);
        assert_eq!(f.ctx.orphan_count(), 0);
    }

    #[tokio::test]
    async fn handler_error_stops_pipeline() {
        let handlers = FlowHandlers::new().on_block_added(|_, _| Err(HandlerError("index offline".into())));
        let f = fixture_with(immediate_config(), handlers);
        let block = child_of(&f.genesis, 1);
        let result = f.consensus.validate_and_insert_block(&block).unwrap();
        let err = f.ctx.on_new_block_accepted(&block, result).unwrap_err();
        assert_eq!(err, ContextError::Handler(HandlerError("index offline".into())));
    }

    #[tokio::test]
    async fn block_transactions_unlock_mempool_orphans() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();
        let unlocked = sample_transaction(77);
        f.mempool.queue_unorphaned(unlocked.clone());

        let block = child_of(&f.genesis, 1);
        let result = f.consensus.validate_and_insert_block(&block).unwrap();
        f.ctx.on_new_block_accepted(&block, result).unwrap();

        assert_eq!(drain(&mut rx), vec![Message::InvTransactions(vec![unlocked.id()])]);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn add_transaction_announces_id() {
        let added = Arc::new(Mutex::new(0usize));
        let handlers = {
            let added = added.clone();
            FlowHandlers::new().on_transactions_added(move |txs| {
                *added.lock() += txs.len();
                Ok(())
            })
        };
        let f = fixture_with(immediate_config(), handlers);
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();

        let tx = sample_transaction(1);
        f.ctx.add_transaction(tx.clone(), false).unwrap();

        assert_eq!(drain(&mut rx), vec![Message::InvTransactions(vec![tx.id()])]);
        assert_eq!(*added.lock(), 1);
        assert!(f.mempool.has_transaction(&tx.id()));
    }

    #[tokio::test]
    async fn rejected_transaction_surfaces_mempool_error() {
        let f = fixture();
        let tx = sample_transaction(2);
        f.mempool.reject(tx.id(), TxRuleError::LowFee(1));
        let err = f.ctx.add_transaction(tx, false).unwrap_err();
        assert!(matches!(err, ContextError::Mempool(_)));
    }

    #[tokio::test]
    async fn announcements_wait_for_interval() {
        let config = FlowConfig {
            tx_propagation_interval: Duration::from_secs(3600),
            ..immediate_config()
        };
        let f = fixture_with(config, FlowHandlers::new());
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();

        f.ctx.add_transaction(sample_transaction(3), false).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.ctx.pending_transaction_announcements(), 1);
    }

    #[tokio::test]
    async fn due_announcement_goes_out_in_one_message() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();

        let ids: Vec<Hash256> = (0..12_001u32)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..4].copy_from_slice(&i.to_le_bytes());
                Hash256(bytes)
            })
            .collect();
        assert_eq!(f.ctx.enqueue_transaction_ids_for_propagation(ids.clone()), 1);

        assert_eq!(drain(&mut rx), vec![Message::InvTransactions(ids)]);
        assert_eq!(f.ctx.pending_transaction_announcements(), 0);
    }

    // ------------------------------------------------------------------
    // IBD
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn ibd_starts_with_peer_ahead_and_restarts_on_removal() {
        let f = fixture();
        let (a, _rx_a) = loopback_peer(PeerId([1; 16]), Hash256([0xaa; 32]));
        let (b, _rx_b) = loopback_peer(PeerId([2; 16]), Hash256([0xbb; 32]));
        f.ctx.add_peer(a).unwrap();
        f.ctx.add_peer(b).unwrap();

        assert!(f.ctx.try_start_ibd().unwrap());
        assert_eq!(f.ctx.ibd_peer().unwrap().id(), PeerId([1; 16]));
        assert!(!f.ctx.try_start_ibd().unwrap(), "only one session at a time");

        f.ctx.remove_peer(&PeerId([1; 16]));
        assert_eq!(f.ctx.ibd_peer().unwrap().id(), PeerId([2; 16]));

        // Still ahead, so finishing hands the next session to the same peer.
        f.ctx.finish_ibd(&PeerId([2; 16]));
        assert_eq!(f.ctx.ibd_peer().unwrap().id(), PeerId([2; 16]));

        f.ctx.peer(&PeerId([2; 16])).unwrap().set_selected_tip(f.genesis.hash());
        f.ctx.finish_ibd(&PeerId([2; 16]));
        assert!(!f.ctx.is_ibd_running());
    }

    #[test]
    fn racing_teardown_never_leaves_a_session_behind() {
        for _ in 0..200 {
            let f = fixture();
            let (peer, _rx) = loopback_peer(PeerId([1; 16]), Hash256([0xaa; 32]));
            f.ctx.add_peer(peer).unwrap();

            let starter = {
                let ctx = Arc::clone(&f.ctx);
                std::thread::spawn(move || ctx.try_start_ibd().unwrap())
            };
            let remover = {
                let ctx = Arc::clone(&f.ctx);
                std::thread::spawn(move || ctx.remove_peer(&PeerId([1; 16])))
            };
            starter.join().unwrap();
            assert!(remover.join().unwrap().is_some());

            assert_eq!(f.ctx.peer_count(), 0);
            assert!(!f.ctx.is_ibd_running());
        }
    }

    #[tokio::test]
    async fn stale_node_requests_tips() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), f.genesis.hash());
        f.ctx.add_peer(peer).unwrap();

        // Genesis is far in the past, so the node is not current.
        assert!(!f.ctx.try_start_ibd().unwrap());
        assert_eq!(drain(&mut rx), vec![Message::RequestSelectedTip]);
    }

    #[tokio::test]
    async fn transaction_propagation_paused_during_ibd() {
        let f = fixture();
        let (peer, mut rx) = loopback_peer(PeerId([1; 16]), Hash256([0xaa; 32]));
        f.ctx.add_peer(peer).unwrap();
        assert!(f.ctx.try_start_ibd().unwrap());
        f.mempool.queue_unorphaned(sample_transaction(9));

        let block = child_of(&f.genesis, 1);
        let result = f.consensus.validate_and_insert_block(&block).unwrap();
        f.ctx.on_new_block_accepted(&block, result).unwrap();

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn local_version_advertises_selected_tip() {
        let f = fixture();
        let version = f.ctx.local_version().unwrap();
        assert_eq!(version.selected_tip, f.genesis.hash());
        assert_eq!(version.id, f.ctx.local_id());
        assert_eq!(version.network, "dagflow-simnet");
    }

    #[tokio::test]
    async fn shutdown_is_observable() {
        let f = fixture();
        let signal = f.ctx.shutdown_signal();
        f.ctx.shutdown();
        assert!(signal.is_triggered());
        assert!(f.ctx.is_shutdown());
    }
}
