//! Initial block download flows.
//!
//! The requesting side waits until the flow context picks its peer for an
//! IBD session, then downloads the blocks between our selected tip and the
//! peer's in batches. The serving side answers each batch request.

use async_trait::async_trait;
use dagflow_core::constants::MAX_IBD_BLOCKS_PER_REQUEST;
use dagflow_core::error::{ConsensusError, RuleError};
use dagflow_core::types::{Block, Hash256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::{Flow, unexpected};
use crate::peer::{Peer, PeerId};
use crate::protocol::Message;
use crate::router::{IncomingRoute, OutgoingRoute};

/// Ends the IBD session when dropped, on every exit path.
struct IbdSession {
    ctx: Arc<FlowContext>,
    peer: PeerId,
}

impl Drop for IbdSession {
    fn drop(&mut self) {
        self.ctx.finish_ibd(&self.peer);
    }
}

/// Runs IBD sessions assigned to this peer.
pub struct HandleIbd {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl HandleIbd {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            peer,
            incoming,
            outgoing,
        }
    }

    async fn run_session(&mut self) -> Result<(), FlowError> {
        let consensus = self.ctx.consensus();
        let pruning_point_before = consensus.pruning_point()?;
        self.download().await?;
        if self.ctx.consensus().pruning_point()? != pruning_point_before {
            self.ctx.on_pruning_point_utxo_set_override()?;
        }
        Ok(())
    }

    async fn download(&mut self) -> Result<(), FlowError> {
        let high = self.peer.selected_tip();
        let mut low = self.ctx.consensus().virtual_selected_parent()?.hash();
        let timeout = self.ctx.config().response_timeout;
        info!(peer = %self.peer, %low, %high, "ibd: downloading blocks");

        while !self.ctx.consensus().block_exists(&high)? {
            self.outgoing
                .enqueue(Message::RequestIbdBlocks { low, high })
                .await?;

            let mut last = None;
            let mut received = 0usize;
            loop {
                match self.incoming.dequeue_with_timeout(timeout).await? {
                    Message::IbdBlock(block) => {
                        let hash = block.hash();
                        self.insert_block(*block)?;
                        last = Some(hash);
                        received += 1;
                    }
                    Message::DoneIbdBlocks => break,
                    other => return Err(unexpected("ibd", &other)),
                }
            }
            debug!(peer = %self.peer, received, "ibd: batch done");

            match last {
                Some(hash) if hash != low => low = hash,
                _ => {
                    return Err(FlowError::protocol(format!(
                        "IBD made no progress towards {high}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn insert_block(&self, block: Block) -> Result<(), FlowError> {
        let hash = block.hash();
        if block.is_header_only() {
            return Err(FlowError::ban(format!("IBD block {hash} is header-only")));
        }
        match self.ctx.consensus().validate_and_insert_block(&block) {
            Ok(result) => {
                self.ctx.on_new_block_accepted(&block, result)?;
                Ok(())
            }
            Err(ConsensusError::Rule(RuleError::DuplicateBlock(_))) => Ok(()),
            Err(ConsensusError::Rule(RuleError::MissingParents(_))) => Err(FlowError::ban(format!(
                "IBD block {hash} arrived before its parents"
            ))),
            Err(err) => Err(FlowError::from_consensus(err, &format!("IBD block {hash}"))),
        }
    }
}

#[async_trait]
impl Flow for HandleIbd {
    fn name(&self) -> &'static str {
        "ibd"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            tokio::select! {
                _ = self.peer.ibd_requested() => {}
                _ = shutdown.wait() => return Err(FlowError::RouteClosed),
            }
            let is_ours = self.ctx.ibd_peer().is_some_and(|p| p.id() == self.peer.id());
            if !is_ours {
                continue;
            }

            let _session = IbdSession {
                ctx: Arc::clone(&self.ctx),
                peer: self.peer.id(),
            };
            self.run_session().await?;
            info!(peer = %self.peer, "ibd: session completed");
        }
    }
}

/// Serves `RequestIbdBlocks` batches.
pub struct HandleIbdBlockRequests {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl HandleIbdBlockRequests {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            peer,
            incoming,
            outgoing,
        }
    }

    fn hashes_between(&self, low: &Hash256, high: &Hash256) -> Result<Vec<Hash256>, FlowError> {
        match self
            .ctx
            .consensus()
            .block_hashes_between(low, high, MAX_IBD_BLOCKS_PER_REQUEST)
        {
            Ok(hashes) => Ok(hashes),
            Err(ConsensusError::BlockNotFound(hash)) => Err(FlowError::protocol(format!(
                "IBD requested up to unknown block {hash}"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Flow for HandleIbdBlockRequests {
    fn name(&self) -> &'static str {
        "ibd-block-requests"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            let (low, high) = match self.incoming.dequeue().await? {
                Message::RequestIbdBlocks { low, high } => (low, high),
                other => return Err(unexpected(self.name(), &other)),
            };
            let hashes = self.hashes_between(&low, &high)?;
            debug!(peer = %self.peer, count = hashes.len(), "ibd: serving blocks");
            for hash in hashes {
                let block = self
                    .ctx
                    .consensus()
                    .block(&hash)?
                    .ok_or_else(|| FlowError::fatal(format!("listed block {hash} is missing")))?;
                self.outgoing.enqueue(Message::IbdBlock(Box::new(block))).await?;
            }
            self.outgoing.enqueue(Message::DoneIbdBlocks).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_list::BanList;
    use crate::config::FlowConfig;
    use crate::flow_context::FlowHandlers;
    use crate::memory::loopback_peer;
    use crate::protocol::MessageCommand;
    use crate::router::Router;
    use dagflow_core::testing::{MemoryConsensus, MemoryMempool, chain_on, genesis_block};
    use dagflow_core::traits::ConsensusApi;
    use dagflow_core::types::BlockInsertionResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    struct Harness {
        ctx: Arc<FlowContext>,
        consensus: Arc<MemoryConsensus>,
        router: Router,
        sent: mpsc::Receiver<Message>,
    }

    fn harness(handlers: impl FnOnce(Arc<MemoryConsensus>) -> FlowHandlers) -> Harness {
        let consensus = Arc::new(MemoryConsensus::new(genesis_block()));
        let ctx = FlowContext::new(
            FlowConfig::simnet(),
            consensus.clone(),
            Arc::new(MemoryMempool::new()),
            Arc::new(BanList::new()),
            handlers(consensus.clone()),
        );
        let (tx, sent) = mpsc::channel(64);
        let router = Router::new(tx, ctx.shutdown_signal(), 64);
        Harness {
            ctx,
            consensus,
            router,
            sent,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn spawn_ibd(h: &Harness, peer: &Arc<Peer>) -> tokio::task::JoinHandle<Result<(), FlowError>> {
        let route = h
            .router
            .register("ibd", &[MessageCommand::IbdBlock, MessageCommand::DoneIbdBlocks], None)
            .unwrap();
        let flow = Box::new(HandleIbd::new(h.ctx.clone(), peer.clone(), route, h.router.outgoing()));
        tokio::spawn(flow.start())
    }

    // ------------------------------------------------------------------
    // Requesting side
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn session_downloads_and_reports_pruning_move() {
        let genesis = genesis_block();
        let chain = chain_on(&genesis, 5, 0);
        let pruning = chain[2].hash();
        let overrides = Arc::new(AtomicUsize::new(0));
        let mut h = harness(|consensus| {
            let overrides = overrides.clone();
            FlowHandlers::new()
                .on_block_added(move |block: &Block, _: &BlockInsertionResult| {
                    if block.hash() == pruning {
                        consensus.set_pruning_point(pruning);
                    }
                    Ok(())
                })
                .on_pruning_point_utxo_set_override(move || {
                    overrides.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
        });

        let tip = chain[4].hash();
        let (peer, _peer_rx) = loopback_peer(PeerId([9; 16]), tip);
        h.ctx.add_peer(peer.clone()).unwrap();
        let task = spawn_ibd(&h, &peer);
        assert!(h.ctx.try_start_ibd().unwrap());

        assert_eq!(
            h.sent.recv().await,
            Some(Message::RequestIbdBlocks {
                low: genesis.hash(),
                high: tip
            })
        );
        for block in &chain {
            h.router.route_incoming(Message::IbdBlock(Box::new(block.clone()))).unwrap();
        }
        h.router.route_incoming(Message::DoneIbdBlocks).unwrap();

        wait_until(|| !h.ctx.is_ibd_running()).await;
        assert!(h.consensus.contains(&tip));
        assert_eq!(overrides.load(Ordering::SeqCst), 1);

        h.ctx.shutdown();
        assert_eq!(task.await.unwrap(), Err(FlowError::RouteClosed));
    }

    #[tokio::test]
    async fn empty_batch_ends_session_with_error() {
        let mut h = harness(|_| FlowHandlers::new());
        let unknown = Hash256([0xee; 32]);
        let (peer, _peer_rx) = loopback_peer(PeerId([9; 16]), unknown);
        h.ctx.add_peer(peer.clone()).unwrap();
        let task = spawn_ibd(&h, &peer);
        assert!(h.ctx.try_start_ibd().unwrap());

        assert!(matches!(h.sent.recv().await, Some(Message::RequestIbdBlocks { .. })));
        h.router.route_incoming(Message::DoneIbdBlocks).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FlowError::Protocol { ban: false, .. }));
        // Teardown removes the failed peer, which ends its session for good.
        h.ctx.remove_peer(&peer.id());
        assert!(!h.ctx.is_ibd_running());
    }

    #[tokio::test]
    async fn block_ahead_of_parents_is_ban_worthy() {
        let genesis = genesis_block();
        let chain = chain_on(&genesis, 3, 0);
        let mut h = harness(|_| FlowHandlers::new());
        let (peer, _peer_rx) = loopback_peer(PeerId([9; 16]), chain[2].hash());
        h.ctx.add_peer(peer.clone()).unwrap();
        let task = spawn_ibd(&h, &peer);
        assert!(h.ctx.try_start_ibd().unwrap());

        assert!(matches!(h.sent.recv().await, Some(Message::RequestIbdBlocks { .. })));
        h.router.route_incoming(Message::IbdBlock(Box::new(chain[1].clone()))).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FlowError::Protocol { ban: true, .. }));
        h.ctx.remove_peer(&peer.id());
        assert!(!h.ctx.is_ibd_running());
    }

    #[tokio::test]
    async fn flow_ignores_requests_for_other_peers() {
        let h = harness(|_| FlowHandlers::new());
        let (idle, _idle_rx) = loopback_peer(PeerId([1; 16]), genesis_block().hash());
        let task = spawn_ibd(&h, &idle);

        // A stray wake-up without a session does nothing.
        idle.request_ibd();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        h.ctx.shutdown();
        assert_eq!(task.await.unwrap(), Err(FlowError::RouteClosed));
    }

    // ------------------------------------------------------------------
    // Serving side
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn serves_batches_in_order() {
        let genesis = genesis_block();
        let chain = chain_on(&genesis, 4, 0);
        let mut h = harness(|_| FlowHandlers::new());
        for block in &chain {
            h.consensus.validate_and_insert_block(block).unwrap();
        }
        let (peer, _peer_rx) = loopback_peer(PeerId([3; 16]), genesis.hash());
        let route = h
            .router
            .register("ibd-block-requests", &[MessageCommand::RequestIbdBlocks], None)
            .unwrap();
        let flow = Box::new(HandleIbdBlockRequests::new(h.ctx.clone(), peer, route, h.router.outgoing()));
        let task = tokio::spawn(flow.start());

        h.router
            .route_incoming(Message::RequestIbdBlocks {
                low: chain[0].hash(),
                high: chain[3].hash(),
            })
            .unwrap();
        for expected in &chain[1..] {
            assert_eq!(h.sent.recv().await, Some(Message::IbdBlock(Box::new(expected.clone()))));
        }
        assert_eq!(h.sent.recv().await, Some(Message::DoneIbdBlocks));

        h.router
            .route_incoming(Message::RequestIbdBlocks {
                low: genesis.hash(),
                high: Hash256([0xab; 32]),
            })
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, FlowError::Protocol { ban: false, .. }));
    }
}
