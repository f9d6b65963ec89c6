//! Block relay.
//!
//! Peers announce fully validated blocks with `InvRelayBlock`. The receiving
//! side fetches each unknown block once across all peers, inserts it, and
//! resolves orphans. Missing ancestors of an orphan are requested through
//! the same path, or handed to IBD when too many are missing.

use async_trait::async_trait;
use dagflow_core::error::{ConsensusError, RuleError};
use dagflow_core::types::{Block, Hash256};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::{Flow, unexpected};
use crate::peer::Peer;
use crate::protocol::Message;
use crate::router::{IncomingRoute, OutgoingRoute};

/// Handles `InvRelayBlock` announcements from one peer.
pub struct HandleRelayInvs {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
    /// Announcements received while waiting for a block, plus orphan roots
    /// queued for fetching.
    backlog: VecDeque<Hash256>,
}

impl HandleRelayInvs {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            peer,
            incoming,
            outgoing,
            backlog: VecDeque::new(),
        }
    }

    async fn next_inv(&mut self) -> Result<Hash256, FlowError> {
        if let Some(hash) = self.backlog.pop_front() {
            return Ok(hash);
        }
        match self.incoming.dequeue().await? {
            Message::InvRelayBlock(hash) => Ok(hash),
            Message::Block(block) => Err(FlowError::ban(format!("unrequested block {}", block.hash()))),
            other => Err(unexpected("relay-invs", &other)),
        }
    }

    /// Wait for the requested block, queueing announcements that arrive first.
    async fn read_block(&mut self) -> Result<Block, FlowError> {
        let timeout = self.ctx.config().response_timeout;
        loop {
            match self.incoming.dequeue_with_timeout(timeout).await? {
                Message::InvRelayBlock(hash) => self.backlog.push_back(hash),
                Message::Block(block) => return Ok(*block),
                other => return Err(unexpected("relay-invs", &other)),
            }
        }
    }

    async fn handle_inv(&mut self, hash: Hash256) -> Result<(), FlowError> {
        if self.ctx.consensus().block_exists(&hash)? {
            return Ok(());
        }
        if self.ctx.is_ibd_running() {
            debug!(%hash, "relay: ignoring announcement during IBD");
            return Ok(());
        }
        if self.ctx.is_known_orphan(&hash) {
            return self.handle_orphan(hash).await;
        }

        let claim = self.ctx.requested_blocks().claim_batch([hash]);
        if claim.is_empty() {
            debug!(%hash, "relay: block already requested from another peer");
            return Ok(());
        }
        self.outgoing.enqueue(Message::RequestRelayBlocks(vec![hash])).await?;
        let block = self.read_block().await?;
        if block.hash() != hash {
            return Err(FlowError::ban(format!("requested block {hash}, got {}", block.hash())));
        }
        let result = self.process_block(block).await;
        drop(claim);
        result
    }

    async fn process_block(&mut self, block: Block) -> Result<(), FlowError> {
        let hash = block.hash();
        if block.is_header_only() {
            return Err(FlowError::ban(format!("relayed block {hash} is header-only")));
        }
        match self.ctx.consensus().validate_and_insert_block(&block) {
            Ok(result) => {
                let accepted = self.ctx.on_new_block_accepted(&block, result)?;
                info!(%hash, peer = %self.peer, "relay: accepted block");
                for accepted_hash in accepted {
                    self.ctx.broadcast(Message::InvRelayBlock(accepted_hash));
                }
                Ok(())
            }
            Err(ConsensusError::Rule(RuleError::DuplicateBlock(_))) => Ok(()),
            Err(ConsensusError::Rule(RuleError::MissingParents(missing))) => {
                debug!(%hash, missing = missing.len(), "relay: block is an orphan");
                self.ctx.add_orphan(block);
                self.handle_orphan(hash).await
            }
            Err(err) => Err(FlowError::from_consensus(err, &format!("relayed block {hash}"))),
        }
    }

    /// Request the missing ancestors of an orphan, or start IBD if there
    /// are too many.
    async fn handle_orphan(&mut self, hash: Hash256) -> Result<(), FlowError> {
        let roots = self.ctx.orphan_roots(&hash)?;
        if roots.len() > self.ctx.config().max_orphan_roots_to_request {
            info!(%hash, roots = roots.len(), peer = %self.peer, "relay: orphan too far ahead, trying IBD");
            self.peer.set_selected_tip(hash);
            self.ctx.try_start_ibd()?;
            return Ok(());
        }
        for root in roots {
            if !self.backlog.contains(&root) {
                self.backlog.push_back(root);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Flow for HandleRelayInvs {
    fn name(&self) -> &'static str {
        "relay-invs"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            let hash = self.next_inv().await?;
            self.handle_inv(hash).await?;
        }
    }
}

/// Serves `RequestRelayBlocks` from one peer.
pub struct HandleRelayBlockRequests {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl HandleRelayBlockRequests {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            peer,
            incoming,
            outgoing,
        }
    }
}

#[async_trait]
impl Flow for HandleRelayBlockRequests {
    fn name(&self) -> &'static str {
        "relay-block-requests"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            let hashes = match self.incoming.dequeue().await? {
                Message::RequestRelayBlocks(hashes) => hashes,
                other => return Err(unexpected(self.name(), &other)),
            };
            for hash in hashes {
                let block = self
                    .ctx
                    .consensus()
                    .block(&hash)?
                    .ok_or_else(|| FlowError::protocol(format!("requested relay block {hash} not found")))?;
                debug!(%hash, peer = %self.peer, "relay: serving block");
                self.outgoing.enqueue(Message::Block(Box::new(block))).await?;
            }
        }
    }
}
