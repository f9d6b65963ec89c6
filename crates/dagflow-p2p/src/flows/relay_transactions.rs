//! Transaction relay.

use async_trait::async_trait;
use dagflow_core::error::MempoolError;
use dagflow_core::types::{Hash256, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::{Flow, unexpected};
use crate::peer::Peer;
use crate::protocol::Message;
use crate::router::{IncomingRoute, OutgoingRoute};

/// Handles `InvTransactions` announcements from one peer: requests the
/// unknown, unclaimed IDs and inserts what arrives into the mempool.
pub struct HandleRelayedTransactions {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
    backlog: VecDeque<Vec<Hash256>>,
}

impl HandleRelayedTransactions {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            peer,
            incoming,
            outgoing,
            backlog: VecDeque::new(),
        }
    }

    async fn next_inv(&mut self) -> Result<Vec<Hash256>, FlowError> {
        if let Some(ids) = self.backlog.pop_front() {
            return Ok(ids);
        }
        match self.incoming.dequeue().await? {
            Message::InvTransactions(ids) => Ok(ids),
            Message::Transaction(tx) => Err(FlowError::ban(format!("unrequested transaction {}", tx.id()))),
            Message::TransactionNotFound(id) => Err(FlowError::ban(format!("unrequested not-found for {id}"))),
            other => Err(unexpected("relayed-transactions", &other)),
        }
    }

    /// Next reply to an outstanding request, queueing announcements that
    /// arrive first.
    async fn read_reply(&mut self, timeout: Duration) -> Result<Message, FlowError> {
        loop {
            match self.incoming.dequeue_with_timeout(timeout).await? {
                Message::InvTransactions(ids) => self.backlog.push_back(ids),
                other => return Ok(other),
            }
        }
    }

    async fn handle_inv(&mut self, ids: Vec<Hash256>) -> Result<(), FlowError> {
        if self.ctx.is_ibd_running() {
            return Ok(());
        }
        let unknown: Vec<Hash256> = ids
            .into_iter()
            .filter(|id| !self.ctx.mining().has_transaction(id))
            .collect();
        let claim = self.ctx.requested_transactions().claim_batch(unknown);
        if claim.is_empty() {
            return Ok(());
        }

        self.outgoing
            .enqueue(Message::RequestTransactions(claim.ids().to_vec()))
            .await?;
        let timeout = self.ctx.config().response_timeout;
        for expected in claim.ids() {
            match self.read_reply(timeout).await? {
                Message::Transaction(tx) => {
                    if tx.id() != *expected {
                        return Err(FlowError::ban(format!(
                            "requested transaction {expected}, got {}",
                            tx.id()
                        )));
                    }
                    self.insert_transaction(*tx)?;
                }
                Message::TransactionNotFound(id) => {
                    if id != *expected {
                        return Err(FlowError::ban(format!(
                            "requested transaction {expected}, got not-found for {id}"
                        )));
                    }
                    debug!(%id, peer = %self.peer, "relay: peer no longer has transaction");
                }
                other => return Err(unexpected("relayed-transactions", &other)),
            }
        }
        Ok(())
    }

    fn insert_transaction(&self, tx: Transaction) -> Result<(), FlowError> {
        let id = tx.id();
        match self.ctx.mining().validate_and_insert_transaction(tx, false, true) {
            Ok(accepted) => {
                self.ctx.on_transactions_accepted(&accepted)?;
                Ok(())
            }
            Err(MempoolError::Rule(rule)) if !rule.is_ban_worthy() => {
                debug!(%id, reason = %rule, "relay: transaction not accepted");
                Ok(())
            }
            Err(err) => Err(FlowError::from_mempool(err, &format!("relayed transaction {id}"))),
        }
    }
}

#[async_trait]
impl Flow for HandleRelayedTransactions {
    fn name(&self) -> &'static str {
        "relayed-transactions"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            let ids = self.next_inv().await?;
            self.handle_inv(ids).await?;
        }
    }
}

/// Serves `RequestTransactions` from the mempool.
pub struct HandleRequestedTransactions {
    ctx: Arc<FlowContext>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl HandleRequestedTransactions {
    pub fn new(ctx: Arc<FlowContext>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            incoming,
            outgoing,
        }
    }
}

#[async_trait]
impl Flow for HandleRequestedTransactions {
    fn name(&self) -> &'static str {
        "requested-transactions"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            let ids = match self.incoming.dequeue().await? {
                Message::RequestTransactions(ids) => ids,
                other => return Err(unexpected(self.name(), &other)),
            };
            for id in ids {
                let reply = match self.ctx.mining().transaction(&id) {
                    Some(tx) => Message::Transaction(Box::new(tx)),
                    None => Message::TransactionNotFound(id),
                };
                self.outgoing.enqueue(reply).await?;
            }
        }
    }
}
