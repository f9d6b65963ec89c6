//! Keep-alive pings.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::{Flow, unexpected};
use crate::peer::Peer;
use crate::protocol::Message;
use crate::router::{IncomingRoute, OutgoingRoute};

/// Answers every `Ping` with a `Pong` carrying the same nonce.
pub struct ReceivePings {
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl ReceivePings {
    pub fn new(incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self { incoming, outgoing }
    }
}

#[async_trait]
impl Flow for ReceivePings {
    fn name(&self) -> &'static str {
        "receive-pings"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            match self.incoming.dequeue().await? {
                Message::Ping(nonce) => self.outgoing.enqueue(Message::Pong(nonce)).await?,
                other => return Err(unexpected(self.name(), &other)),
            }
        }
    }
}

/// Pings the peer periodically and expects a matching `Pong` in time.
pub struct SendPings {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl SendPings {
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
impl Flow for SendPings {
    fn name(&self) -> &'static str {
        "send-pings"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        let interval = self.ctx.config().ping_interval;
        let timeout = self.ctx.config().response_timeout;
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.wait() => return Err(FlowError::RouteClosed),
            }

            let nonce: u64 = rand::random();
            self.outgoing.enqueue(Message::Ping(nonce)).await?;
            match self.incoming.dequeue_with_timeout(timeout).await? {
                Message::Pong(n) if n == nonce => {
                    trace!(peer = %self.peer, "ping: pong received");
                }
                Message::Pong(n) => {
                    return Err(FlowError::ban(format!("pong nonce {n} does not match ping {nonce}")));
                }
                other => return Err(unexpected(self.name(), &other)),
            }
        }
    }
}
