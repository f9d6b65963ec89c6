//! Incoming `Reject` messages.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::FlowError;
use crate::flows::{Flow, unexpected};
use crate::peer::Peer;
use crate::protocol::Message;
use crate::router::IncomingRoute;

/// Ends the connection when the peer tells us it is dropping us.
pub struct HandleRejects {
    peer: Arc<Peer>,
    incoming: IncomingRoute,
}

impl HandleRejects {
    pub fn new(peer: Arc<Peer>, incoming: IncomingRoute) -> Self {
        Self { peer, incoming }
    }
}

#[async_trait]
impl Flow for HandleRejects {
    fn name(&self) -> &'static str {
        "rejects"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        match self.incoming.dequeue().await? {
            Message::Reject(reason) => {
                info!(peer = %self.peer, %reason, "reject: peer rejected us");
                Err(FlowError::protocol(format!("peer rejected us: {reason}")))
            }
            other => Err(unexpected(self.name(), &other)),
        }
    }
}
