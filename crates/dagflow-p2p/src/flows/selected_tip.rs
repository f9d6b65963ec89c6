//! Selected-tip exchange, used to discover peers that are ahead of us.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::{Flow, unexpected};
use crate::peer::Peer;
use crate::protocol::Message;
use crate::router::{IncomingRoute, OutgoingRoute};

/// Answers `RequestSelectedTip` with our virtual selected parent.
pub struct HandleRequestSelectedTip {
    ctx: Arc<FlowContext>,
    incoming: IncomingRoute,
    outgoing: OutgoingRoute,
}

impl HandleRequestSelectedTip {
    pub fn new(ctx: Arc<FlowContext>, incoming: IncomingRoute, outgoing: OutgoingRoute) -> Self {
        Self {
            ctx,
            incoming,
            outgoing,
        }
    }
}

#[async_trait]
impl Flow for HandleRequestSelectedTip {
    fn name(&self) -> &'static str {
        "request-selected-tip"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            match self.incoming.dequeue().await? {
                Message::RequestSelectedTip => {
                    let tip = self.ctx.consensus().virtual_selected_parent()?.hash();
                    self.outgoing.enqueue(Message::SelectedTip(tip)).await?;
                }
                other => return Err(unexpected(self.name(), &other)),
            }
        }
    }
}

/// Records the tips the peer announces and starts IBD when one is unknown.
pub struct ReceiveSelectedTips {
    ctx: Arc<FlowContext>,
    peer: Arc<Peer>,
    incoming: IncomingRoute,
}

impl ReceiveSelectedTips {
    pub fn new(ctx: Arc<FlowContext>, peer: Arc<Peer>, incoming: IncomingRoute) -> Self {
        Self { ctx, peer, incoming }
    }
}

#[async_trait]
impl Flow for ReceiveSelectedTips {
    fn name(&self) -> &'static str {
        "selected-tips"
    }

    async fn start(mut self: Box<Self>) -> Result<(), FlowError> {
        loop {
            match self.incoming.dequeue().await? {
                Message::SelectedTip(tip) => {
                    debug!(peer = %self.peer, %tip, "selected_tip: peer announced tip");
                    self.peer.set_selected_tip(tip);
                    // Only an unknown tip can start IBD.
                    if !self.ctx.consensus().block_exists(&tip)? {
                        self.ctx.try_start_ibd()?;
                    }
                }
                other => return Err(unexpected(self.name(), &other)),
            }
        }
    }
}
