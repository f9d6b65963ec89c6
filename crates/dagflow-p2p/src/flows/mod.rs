//! Per-peer protocol flows.
//!
//! A flow is a long-running task that owns one incoming route and handles
//! one aspect of the protocol. Flows run until they fail or their route is
//! closed; the dispatcher tears the connection down when the first one ends.

pub mod handshake;
pub mod ibd;
pub mod ping;
pub mod reject;
pub mod relay_blocks;
pub mod relay_transactions;
pub mod selected_tip;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::peer::Peer;
use crate::protocol::{Message, MessageCommand};
use crate::router::{IncomingRoute, OutgoingRoute, Router};

#[async_trait]
pub trait Flow: Send {
    fn name(&self) -> &'static str;

    /// Run until the route closes or a protocol error occurs.
    async fn start(self: Box<Self>) -> Result<(), FlowError>;
}

/// A message arrived on a route not registered for its command.
pub(crate) fn unexpected(flow: &str, message: &Message) -> FlowError {
    FlowError::fatal(format!("{flow}: unexpected {} on route", message.command()))
}

/// Incoming routes of the steady-state flows.
///
/// Registered before the handshake starts so that messages the remote
/// sends right after its `Verack` are queued instead of refused.
pub struct FlowRoutes {
    receive_pings: IncomingRoute,
    send_pings: IncomingRoute,
    relay_invs: IncomingRoute,
    relay_block_requests: IncomingRoute,
    relayed_transactions: IncomingRoute,
    requested_transactions: IncomingRoute,
    request_selected_tip: IncomingRoute,
    selected_tips: IncomingRoute,
    ibd: IncomingRoute,
    ibd_block_requests: IncomingRoute,
    rejects: IncomingRoute,
    outgoing: OutgoingRoute,
}

pub fn register_routes(ctx: &FlowContext, router: &Router) -> Result<FlowRoutes, FlowError> {
    use MessageCommand::*;

    Ok(FlowRoutes {
        receive_pings: router.register("receive-pings", &[Ping], None)?,
        send_pings: router.register("send-pings", &[Pong], None)?,
        relay_invs: router.register("relay-invs", &[InvRelayBlock, Block], None)?,
        relay_block_requests: router.register("relay-block-requests", &[RequestRelayBlocks], None)?,
        relayed_transactions: router.register(
            "relayed-transactions",
            &[InvTransactions, Transaction, TransactionNotFound],
            None,
        )?,
        requested_transactions: router.register("requested-transactions", &[RequestTransactions], None)?,
        request_selected_tip: router.register("request-selected-tip", &[RequestSelectedTip], None)?,
        selected_tips: router.register("selected-tips", &[SelectedTip], None)?,
        ibd: router.register("ibd", &[IbdBlock, DoneIbdBlocks], Some(ctx.config().ibd_route_capacity))?,
        ibd_block_requests: router.register("ibd-block-requests", &[RequestIbdBlocks], None)?,
        rejects: router.register("rejects", &[Reject], None)?,
        outgoing: router.outgoing(),
    })
}

/// Build every steady-state flow of a handshaken peer.
pub fn build_flows(ctx: &Arc<FlowContext>, routes: FlowRoutes, peer: &Arc<Peer>) -> Vec<Box<dyn Flow>> {
    let outgoing = routes.outgoing;
    vec![
        Box::new(ping::ReceivePings::new(routes.receive_pings, outgoing.clone())) as Box<dyn Flow>,
        Box::new(ping::SendPings::new(
            ctx.clone(),
            peer.clone(),
            routes.send_pings,
            outgoing.clone(),
        )),
        Box::new(relay_blocks::HandleRelayInvs::new(
            ctx.clone(),
            peer.clone(),
            routes.relay_invs,
            outgoing.clone(),
        )),
        Box::new(relay_blocks::HandleRelayBlockRequests::new(
            ctx.clone(),
            peer.clone(),
            routes.relay_block_requests,
            outgoing.clone(),
        )),
        Box::new(relay_transactions::HandleRelayedTransactions::new(
            ctx.clone(),
            peer.clone(),
            routes.relayed_transactions,
            outgoing.clone(),
        )),
        Box::new(relay_transactions::HandleRequestedTransactions::new(
            ctx.clone(),
            routes.requested_transactions,
            outgoing.clone(),
        )),
        Box::new(selected_tip::HandleRequestSelectedTip::new(
            ctx.clone(),
            routes.request_selected_tip,
            outgoing.clone(),
        )),
        Box::new(selected_tip::ReceiveSelectedTips::new(
            ctx.clone(),
            peer.clone(),
            routes.selected_tips,
        )),
        Box::new(ibd::HandleIbd::new(ctx.clone(), peer.clone(), routes.ibd, outgoing.clone())),
        Box::new(ibd::HandleIbdBlockRequests::new(
            ctx.clone(),
            peer.clone(),
            routes.ibd_block_requests,
            outgoing,
        )),
        Box::new(reject::HandleRejects::new(peer.clone(), routes.rejects)),
    ]
}
