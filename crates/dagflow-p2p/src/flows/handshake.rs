//! Version/verack exchange.
//!
//! Both sides send `Version` immediately, validate the remote's, then
//! acknowledge it with `Verack`. The peer is usable once both acks are in.

use dagflow_core::constants::MIN_PROTOCOL_VERSION;
use dagflow_core::time::unix_now_millis;
use std::sync::Arc;
use tracing::debug;

use crate::config::FlowConfig;
use crate::connection::NetConnection;
use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::unexpected;
use crate::peer::{Peer, PeerId};
use crate::protocol::{Message, VersionMessage};
use crate::router::{IncomingRoute, OutgoingRoute};

/// Routes owned by the handshake for its duration.
pub struct HandshakeRoutes {
    pub version: IncomingRoute,
    pub verack: IncomingRoute,
}

/// Run the handshake, bounded by the configured handshake timeout.
pub async fn perform_handshake(
    ctx: &FlowContext,
    connection: Arc<dyn NetConnection>,
    outgoing: &OutgoingRoute,
    routes: &mut HandshakeRoutes,
) -> Result<Arc<Peer>, FlowError> {
    let timeout = ctx.config().handshake_timeout;
    match tokio::time::timeout(timeout, exchange(ctx, connection, outgoing, routes)).await {
        Ok(result) => result,
        Err(_) => Err(FlowError::timeout(format!("handshake not completed within {timeout:?}"))),
    }
}

async fn exchange(
    ctx: &FlowContext,
    connection: Arc<dyn NetConnection>,
    outgoing: &OutgoingRoute,
    routes: &mut HandshakeRoutes,
) -> Result<Arc<Peer>, FlowError> {
    outgoing.enqueue(Message::Version(ctx.local_version()?)).await?;

    let remote = match routes.version.dequeue().await? {
        Message::Version(version) => version,
        other => return Err(unexpected("handshake", &other)),
    };
    validate_remote_version(ctx.config(), ctx.local_id(), &remote)?;
    debug!(peer = %remote.id, agent = %remote.user_agent, "handshake: received valid version");

    outgoing.enqueue(Message::Verack).await?;
    match routes.verack.dequeue().await? {
        Message::Verack => {}
        other => return Err(unexpected("handshake", &other)),
    }

    Ok(Arc::new(Peer::new(&remote, connection, outgoing.clone(), unix_now_millis())))
}

/// Check a remote `Version` against our configuration.
pub fn validate_remote_version(
    config: &FlowConfig,
    local_id: PeerId,
    remote: &VersionMessage,
) -> Result<(), FlowError> {
    if remote.network != config.network.name() {
        return Err(FlowError::ban(format!(
            "wrong network {}, expected {}",
            remote.network,
            config.network.name()
        )));
    }
    if remote.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(FlowError::protocol(format!(
            "protocol version {} is older than {MIN_PROTOCOL_VERSION}",
            remote.protocol_version
        )));
    }
    if remote.id == local_id {
        return Err(FlowError::protocol("connected to self"));
    }
    if !remote.subnetwork_id.is_native() && remote.subnetwork_id != config.subnetwork_id {
        return Err(FlowError::protocol(format!(
            "partial node on subnetwork {} is not served",
            remote.subnetwork_id
        )));
    }
    Ok(())
}
