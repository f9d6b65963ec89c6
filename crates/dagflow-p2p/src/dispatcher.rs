//! Connection lifecycle.
//!
//! [`FlowDispatcher::handle_connection`] drives one connection from the
//! handshake to teardown: it routes incoming messages, runs every flow as
//! its own task, and once the first flow ends it closes the routes, stops
//! the remaining flows and acts on the error that ended the connection.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionHandle, NetConnection};
use crate::error::FlowError;
use crate::flow_context::FlowContext;
use crate::flows::handshake::{HandshakeRoutes, perform_handshake};
use crate::flows::{FlowRoutes, build_flows, register_routes};
use crate::peer::Peer;
use crate::protocol::{Message, MessageCommand};
use crate::router::{OutgoingRoute, Router};
use crate::shutdown::ShutdownSignal;

type FlowExit = (&'static str, Result<(), FlowError>);

/// What the dispatcher does with the error that ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Graceful close.
    Ignore,
    Disconnect,
    /// Send `Reject`, ban the address, then disconnect.
    BanAndDisconnect,
    /// Log and abort the process.
    Abort,
}

/// Map a flow error to its action. Bans degrade to plain disconnects when
/// banning is disabled.
pub fn classify(err: &FlowError, enable_banning: bool) -> ErrorAction {
    match err {
        FlowError::RouteClosed => ErrorAction::Ignore,
        FlowError::Protocol { ban: true, .. } if enable_banning => ErrorAction::BanAndDisconnect,
        FlowError::Protocol { .. } | FlowError::Timeout(_) => ErrorAction::Disconnect,
        FlowError::Fatal(_) => ErrorAction::Abort,
    }
}

/// Runs connections against one [`FlowContext`].
#[derive(Clone)]
pub struct FlowDispatcher {
    ctx: Arc<FlowContext>,
}

impl FlowDispatcher {
    pub fn new(ctx: Arc<FlowContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<FlowContext> {
        &self.ctx
    }

    /// Run [`handle_connection`](Self::handle_connection) on its own task.
    pub fn spawn(&self, handle: ConnectionHandle) -> JoinHandle<Result<(), FlowError>> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.handle_connection(handle).await })
    }

    /// Drive a connection until it ends.
    ///
    /// Returns `Ok` on a graceful close and otherwise the error that ended
    /// the connection, after it was acted upon.
    pub async fn handle_connection(&self, handle: ConnectionHandle) -> Result<(), FlowError> {
        let ConnectionHandle {
            connection,
            incoming,
            outgoing,
        } = handle;
        let address = connection.address();
        if self.ctx.address_book().is_banned(address.ip()) {
            info!(%address, "dispatch: refusing banned address");
            connection.disconnect();
            return Err(FlowError::protocol(format!("address {} is banned", address.ip())));
        }

        let router = Arc::new(Router::new(
            outgoing,
            self.ctx.shutdown_signal(),
            self.ctx.config().default_route_capacity,
        ));
        let mut tasks = JoinSet::new();
        let mut registered = None;
        let result = self
            .run(&router, &connection, incoming, &mut tasks, &mut registered)
            .await;

        router.close();
        tasks.shutdown().await;
        if let Some(peer) = registered {
            self.ctx.remove_peer(&peer.id());
            info!(%peer, peers = self.ctx.peer_count(), "dispatch: peer disconnected");
        }
        let result = match result {
            Err(FlowError::RouteClosed) | Ok(()) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.act(err, connection.as_ref(), &router.outgoing());
        }
        connection.disconnect();
        result
    }

    async fn run(
        &self,
        router: &Arc<Router>,
        connection: &Arc<dyn NetConnection>,
        incoming: mpsc::Receiver<Message>,
        tasks: &mut JoinSet<FlowExit>,
        registered: &mut Option<Arc<Peer>>,
    ) -> Result<(), FlowError> {
        let mut handshake = HandshakeRoutes {
            version: router.register("receive-version", &[MessageCommand::Version], Some(1))?,
            verack: router.register("receive-verack", &[MessageCommand::Verack], Some(1))?,
        };
        let routes = register_routes(&self.ctx, router)?;
        tasks.spawn(route_messages(
            Arc::clone(router),
            incoming,
            Arc::clone(connection),
            self.ctx.shutdown_signal(),
        ));

        let outgoing = router.outgoing();
        let peer = tokio::select! {
            biased;
            result = perform_handshake(&self.ctx, Arc::clone(connection), &outgoing, &mut handshake) => result?,
            Some(exit) = tasks.join_next() => return Err(exit_error(exit)),
        };
        router.unregister(&handshake.version);
        router.unregister(&handshake.verack);

        self.ctx.add_peer(Arc::clone(&peer))?;
        *registered = Some(Arc::clone(&peer));
        self.serve(&peer, routes, tasks).await
    }

    async fn serve(
        &self,
        peer: &Arc<Peer>,
        routes: FlowRoutes,
        tasks: &mut JoinSet<FlowExit>,
    ) -> Result<(), FlowError> {
        let flows = build_flows(&self.ctx, routes, peer);
        info!(
            %peer,
            outbound = peer.is_outbound(),
            agent = peer.user_agent(),
            flows = flows.len(),
            "dispatch: peer connected"
        );
        for flow in flows {
            let name = flow.name();
            tasks.spawn(async move { (name, flow.start().await) });
        }
        self.ctx.try_start_ibd()?;

        match tasks.join_next().await {
            Some(exit) => Err(exit_error(exit)),
            None => Ok(()),
        }
    }

    fn act(&self, err: &FlowError, connection: &dyn NetConnection, outgoing: &OutgoingRoute) {
        let address = connection.address();
        match classify(err, self.ctx.config().enable_banning) {
            ErrorAction::Ignore => debug!(%address, "dispatch: connection closed"),
            ErrorAction::Disconnect => match err {
                FlowError::Timeout(_) => info!(%address, error = %err, "dispatch: disconnecting"),
                _ => warn!(%address, error = %err, "dispatch: disconnecting"),
            },
            ErrorAction::BanAndDisconnect => {
                warn!(%address, error = %err, "dispatch: banning peer");
                if outgoing.try_enqueue(Message::Reject(err.to_string())).is_err() {
                    debug!(%address, "dispatch: could not send reject");
                }
                self.ctx.address_book().ban(address.ip());
            }
            ErrorAction::Abort => {
                error!(%address, error = %err, "dispatch: fatal error, aborting");
                std::process::abort();
            }
        }
    }
}

/// Feed decoded messages into the router until the connection goes away.
async fn route_messages(
    router: Arc<Router>,
    mut incoming: mpsc::Receiver<Message>,
    connection: Arc<dyn NetConnection>,
    mut shutdown: ShutdownSignal,
) -> FlowExit {
    let result = loop {
        tokio::select! {
            _ = shutdown.wait() => break Err(FlowError::RouteClosed),
            _ = connection.closed() => break Err(FlowError::RouteClosed),
            message = incoming.recv() => match message {
                Some(message) => {
                    if let Err(err) = router.route_incoming(message) {
                        break Err(err);
                    }
                }
                None => break Err(FlowError::RouteClosed),
            },
        }
    };
    ("router", result)
}

fn exit_error(joined: Result<FlowExit, JoinError>) -> FlowError {
    match joined {
        Ok((name, Ok(()))) => {
            debug!(flow = name, "dispatch: flow finished");
            FlowError::RouteClosed
        }
        Ok((name, Err(err))) => {
            debug!(flow = name, error = %err, "dispatch: flow ended");
            err
        }
        Err(err) if err.is_cancelled() => FlowError::RouteClosed,
        Err(err) => FlowError::fatal(format!("flow task panicked: {err}")),
    }
}
