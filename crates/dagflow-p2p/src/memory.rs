//! In-process transport.
//!
//! [`pipe`] returns two connected [`ConnectionHandle`]s whose message queues
//! are cross-wired, so two flow contexts in one process can talk to each
//! other. Used by simulations and tests.

use async_trait::async_trait;
use dagflow_core::constants::PROTOCOL_VERSION;
use dagflow_core::types::{Hash256, SubnetworkId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::connection::{ConnectionHandle, NetConnection};
use crate::peer::{Peer, PeerId};
use crate::protocol::{Message, VersionMessage};
use crate::router::OutgoingRoute;

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    address: SocketAddr,
    outbound: bool,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    pub fn new(address: SocketAddr, outbound: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            address,
            outbound,
            closed,
        }
    }
}

#[async_trait]
impl NetConnection for MemoryConnection {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    fn disconnect(&self) {
        self.closed.send_replace(true);
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Create a connected pair.
///
/// The first handle is the dialing side and sees `remote_of_dialer` as the
/// peer address; the second sees `remote_of_listener`.
pub fn pipe(
    remote_of_dialer: SocketAddr,
    remote_of_listener: SocketAddr,
    capacity: usize,
) -> (ConnectionHandle, ConnectionHandle) {
    let (dialer_tx, listener_rx) = mpsc::channel(capacity);
    let (listener_tx, dialer_rx) = mpsc::channel(capacity);
    let dialer = ConnectionHandle {
        connection: Arc::new(MemoryConnection::new(remote_of_dialer, true)),
        incoming: dialer_rx,
        outgoing: dialer_tx,
    };
    let listener = ConnectionHandle {
        connection: Arc::new(MemoryConnection::new(remote_of_listener, false)),
        incoming: listener_rx,
        outgoing: listener_tx,
    };
    (dialer, listener)
}

/// A handshaken peer whose outgoing messages land in the returned receiver.
///
/// Lets callers drive a flow context without running a remote node.
pub fn loopback_peer(id: PeerId, selected_tip: Hash256) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    loopback_peer_with_capacity(id, selected_tip, 64)
}

pub fn loopback_peer_with_capacity(
    id: PeerId,
    selected_tip: Hash256,
    capacity: usize,
) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity);
    let address = SocketAddr::from(([127, 0, 0, 1], 16_000 + u16::from(id.0[0])));
    let version = VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        network: String::new(),
        id,
        user_agent: "/loopback/".into(),
        selected_tip,
        subnetwork_id: SubnetworkId::NATIVE,
        timestamp: 0,
    };
    let connection: Arc<dyn NetConnection> = Arc::new(MemoryConnection::new(address, true));
    let peer = Peer::new(&version, connection, OutgoingRoute::new(tx), 0);
    (Arc::new(peer), rx)
}
