//! Transport abstraction.
//!
//! The sync core never touches sockets. A transport hands the dispatcher a
//! [`ConnectionHandle`]: the [`NetConnection`] it can close, a stream of
//! already-decoded incoming messages and a sink for outgoing ones.

use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::Message;

/// A live connection to a remote node.
#[async_trait]
pub trait NetConnection: Send + Sync + fmt::Debug {
    fn address(&self) -> SocketAddr;

    /// Whether we dialed the remote.
    fn is_outbound(&self) -> bool;

    /// Close the connection. Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Resolves once [`disconnect`](Self::disconnect) was called.
    async fn closed(&self);
}

/// Everything the dispatcher needs to drive one connection.
pub struct ConnectionHandle {
    pub connection: Arc<dyn NetConnection>,
    pub incoming: mpsc::Receiver<Message>,
    pub outgoing: mpsc::Sender<Message>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Address-level ban bookkeeping.
///
/// Bans are keyed by IP so that reconnecting from another port does not
/// evade them. They last until explicitly lifted.
pub trait AddressBook: Send + Sync {
    fn ban(&self, ip: IpAddr);
    fn unban(&self, ip: IpAddr);
    fn is_banned(&self, ip: IpAddr) -> bool;
}
