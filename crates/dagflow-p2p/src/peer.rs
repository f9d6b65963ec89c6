//! A connected, handshaken peer.

use dagflow_core::types::{Hash256, SubnetworkId};
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::connection::NetConnection;
use crate::protocol::VersionMessage;
use crate::router::OutgoingRoute;

/// Random per-process node identity exchanged in the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Properties learned in the handshake plus mutable sync state.
///
/// Shared as `Arc<Peer>` between the flow context and every flow of the
/// connection.
pub struct Peer {
    id: PeerId,
    address: SocketAddr,
    is_outbound: bool,
    protocol_version: u32,
    user_agent: String,
    subnetwork_id: SubnetworkId,
    /// Peer clock minus ours at handshake time, in milliseconds.
    time_offset_ms: i64,
    selected_tip: RwLock<Hash256>,
    outgoing: OutgoingRoute,
    connection: Arc<dyn NetConnection>,
    ibd_requested: Notify,
}

impl Peer {
    pub fn new(
        version: &VersionMessage,
        connection: Arc<dyn NetConnection>,
        outgoing: OutgoingRoute,
        local_time_ms: i64,
    ) -> Self {
        Self {
            id: version.id,
            address: connection.address(),
            is_outbound: connection.is_outbound(),
            protocol_version: version.protocol_version,
            user_agent: version.user_agent.clone(),
            subnetwork_id: version.subnetwork_id,
            time_offset_ms: version.timestamp.saturating_sub(local_time_ms),
            selected_tip: RwLock::new(version.selected_tip),
            outgoing,
            connection,
            ibd_requested: Notify::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_outbound(&self) -> bool {
        self.is_outbound
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn subnetwork_id(&self) -> SubnetworkId {
        self.subnetwork_id
    }

    pub fn time_offset_ms(&self) -> i64 {
        self.time_offset_ms
    }

    /// Last selected tip the peer announced.
    pub fn selected_tip(&self) -> Hash256 {
        *self.selected_tip.read()
    }

    pub fn set_selected_tip(&self, hash: Hash256) {
        *self.selected_tip.write() = hash;
    }

    pub fn outgoing(&self) -> &OutgoingRoute {
        &self.outgoing
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Wake this peer's IBD flow. A wake-up before the flow waits is kept.
    pub fn request_ibd(&self) {
        self.ibd_requested.notify_one();
    }

    /// Resolves once [`request_ibd`](Self::request_ibd) was called.
    pub async fn ibd_requested(&self) {
        self.ibd_requested.notified().await;
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("outbound", &self.is_outbound)
            .field("selected_tip", &self.selected_tip())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::loopback_peer;
    use std::time::Duration;

    #[test]
    fn random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn id_display_is_short_hex() {
        let id = PeerId([0xab; 16]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(format!("{id:?}"), "PeerId(abababababababab)");
    }

    #[tokio::test]
    async fn selected_tip_is_updatable() {
        let (peer, _rx) = loopback_peer(PeerId([1; 16]), Hash256([1; 32]));
        assert_eq!(peer.selected_tip(), Hash256([1; 32]));
        peer.set_selected_tip(Hash256([2; 32]));
        assert_eq!(peer.selected_tip(), Hash256([2; 32]));
    }

    #[tokio::test]
    async fn ibd_request_before_wait_is_not_lost() {
        let (peer, _rx) = loopback_peer(PeerId([2; 16]), Hash256::ZERO);
        peer.request_ibd();
        tokio::time::timeout(Duration::from_secs(1), peer.ibd_requested())
            .await
            .expect("stored permit should wake the waiter");
    }

    #[tokio::test]
    async fn disconnect_reaches_connection() {
        let (peer, _rx) = loopback_peer(PeerId([3; 16]), Hash256::ZERO);
        assert!(peer.is_connected());
        peer.disconnect();
        assert!(!peer.is_connected());
    }
}
