//! Misbehaving and disappearing peers.
//!
//! A scripted remote drives one end of an in-memory pipe by hand so that
//! it can break the protocol in ways a real node never would.
//!
//! Scenarios covered:
//! - A peer on another network is banned during the handshake
//! - A banned address cannot reconnect
//! - An unrequested block is ban-worthy
//! - A second connection from an already connected peer is refused without a ban
//! - Shutdown closes every connection gracefully

use std::net::SocketAddr;
use std::time::Duration;

use dagflow_core::constants::NetworkType;
use dagflow_core::testing::{child_of, genesis_block};
use dagflow_p2p::connection::ConnectionHandle;
use dagflow_p2p::memory::pipe;
use dagflow_p2p::{AddressBook, FlowConfig, FlowError, Message, PeerId};
use dagflow_tests::helpers::*;

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn scripted_address(host: u8) -> SocketAddr {
    SocketAddr::from(([192, 168, 0, host], 16_111))
}

/// Next message from the node, skipping keep-alive and tip traffic.
async fn next_message(remote: &mut ConnectionHandle) -> Option<Message> {
    loop {
        match tokio::time::timeout(TIMEOUT, remote.incoming.recv()).await.ok()?? {
            Message::Ping(_) | Message::RequestSelectedTip => continue,
            other => return Some(other),
        }
    }
}

/// Complete the handshake from the scripted side.
async fn handshake(remote: &mut ConnectionHandle, config: &FlowConfig, id: PeerId) {
    assert!(matches!(next_message(remote).await, Some(Message::Version(_))));
    let version = remote_version(config, id, genesis_block().hash());
    remote.outgoing.send(Message::Version(version)).await.unwrap();
    assert_eq!(next_message(remote).await, Some(Message::Verack));
    remote.outgoing.send(Message::Verack).await.unwrap();
}

// ---------------------------------------------------------------------------
// Bans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wrong_network_is_banned() {
    let node = TestNode::new();
    let address = scripted_address(1);
    let (mut remote, local) = pipe(node.address, address, 64);
    let task = node.dispatcher.spawn(local);

    assert!(matches!(next_message(&mut remote).await, Some(Message::Version(_))));
    let mut version = remote_version(&test_config(), PeerId([1; 16]), genesis_block().hash());
    version.network = NetworkType::Testnet.name().to_string();
    remote.outgoing.send(Message::Version(version)).await.unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, FlowError::Protocol { ban: true, .. }));
    assert!(node.bans.is_banned(address.ip()));
    assert!(matches!(next_message(&mut remote).await, Some(Message::Reject(_))));
    assert_eq!(node.ctx().peer_count(), 0);
}

#[tokio::test]
async fn banned_address_cannot_reconnect() {
    let node = TestNode::new();
    let address = scripted_address(2);
    node.bans.ban(address.ip());

    let (_remote, local) = pipe(node.address, address, 8);
    assert!(node.dispatcher.handle_connection(local).await.is_err());

    node.bans.unban(address.ip());
    let (mut remote, local) = pipe(node.address, address, 64);
    let _task = node.dispatcher.spawn(local);
    handshake(&mut remote, &test_config(), PeerId([2; 16])).await;
    assert!(wait_for(TIMEOUT, || node.ctx().peer_count() == 1).await);
}

#[tokio::test]
async fn unrequested_block_is_banned() {
    let node = TestNode::new();
    let address = scripted_address(3);
    let (mut remote, local) = pipe(node.address, address, 64);
    let task = node.dispatcher.spawn(local);
    handshake(&mut remote, &test_config(), PeerId([3; 16])).await;
    assert!(wait_for(TIMEOUT, || node.ctx().peer_count() == 1).await);

    let block = child_of(&genesis_block(), 1);
    remote.outgoing.send(Message::Block(Box::new(block.clone()))).await.unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, FlowError::Protocol { ban: true, .. }));
    assert!(node.bans.is_banned(address.ip()));
    assert!(!node.consensus.contains(&block.hash()));
    assert_eq!(node.ctx().peer_count(), 0);
}

#[tokio::test]
async fn banning_disabled_only_disconnects() {
    let node = TestNode::with(FlowConfig::simnet(), Default::default());
    let address = scripted_address(4);
    let (mut remote, local) = pipe(node.address, address, 64);
    let task = node.dispatcher.spawn(local);
    handshake(&mut remote, &FlowConfig::simnet(), PeerId([4; 16])).await;
    assert!(wait_for(TIMEOUT, || node.ctx().peer_count() == 1).await);

    remote
        .outgoing
        .send(Message::Block(Box::new(child_of(&genesis_block(), 2))))
        .await
        .unwrap();

    assert!(task.await.unwrap().is_err());
    assert!(!node.bans.is_banned(address.ip()));
}

// ---------------------------------------------------------------------------
// Duplicates and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_connection_is_refused_without_ban() {
    let a = TestNode::new();
    let b = TestNode::new();
    let _first = connect(&a, &b);
    wait_connected(&a, &b).await;

    let second = connect(&a, &b);
    let dialer = second.dialer.await.unwrap();
    let listener = second.listener.await.unwrap();
    let refused = |r: &Result<(), FlowError>| matches!(r, Err(FlowError::Protocol { ban: false, .. }));
    assert!(refused(&dialer) || refused(&listener));
    assert!(!matches!(dialer, Err(FlowError::Protocol { ban: true, .. })));
    assert!(!matches!(listener, Err(FlowError::Protocol { ban: true, .. })));

    assert_eq!(a.ctx().peer_count(), 1);
    assert_eq!(b.ctx().peer_count(), 1);
    assert!(a.bans.is_empty());
    assert!(b.bans.is_empty());
}

#[tokio::test]
async fn shutdown_closes_connections_gracefully() {
    let a = TestNode::new();
    let b = TestNode::new();
    let c = TestNode::new();
    let ab = connect(&a, &b);
    let bc = connect(&b, &c);
    wait_connected(&a, &b).await;
    wait_connected(&b, &c).await;

    b.ctx().shutdown();

    for task in [ab.dialer, ab.listener, bc.dialer, bc.listener] {
        assert_eq!(task.await.unwrap(), Ok(()));
    }
    assert_eq!(a.ctx().peer_count(), 0);
    assert_eq!(b.ctx().peer_count(), 0);
    assert_eq!(c.ctx().peer_count(), 0);
    assert!(a.bans.is_empty() && b.bans.is_empty() && c.bans.is_empty());
}
