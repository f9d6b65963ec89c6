//! Initial block download between nodes.
//!
//! Scenarios covered:
//! - A fresh node catches up with a peer that is far ahead
//! - Every downloaded block is reported to the block-added handler in order
//! - Two peers ahead: one session syncs, the other stays connected idle
//! - A node that is ahead does not sync from a node that is behind
//! - Block relay works again once the session ends

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagflow_core::testing::{chain_on, genesis_block};
use dagflow_core::types::{Block, BlockInsertionResult, Hash256};
use dagflow_p2p::{FlowHandlers, HandlerError};
use dagflow_tests::helpers::*;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn fresh_node_catches_up() {
    let chain = chain_on(&genesis_block(), 50, 0);
    let ahead = TestNode::new();
    ahead.preload(&chain);

    let added: Arc<Mutex<Vec<Hash256>>> = Arc::default();
    let handlers = FlowHandlers::new().on_block_added({
        let added = added.clone();
        move |block: &Block, _: &BlockInsertionResult| -> Result<(), HandlerError> {
            added.lock().unwrap().push(block.hash());
            Ok(())
        }
    });
    let fresh = TestNode::with(test_config(), handlers);
    let _link = connect(&fresh, &ahead);

    let tip = chain[49].hash();
    assert!(wait_for(TIMEOUT, || fresh.consensus.contains(&tip)).await);
    assert!(wait_for(TIMEOUT, || !fresh.ctx().is_ibd_running()).await);

    assert_eq!(fresh.consensus.block_count(), 51);
    assert_eq!(fresh.consensus.selected_tip(), tip);
    let expected: Vec<Hash256> = chain.iter().map(|b| b.hash()).collect();
    assert_eq!(*added.lock().unwrap(), expected);
}

#[tokio::test]
async fn two_peers_ahead_sync_once() {
    let chain = chain_on(&genesis_block(), 30, 100);
    let first = TestNode::new();
    let second = TestNode::new();
    first.preload(&chain);
    second.preload(&chain);

    let fresh = TestNode::new();
    let _a = connect(&fresh, &first);
    let _b = connect(&fresh, &second);

    let tip = chain[29].hash();
    assert!(wait_for(TIMEOUT, || fresh.consensus.contains(&tip)).await);
    assert!(wait_for(TIMEOUT, || !fresh.ctx().is_ibd_running()).await);

    assert_eq!(fresh.consensus.block_count(), 31);
    assert_eq!(fresh.ctx().peer_count(), 2);
    assert!(fresh.bans.is_empty());
}

#[tokio::test]
async fn node_ahead_does_not_sync_from_node_behind() {
    let chain = chain_on(&genesis_block(), 10, 200);
    let ahead = TestNode::new();
    ahead.preload(&chain);
    let behind = TestNode::new();
    let _link = connect(&ahead, &behind);

    let tip = chain[9].hash();
    assert!(wait_for(TIMEOUT, || behind.consensus.contains(&tip)).await);
    assert!(!ahead.ctx().is_ibd_running());
    assert_eq!(ahead.consensus.block_count(), 11);
}

#[tokio::test]
async fn relay_resumes_after_ibd() {
    let chain = chain_on(&genesis_block(), 20, 300);
    let ahead = TestNode::new();
    ahead.preload(&chain[..19]);
    let fresh = TestNode::new();
    let _link = connect(&fresh, &ahead);

    assert!(wait_for(TIMEOUT, || fresh.consensus.contains(&chain[18].hash())).await);
    assert!(wait_for(TIMEOUT, || !fresh.ctx().is_ibd_running()).await);

    ahead.ctx().add_block(chain[19].clone()).unwrap();
    assert!(wait_for(TIMEOUT, || fresh.consensus.contains(&chain[19].hash())).await);
}
