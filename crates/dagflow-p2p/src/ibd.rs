//! Initial block download (IBD) coordination.
//!
//! At most one IBD session runs per node. The [`IbdCoordinator`] owns the
//! `Idle -> Syncing(peer) -> Idle` state machine; the flow context drives it
//! and the chosen peer's IBD flow performs the actual download.

use dagflow_core::error::ConsensusError;
use dagflow_core::time::is_recent;
use dagflow_core::traits::ConsensusApi;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::peer::{Peer, PeerId};

/// The state of the node-wide IBD session.
#[derive(Debug, Clone, Default)]
pub enum IbdState {
    /// No session is running.
    #[default]
    Idle,
    /// Downloading from this peer.
    Syncing(Arc<Peer>),
}

/// Outcome of [`IbdCoordinator::try_start`].
#[derive(Debug, Clone)]
pub enum IbdStart {
    /// A session started with this peer.
    Started(Arc<Peer>),
    /// A session was already running with this peer.
    AlreadyRunning(Arc<Peer>),
    /// No peer announced a selected tip unknown to consensus.
    NoCandidate {
        /// Whether our own selected tip is recent enough.
        dag_time_current: bool,
    },
}

/// Serializes IBD session starts and ends.
pub struct IbdCoordinator {
    state: Mutex<IbdState>,
    staleness_window_ms: i64,
}

impl IbdCoordinator {
    pub fn new(staleness_window_ms: i64) -> Self {
        Self {
            state: Mutex::new(IbdState::Idle),
            staleness_window_ms,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), IbdState::Syncing(_))
    }

    /// The peer of the running session, if any.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        match &*self.state.lock() {
            IbdState::Syncing(peer) => Some(Arc::clone(peer)),
            IbdState::Idle => None,
        }
    }

    /// Start a session unless one is running.
    ///
    /// `peers` is read only after the state lock is taken. A peer removed
    /// before that is never chosen, and one removed after it has its
    /// `finish` wait for the lock, so a session cannot outlive its peer.
    pub fn try_start(
        &self,
        peers: impl FnOnce() -> Vec<Arc<Peer>>,
        consensus: &dyn ConsensusApi,
        now_ms: i64,
    ) -> Result<IbdStart, ConsensusError> {
        let mut state = self.state.lock();
        if let IbdState::Syncing(peer) = &*state {
            return Ok(IbdStart::AlreadyRunning(Arc::clone(peer)));
        }
        match select_ibd_peer(&peers(), consensus)? {
            Some(peer) => {
                info!(peer = %peer, tip = %peer.selected_tip(), "ibd: starting session");
                *state = IbdState::Syncing(Arc::clone(&peer));
                Ok(IbdStart::Started(peer))
            }
            None => {
                let dag_time_current =
                    is_dag_time_current(consensus, now_ms, self.staleness_window_ms)?;
                debug!(dag_time_current, "ibd: no peer is ahead of us");
                Ok(IbdStart::NoCandidate { dag_time_current })
            }
        }
    }

    /// End the session held by `peer`.
    ///
    /// Returns `false` (and changes nothing) when `peer` does not hold the
    /// running session.
    pub fn finish(&self, peer: &PeerId) -> bool {
        let mut state = self.state.lock();
        match &*state {
            IbdState::Syncing(current) if current.id() == *peer => {
                info!(%peer, "ibd: session finished");
                *state = IbdState::Idle;
                true
            }
            _ => false,
        }
    }
}

/// The first peer, by ascending id, whose announced selected tip is unknown
/// to consensus.
pub fn select_ibd_peer(
    peers: &[Arc<Peer>],
    consensus: &dyn ConsensusApi,
) -> Result<Option<Arc<Peer>>, ConsensusError> {
    let mut ordered: Vec<&Arc<Peer>> = peers.iter().collect();
    ordered.sort_by_key(|p| p.id());
    for peer in ordered {
        if !consensus.block_exists(&peer.selected_tip())? {
            return Ok(Some(Arc::clone(peer)));
        }
    }
    Ok(None)
}

/// Whether the virtual selected parent's timestamp is within `window_ms` of `now_ms`.
pub fn is_dag_time_current(
    consensus: &dyn ConsensusApi,
    now_ms: i64,
    window_ms: i64,
) -> Result<bool, ConsensusError> {
    let tip = consensus.virtual_selected_parent()?;
    Ok(is_recent(tip.timestamp, now_ms, window_ms))
}
