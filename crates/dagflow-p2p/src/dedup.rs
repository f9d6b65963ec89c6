//! Cross-peer request deduplication.
//!
//! When several peers announce the same block or transaction, only the first
//! flow to claim its ID fetches it. The claim is released once the fetch
//! ends, successfully or not; [`ClaimBatch`] releases on drop so that an
//! early `?` return cannot leak a claim.

use dagflow_core::types::Hash256;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A set of IDs currently being fetched from some peer.
#[derive(Debug)]
pub struct RequestedSet {
    name: &'static str,
    ids: Mutex<HashSet<Hash256>>,
}

impl RequestedSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claim `id`. Returns `true` if it was *already* claimed, in which case
    /// the caller must not fetch it.
    pub fn claim(&self, id: Hash256) -> bool {
        !self.ids.lock().insert(id)
    }

    pub fn release(&self, id: &Hash256) {
        self.ids.lock().remove(id);
    }

    pub fn release_many(&self, ids: &[Hash256]) {
        let mut set = self.ids.lock();
        for id in ids {
            set.remove(id);
        }
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Claim every unclaimed ID in `ids` under one lock acquisition.
    ///
    /// The returned batch holds only the IDs this call claimed, in input
    /// order without duplicates, and releases them when dropped.
    pub fn claim_batch(self: &Arc<Self>, ids: impl IntoIterator<Item = Hash256>) -> ClaimBatch {
        let mut claimed = Vec::new();
        {
            let mut set = self.ids.lock();
            for id in ids {
                if set.insert(id) {
                    claimed.push(id);
                }
            }
        }
        ClaimBatch {
            set: Arc::clone(self),
            ids: claimed,
        }
    }
}

/// IDs claimed by one flow; released on drop.
#[derive(Debug)]
#[must_use = "dropping a claim batch releases its IDs immediately"]
pub struct ClaimBatch {
    set: Arc<RequestedSet>,
    ids: Vec<Hash256>,
}

impl ClaimBatch {
    pub fn ids(&self) -> &[Hash256] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

impl Drop for ClaimBatch {
    fn drop(&mut self) {
        self.set.release_many(&self.ids);
    }
}
