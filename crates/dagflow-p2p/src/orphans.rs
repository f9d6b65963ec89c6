//! Orphan block pool and resolver.
//!
//! An orphan is a fully received block whose parents are not all known to
//! consensus yet. When some block is accepted, every orphan that thereby
//! becomes insertable is inserted, breadth-first from the accepted block.

use dagflow_core::error::ConsensusError;
use dagflow_core::traits::ConsensusApi;
use dagflow_core::types::{Block, BlockInsertionResult, Hash256};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// An orphan that was inserted into consensus by the resolver.
#[derive(Debug, Clone)]
pub struct UnorphanedBlock {
    pub block: Block,
    pub insertion_result: BlockInsertionResult,
}

/// Bounded pool of orphan blocks keyed by hash.
///
/// Not synchronized; the flow context keeps it behind a mutex held for the
/// whole of each resolution.
#[derive(Debug)]
pub struct OrphanPool {
    orphans: HashMap<Hash256, Block>,
    max_orphans: usize,
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            orphans: HashMap::new(),
            max_orphans: max_orphans.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Store `block`, replacing an orphan with the same hash.
    ///
    /// When the pool is full an arbitrary orphan is evicted and its hash
    /// returned.
    pub fn add_orphan(&mut self, block: Block) -> Option<Hash256> {
        let hash = block.hash();
        let mut evicted = None;
        if !self.orphans.contains_key(&hash) && self.orphans.len() >= self.max_orphans {
            evicted = self.orphans.keys().next().copied();
            if let Some(victim) = evicted {
                self.orphans.remove(&victim);
                debug!(%victim, "orphans: pool full, evicted orphan");
            }
        }
        self.orphans.insert(hash, block);
        evicted
    }

    /// Orphans listing `parent` among their parents, sorted by hash.
    fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        let mut children: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, block)| block.parents().contains(parent))
            .map(|(hash, _)| *hash)
            .collect();
        children.sort();
        children
    }

    /// Ancestors of `hash` that are neither orphans nor known to consensus.
    ///
    /// These are the blocks to request so that `hash` can eventually be
    /// unorphaned. Returned in discovery order.
    pub fn missing_roots(
        &self,
        hash: &Hash256,
        consensus: &dyn ConsensusApi,
    ) -> Result<Vec<Hash256>, ConsensusError> {
        let mut roots = Vec::new();
        let mut visited = HashSet::from([*hash]);
        let mut queue = VecDeque::from([*hash]);
        while let Some(current) = queue.pop_front() {
            match self.orphans.get(&current) {
                Some(orphan) => {
                    for parent in orphan.parents() {
                        if visited.insert(*parent) {
                            queue.push_back(*parent);
                        }
                    }
                }
                None => {
                    if !consensus.block_exists(&current)? {
                        roots.push(current);
                    }
                }
            }
        }
        Ok(roots)
    }

    /// Insert every orphan made insertable by the acceptance of `root`.
    ///
    /// Candidates are visited breadth-first starting with the orphan
    /// children of `root`. A candidate is inserted once all its parents are
    /// in consensus, and its own orphan children are queued unless already
    /// pending. Returned blocks are in insertion order, so every parent
    /// precedes its children.
    ///
    /// Orphans consensus rejects on a rule are dropped. Any other consensus
    /// error aborts the traversal; blocks inserted before it stay inserted.
    pub fn unorphan_blocks_rooted_at(
        &mut self,
        root: Hash256,
        consensus: &dyn ConsensusApi,
    ) -> Result<Vec<UnorphanedBlock>, ConsensusError> {
        let mut queue: VecDeque<Hash256> = self.children_of(&root).into();
        let mut pending: HashSet<Hash256> = queue.iter().copied().collect();
        let mut unorphaned = Vec::new();

        while let Some(hash) = queue.pop_front() {
            pending.remove(&hash);
            let Some(candidate) = self.orphans.get(&hash) else {
                continue;
            };

            let mut insertable = true;
            for parent in candidate.parents() {
                if !consensus.block_exists(parent)? {
                    insertable = false;
                    break;
                }
            }
            if !insertable {
                continue;
            }

            match consensus.validate_and_insert_block(candidate) {
                Ok(insertion_result) => {
                    if let Some(block) = self.orphans.remove(&hash) {
                        debug!(%hash, "orphans: unorphaned block");
                        unorphaned.push(UnorphanedBlock {
                            block,
                            insertion_result,
                        });
                    }
                }
                Err(err) if err.is_rule_error() => {
                    warn!(%hash, error = %err, "orphans: orphan failed validation, dropping");
                    self.orphans.remove(&hash);
                    continue;
                }
                Err(err) => return Err(err),
            }

            for child in self.children_of(&hash) {
                if pending.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        Ok(unorphaned)
    }
}
