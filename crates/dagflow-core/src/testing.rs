//! In-memory consensus and mempool doubles plus block/transaction builders.
//!
//! Compiled for this crate's tests and for downstream crates enabling the
//! `testing` feature.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::{ConsensusError, MempoolError, RuleError, TxRuleError};
use crate::traits::{ConsensusApi, MiningManager};
use crate::types::{
    Block, BlockHeader, BlockInfo, BlockInsertionResult, ChainChanges, Hash256, OutPoint,
    SubnetworkId, Transaction, TxInput, TxOutput,
};

/// Timestamp of [`genesis_block`].
pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000_000;

/// Milliseconds between a parent and a child built by [`child_of`].
pub const BLOCK_INTERVAL_MS: i64 = 1_000;

/// Deterministic genesis block.
pub fn genesis_block() -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            parents: Vec::new(),
            hash_merkle_root: Hash256::ZERO,
            timestamp: GENESIS_TIMESTAMP,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions: vec![coinbase(0)],
    }
}

/// A coinbase transaction made unique by `nonce`.
pub fn coinbase(nonce: u64) -> Transaction {
    Transaction {
        version: 0,
        inputs: Vec::new(),
        outputs: vec![TxOutput {
            value: 50_000_000,
            script_public_key: vec![0x51],
        }],
        lock_time: 0,
        subnetwork_id: SubnetworkId::COINBASE,
        gas: 0,
        payload: nonce.to_le_bytes().to_vec(),
    }
}

/// A full block with the given parents. `nonce` keeps siblings distinct.
pub fn block_with_parents(parents: &[Hash256], timestamp: i64, nonce: u64) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            parents: parents.to_vec(),
            hash_merkle_root: Hash256::ZERO,
            timestamp,
            bits: 0x207f_ffff,
            nonce,
        },
        transactions: vec![coinbase(nonce)],
    }
}

/// A full block with a single parent, one interval later than it.
pub fn child_of(parent: &Block, nonce: u64) -> Block {
    block_with_parents(
        &[parent.hash()],
        parent.header.timestamp + BLOCK_INTERVAL_MS,
        nonce,
    )
}

/// A chain of `len` blocks on top of `base`, oldest first.
pub fn chain_on(base: &Block, len: usize, nonce_base: u64) -> Vec<Block> {
    let mut chain: Vec<Block> = Vec::with_capacity(len);
    for i in 0..len {
        let parent = chain.last().unwrap_or(base);
        let block = child_of(parent, nonce_base + i as u64);
        chain.push(block);
    }
    chain
}

/// A native-subnetwork transaction made unique by `seed`.
pub fn sample_transaction(seed: u64) -> Transaction {
    Transaction {
        version: 0,
        inputs: vec![TxInput {
            previous_outpoint: OutPoint {
                transaction_id: Hash256::ZERO,
                index: seed as u32,
            },
            signature_script: seed.to_le_bytes().to_vec(),
            sequence: seed,
        }],
        outputs: vec![TxOutput {
            value: 1_000 + seed,
            script_public_key: vec![0x51],
        }],
        lock_time: 0,
        subnetwork_id: SubnetworkId::NATIVE,
        gas: 0,
        payload: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// MemoryConsensus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryDag {
    blocks: HashMap<Hash256, Block>,
    blue_scores: HashMap<Hash256, u64>,
    invalid: HashSet<Hash256>,
    failing: HashSet<Hash256>,
    selected_tip: Hash256,
    pruning_point: Hash256,
}

impl MemoryDag {
    /// `hash` and all its ancestors. Unknown hashes yield an empty set.
    fn past_inclusive(&self, hash: &Hash256) -> HashSet<Hash256> {
        let mut seen = HashSet::new();
        if !self.blocks.contains_key(hash) {
            return seen;
        }
        let mut stack = vec![*hash];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(block) = self.blocks.get(&current) {
                stack.extend(block.parents().iter().copied());
            }
        }
        seen
    }

    fn score(&self, hash: &Hash256) -> u64 {
        self.blue_scores.get(hash).copied().unwrap_or(0)
    }
}

/// A DAG store that accepts any structurally complete block.
///
/// The selected tip is the block with the highest score (longest parent
/// path), ties broken by hash.
pub struct MemoryConsensus {
    dag: RwLock<MemoryDag>,
}

impl MemoryConsensus {
    /// Create a store holding only `genesis`.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut dag = MemoryDag::default();
        dag.blocks.insert(hash, genesis);
        dag.blue_scores.insert(hash, 0);
        dag.selected_tip = hash;
        dag.pruning_point = hash;
        Self {
            dag: RwLock::new(dag),
        }
    }

    /// Make any future insertion of `hash` fail with a rule error.
    pub fn mark_invalid(&self, hash: Hash256) {
        self.dag.write().invalid.insert(hash);
    }

    /// Make any future insertion of `hash` fail with an internal error.
    pub fn fail_insertion_of(&self, hash: Hash256) {
        self.dag.write().failing.insert(hash);
    }

    /// Move the pruning point.
    pub fn set_pruning_point(&self, hash: Hash256) {
        self.dag.write().pruning_point = hash;
    }

    /// Whether `hash` is stored.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.dag.read().blocks.contains_key(hash)
    }

    /// Number of stored blocks, genesis included.
    pub fn block_count(&self) -> usize {
        self.dag.read().blocks.len()
    }

    /// Hash of the current selected tip.
    pub fn selected_tip(&self) -> Hash256 {
        self.dag.read().selected_tip
    }
}

impl ConsensusApi for MemoryConsensus {
    fn validate_and_insert_block(&self, block: &Block) -> Result<BlockInsertionResult, ConsensusError> {
        let hash = block.hash();
        let mut dag = self.dag.write();

        if dag.blocks.contains_key(&hash) {
            return Err(RuleError::DuplicateBlock(hash).into());
        }
        if dag.failing.contains(&hash) {
            return Err(ConsensusError::Internal(format!("injected failure for {hash}")));
        }
        if dag.invalid.contains(&hash) {
            return Err(RuleError::InvalidBlock(format!("block {hash} rejected")).into());
        }
        if block.transactions.is_empty() {
            return Err(RuleError::NoTransactions.into());
        }
        if block.parents().is_empty() {
            return Err(RuleError::NoParents.into());
        }

        let missing: Vec<Hash256> = block
            .parents()
            .iter()
            .filter(|p| !dag.blocks.contains_key(*p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(RuleError::MissingParents(missing).into());
        }

        let score = block
            .parents()
            .iter()
            .map(|p| dag.score(p))
            .max()
            .unwrap_or(0)
            + 1;
        dag.blocks.insert(hash, block.clone());
        dag.blue_scores.insert(hash, score);

        let mut chain_changes = ChainChanges::default();
        let current = dag.selected_tip;
        if (score, hash) > (dag.score(&current), current) {
            chain_changes.added.push(hash);
            dag.selected_tip = hash;
        }

        Ok(BlockInsertionResult { chain_changes })
    }

    fn block_info(&self, hash: &Hash256) -> Result<BlockInfo, ConsensusError> {
        Ok(BlockInfo {
            exists: self.dag.read().blocks.contains_key(hash),
        })
    }

    fn virtual_selected_parent(&self) -> Result<BlockHeader, ConsensusError> {
        let dag = self.dag.read();
        dag.blocks
            .get(&dag.selected_tip)
            .map(|b| b.header.clone())
            .ok_or_else(|| ConsensusError::Internal("selected tip missing".into()))
    }

    fn block_header(&self, hash: &Hash256) -> Result<BlockHeader, ConsensusError> {
        self.dag
            .read()
            .blocks
            .get(hash)
            .map(|b| b.header.clone())
            .ok_or(ConsensusError::BlockNotFound(*hash))
    }

    fn block(&self, hash: &Hash256) -> Result<Option<Block>, ConsensusError> {
        Ok(self.dag.read().blocks.get(hash).cloned())
    }

    fn block_hashes_between(
        &self,
        low: &Hash256,
        high: &Hash256,
        max: usize,
    ) -> Result<Vec<Hash256>, ConsensusError> {
        let dag = self.dag.read();
        if !dag.blocks.contains_key(high) {
            return Err(ConsensusError::BlockNotFound(*high));
        }
        let below = dag.past_inclusive(low);
        let mut hashes: Vec<Hash256> = dag
            .past_inclusive(high)
            .into_iter()
            .filter(|h| !below.contains(h))
            .collect();
        hashes.sort_by_key(|h| (dag.score(h), *h));
        hashes.truncate(max);
        Ok(hashes)
    }

    fn pruning_point(&self) -> Result<Hash256, ConsensusError> {
        Ok(self.dag.read().pruning_point)
    }
}

// ---------------------------------------------------------------------------
// MemoryMempool
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MempoolState {
    transactions: HashMap<Hash256, (Transaction, bool)>,
    rejected: HashMap<Hash256, TxRuleError>,
    unorphan_on_next_block: Vec<Transaction>,
}

/// A mempool that accepts everything not explicitly rejected.
#[derive(Default)]
pub struct MemoryMempool {
    state: RwLock<MempoolState>,
}

impl MemoryMempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any future insertion of `id` fail with `err`.
    pub fn reject(&self, id: Hash256, err: TxRuleError) {
        self.state.write().rejected.insert(id, err);
    }

    /// Accept `tx` as an unorphaned transaction on the next block.
    pub fn queue_unorphaned(&self, tx: Transaction) {
        self.state.write().unorphan_on_next_block.push(tx);
    }

    /// Number of transactions in the pool.
    pub fn len(&self) -> usize {
        self.state.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MiningManager for MemoryMempool {
    fn handle_new_block_transactions(
        &self,
        transactions: &[Transaction],
    ) -> Result<Vec<Transaction>, MempoolError> {
        let mut state = self.state.write();
        for tx in transactions {
            state.transactions.remove(&tx.id());
        }
        let unorphaned = std::mem::take(&mut state.unorphan_on_next_block);
        for tx in &unorphaned {
            state.transactions.insert(tx.id(), (tx.clone(), false));
        }
        Ok(unorphaned)
    }

    fn validate_and_insert_transaction(
        &self,
        transaction: Transaction,
        is_local: bool,
        _allow_orphan: bool,
    ) -> Result<Vec<Transaction>, MempoolError> {
        let id = transaction.id();
        let mut state = self.state.write();
        if let Some(err) = state.rejected.get(&id) {
            return Err(err.clone().into());
        }
        if state.transactions.contains_key(&id) {
            return Err(TxRuleError::AlreadyInMempool(id).into());
        }
        state.transactions.insert(id, (transaction.clone(), is_local));
        Ok(vec![transaction])
    }

    fn transaction(&self, id: &Hash256) -> Option<Transaction> {
        self.state.read().transactions.get(id).map(|(tx, _)| tx.clone())
    }

    fn revalidate_high_priority_transactions(&self) -> Result<Vec<Hash256>, MempoolError> {
        let mut ids: Vec<Hash256> = self
            .state
            .read()
            .transactions
            .iter()
            .filter(|(_, (_, is_local))| *is_local)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
