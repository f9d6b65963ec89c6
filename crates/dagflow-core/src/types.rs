//! Core DAG types: hashes, block headers, blocks, transactions.
//!
//! Blocks reference any number of parents. Timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for block hashes (double SHA-256 of the header) and transaction IDs
/// (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identifier of the subnetwork a transaction (or a peer) belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SubnetworkId(pub [u8; 20]);

impl SubnetworkId {
    /// The native subnetwork. Full nodes that accept every transaction use it.
    pub const NATIVE: Self = Self([0u8; 20]);

    /// The subnetwork used by coinbase transactions.
    pub const COINBASE: Self = {
        let mut bytes = [0u8; 20];
        bytes[0] = 1;
        Self(bytes)
    };

    /// Whether this is the native subnetwork.
    pub fn is_native(&self) -> bool {
        *self == Self::NATIVE
    }
}

impl fmt::Display for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// ID of the transaction containing the referenced output.
    pub transaction_id: Hash256,
    /// Index of the output within that transaction.
    pub index: u32,
}

/// A transaction input, spending a previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    /// The outpoint being spent.
    pub previous_outpoint: OutPoint,
    /// Unlocking script.
    pub signature_script: Vec<u8>,
    /// Relative lock sequence.
    pub sequence: u64,
}

/// A transaction output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Locking script.
    pub script_public_key: Vec<u8>,
}

/// A transaction moving value between scripts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Protocol version.
    pub version: u16,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// DAA score or timestamp before which this transaction is invalid.
    pub lock_time: u64,
    /// Subnetwork this transaction belongs to.
    pub subnetwork_id: SubnetworkId,
    /// Gas limit for non-native subnetworks.
    pub gas: u64,
    /// Arbitrary payload for non-native subnetworks.
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Compute the transaction ID: BLAKE3 over a fixed little-endian layout
    /// of every field.
    pub fn id(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.previous_outpoint.transaction_id.as_bytes());
            hasher.update(&input.previous_outpoint.index.to_le_bytes());
            hasher.update(&(input.signature_script.len() as u64).to_le_bytes());
            hasher.update(&input.signature_script);
            hasher.update(&input.sequence.to_le_bytes());
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.value.to_le_bytes());
            hasher.update(&(output.script_public_key.len() as u64).to_le_bytes());
            hasher.update(&output.script_public_key);
        }
        hasher.update(&self.lock_time.to_le_bytes());
        hasher.update(&self.subnetwork_id.0);
        hasher.update(&self.gas.to_le_bytes());
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        Hash256(hasher.finalize().into())
    }

    /// Check if this is a coinbase transaction.
    pub fn is_coinbase(&self) -> bool {
        self.subnetwork_id == SubnetworkId::COINBASE
    }
}

/// Block header. A header references one or more parent blocks; only the
/// genesis block has no parents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u16,
    /// Hashes of the direct parents of this block.
    pub parents: Vec<Hash256>,
    /// Merkle root of the block's transactions.
    pub hash_merkle_root: Hash256,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Compute the block hash (double SHA-256).
    ///
    /// Layout: version || parent count || parents || merkle root ||
    /// timestamp || bits || nonce, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(2 + 8 + self.parents.len() * 32 + 32 + 8 + 4 + 8);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&(self.parents.len() as u64).to_le_bytes());
        for parent in &self.parents {
            data.extend_from_slice(parent.as_bytes());
        }
        data.extend_from_slice(self.hash_merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// A header with no parents can only be a genesis header.
    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }
}

/// A complete block: header plus transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Ordered list of transactions. A full block always carries at least
    /// its coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Wrap a bare header into a header-only block.
    pub fn from_header(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }

    /// The block hash.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// A header-only block carries no transactions.
    pub fn is_header_only(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Direct parents of this block.
    pub fn parents(&self) -> &[Hash256] {
        &self.header.parents
    }
}

/// What consensus knows about a block hash.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// Whether the block is stored by consensus.
    pub exists: bool,
}

/// Changes to the virtual selected-parent chain caused by an insertion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChainChanges {
    /// Blocks removed from the selected-parent chain, tip first.
    pub removed: Vec<Hash256>,
    /// Blocks added to the selected-parent chain, oldest first.
    pub added: Vec<Hash256>,
}

/// Result of a successful block insertion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockInsertionResult {
    /// How the virtual selected-parent chain moved.
    pub chain_changes: ChainChanges,
}

impl BlockInsertionResult {
    /// Whether the inserted block changed the virtual selected parent.
    pub fn selected_parent_changed(&self) -> bool {
        !self.chain_changes.added.is_empty() || !self.chain_changes.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx(seed: u8) -> Transaction {
        Transaction {
            version: 0,
            inputs: vec![TxInput {
                previous_outpoint: OutPoint {
                    transaction_id: Hash256([seed; 32]),
                    index: 0,
                },
                signature_script: vec![seed; 8],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 1_000,
                script_public_key: vec![0xAA; 4],
            }],
            lock_time: 0,
            subnetwork_id: SubnetworkId::NATIVE,
            gas: 0,
            payload: vec![],
        }
    }

    fn sample_header(parents: Vec<Hash256>) -> BlockHeader {
        BlockHeader {
            version: 1,
            parents,
            hash_merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000_000,
            bits: 0x207f_ffff,
            nonce: 0,
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(Hash256::ZERO, Hash256::default());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
    }

    // --- SubnetworkId ---

    #[test]
    fn native_and_coinbase_subnetworks_differ() {
        assert!(SubnetworkId::NATIVE.is_native());
        assert!(!SubnetworkId::COINBASE.is_native());
        assert_eq!(SubnetworkId::default(), SubnetworkId::NATIVE);
    }

    // --- Transaction ---

    #[test]
    fn transaction_id_is_deterministic() {
        assert_eq!(sample_tx(1).id(), sample_tx(1).id());
    }

    #[test]
    fn transaction_id_changes_with_payload() {
        let a = sample_tx(1);
        let mut b = a.clone();
        b.payload = vec![1];
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn coinbase_detected_by_subnetwork() {
        let mut tx = sample_tx(2);
        assert!(!tx.is_coinbase());
        tx.subnetwork_id = SubnetworkId::COINBASE;
        assert!(tx.is_coinbase());
    }

    // --- BlockHeader / Block ---

    #[test]
    fn header_hash_depends_on_parents() {
        let a = sample_header(vec![Hash256([1; 32])]);
        let b = sample_header(vec![Hash256([1; 32]), Hash256([2; 32])]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn header_hash_depends_on_nonce() {
        let a = sample_header(vec![]);
        let mut b = a.clone();
        b.nonce = 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn genesis_has_no_parents() {
        assert!(sample_header(vec![]).is_genesis());
        assert!(!sample_header(vec![Hash256([1; 32])]).is_genesis());
    }

    #[test]
    fn header_only_block() {
        let header = sample_header(vec![Hash256([1; 32])]);
        let block = Block::from_header(header.clone());
        assert!(block.is_header_only());
        assert_eq!(block.hash(), header.hash());

        let full = Block {
            header,
            transactions: vec![sample_tx(3)],
        };
        assert!(!full.is_header_only());
        assert_eq!(full.parents(), &[Hash256([1; 32])]);
    }

    #[test]
    fn insertion_result_reports_selected_parent_change() {
        assert!(!BlockInsertionResult::default().selected_parent_changed());
        let changed = BlockInsertionResult {
            chain_changes: ChainChanges {
                removed: vec![],
                added: vec![Hash256([9; 32])],
            },
        };
        assert!(changed.selected_parent_changed());
    }
}
