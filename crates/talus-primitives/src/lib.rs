//! Shared primitives for the Talus commitment and index crates.
//!
//! The types here are the surface between the node and the accumulator
//! cores: chain entries ([`BlockIndex`]), per-block undo data carrying the
//! positions of spent coins ([`BlockUndo`]), and the collaborator traits the
//! indexes are driven through ([`BlockSource`], [`CoinView`]).

use bitcoin::{Block, BlockHash, OutPoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod math;

/// Hash of a single accumulator leaf.
pub type LeafHash = [u8; 32];

/// An entry in the block tree, linked to its parent.
///
/// Entries are shared as `Arc<BlockIndex>`; walking `prev` reaches the
/// genesis entry. Two entries are the same block iff their hashes match.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    /// Hash of the block.
    pub hash: BlockHash,
    /// Height of the block in the chain it belongs to.
    pub height: u32,
    /// Parent entry, `None` for genesis.
    pub prev: Option<Arc<BlockIndex>>,
}

impl BlockIndex {
    /// Create the genesis entry.
    pub fn genesis(hash: BlockHash) -> Arc<Self> {
        Arc::new(Self {
            hash,
            height: 0,
            prev: None,
        })
    }

    /// Create a new entry extending `prev`.
    pub fn new(hash: BlockHash, prev: Arc<BlockIndex>) -> Arc<Self> {
        let height = prev.height + 1;
        Arc::new(Self {
            hash,
            height,
            prev: Some(prev),
        })
    }

    /// Hash of the block this entry refers to.
    pub fn block_hash(&self) -> BlockHash {
        self.hash
    }

    /// Hash of the parent block, or the all-zero hash for genesis.
    pub fn prev_block_hash(&self) -> BlockHash {
        use bitcoin::hashes::Hash;
        self.prev
            .as_ref()
            .map(|p| p.hash)
            .unwrap_or_else(BlockHash::all_zeros)
    }

    /// Ancestor of this entry at the given height.
    ///
    /// Returns `None` if `height` is above this entry's height.
    pub fn ancestor_at(self: &Arc<Self>, height: u32) -> Option<Arc<BlockIndex>> {
        if height > self.height {
            return None;
        }
        let mut walk = self.clone();
        while walk.height > height {
            walk = walk.prev.clone()?;
        }
        Some(walk)
    }
}

impl std::fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{},{}", self.height, self.hash)
    }
}

impl PartialEq for BlockIndex {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlockIndex {}

/// A coin spent by a block, as recorded in undo data.
///
/// Carries the coin's accumulator position and leaf hash so that disconnects
/// can restore it without consulting the coin database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentLeaf {
    /// Global insertion position assigned when the coin was created.
    pub position: u64,
    /// Leaf hash committed to by the accumulator.
    pub leaf_hash: LeafHash,
}

/// Undo data for a single transaction: the coins its inputs spent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxUndo {
    /// Spent coins in input order.
    pub spent: Vec<SpentLeaf>,
}

/// Undo data for a single block.
///
/// One [`TxUndo`] per non-coinbase transaction, in block order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Per-transaction undo records.
    pub tx_undos: Vec<TxUndo>,
}

impl BlockUndo {
    /// Create a new empty undo record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the coins spent by one transaction.
    pub fn push_tx(&mut self, spent: Vec<SpentLeaf>) {
        self.tx_undos.push(TxUndo { spent });
    }

    /// All spent-coin positions in the block, in block order.
    pub fn spent_positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.tx_undos
            .iter()
            .flat_map(|tx| tx.spent.iter().map(|s| s.position))
    }

    /// All spent coins in the block, in block order.
    pub fn spent_leaves(&self) -> impl Iterator<Item = &SpentLeaf> + '_ {
        self.tx_undos.iter().flat_map(|tx| tx.spent.iter())
    }

    /// Serialize to bytes for storage.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("BlockUndo serialization should not fail")
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Access to block bodies, undo data, and the block-index map.
///
/// Implemented by the node's block storage; the indexes only read.
pub trait BlockSource: Send + Sync {
    /// Read the full block body.
    fn block(&self, hash: &BlockHash) -> Option<Block>;

    /// Read the undo data recorded when the block was connected.
    fn undo(&self, hash: &BlockHash) -> Option<BlockUndo>;

    /// Look up the chain entry for a block hash, on any known branch.
    fn block_index(&self, hash: &BlockHash) -> Option<Arc<BlockIndex>>;
}

/// Positions and leaf hashes for coins created by connected blocks.
///
/// A pure mapping maintained by the node's coin database: every unspent coin
/// has a stable insertion position and a leaf hash. Implementations may
/// answer from coins read eagerly out of the block itself.
pub trait CoinView: Send + Sync {
    /// Position and leaf hash of the coin at `outpoint`, if it exists.
    fn leaf(&self, outpoint: &OutPoint) -> Option<(u64, LeafHash)>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    #[test]
    fn test_ancestor_walk() {
        let genesis = BlockIndex::genesis(hash(0));
        let b1 = BlockIndex::new(hash(1), genesis.clone());
        let b2 = BlockIndex::new(hash(2), b1.clone());

        assert_eq!(b2.height, 2);
        assert_eq!(b2.ancestor_at(0).unwrap().hash, genesis.hash);
        assert_eq!(b2.ancestor_at(1).unwrap().hash, b1.hash);
        assert_eq!(b2.ancestor_at(2).unwrap().hash, b2.hash);
        assert!(b2.ancestor_at(3).is_none());
    }

    #[test]
    fn test_block_undo_roundtrip() {
        let mut undo = BlockUndo::new();
        undo.push_tx(vec![SpentLeaf {
            position: 7,
            leaf_hash: [0xab; 32],
        }]);
        undo.push_tx(vec![
            SpentLeaf {
                position: 3,
                leaf_hash: [1; 32],
            },
            SpentLeaf {
                position: 11,
                leaf_hash: [2; 32],
            },
        ]);

        let decoded = BlockUndo::decode(&undo.encode()).unwrap();
        assert_eq!(decoded.tx_undos.len(), 2);
        assert_eq!(
            decoded.spent_positions().collect::<Vec<_>>(),
            vec![7, 3, 11]
        );
        assert_eq!(decoded.tx_undos[0].spent[0].leaf_hash, [0xab; 32]);
    }
}
