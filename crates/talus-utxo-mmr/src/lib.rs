//! Disk-backed append-update merkle mountain range over the UTXO set.
//!
//! Leaves are indexed by their global insertion position; every position
//! persists a vertical slice of the tree (its "entry list") in RocksDB, and
//! an in-memory peak cache mirrors the current peaks. The accumulator
//! supports ordered insertion, overwrite-in-place, removal, rewind and a
//! root commitment, and is driven by block connect/disconnect events.
//!
//! ## Storage
//!
//! - `'e' || index (be64)` — compressed entry list for the index
//! - `'I'` — next insertion index
//! - `'B'` — hash of the last block applied
//!
//! All multi-entry mutations go through a single RocksDB `WriteBatch`, so
//! readers only ever observe whole-block state transitions.

mod db;
mod entry;
mod mmr;

pub use db::MmrDb;
pub use entry::{Entry, EntryList};
pub use mmr::UtxoMmr;

use bitcoin::{BlockHash, OutPoint};
use talus_primitives::math::log2_floor;

/// Errors raised by the accumulator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// A stored entry list does not match its index's slice size.
    #[error("entry list at index {index} has {actual} entries, expected {expected}")]
    EntryListSizeMismatch {
        index: u64,
        expected: usize,
        actual: usize,
    },

    /// A stored entry list could not be parsed.
    #[error("entry list at index {0} is malformed")]
    MalformedEntryList(u64),

    /// The persisted next-index scalar could not be parsed.
    #[error("stored next index is malformed")]
    MalformedNextIndex,

    /// The persisted best-block record could not be parsed.
    #[error("stored best block is malformed")]
    MalformedBestBlock,

    /// A block event arrived out of order.
    #[error("block {got} does not follow accumulator best block {expected}")]
    BestBlockMismatch { got: BlockHash, expected: BlockHash },

    /// The coin view has no position for a created coin.
    #[error("coin {0} has no accumulator position")]
    MissingCoinPosition(OutPoint),

    /// A block body required during catch-up was unavailable.
    #[error("block {0} not found")]
    BlockNotFound(BlockHash),

    /// Undo data required during catch-up was unavailable.
    #[error("undo data for block {0} not found")]
    UndoNotFound(BlockHash),
}

/// Result type for accumulator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Height of the peak containing insertion index `idx` in an MMR with
/// `total` inserted entries.
pub(crate) fn peak_height(idx: u64, total: u64) -> u32 {
    log2_floor(idx ^ total)
}

/// Size of the entry list persisted at `idx`.
pub(crate) fn entry_list_size(idx: u64) -> usize {
    peak_height(idx, idx + 1) as usize + 1
}
