//! Error types for the index crates.

use crate::store::RecordKind;
use bitcoin::BlockHash;

/// Errors raised by the stores, indexes and synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Filter construction or decoding failed.
    #[error(transparent)]
    Filter(#[from] talus_filter::Error),

    /// The UTXO accumulator failed.
    #[error(transparent)]
    UtxoMmr(#[from] talus_utxo_mmr::Error),

    /// A stored row could not be parsed.
    #[error("{kind} record at height {height} is malformed")]
    MalformedRecord { kind: RecordKind, height: u32 },

    /// A height-keyed row the iterator expected was absent.
    #[error("expected {kind} record at height {height} is missing")]
    MissingRecord { kind: RecordKind, height: u32 },

    /// A hash-keyed fallback row was absent.
    #[error("no {kind} record for block {hash}")]
    MissingHashRecord { kind: RecordKind, hash: BlockHash },

    /// A range lookup with inverted bounds.
    #[error("start height {start} is above stop height {stop}")]
    InvalidRange { start: u32, stop: u32 },

    /// The stored previous filter header belongs to a different block.
    #[error(
        "previous filter header at height {height} belongs to block {got}, expected {expected}"
    )]
    PrevBlockMismatch {
        height: u32,
        got: BlockHash,
        expected: BlockHash,
    },

    /// The stored best block record could not be parsed.
    #[error("stored best block is malformed")]
    MalformedBestBlock,

    /// The index's recorded best block is not in the block-index map.
    #[error("best block {0} of the index is unknown")]
    UnknownBestBlock(BlockHash),

    /// A queued block does not connect to the index's best chain.
    #[error("block {got} does not connect to an ancestor of the index tip {tip}")]
    OutOfOrderBlock { got: BlockHash, tip: BlockHash },

    /// A block body required by the writer was unavailable.
    #[error("block {0} not found")]
    BlockNotFound(BlockHash),

    /// Undo data required by the writer was unavailable.
    #[error("undo data for block {0} not found")]
    UndoNotFound(BlockHash),
}
