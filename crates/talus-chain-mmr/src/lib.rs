//! Merkle mountain range commitments over the active chain.
//!
//! [`Chain`] holds the active chain's block-index vector together with a
//! per-height cache of MMR intermediate entries. For any root height `r` it
//! can produce a commitment over the chain prefix `0..=r` and, for any
//! header height `h <= r`, a membership proof verifiable against that
//! commitment with [`verify_proof`].
//!
//! Leaves are the raw block-hash bytes; internal nodes are plain
//! `SHA256(left || right)`. The accumulator is pure: no I/O, no background
//! tasks; it is owned by the chain object and recomputed from the fork
//! point whenever the tip moves.

mod chain;

pub use chain::{verify_proof, Chain, NodeHash};

/// Errors raised by commitment and proof generation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `header_height` was above `root_height`.
    #[error("header height {header_height} exceeds root height {root_height}")]
    HeaderAboveRoot {
        header_height: u32,
        root_height: u32,
    },

    /// The requested root height is above the chain tip.
    #[error("root height {root_height} exceeds chain height")]
    RootAboveTip { root_height: u32 },
}

/// Result type for chain MMR operations.
pub type Result<T> = std::result::Result<T, Error>;
