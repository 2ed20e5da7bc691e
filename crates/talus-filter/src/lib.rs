//! Golomb-coded set block filters.
//!
//! A [`GcsFilter`] is a compact probabilistic summary of a set of byte
//! strings: elements are SipHash-2-4 hashed into a numeric range, sorted,
//! delta-encoded and Golomb-Rice compressed into a byte-exact wire format.
//! [`BlockFilter`] wraps one filter per block, derives the SipHash keys from
//! the block hash, and chains per-height headers with double SHA-256.
//!
//! Everything in this crate is pure: no I/O, no background tasks. Filters
//! are immutable after construction and safe to share for reads.

mod bits;
mod block_filter;
mod gcs;

pub use bits::{BitStreamReader, BitStreamWriter};
pub use block_filter::{
    basic_filter_elements, BlockFilter, FilterHash, FilterHeader, FilterType,
    BASIC_FILTER_P,
};
pub use gcs::{map_into_range, Element, GcsFilter};

/// Errors raised while building or decoding filters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Golomb-Rice parameter out of range.
    #[error("P must be <= 32")]
    PTooLarge,

    /// Element count out of range.
    #[error("N must be < 2^32")]
    NTooLarge,

    /// The bit stream ended in the middle of a coded value.
    #[error("bit stream ended unexpectedly")]
    UnexpectedEnd,

    /// Bytes remained after decoding all N values.
    #[error("encoded filter carries {0} excess bytes")]
    TrailingBytes(usize),

    /// The compact-size prefix could not be decoded.
    #[error("invalid compact size prefix")]
    InvalidCompactSize,

    /// A persisted block filter record did not parse.
    #[error("truncated block filter record")]
    TruncatedRecord,

    /// The record named a filter type this build does not know.
    #[error("unknown filter type {0}")]
    UnknownFilterType(u8),
}

/// Result type for filter operations.
pub type Result<T> = std::result::Result<T, Error>;
