//! Block-driven indexes and their synchronization machinery.
//!
//! The pieces fit together like this: the node's validation layer publishes
//! connect/disconnect events on a [`ValidationBus`]; an
//! [`IndexSynchronizer`] owns one worker thread per index, catches the
//! index up with the active chain, then applies queued events in delivery
//! order through an [`IndexWriter`]. The [`BlockFilterIndex`] persists GCS
//! filters in a [`TwoKeyedStore`] keyed primarily by height, with a
//! hash-keyed fallback so reorged-out rows stay reachable; the
//! [`UtxoMmrWriter`] drives the disk-backed UTXO accumulator.
//!
//! Ordering rests on two FIFO queues with in-band barriers ([`Queue`]): the
//! bus queue and each synchronizer's update queue. A successful
//! [`IndexSynchronizer::block_until_synced_to_current_chain`] therefore
//! happens-after every event delivered before the call.

mod bus;
mod error;
mod filter_index;
mod queue;
mod store;
mod sync;

pub use bus::{ChainEventListener, ValidationBus};
pub use error::Error;
pub use filter_index::BlockFilterIndex;
pub use queue::{Barrier, Queue};
pub use store::{RecordKind, TwoKeyedStore};
pub use sync::{BlockUpdate, IndexSynchronizer, IndexWriter, UtxoMmrWriter};

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, Error>;
