//! Two-keyed block-indexed store.
//!
//! Each record family stores one row per block. Rows for blocks on the
//! active chain live under a height key (the fast path for range scans);
//! when a reorg retires part of the chain, [`TwoKeyedStore::rewind`] copies
//! the affected rows up under a hash key so they stay reachable until a
//! future reorg back. The stored value always leads with the block hash
//! written at the time, which disambiguates height collisions afterwards.

use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use talus_primitives::BlockIndex;

const DB_BLOCK_HEIGHT: u8 = b't';
const DB_BLOCK_HASH: u8 = b's';
const DB_BEST_BLOCK: u8 = b'B';

/// The record families of the filter index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Encoded filter payload.
    Filter,
    /// Double-SHA256 filter hash.
    FilterHash,
    /// Chained filter header.
    FilterHeader,
}

impl RecordKind {
    /// All families, in rewind order.
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Filter,
        RecordKind::FilterHash,
        RecordKind::FilterHeader,
    ];

    fn tag(self) -> u8 {
        match self {
            RecordKind::Filter => b'f',
            RecordKind::FilterHash => b'h',
            RecordKind::FilterHeader => b'r',
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::Filter => "filter",
            RecordKind::FilterHash => "filter hash",
            RecordKind::FilterHeader => "filter header",
        };
        f.write_str(name)
    }
}

/// Key for the height index. Heights are serialized big-endian so a
/// forward iteration visits them in order.
fn height_key(kind: RecordKind, height: u32) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[0] = kind.tag();
    key[1] = DB_BLOCK_HEIGHT;
    key[2..].copy_from_slice(&i64::from(height).to_be_bytes());
    key
}

/// Key for the hash index.
fn hash_key(kind: RecordKind, block_hash: &BlockHash) -> [u8; 34] {
    let mut key = [0u8; 34];
    key[0] = kind.tag();
    key[1] = DB_BLOCK_HASH;
    key[2..].copy_from_slice(&block_hash.to_byte_array());
    key
}

/// Split a height-keyed value into the block hash written at the time and
/// the payload.
fn split_value(value: &[u8]) -> Option<(BlockHash, Vec<u8>)> {
    let (hash, payload) = value.split_at_checked(32)?;
    let hash: [u8; 32] = hash.try_into().ok()?;
    Some((BlockHash::from_byte_array(hash), payload.to_vec()))
}

/// Height-primary, hash-secondary store for per-block records.
pub struct TwoKeyedStore {
    db: DB,
}

impl TwoKeyedStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        let db = DB::open(&db_opts, path)?;
        Ok(Self { db })
    }

    /// Write one block's rows under the height index, atomically, and
    /// advance the best block marker.
    pub fn write(&self, index: &BlockIndex, rows: &[(RecordKind, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (kind, payload) in rows {
            let mut value = Vec::with_capacity(32 + payload.len());
            value.extend_from_slice(&index.hash.to_byte_array());
            value.extend_from_slice(payload);
            batch.put(height_key(*kind, index.height), value);
        }
        batch.put([DB_BEST_BLOCK], index.hash.to_byte_array());
        self.db.write(batch)?;
        Ok(())
    }

    /// Read the height-keyed row, if present.
    pub(crate) fn read_height(
        &self,
        kind: RecordKind,
        height: u32,
    ) -> Result<Option<(BlockHash, Vec<u8>)>> {
        match self.db.get(height_key(kind, height))? {
            Some(value) => Ok(Some(
                split_value(&value).ok_or(Error::MalformedRecord { kind, height })?,
            )),
            None => Ok(None),
        }
    }

    fn read_hash(&self, kind: RecordKind, block_hash: &BlockHash) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(hash_key(kind, block_hash))?)
    }

    /// Payload for `index`: the height row when its stored hash matches,
    /// otherwise the hash-keyed fallback.
    pub fn lookup_one(&self, kind: RecordKind, index: &BlockIndex) -> Result<Option<Vec<u8>>> {
        let Some((stored_hash, payload)) = self.read_height(kind, index.height)? else {
            return Ok(None);
        };
        if stored_hash == index.hash {
            return Ok(Some(payload));
        }
        self.read_hash(kind, &index.hash)
    }

    /// Payloads for every height in `start_height..=stop_index.height` on
    /// the chain ending at `stop_index`.
    ///
    /// Scans the height index forward, then re-reads through the hash index
    /// wherever the stored block hash disagrees with the chain. Fails if
    /// any expected row is missing.
    pub fn lookup_range(
        &self,
        kind: RecordKind,
        start_height: u32,
        stop_index: &Arc<BlockIndex>,
    ) -> Result<Vec<Vec<u8>>> {
        if start_height > stop_index.height {
            return Err(Error::InvalidRange {
                start: start_height,
                stop: stop_index.height,
            });
        }

        let count = (stop_index.height - start_height + 1) as usize;
        let mut values = Vec::with_capacity(count);

        let mut iter = self.db.raw_iterator();
        iter.seek(height_key(kind, start_height));
        for height in start_height..=stop_index.height {
            let expected_key = height_key(kind, height);
            if !iter.valid() || iter.key() != Some(expected_key.as_ref()) {
                return Err(Error::MissingRecord { kind, height });
            }
            let value = iter.value().expect("valid iterator has a value");
            values.push(split_value(value).ok_or(Error::MalformedRecord { kind, height })?);
            iter.next();
        }

        let mut results: Vec<Option<Vec<u8>>> = vec![None; count];
        let mut walk = Some(stop_index.clone());
        while let Some(index) = walk {
            if index.height < start_height {
                break;
            }
            let slot = (index.height - start_height) as usize;
            if values[slot].0 == index.hash {
                results[slot] = Some(std::mem::take(&mut values[slot].1));
            } else {
                let payload = self
                    .read_hash(kind, &index.hash)?
                    .ok_or(Error::MissingHashRecord {
                        kind,
                        hash: index.hash,
                    })?;
                results[slot] = Some(payload);
            }
            walk = index.prev.clone();
        }

        Ok(results
            .into_iter()
            .map(|payload| payload.expect("every slot in range was visited"))
            .collect())
    }

    /// Copy every height row from `new_tip.height` up to the current tip
    /// into the hash index, keyed by the stored block hash, in one atomic
    /// batch. Run when the active chain retires the rows' blocks.
    pub fn rewind(&self, current_tip: &Arc<BlockIndex>, new_tip: &Arc<BlockIndex>) -> Result<()> {
        assert!(
            current_tip
                .ancestor_at(new_tip.height)
                .is_some_and(|ancestor| ancestor.hash == new_tip.hash),
            "the new tip must be an ancestor of the current tip"
        );

        let mut batch = WriteBatch::default();
        for kind in RecordKind::ALL {
            self.copy_height_rows_to_hash(&mut batch, kind, new_tip.height, current_tip)?;
        }
        batch.put([DB_BEST_BLOCK], new_tip.hash.to_byte_array());
        self.db.write(batch)?;
        Ok(())
    }

    fn copy_height_rows_to_hash(
        &self,
        batch: &mut WriteBatch,
        kind: RecordKind,
        start_height: u32,
        stop_index: &BlockIndex,
    ) -> Result<()> {
        let mut iter = self.db.raw_iterator();
        iter.seek(height_key(kind, start_height));
        for height in start_height..=stop_index.height {
            let expected_key = height_key(kind, height);
            if !iter.valid() || iter.key() != Some(expected_key.as_ref()) {
                return Err(Error::MissingRecord { kind, height });
            }
            let value = iter.value().expect("valid iterator has a value");
            let (stored_hash, payload) =
                split_value(value).ok_or(Error::MalformedRecord { kind, height })?;
            batch.put(hash_key(kind, &stored_hash), payload);
            iter.next();
        }
        Ok(())
    }

    /// Hash of the last block written, or the zero hash for a fresh store.
    pub fn best_block(&self) -> Result<BlockHash> {
        match self.db.get([DB_BEST_BLOCK])? {
            Some(bytes) => {
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::MalformedBestBlock)?;
                Ok(BlockHash::from_byte_array(bytes))
            }
            None => Ok(BlockHash::all_zeros()),
        }
    }
}
