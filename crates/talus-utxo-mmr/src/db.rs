//! RocksDB wrapper for the accumulator's key space.

use crate::entry::EntryList;
use crate::{entry_list_size, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;

const KEY_NEXT_INDEX: u8 = b'I';
const KEY_ENTRIES: u8 = b'e';
const KEY_BEST_BLOCK: u8 = b'B';

fn entries_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = KEY_ENTRIES;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Persistent store for entry lists, the next insertion index and the best
/// block marker.
pub struct MmrDb {
    db: DB,
}

impl MmrDb {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        let db = DB::open(&db_opts, path)?;
        Ok(Self { db })
    }

    /// Read the entry list at `index`; absence decodes as all-cleared.
    pub fn read_entries(&self, index: u64) -> Result<EntryList> {
        match self.db.get(entries_key(index))? {
            Some(bytes) => EntryList::decode(&bytes, index),
            None => Ok(EntryList::cleared(entry_list_size(index))),
        }
    }

    /// Queue the entry list at `index` into `batch`; all-cleared lists are
    /// erased rather than written.
    pub fn write_entries(&self, batch: &mut WriteBatch, index: u64, entry_list: &EntryList) {
        let key = entries_key(index);
        if entry_list.is_empty() {
            batch.delete(key);
        } else {
            batch.put(key, entry_list.encode());
        }
    }

    /// Read the next insertion index; a fresh store reads as 0.
    pub fn read_next_index(&self) -> Result<u64> {
        match self.db.get([KEY_NEXT_INDEX])? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::MalformedNextIndex)?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Queue the next insertion index into `batch`.
    pub fn write_next_index(&self, batch: &mut WriteBatch, index: u64) {
        batch.put([KEY_NEXT_INDEX], index.to_le_bytes());
    }

    /// Read the best block marker; a fresh store reads as the zero hash.
    pub fn read_best_block(&self) -> Result<BlockHash> {
        match self.db.get([KEY_BEST_BLOCK])? {
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

    /// Persist the best block marker.
    pub fn write_best_block(&self, block_hash: &BlockHash) -> Result<()> {
        self.db
            .put([KEY_BEST_BLOCK], block_hash.to_byte_array())?;
        Ok(())
    }

    /// Commit a batch atomically.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }
}
