//! The append-update MMR core and its block event state machine.

use crate::db::MmrDb;
use crate::entry::{Entry, EntryList};
use crate::{peak_height, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, OutPoint};
use rocksdb::WriteBatch;
use sha2::{Digest, Sha256};
use std::path::Path;
use talus_chain_mmr::Chain;
use talus_primitives::{BlockIndex, BlockSource, BlockUndo, CoinView, LeafHash};

/// Parent of two entries: counts sum, hash commits to both serialized
/// children (count and hash each).
fn combine(left: &Entry, right: &Entry) -> Entry {
    let mut preimage = Vec::with_capacity(72);
    left.write_to(&mut preimage);
    right.write_to(&mut preimage);
    Entry {
        count: left.count + right.count,
        hash: Sha256::digest(&preimage).into(),
    }
}

/// Disk-backed accumulator over the UTXO set, keyed by insertion position.
///
/// Only the owning synchronizer thread mutates this; `next_index` and the
/// peak cache always reflect the last committed batch.
pub struct UtxoMmr {
    db: MmrDb,
    next_index: u64,
    /// One entry per current peak, highest subtree first; the back entry is
    /// the most recently formed peak.
    peak_cache: Vec<Entry>,
}

impl UtxoMmr {
    /// Open or create the accumulator at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = MmrDb::open(path)?;
        let next_index = db.read_next_index()?;
        let mut mmr = Self {
            db,
            next_index,
            peak_cache: Vec::new(),
        };
        mmr.refresh_peak_cache()?;
        tracing::info!(
            next_index = mmr.next_index,
            leaf_count = mmr.leaf_count(),
            "Opened UTXO accumulator"
        );
        Ok(mmr)
    }

    /// Next insertion position.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of populated leaves.
    pub fn leaf_count(&self) -> u32 {
        self.peak_cache.iter().map(|entry| entry.count).sum()
    }

    /// Hash of the last block applied to the accumulator.
    pub fn best_block(&self) -> Result<BlockHash> {
        self.db.read_best_block()
    }

    /// Root commitment: a SHA-256 chain seeded with the accumulator size,
    /// folded with each peak from the most recent to the oldest.
    pub fn root_hash(&self) -> LeafHash {
        let mut root = Entry {
            count: 0,
            hash: Sha256::digest(self.next_index.to_le_bytes()).into(),
        };

        for peak in self.peak_cache.iter().rev() {
            let mut preimage = Vec::with_capacity(72);
            peak.write_to(&mut preimage);
            root.write_to(&mut preimage);

            root.count += peak.count;
            root.hash = Sha256::digest(&preimage).into();
        }

        let mut preimage = Vec::with_capacity(36);
        root.write_to(&mut preimage);
        Sha256::digest(&preimage).into()
    }

    /// Append one entry at `next_index`, merging completed subtrees out of
    /// the peak cache into the new index's entry list.
    fn append(&mut self, batch: &mut WriteBatch, entry: Entry) {
        let index = self.next_index;
        self.next_index += 1;
        let peak_height = peak_height(index, self.next_index) as usize;

        let mut entries = vec![Entry::default(); peak_height + 1];
        entries[0] = entry;

        for height in 1..=peak_height {
            let left = self
                .peak_cache
                .pop()
                .expect("peak cache tracks the bits of next_index");
            let right = entries[height - 1];
            entries[height] = combine(&left, &right);
        }

        let entry_list = EntryList(entries);
        self.db.write_entries(batch, index, &entry_list);
        self.db.write_next_index(batch, self.next_index);

        // The top entry of the new list is a new peak.
        self.peak_cache
            .push(*entry_list.0.last().expect("list has peak_height + 1 entries"));
    }

    /// Recompute the parents of a modified entry list with a horizontal
    /// walk toward the containing peak.
    ///
    /// At each height, if the walk stays at the same index only the left
    /// sibling is loaded; if it moves right, the current list is flushed as
    /// the new left slice first. When the next index in the batch is lower
    /// than the index the walk reached, the remaining heights are shared
    /// with that index's own walk and are left to it.
    fn update_parents(
        &mut self,
        batch: &mut WriteBatch,
        mut right_entry_list: EntryList,
        mut index: u64,
        next_in_batch: u64,
        peak_height: usize,
        update_count: &mut usize,
    ) -> Result<()> {
        let mut left_entry_list = EntryList::cleared(0);

        for height in 1..=peak_height {
            let mask = 1u64 << (height - 1);
            let last_index = index;
            index |= mask;

            if index == last_index {
                let left_index = index & !mask;
                left_entry_list = self.db.read_entries(left_index)?;
            } else {
                let left_index = last_index;
                std::mem::swap(&mut left_entry_list, &mut right_entry_list);
                self.db.write_entries(batch, left_index, &left_entry_list);
                *update_count += 1;

                if next_in_batch < index {
                    return Ok(());
                }

                right_entry_list = self.db.read_entries(index)?;
            }

            let left = left_entry_list.0[height - 1];
            let right = right_entry_list.0[height - 1];

            right_entry_list.0[height] = match (left.count, right.count) {
                (0, 0) => Entry::default(),
                (0, 1) => right,
                (1, 0) => left,
                _ => combine(&left, &right),
            };
        }

        self.db.write_entries(batch, index, &right_entry_list);
        *update_count += 1;

        let peak_cache_idx = (index + 1).count_ones() as usize - 1;
        self.peak_cache[peak_cache_idx] = *right_entry_list
            .0
            .last()
            .expect("entry lists are never zero-sized");

        Ok(())
    }

    /// Insert leaves at the given positions.
    ///
    /// Positions at or beyond `next_index` extend the accumulator, filling
    /// any gap with cleared leaves; existing positions are populated or
    /// overwritten in place. Returns the number of entry lists written.
    pub fn insert(&mut self, mut leaves: Vec<(u64, LeafHash)>) -> Result<usize> {
        if leaves.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        leaves.sort_unstable();

        let mut update_count = 0;

        for i in 0..leaves.len() {
            let (index, hash) = leaves[i];

            if index >= self.next_index {
                while self.next_index < index {
                    self.append(&mut batch, Entry::default());
                    update_count += 1;
                }
                self.append(&mut batch, Entry::leaf(hash));
                update_count += 1;
                continue;
            }

            let peak_height = peak_height(index, self.next_index) as usize;
            let mut entry_list = self.db.read_entries(index)?;

            let leaf_entry = &mut entry_list.0[0];
            match leaf_entry.count {
                0 => *leaf_entry = Entry::leaf(hash),
                1 => {
                    if leaf_entry.hash == hash {
                        continue;
                    }
                    leaf_entry.hash = hash;
                }
                // Only leaves can sit at height 0.
                count => panic!("leaf entry at index {index} has count {count}"),
            }

            let next_in_batch = leaves.get(i + 1).map(|(idx, _)| *idx).unwrap_or(self.next_index);
            self.update_parents(
                &mut batch,
                entry_list,
                index,
                next_in_batch,
                peak_height,
                &mut update_count,
            )?;
        }

        self.db.write_batch(batch)?;
        Ok(update_count)
    }

    /// Clear the leaves at the given positions.
    ///
    /// Positions beyond the accumulator or already cleared are skipped.
    /// Returns the number of entry lists written.
    pub fn remove(&mut self, mut indices: Vec<u64>) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        indices.sort_unstable();

        let mut update_count = 0;

        for i in 0..indices.len() {
            let index = indices[i];
            if index >= self.next_index {
                continue;
            }

            let peak_height = peak_height(index, self.next_index) as usize;
            let mut entry_list = self.db.read_entries(index)?;

            let leaf_entry = &mut entry_list.0[0];
            match leaf_entry.count {
                0 => continue,
                1 => leaf_entry.clear(),
                // Only leaves can sit at height 0.
                count => panic!("leaf entry at index {index} has count {count}"),
            }

            let next_in_batch = indices.get(i + 1).copied().unwrap_or(self.next_index);
            self.update_parents(
                &mut batch,
                entry_list,
                index,
                next_in_batch,
                peak_height,
                &mut update_count,
            )?;
        }

        self.db.write_batch(batch)?;
        Ok(update_count)
    }

    /// Drop the last `hashes_count` positions and rebuild the peak cache.
    pub fn rewind(&mut self, hashes_count: u64) -> Result<()> {
        assert!(
            hashes_count <= self.next_index,
            "cannot rewind {hashes_count} entries, only {} appended",
            self.next_index
        );

        let mut batch = WriteBatch::default();
        let new_next_index = self.next_index - hashes_count;
        self.db.write_next_index(&mut batch, new_next_index);

        let empty_entry_list = EntryList::cleared(0);
        for index in new_next_index..self.next_index {
            self.db.write_entries(&mut batch, index, &empty_entry_list);
        }

        self.db.write_batch(batch)?;
        self.next_index = new_next_index;

        self.refresh_peak_cache()
    }

    /// Rebuild the peak cache from the store by iterating the set bits of
    /// `next_index`.
    fn refresh_peak_cache(&mut self) -> Result<()> {
        let n_peaks = self.next_index.count_ones() as usize;
        self.peak_cache = vec![Entry::default(); n_peaks];

        let mut peak_next_index = self.next_index;
        for i in 0..n_peaks {
            let peak_index = peak_next_index - 1;
            let peak_entry_list = self.db.read_entries(peak_index)?;
            self.peak_cache[n_peaks - i - 1] = *peak_entry_list
                .0
                .last()
                .expect("entry lists are never zero-sized");

            // Clear the least significant bit.
            peak_next_index &= peak_next_index - 1;
        }

        Ok(())
    }

    /// Leaf positions and hashes for every output of `block`.
    fn append_leaves(&self, block: &Block, view: &dyn CoinView) -> Result<Vec<(u64, LeafHash)>> {
        let txout_count = block.txdata.iter().map(|tx| tx.output.len()).sum();
        let mut leaves = Vec::with_capacity(txout_count);

        for tx in &block.txdata {
            let txid = tx.compute_txid();
            for vout in 0..tx.output.len() as u32 {
                let outpoint = OutPoint { txid, vout };
                let (position, hash) = view
                    .leaf(&outpoint)
                    .ok_or(Error::MissingCoinPosition(outpoint))?;
                leaves.push((position, hash));
            }
        }

        Ok(leaves)
    }

    /// Apply a connected block: insert its created coins, clear its spent
    /// ones, and advance the best block marker.
    pub fn block_connected(
        &mut self,
        block: &Block,
        block_undo: &BlockUndo,
        view: &dyn CoinView,
        block_index: &BlockIndex,
    ) -> Result<()> {
        let best_block = self.best_block()?;
        if best_block != block.header.prev_blockhash {
            return Err(Error::BestBlockMismatch {
                got: block.block_hash(),
                expected: best_block,
            });
        }

        let append_leaves = self.append_leaves(block, view)?;
        let insert_updates = self.insert(append_leaves)?;

        let remove_indices: Vec<u64> = block_undo.spent_positions().collect();
        let remove_updates = self.remove(remove_indices)?;

        self.db.write_best_block(&block.block_hash())?;

        tracing::debug!(
            height = block_index.height,
            leaf_count = self.leaf_count(),
            insert_updates,
            remove_updates,
            "Connected block to UTXO accumulator"
        );

        Ok(())
    }

    /// Undo a disconnected block: restore its spent coins at their original
    /// positions, rewind its appended outputs, and move the best block
    /// marker back.
    pub fn block_disconnected(&mut self, block: &Block, block_undo: &BlockUndo) -> Result<()> {
        let best_block = self.best_block()?;
        let block_hash = block.block_hash();
        if best_block != block_hash {
            return Err(Error::BestBlockMismatch {
                got: block_hash,
                expected: best_block,
            });
        }

        let restore: Vec<(u64, LeafHash)> = block_undo
            .spent_leaves()
            .map(|spent| (spent.position, spent.leaf_hash))
            .collect();
        self.insert(restore)?;

        let txout_count: u64 = block.txdata.iter().map(|tx| tx.output.len() as u64).sum();
        self.rewind(txout_count)?;

        self.db.write_best_block(&block.header.prev_blockhash)?;

        tracing::debug!(
            leaf_count = self.leaf_count(),
            rewound = txout_count,
            "Disconnected block from UTXO accumulator"
        );

        Ok(())
    }

    /// Bring the accumulator up to the active chain tip.
    ///
    /// If the recorded best block left the active chain, its branch is
    /// disconnected block by block first; the remaining gap is then
    /// re-connected in order. The caller holds the chain lock.
    pub fn catch_up(
        &mut self,
        chain: &Chain,
        source: &dyn BlockSource,
        view: &dyn CoinView,
    ) -> Result<()> {
        let best_block = self.best_block()?;

        let on_chain = if best_block == BlockHash::all_zeros() {
            None
        } else {
            let mut walk = source
                .block_index(&best_block)
                .ok_or(Error::BlockNotFound(best_block))?;
            loop {
                if chain.contains(&walk) {
                    break Some(walk);
                }
                let block = source.block(&walk.hash).ok_or(Error::BlockNotFound(walk.hash))?;
                let undo = source.undo(&walk.hash).ok_or(Error::UndoNotFound(walk.hash))?;
                self.block_disconnected(&block, &undo)?;

                match walk.prev.clone() {
                    Some(prev) => walk = prev,
                    None => break None,
                }
            }
        };

        let mut next = match &on_chain {
            Some(index) => chain.next(index),
            None => chain.genesis(),
        };

        while let Some(index) = next {
            tracing::info!(height = index.height, "Catching up UTXO accumulator");

            let block = source.block(&index.hash).ok_or(Error::BlockNotFound(index.hash))?;
            let undo = source.undo(&index.hash).ok_or(Error::UndoNotFound(index.hash))?;
            self.block_connected(&block, &undo, view, &index)?;

            next = chain.next(&index);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::block::{Header, Version};
    use bitcoin::consensus;
    use bitcoin::transaction::Version as TxVersion;
    use bitcoin::{
        Amount, CompactTarget, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode, TxOut,
        Witness,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use talus_primitives::SpentLeaf;

    fn open_temp() -> (tempfile::TempDir, UtxoMmr) {
        let dir = tempfile::tempdir().unwrap();
        let mmr = UtxoMmr::open(dir.path()).unwrap();
        (dir, mmr)
    }

    fn leaf_hash(i: u32) -> LeafHash {
        Sha256::digest(i.to_le_bytes()).into()
    }

    #[test]
    fn test_sanity_insert_remove_rewind() {
        let (_dir, mut mmr) = open_temp();

        let root_hash1 = mmr.root_hash();

        let hashes: Vec<LeafHash> = (0..255).map(leaf_hash).collect();

        // Add the first 127 leaves.
        for (i, hash) in hashes.iter().take(127).enumerate() {
            mmr.insert(vec![(i as u64, *hash)]).unwrap();
        }
        let root_hash2 = mmr.root_hash();

        // Add 128 more leaves.
        for (i, hash) in hashes.iter().enumerate().skip(127) {
            mmr.insert(vec![(i as u64, *hash)]).unwrap();
        }
        let root_hash3 = mmr.root_hash();
        assert_eq!(mmr.leaf_count(), 255);

        // Remove leaves one by one from the front.
        for i in 0..255u64 {
            mmr.remove(vec![i]).unwrap();
        }
        let root_hash4 = mmr.root_hash();
        assert_eq!(mmr.leaf_count(), 0);

        // Re-add the removed leaves in ascending order.
        for (i, hash) in hashes.iter().enumerate() {
            mmr.insert(vec![(i as u64, *hash)]).unwrap();
        }
        let root_hash5 = mmr.root_hash();
        assert_eq!(root_hash3, root_hash5);

        // Remove in reverse order from the back.
        for i in (0..255u64).rev() {
            mmr.remove(vec![i]).unwrap();
        }
        let root_hash6 = mmr.root_hash();
        assert_eq!(root_hash4, root_hash6);

        // Re-add in descending order.
        for (i, hash) in hashes.iter().enumerate().rev() {
            mmr.insert(vec![(i as u64, *hash)]).unwrap();
        }
        let root_hash7 = mmr.root_hash();
        assert_eq!(root_hash5, root_hash7);

        // Rewind to 127 leaves, then to none.
        mmr.rewind(128).unwrap();
        assert_eq!(mmr.root_hash(), root_hash2);

        mmr.rewind(127).unwrap();
        assert_eq!(mmr.root_hash(), root_hash1);
        assert_eq!(mmr.next_index(), 0);
    }

    #[test]
    fn test_batch_permutations_agree() {
        let leaves: Vec<(u64, LeafHash)> = (0..21u64).map(|i| (i, leaf_hash(i as u32))).collect();

        let (_dir1, mut ascending) = open_temp();
        ascending.insert(leaves.clone()).unwrap();

        let (_dir2, mut shuffled) = open_temp();
        // A fixed permutation; insert() sorts internally per batch.
        let mut reordered = leaves.clone();
        reordered.reverse();
        reordered.swap(3, 17);
        shuffled.insert(reordered).unwrap();

        let (_dir3, mut one_by_one_desc) = open_temp();
        for leaf in leaves.iter().rev() {
            one_by_one_desc.insert(vec![*leaf]).unwrap();
        }

        assert_eq!(ascending.root_hash(), shuffled.root_hash());
        assert_eq!(ascending.root_hash(), one_by_one_desc.root_hash());
    }

    #[test]
    fn test_insert_remove_inverse() {
        // Clearing every populated leaf leaves a root that depends only on
        // the accumulator size, not on what the leaves held.
        let (_dir1, mut a) = open_temp();
        let (_dir2, mut b) = open_temp();

        a.insert((0..13u64).map(|i| (i, leaf_hash(i as u32))).collect())
            .unwrap();
        b.insert((0..13u64).map(|i| (i, leaf_hash(1000 + i as u32))).collect())
            .unwrap();
        assert_ne!(a.root_hash(), b.root_hash());

        a.remove((0..13u64).collect()).unwrap();
        b.remove((0..13u64).collect()).unwrap();
        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.leaf_count(), 0);
        assert_eq!(a.next_index(), 13);
    }

    #[test]
    fn test_overwrite_and_noop_insert() {
        let (_dir, mut mmr) = open_temp();
        mmr.insert(vec![(0, leaf_hash(0)), (1, leaf_hash(1))]).unwrap();
        let root = mmr.root_hash();

        // Re-inserting the same leaf is a no-op.
        let updates = mmr.insert(vec![(0, leaf_hash(0))]).unwrap();
        assert_eq!(updates, 0);
        assert_eq!(mmr.root_hash(), root);

        // Overwriting in place changes the root, and writing the old value
        // back restores it.
        mmr.insert(vec![(0, leaf_hash(99))]).unwrap();
        assert_ne!(mmr.root_hash(), root);
        mmr.insert(vec![(0, leaf_hash(0))]).unwrap();
        assert_eq!(mmr.root_hash(), root);

        // Removing positions that are absent or out of range is a no-op.
        let updates = mmr.remove(vec![5, 100]).unwrap();
        assert_eq!(updates, 0);
        assert_eq!(mmr.root_hash(), root);
    }

    #[test]
    fn test_gap_insert_extends_with_cleared_leaves() {
        let (_dir, mut mmr) = open_temp();
        mmr.insert(vec![(5, leaf_hash(5))]).unwrap();
        assert_eq!(mmr.next_index(), 6);
        assert_eq!(mmr.leaf_count(), 1);

        // Filling the gap afterwards matches a dense insert of the same
        // final contents.
        mmr.insert((0..5u64).map(|i| (i, leaf_hash(i as u32))).collect())
            .unwrap();

        let (_dir2, mut dense) = open_temp();
        dense
            .insert((0..6u64).map(|i| (i, leaf_hash(i as u32))).collect())
            .unwrap();
        assert_eq!(mmr.root_hash(), dense.root_hash());
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let root = {
            let mut mmr = UtxoMmr::open(dir.path()).unwrap();
            mmr.insert((0..10u64).map(|i| (i, leaf_hash(i as u32))).collect())
                .unwrap();
            mmr.remove(vec![3, 4]).unwrap();
            mmr.root_hash()
        };

        let mmr = UtxoMmr::open(dir.path()).unwrap();
        assert_eq!(mmr.next_index(), 10);
        assert_eq!(mmr.leaf_count(), 8);
        assert_eq!(mmr.root_hash(), root);
    }

    // --- Block event tests ---

    struct TestCoinView(HashMap<OutPoint, (u64, LeafHash)>);

    impl CoinView for TestCoinView {
        fn leaf(&self, outpoint: &OutPoint) -> Option<(u64, LeafHash)> {
            self.0.get(outpoint).copied()
        }
    }

    fn coinbase_tx(tag: u8, n_outputs: usize) -> Transaction {
        Transaction {
            version: TxVersion::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, tag]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: (0..n_outputs)
                .map(|i| TxOut {
                    value: Amount::from_sat(5_000_000_000 - i as u64),
                    script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros()),
                })
                .collect(),
        }
    }

    fn spend_tx(prevouts: Vec<OutPoint>, n_outputs: usize) -> Transaction {
        Transaction {
            version: TxVersion::TWO,
            lock_time: LockTime::ZERO,
            input: prevouts
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: (0..n_outputs)
                .map(|i| TxOut {
                    value: Amount::from_sat(1_000_000 + i as u64),
                    script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros()),
                })
                .collect(),
        }
    }

    fn block_with(prev_blockhash: BlockHash, txdata: Vec<Transaction>, nonce: u32) -> Block {
        Block {
            header: Header {
                version: Version::TWO,
                prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce,
            },
            txdata,
        }
    }

    /// Tracks coin positions the way a node's coin database would: every
    /// output of a connected block gets the next position.
    struct PositionAssigner {
        view: TestCoinView,
        next_position: u64,
    }

    impl PositionAssigner {
        fn new() -> Self {
            Self {
                view: TestCoinView(HashMap::new()),
                next_position: 0,
            }
        }

        /// Assign positions for a block's outputs and collect the undo data
        /// for its spends.
        fn process_block(&mut self, block: &Block) -> BlockUndo {
            let mut undo = BlockUndo::new();
            for tx in &block.txdata {
                if !tx.is_coinbase() {
                    let spent = tx
                        .input
                        .iter()
                        .map(|input| {
                            let (position, leaf_hash) = self.view.0[&input.previous_output];
                            SpentLeaf {
                                position,
                                leaf_hash,
                            }
                        })
                        .collect();
                    undo.push_tx(spent);
                }

                let txid = tx.compute_txid();
                for vout in 0..tx.output.len() as u32 {
                    let outpoint = OutPoint { txid, vout };
                    let hash: LeafHash =
                        Sha256::digest(consensus::serialize(&outpoint)).into();
                    self.view.0.insert(outpoint, (self.next_position, hash));
                    self.next_position += 1;
                }
            }
            undo
        }
    }

    #[test]
    fn test_block_connect_disconnect_roundtrip() {
        let (_dir, mut mmr) = open_temp();
        let mut assigner = PositionAssigner::new();

        let b0 = block_with(BlockHash::all_zeros(), vec![coinbase_tx(0, 2)], 0);
        let undo0 = assigner.process_block(&b0);
        let index0 = BlockIndex::genesis(b0.block_hash());
        mmr.block_connected(&b0, &undo0, &assigner.view, &index0).unwrap();
        let root0 = mmr.root_hash();
        assert_eq!(mmr.best_block().unwrap(), b0.block_hash());
        assert_eq!(mmr.leaf_count(), 2);

        // Block 1 spends the first coinbase output.
        let spend_outpoint = OutPoint {
            txid: b0.txdata[0].compute_txid(),
            vout: 0,
        };
        let b1 = block_with(
            b0.block_hash(),
            vec![coinbase_tx(1, 1), spend_tx(vec![spend_outpoint], 2)],
            1,
        );
        let undo1 = assigner.process_block(&b1);
        let index1 = BlockIndex::new(b1.block_hash(), index0.clone());
        mmr.block_connected(&b1, &undo1, &assigner.view, &index1).unwrap();
        let root1 = mmr.root_hash();
        // 2 from b0, minus the spent one, plus 3 created by b1.
        assert_eq!(mmr.leaf_count(), 4);

        let b2 = block_with(b1.block_hash(), vec![coinbase_tx(2, 1)], 2);
        let undo2 = assigner.process_block(&b2);
        let index2 = BlockIndex::new(b2.block_hash(), index1.clone());
        mmr.block_connected(&b2, &undo2, &assigner.view, &index2).unwrap();
        assert_ne!(mmr.root_hash(), root1);

        // Disconnect back down to block 0.
        mmr.block_disconnected(&b2, &undo2).unwrap();
        assert_eq!(mmr.root_hash(), root1);
        assert_eq!(mmr.best_block().unwrap(), b1.block_hash());

        mmr.block_disconnected(&b1, &undo1).unwrap();
        assert_eq!(mmr.root_hash(), root0);
        assert_eq!(mmr.best_block().unwrap(), b0.block_hash());

        // Reconnecting out of order is rejected.
        let err = mmr
            .block_connected(&b2, &undo2, &assigner.view, &index2)
            .unwrap_err();
        assert!(matches!(err, Error::BestBlockMismatch { .. }));
    }

    struct TestBlockSource {
        blocks: HashMap<BlockHash, (Block, BlockUndo, Arc<BlockIndex>)>,
    }

    impl BlockSource for TestBlockSource {
        fn block(&self, hash: &BlockHash) -> Option<Block> {
            self.blocks.get(hash).map(|(block, _, _)| block.clone())
        }

        fn undo(&self, hash: &BlockHash) -> Option<BlockUndo> {
            self.blocks.get(hash).map(|(_, undo, _)| undo.clone())
        }

        fn block_index(&self, hash: &BlockHash) -> Option<Arc<BlockIndex>> {
            self.blocks.get(hash).map(|(_, _, index)| index.clone())
        }
    }

    #[test]
    fn test_catch_up_and_reorg() {
        let mut assigner = PositionAssigner::new();
        let mut source = TestBlockSource {
            blocks: HashMap::new(),
        };

        // Main chain: three blocks.
        let b0 = block_with(BlockHash::all_zeros(), vec![coinbase_tx(0, 2)], 0);
        let undo0 = assigner.process_block(&b0);
        let index0 = BlockIndex::genesis(b0.block_hash());
        source
            .blocks
            .insert(b0.block_hash(), (b0.clone(), undo0, index0.clone()));

        let b1 = block_with(b0.block_hash(), vec![coinbase_tx(1, 1)], 1);
        let undo1 = assigner.process_block(&b1);
        let index1 = BlockIndex::new(b1.block_hash(), index0.clone());
        source
            .blocks
            .insert(b1.block_hash(), (b1.clone(), undo1, index1.clone()));

        let b2 = block_with(b1.block_hash(), vec![coinbase_tx(2, 1)], 2);
        let undo2 = assigner.process_block(&b2);
        let index2 = BlockIndex::new(b2.block_hash(), index1.clone());
        source
            .blocks
            .insert(b2.block_hash(), (b2.clone(), undo2, index2.clone()));

        let mut chain = Chain::new();
        chain.set_tip(Some(index2.clone()));

        // Catch up from scratch reaches the tip.
        let (_dir, mut mmr) = open_temp();
        mmr.catch_up(&chain, &source, &assigner.view).unwrap();
        assert_eq!(mmr.best_block().unwrap(), b2.block_hash());
        let root_main = mmr.root_hash();

        // A competing branch replaces b2.
        let c2 = block_with(b1.block_hash(), vec![coinbase_tx(0x22, 2)], 0x22);
        let undo_c2 = assigner.process_block(&c2);
        let index_c2 = BlockIndex::new(c2.block_hash(), index1.clone());
        source
            .blocks
            .insert(c2.block_hash(), (c2.clone(), undo_c2, index_c2.clone()));

        let c3 = block_with(c2.block_hash(), vec![coinbase_tx(0x23, 1)], 0x23);
        let undo_c3 = assigner.process_block(&c3);
        let index_c3 = BlockIndex::new(c3.block_hash(), index_c2.clone());
        source
            .blocks
            .insert(c3.block_hash(), (c3.clone(), undo_c3, index_c3.clone()));

        chain.set_tip(Some(index_c3.clone()));
        mmr.catch_up(&chain, &source, &assigner.view).unwrap();
        assert_eq!(mmr.best_block().unwrap(), c3.block_hash());
        assert_ne!(mmr.root_hash(), root_main);

        // A fresh accumulator over the final chain agrees.
        let (_dir2, mut fresh) = open_temp();
        fresh.catch_up(&chain, &source, &assigner.view).unwrap();
        assert_eq!(fresh.root_hash(), mmr.root_hash());
    }
}
