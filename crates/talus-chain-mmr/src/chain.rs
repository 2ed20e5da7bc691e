//! Active chain container with an MMR peak cache.

use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use talus_primitives::math::log2_floor_u32;
use talus_primitives::BlockIndex;

/// An internal MMR node: a raw SHA-256 digest.
pub type NodeHash = [u8; 32];

fn hash_pair(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// The active chain: block-index entries by height plus the MMR entry cache.
///
/// `mmr_entries[h]` holds the intermediate subtree roots computed while
/// appending the block at height `h`, lowest height first; the entry at
/// position `k` is the height-`k+1` subtree root whose rightmost leaf is
/// `h`. Entries above the fork point are recomputed on [`set_tip`].
///
/// [`set_tip`]: Self::set_tip
#[derive(Default)]
pub struct Chain {
    chain: Vec<Arc<BlockIndex>>,
    mmr_entries: Vec<Vec<NodeHash>>,
}

impl Chain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// The tip entry, or `None` for an empty chain.
    pub fn tip(&self) -> Option<Arc<BlockIndex>> {
        self.chain.last().cloned()
    }

    /// Height of the tip, or `None` for an empty chain.
    pub fn height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    /// The entry at `height` on the active chain.
    pub fn get(&self, height: u32) -> Option<Arc<BlockIndex>> {
        self.chain.get(height as usize).cloned()
    }

    /// Whether `index` is on the active chain.
    pub fn contains(&self, index: &BlockIndex) -> bool {
        self.get(index.height)
            .is_some_and(|entry| entry.hash == index.hash)
    }

    /// The successor of `index` on the active chain, if `index` is on it.
    pub fn next(&self, index: &BlockIndex) -> Option<Arc<BlockIndex>> {
        if self.contains(index) {
            self.get(index.height + 1)
        } else {
            None
        }
    }

    /// The genesis entry.
    pub fn genesis(&self) -> Option<Arc<BlockIndex>> {
        self.chain.first().cloned()
    }

    /// Last common entry between `index` and the active chain.
    pub fn find_fork(&self, index: &Arc<BlockIndex>) -> Option<Arc<BlockIndex>> {
        let mut walk = match self.height() {
            Some(height) if index.height > height => index.ancestor_at(height)?,
            Some(_) => index.clone(),
            None => return None,
        };
        while !self.contains(&walk) {
            walk = walk.prev.clone()?;
        }
        Some(walk)
    }

    /// Point the chain at a new tip, recomputing MMR entries above the fork.
    pub fn set_tip(&mut self, tip: Option<Arc<BlockIndex>>) {
        let Some(tip) = tip else {
            self.chain.clear();
            self.mmr_entries.clear();
            return;
        };

        // Collect the branch back to the first entry we already have.
        let mut branch = Vec::new();
        let mut walk = Some(tip.clone());
        while let Some(entry) = walk {
            if self
                .chain
                .get(entry.height as usize)
                .is_some_and(|e| e.hash == entry.hash)
            {
                break;
            }
            walk = entry.prev.clone();
            branch.push(entry);
        }

        let keep = branch
            .last()
            .map(|lowest| lowest.height as usize)
            .unwrap_or(tip.height as usize + 1);
        self.chain.truncate(keep);
        self.mmr_entries.truncate(keep);

        for entry in branch.into_iter().rev() {
            debug_assert_eq!(entry.height as usize, self.chain.len());
            self.chain.push(entry);

            let height = (self.chain.len() - 1) as u32;
            let mut intermediates = Vec::new();
            self.compute_peak(height, height, Some(&mut intermediates), None)
                .expect("height <= height");
            self.mmr_entries.push(intermediates);
        }
    }

    /// MMR entry at storage index `idx` and height: the root of the
    /// height-`height` subtree whose last leaf is `idx`.
    fn mmr_entry(&self, idx: u32, height: u32) -> NodeHash {
        debug_assert!(
            idx.trailing_ones() >= height,
            "index {idx} does not close a height-{height} subtree"
        );
        if height == 0 {
            self.chain[idx as usize].hash.to_byte_array()
        } else {
            self.mmr_entries[idx as usize][height as usize - 1]
        }
    }

    /// Walk from the leaf at `header_height` up to its peak in the MMR with
    /// root height `root_height`, optionally collecting the intermediate
    /// entries and the sibling branch.
    fn compute_peak(
        &self,
        header_height: u32,
        root_height: u32,
        mut intermediate_entries: Option<&mut Vec<NodeHash>>,
        mut proof_branch: Option<&mut Vec<NodeHash>>,
    ) -> Result<NodeHash> {
        if header_height > root_height {
            return Err(Error::HeaderAboveRoot {
                header_height,
                root_height,
            });
        }

        let peak_height = log2_floor_u32(header_height ^ (root_height + 1));

        let mut peak = self.chain[header_height as usize].hash.to_byte_array();
        let mut idx = header_height;

        for bit in 0..peak_height {
            let mask = 1u32 << bit;
            let sibling = self.mmr_entry(idx ^ mask, bit);

            peak = if idx & mask != 0 {
                hash_pair(&sibling, &peak)
            } else {
                hash_pair(&peak, &sibling)
            };

            if let Some(entries) = intermediate_entries.as_deref_mut() {
                entries.push(peak);
            }
            if let Some(branch) = proof_branch.as_deref_mut() {
                branch.push(sibling);
            }

            idx |= mask;
        }

        Ok(peak)
    }

    /// Peaks of the MMR with the given root height, ascending bit order.
    pub fn peaks(&self, root_height: u32) -> Vec<NodeHash> {
        let mut idx = root_height + 1;
        let mut peaks = Vec::with_capacity(idx.count_ones() as usize);

        let mut bit = 0;
        while idx != 0 {
            let mask = 1u32 << bit;
            if idx & mask != 0 {
                peaks.push(self.mmr_entry(idx - 1, bit));
                idx ^= mask;
            }
            bit += 1;
        }

        peaks
    }

    /// Commitment over the chain prefix `0..=root_height`: the SHA-256 fold
    /// of all peaks, starting from 32 zero bytes.
    pub fn commitment(&self, root_height: u32) -> Result<NodeHash> {
        if self.height().is_none_or(|height| root_height > height) {
            return Err(Error::RootAboveTip { root_height });
        }

        let mut commitment = [0u8; 32];
        for peak in self.peaks(root_height) {
            commitment = hash_pair(&commitment, &peak);
        }
        Ok(commitment)
    }

    /// Membership proof for the header at `header_height` against
    /// `commitment(root_height)`.
    ///
    /// Layout: the sibling branch into the containing peak (low bit first),
    /// then the single fold-commitment of all lower peaks, then the higher
    /// peaks in ascending order.
    pub fn proof(&self, header_height: u32, root_height: u32) -> Result<Vec<NodeHash>> {
        if header_height > root_height {
            return Err(Error::HeaderAboveRoot {
                header_height,
                root_height,
            });
        }
        if self.height().is_none_or(|height| root_height > height) {
            return Err(Error::RootAboveTip { root_height });
        }

        let idx = root_height + 1;
        let peak_height = log2_floor_u32(header_height ^ idx);

        let mask = (1u64 << peak_height) - 1;
        let n_lower_peaks = (u64::from(idx) & mask).count_ones() as usize;
        let n_higher_peaks = (u64::from(idx) & !mask).count_ones() as usize - 1;

        let mut proof = Vec::with_capacity(peak_height as usize + 1 + n_higher_peaks);
        self.compute_peak(header_height, root_height, None, Some(&mut proof))?;

        let peaks = self.peaks(root_height);

        let mut commitment = [0u8; 32];
        for peak in &peaks[..n_lower_peaks] {
            commitment = hash_pair(&commitment, peak);
        }
        proof.push(commitment);

        proof.extend_from_slice(&peaks[n_lower_peaks + 1..]);

        Ok(proof)
    }
}

/// Verify a proof produced by [`Chain::proof`].
///
/// Recomputes the containing peak from `block_hash` and the branch, folds in
/// the lower-peaks commitment, then chains the higher peaks; the result must
/// equal `root_commitment`. Any altered byte in the inputs makes this
/// return `false`.
pub fn verify_proof(
    header_height: u32,
    root_height: u32,
    block_hash: BlockHash,
    root_commitment: &NodeHash,
    proof: &[NodeHash],
) -> Result<bool> {
    if header_height > root_height {
        return Err(Error::HeaderAboveRoot {
            header_height,
            root_height,
        });
    }

    let peak_height = log2_floor_u32(header_height ^ (root_height + 1)) as usize;
    if proof.len() <= peak_height {
        return Ok(false);
    }

    let mut commitment = block_hash.to_byte_array();
    for (bit, sibling) in proof[..peak_height].iter().enumerate() {
        commitment = if header_height & (1 << bit) != 0 {
            hash_pair(sibling, &commitment)
        } else {
            hash_pair(&commitment, sibling)
        };
    }

    commitment = hash_pair(&proof[peak_height], &commitment);

    for peak in &proof[peak_height + 1..] {
        commitment = hash_pair(&commitment, peak);
    }

    Ok(&commitment == root_commitment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    /// Chain of `len` entries with hashes 0, 1, 2, ...
    fn build_chain(len: u8) -> Chain {
        let mut tip = BlockIndex::genesis(block_hash(0));
        for i in 1..len {
            tip = BlockIndex::new(block_hash(i), tip);
        }
        let mut chain = Chain::new();
        chain.set_tip(Some(tip));
        chain
    }

    #[test]
    fn test_toy_chain_peaks() {
        let chain = build_chain(4);
        let h: Vec<NodeHash> = (0..4u8).map(|i| [i; 32]).collect();

        // Four leaves form a single complete tree.
        let left = hash_pair(&h[0], &h[1]);
        let right = hash_pair(&h[2], &h[3]);
        assert_eq!(chain.peaks(3), vec![hash_pair(&left, &right)]);

        // Three leaves: one height-1 peak plus a bare leaf.
        assert_eq!(chain.peaks(2), vec![left, h[2]]);

        // A single leaf is its own peak.
        assert_eq!(chain.peaks(0), vec![h[0]]);
    }

    #[test]
    fn test_toy_chain_proof_layout() {
        let chain = build_chain(4);
        let h: Vec<NodeHash> = (0..4u8).map(|i| [i; 32]).collect();

        // Proof for leaf 1 against the 4-leaf root: sibling leaf, sibling
        // subtree, then the (empty, all-zero) lower-peak fold. No higher
        // peaks exist.
        let proof = chain.proof(1, 3).unwrap();
        assert_eq!(proof, vec![h[0], hash_pair(&h[2], &h[3]), [0u8; 32]]);

        let commitment = chain.commitment(3).unwrap();
        assert!(verify_proof(1, 3, block_hash(1), &commitment, &proof).unwrap());
    }

    #[test]
    fn test_proof_soundness_all_pairs() {
        let chain = build_chain(33);
        for root_height in 0..=32u32 {
            let commitment = chain.commitment(root_height).unwrap();
            for header_height in 0..=root_height {
                let proof = chain.proof(header_height, root_height).unwrap();
                assert!(
                    verify_proof(
                        header_height,
                        root_height,
                        block_hash(header_height as u8),
                        &commitment,
                        &proof,
                    )
                    .unwrap(),
                    "h={header_height} r={root_height}"
                );
            }
        }
    }

    #[test]
    fn test_proof_completeness_under_corruption() {
        let chain = build_chain(20);
        let (header_height, root_height) = (5, 17);
        let commitment = chain.commitment(root_height).unwrap();
        let proof = chain.proof(header_height, root_height).unwrap();

        // Wrong block hash.
        assert!(!verify_proof(
            header_height,
            root_height,
            block_hash(0xEE),
            &commitment,
            &proof
        )
        .unwrap());

        // Corrupted commitment.
        let mut bad_commitment = commitment;
        bad_commitment[13] ^= 0x01;
        assert!(!verify_proof(
            header_height,
            root_height,
            block_hash(header_height as u8),
            &bad_commitment,
            &proof
        )
        .unwrap());

        // Every proof entry matters.
        for i in 0..proof.len() {
            let mut bad_proof = proof.clone();
            bad_proof[i][0] ^= 0x80;
            assert!(
                !verify_proof(
                    header_height,
                    root_height,
                    block_hash(header_height as u8),
                    &commitment,
                    &bad_proof
                )
                .unwrap(),
                "flip in entry {i} went undetected"
            );
        }

        // A truncated branch cannot verify.
        assert!(!verify_proof(
            header_height,
            root_height,
            block_hash(header_height as u8),
            &commitment,
            &proof[..2]
        )
        .unwrap());
    }

    #[test]
    fn test_argument_checks() {
        let chain = build_chain(4);
        assert!(matches!(
            chain.proof(3, 1),
            Err(Error::HeaderAboveRoot { .. })
        ));
        assert!(matches!(
            chain.commitment(10),
            Err(Error::RootAboveTip { .. })
        ));
        assert!(matches!(
            verify_proof(3, 1, block_hash(3), &[0; 32], &[]),
            Err(Error::HeaderAboveRoot { .. })
        ));
    }

    #[test]
    fn test_set_tip_reorg_recomputes_entries() {
        let genesis = BlockIndex::genesis(block_hash(0));
        let a1 = BlockIndex::new(block_hash(1), genesis.clone());
        let a2 = BlockIndex::new(block_hash(2), a1.clone());
        let a3 = BlockIndex::new(block_hash(3), a2.clone());

        let mut chain = Chain::new();
        chain.set_tip(Some(a3.clone()));
        assert_eq!(chain.height(), Some(3));

        // Branch off a1 and switch over.
        let b2 = BlockIndex::new(block_hash(0x12), a1.clone());
        let b3 = BlockIndex::new(block_hash(0x13), b2.clone());
        let b4 = BlockIndex::new(block_hash(0x14), b3.clone());
        chain.set_tip(Some(b4.clone()));

        assert_eq!(chain.height(), Some(4));
        assert!(chain.contains(&b3));
        assert!(!chain.contains(&a2));
        assert_eq!(chain.find_fork(&a3).unwrap().hash, a1.hash);

        // The reorged chain commits identically to a freshly built one.
        let mut fresh = Chain::new();
        fresh.set_tip(Some(b4));
        for root_height in 0..=4 {
            assert_eq!(
                chain.commitment(root_height).unwrap(),
                fresh.commitment(root_height).unwrap()
            );
        }

        let commitment = chain.commitment(4).unwrap();
        let proof = chain.proof(2, 4).unwrap();
        assert!(verify_proof(2, 4, block_hash(0x12), &commitment, &proof).unwrap());
    }

    #[test]
    fn test_chain_navigation() {
        let chain = build_chain(5);
        let tip = chain.tip().unwrap();
        assert_eq!(tip.height, 4);

        let b2 = chain.get(2).unwrap();
        assert_eq!(chain.next(&b2).unwrap().hash, block_hash(3));
        assert!(chain.next(&tip).is_none());

        let detached = BlockIndex::new(block_hash(0x77), chain.get(1).unwrap());
        assert!(chain.next(&detached).is_none());
        assert_eq!(chain.find_fork(&detached).unwrap().hash, block_hash(1));
    }
}
