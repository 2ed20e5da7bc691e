//! Block filter index over the two-keyed store.
//!
//! For each block the index persists the encoded filter, its double-SHA256
//! hash and the chained header. Rows belonging to the active chain are
//! height-keyed; rows reorganized out remain reachable through the hash
//! index, so filter data for any block that becomes active again can always
//! be retrieved.

use crate::store::{RecordKind, TwoKeyedStore};
use crate::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use std::path::Path;
use std::sync::Arc;
use talus_filter::{BlockFilter, FilterHash, FilterHeader, FilterType};
use talus_primitives::BlockIndex;

fn header_from_payload(payload: &[u8], kind: RecordKind, height: u32) -> Result<[u8; 32]> {
    payload
        .try_into()
        .map_err(|_| Error::MalformedRecord { kind, height })
}

/// Index of per-block filters, hashes and chained headers.
pub struct BlockFilterIndex {
    filter_type: FilterType,
    name: String,
    store: TwoKeyedStore,
}

impl BlockFilterIndex {
    /// Open or create the index under `path`; each filter type gets its own
    /// database directory.
    pub fn open(path: &Path, filter_type: FilterType) -> Result<Self> {
        let store = TwoKeyedStore::open(&path.join(filter_type.name()))?;
        Ok(Self {
            filter_type,
            name: format!("{filter_type} block filter index"),
            store,
        })
    }

    /// Human-readable index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The indexed filter type.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Hash of the last block written.
    pub fn best_block(&self) -> Result<BlockHash> {
        self.store.best_block()
    }

    /// Compute and persist the filter rows for a newly connected block.
    ///
    /// The previous header is read back from the store and checked against
    /// the block's parent, so a gap or reorg inconsistency surfaces here
    /// instead of corrupting the header chain.
    pub fn write_block(&self, block: &Block, index: &BlockIndex) -> Result<()> {
        let mut prev_header = FilterHeader::all_zeros();
        if index.height > 0 {
            let height = index.height - 1;
            let (stored_hash, payload) = self
                .store
                .read_height(RecordKind::FilterHeader, height)?
                .ok_or(Error::MissingRecord {
                    kind: RecordKind::FilterHeader,
                    height,
                })?;

            let expected = index.prev_block_hash();
            if stored_hash != expected {
                return Err(Error::PrevBlockMismatch {
                    height,
                    got: stored_hash,
                    expected,
                });
            }
            prev_header = FilterHeader::from_byte_array(header_from_payload(
                &payload,
                RecordKind::FilterHeader,
                height,
            )?);
        }

        let filter = BlockFilter::new(self.filter_type, block)?;
        let header = filter.filter_header(&prev_header);

        // The filter payload is stored so that `block_hash || payload` is
        // exactly the persisted block filter record.
        let record = filter.encode();
        let rows = [
            (RecordKind::Filter, record[32..].to_vec()),
            (
                RecordKind::FilterHash,
                filter.filter_hash().to_byte_array().to_vec(),
            ),
            (
                RecordKind::FilterHeader,
                header.to_byte_array().to_vec(),
            ),
        ];
        self.store.write(index, &rows)
    }

    /// Move retired height rows to the hash index after a reorg.
    pub fn rewind(&self, current_tip: &Arc<BlockIndex>, new_tip: &Arc<BlockIndex>) -> Result<()> {
        self.store.rewind(current_tip, new_tip)
    }

    fn filter_from_payload(&self, block_hash: BlockHash, payload: &[u8]) -> Result<BlockFilter> {
        let mut record = Vec::with_capacity(32 + payload.len());
        record.extend_from_slice(&block_hash.to_byte_array());
        record.extend_from_slice(payload);
        Ok(BlockFilter::decode(&record)?)
    }

    /// Get a single filter by block.
    pub fn lookup_filter(&self, index: &BlockIndex) -> Result<Option<BlockFilter>> {
        let Some(payload) = self.store.lookup_one(RecordKind::Filter, index)? else {
            return Ok(None);
        };
        Ok(Some(self.filter_from_payload(index.hash, &payload)?))
    }

    /// Get a single filter hash by block.
    pub fn lookup_filter_hash(&self, index: &BlockIndex) -> Result<Option<FilterHash>> {
        let Some(payload) = self.store.lookup_one(RecordKind::FilterHash, index)? else {
            return Ok(None);
        };
        let bytes = header_from_payload(&payload, RecordKind::FilterHash, index.height)?;
        Ok(Some(FilterHash::from_byte_array(bytes)))
    }

    /// Get a single filter header by block.
    pub fn lookup_filter_header(&self, index: &BlockIndex) -> Result<Option<FilterHeader>> {
        let Some(payload) = self.store.lookup_one(RecordKind::FilterHeader, index)? else {
            return Ok(None);
        };
        let bytes = header_from_payload(&payload, RecordKind::FilterHeader, index.height)?;
        Ok(Some(FilterHeader::from_byte_array(bytes)))
    }

    /// Get the filters for every height in `start_height..=stop.height` on
    /// the chain ending at `stop_index`.
    pub fn lookup_filter_range(
        &self,
        start_height: u32,
        stop_index: &Arc<BlockIndex>,
    ) -> Result<Vec<BlockFilter>> {
        let payloads = self
            .store
            .lookup_range(RecordKind::Filter, start_height, stop_index)?;

        // Pair each slot with its block hash by walking back from the stop
        // block.
        let mut hashes = vec![BlockHash::all_zeros(); payloads.len()];
        let mut walk = Some(stop_index.clone());
        while let Some(index) = walk {
            if index.height < start_height {
                break;
            }
            hashes[(index.height - start_height) as usize] = index.hash;
            walk = index.prev.clone();
        }

        payloads
            .iter()
            .zip(hashes)
            .map(|(payload, block_hash)| self.filter_from_payload(block_hash, payload))
            .collect()
    }

    /// Get the filter hashes for a range of heights.
    pub fn lookup_filter_hash_range(
        &self,
        start_height: u32,
        stop_index: &Arc<BlockIndex>,
    ) -> Result<Vec<FilterHash>> {
        let payloads = self
            .store
            .lookup_range(RecordKind::FilterHash, start_height, stop_index)?;
        payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                let height = start_height + i as u32;
                let bytes = header_from_payload(payload, RecordKind::FilterHash, height)?;
                Ok(FilterHash::from_byte_array(bytes))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::blockdata::block::{Header, Version};
    use bitcoin::hashes::sha256d;
    use bitcoin::transaction::Version as TxVersion;
    use bitcoin::{
        Amount, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
        TxOut, Witness,
    };

    fn coinbase_tx(tag: u32) -> Transaction {
        Transaction {
            version: TxVersion::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(tag.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(5_000_000_000),
                script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros()),
            }],
        }
    }

    fn build_block(prev_blockhash: BlockHash, tag: u32) -> Block {
        Block {
            header: Header {
                version: Version::TWO,
                prev_blockhash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce: tag,
            },
            txdata: vec![coinbase_tx(tag)],
        }
    }

    fn build_chain(len: u32, first_tag: u32) -> Vec<(Block, Arc<BlockIndex>)> {
        let mut out: Vec<(Block, Arc<BlockIndex>)> = Vec::new();
        for i in 0..len {
            let prev_hash = out
                .last()
                .map(|(block, _)| block.block_hash())
                .unwrap_or_else(BlockHash::all_zeros);
            let block = build_block(prev_hash, first_tag + i);
            let index = match out.last() {
                Some((_, prev)) => BlockIndex::new(block.block_hash(), prev.clone()),
                None => BlockIndex::genesis(block.block_hash()),
            };
            out.push((block, index));
        }
        out
    }

    #[test]
    fn test_write_and_lookup_chain() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockFilterIndex::open(dir.path(), FilterType::Basic).unwrap();
        assert_eq!(index.name(), "basic block filter index");

        let chain = build_chain(5, 100);
        for (block, block_index) in &chain {
            index.write_block(block, block_index).unwrap();
        }

        // Headers chain correctly from the zero header.
        let mut prev_header = FilterHeader::all_zeros();
        for (block, block_index) in &chain {
            let filter = index.lookup_filter(block_index).unwrap().unwrap();
            assert_eq!(filter.block_hash(), block.block_hash());

            let filter_hash = index.lookup_filter_hash(block_index).unwrap().unwrap();
            assert_eq!(
                filter_hash.to_byte_array(),
                sha256d::Hash::hash(filter.filter().encoded()).to_byte_array()
            );

            let header = index.lookup_filter_header(block_index).unwrap().unwrap();
            assert_eq!(header, filter.filter_header(&prev_header));
            prev_header = header;
        }

        // Range lookups agree with the singles.
        let tip = chain.last().map(|(_, index)| index.clone()).unwrap();
        let filters = index.lookup_filter_range(0, &tip).unwrap();
        assert_eq!(filters.len(), 5);
        let hashes = index.lookup_filter_hash_range(2, &tip).unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(
            hashes[0],
            index.lookup_filter_hash(&chain[2].1).unwrap().unwrap()
        );
    }

    #[test]
    fn test_write_block_requires_contiguous_headers() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockFilterIndex::open(dir.path(), FilterType::Basic).unwrap();

        let chain = build_chain(3, 200);
        index.write_block(&chain[0].0, &chain[0].1).unwrap();

        // Skipping a height leaves no previous header to chain from.
        assert!(matches!(
            index.write_block(&chain[2].0, &chain[2].1),
            Err(Error::MissingRecord { height: 1, .. })
        ));

        // A previous header belonging to a different block is rejected.
        let impostor = build_chain(2, 900);
        assert!(matches!(
            index.write_block(&impostor[1].0, &impostor[1].1),
            Err(Error::PrevBlockMismatch { height: 0, .. })
        ));
    }

    #[test]
    fn test_reorg_keeps_old_rows_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let index = BlockFilterIndex::open(dir.path(), FilterType::Basic).unwrap();

        let chain_a = build_chain(4, 300);
        for (block, block_index) in &chain_a {
            index.write_block(block, block_index).unwrap();
        }
        let a_tip = chain_a.last().map(|(_, i)| i.clone()).unwrap();
        let a2_header = index.lookup_filter_header(&chain_a[2].1).unwrap().unwrap();

        // Reorg to a branch splitting after height 1.
        let fork = chain_a[1].1.clone();
        index.rewind(&a_tip, &fork).unwrap();
        assert_eq!(index.best_block().unwrap(), fork.hash);

        let mut prev = (chain_a[1].0.block_hash(), fork.clone());
        let mut branch = Vec::new();
        for tag in 0..3u32 {
            let block = build_block(prev.0, 800 + tag);
            let block_index = BlockIndex::new(block.block_hash(), prev.1.clone());
            index.write_block(&block, &block_index).unwrap();
            prev = (block.block_hash(), block_index.clone());
            branch.push((block, block_index));
        }

        // New-branch rows resolve by height; the retired A-chain rows stay
        // reachable through the hash index.
        assert!(index.lookup_filter(&branch[0].1).unwrap().is_some());
        let old = index.lookup_filter_header(&chain_a[2].1).unwrap().unwrap();
        assert_eq!(old, a2_header);
        let old_filter = index.lookup_filter(&chain_a[3].1).unwrap();
        assert!(old_filter.is_some());
    }
}
