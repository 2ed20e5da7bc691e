//! Per-block filter construction and header chaining.

use crate::gcs::{Element, GcsFilter};
use crate::{Error, Result};
use bitcoin::blockdata::script::Instruction;
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::{self, Decodable, Encodable};
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::{Block, BlockHash};
use std::collections::BTreeSet;

/// Golomb-Rice parameter used by BASIC block filters.
pub const BASIC_FILTER_P: u8 = 20;

bitcoin::hashes::hash_newtype! {
    /// Double-SHA256 hash of an encoded block filter.
    pub struct FilterHash(sha256d::Hash);
    /// Chained filter header committing to all filters up to a block.
    pub struct FilterHeader(sha256d::Hash);
}

/// Supported block filter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FilterType {
    /// Txids, spent outpoints and output script data pushes.
    Basic = 0,
}

impl FilterType {
    /// Stable name, used to label index databases.
    pub fn name(&self) -> &'static str {
        match self {
            FilterType::Basic => "basic",
        }
    }
}

impl TryFrom<u8> for FilterType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FilterType::Basic),
            other => Err(Error::UnknownFilterType(other)),
        }
    }
}

impl std::fmt::Display for FilterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Element set of the BASIC filter for `block`:
///
/// * the txid of every transaction,
/// * the canonically serialized previous outpoint of every non-coinbase
///   input,
/// * every nonempty data push of every output script that parses as a valid
///   opcode sequence.
pub fn basic_filter_elements(block: &Block) -> BTreeSet<Element> {
    let mut elements = BTreeSet::new();

    for tx in &block.txdata {
        let txid = tx.compute_txid();
        elements.insert(txid.to_byte_array().to_vec());

        if !tx.is_coinbase() {
            for input in &tx.input {
                elements.insert(consensus::serialize(&input.previous_output));
            }
        }

        for output in &tx.output {
            let Ok(instructions) = output
                .script_pubkey
                .instructions()
                .collect::<std::result::Result<Vec<_>, _>>()
            else {
                // Unparseable scripts are skipped entirely.
                continue;
            };
            for instruction in instructions {
                if let Instruction::PushBytes(push) = instruction {
                    if !push.is_empty() {
                        elements.insert(push.as_bytes().to_vec());
                    }
                }
            }
        }
    }

    elements
}

/// SipHash keys for a block's filter: the first two 64-bit words of the
/// block hash, little endian.
fn filter_keys(block_hash: &BlockHash) -> (u64, u64) {
    let bytes = block_hash.to_byte_array();
    let k0 = u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes"));
    let k1 = u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes"));
    (k0, k1)
}

/// A complete per-block filter: the filter type, the block it summarizes
/// and the GCS payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFilter {
    filter_type: FilterType,
    block_hash: BlockHash,
    filter: GcsFilter,
}

impl BlockFilter {
    /// Build the filter of the given type for `block`.
    pub fn new(filter_type: FilterType, block: &Block) -> Result<Self> {
        let block_hash = block.block_hash();
        let (k0, k1) = filter_keys(&block_hash);

        let filter = match filter_type {
            FilterType::Basic => {
                GcsFilter::from_elements(k0, k1, BASIC_FILTER_P, &basic_filter_elements(block))?
            }
        };

        Ok(Self {
            filter_type,
            block_hash,
            filter,
        })
    }

    /// Build the BASIC filter for `block`.
    pub fn basic(block: &Block) -> Result<Self> {
        Self::new(FilterType::Basic, block)
    }

    /// Reconstruct a filter from an encoding persisted by the index.
    pub fn from_encoded(
        filter_type: FilterType,
        block_hash: BlockHash,
        encoded: Vec<u8>,
    ) -> Result<Self> {
        let (k0, k1) = filter_keys(&block_hash);
        let filter = match filter_type {
            FilterType::Basic => GcsFilter::from_encoded(k0, k1, BASIC_FILTER_P, encoded)?,
        };
        Ok(Self {
            filter_type,
            block_hash,
            filter,
        })
    }

    /// The filter type.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Hash of the block this filter summarizes.
    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    /// The underlying GCS filter.
    pub fn filter(&self) -> &GcsFilter {
        &self.filter
    }

    /// Double-SHA256 hash of the encoded filter payload.
    pub fn filter_hash(&self) -> FilterHash {
        FilterHash::from_raw_hash(sha256d::Hash::hash(self.filter.encoded()))
    }

    /// Chained header: `SHA256d(filter_hash || prev_header)`.
    pub fn filter_header(&self, prev_header: &FilterHeader) -> FilterHeader {
        let mut engine = sha256d::Hash::engine();
        engine.input(self.filter_hash().as_byte_array());
        engine.input(prev_header.as_byte_array());
        FilterHeader::from_raw_hash(sha256d::Hash::from_engine(engine))
    }

    /// Serialize the persisted record:
    /// `block_hash || filter_type || varbytes(encoded_filter)`.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.filter.encoded();
        let mut out = Vec::with_capacity(32 + 1 + 9 + payload.len());
        self.block_hash
            .consensus_encode(&mut out)
            .expect("writing to a Vec cannot fail");
        out.push(self.filter_type as u8);
        VarInt(payload.len() as u64)
            .consensus_encode(&mut out)
            .expect("writing to a Vec cannot fail");
        out.extend_from_slice(payload);
        out
    }

    /// Decode a persisted record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let block_hash =
            BlockHash::consensus_decode(&mut cursor).map_err(|_| Error::TruncatedRecord)?;
        let (filter_type, rest) = cursor.split_first().ok_or(Error::TruncatedRecord)?;
        let filter_type = FilterType::try_from(*filter_type)?;

        let mut cursor = rest;
        let len = VarInt::consensus_decode(&mut cursor)
            .map_err(|_| Error::TruncatedRecord)?
            .0 as usize;
        if cursor.len() != len {
            return Err(Error::TruncatedRecord);
        }

        Self::from_encoded(filter_type, block_hash, cursor.to_vec())
    }
}
