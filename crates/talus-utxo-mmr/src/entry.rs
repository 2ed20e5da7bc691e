//! Tree entries and the compressed per-index entry list encoding.

use crate::{entry_list_size, Error, Result};
use talus_primitives::LeafHash;

/// A single tree node: how many populated leaves it covers and its hash.
///
/// Leaves have count 1 when populated and count 0 when cleared; an internal
/// node's count is the sum of its children's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    /// Number of populated leaves under this node.
    pub count: u32,
    /// Node hash; all zero when cleared.
    pub hash: LeafHash,
}

impl Entry {
    /// A populated leaf.
    pub fn leaf(hash: LeafHash) -> Self {
        Self { count: 1, hash }
    }

    /// Reset to the cleared state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Serialize as `count (le32) || hash`, the form committed to by parent
    /// hashes.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.hash);
    }

    fn read_from(bytes: &[u8]) -> Option<(Self, &[u8])> {
        let (count, rest) = bytes.split_at_checked(4)?;
        let (hash, rest) = rest.split_at_checked(32)?;
        Some((
            Self {
                count: u32::from_le_bytes(count.try_into().expect("4 bytes")),
                hash: hash.try_into().expect("32 bytes"),
            },
            rest,
        ))
    }
}

/// The vertical slice of the tree at one insertion index: the entry at each
/// height whose subtree's last leaf is that index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryList(pub Vec<Entry>);

impl EntryList {
    /// A list of `size` cleared entries.
    pub fn cleared(size: usize) -> Self {
        Self(vec![Entry::default(); size])
    }

    /// Whether every entry is cleared. Empty lists are erased from storage
    /// rather than written.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|entry| entry.count == 0)
    }

    /// Compressed encoding.
    ///
    /// Low heights are frequently all-cleared (`terminal_height` of them),
    /// and the next run of count-1 entries all carry the same hash because
    /// exactly one leaf has reached that subtree; both compress to almost
    /// nothing. Layout:
    ///
    /// ```text
    /// terminal_h || middle_h || max_h
    ///   [ terminal_hash ]            -- if terminal_h < middle_h
    ///   entry[middle_h..max_h]       -- full (count, hash) records
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let max_height = self.0.len();

        let mut height = 0;
        while height < max_height && self.0[height].count == 0 {
            height += 1;
        }
        let terminal_height = height;

        while height < max_height && self.0[height].count == 1 {
            height += 1;
        }
        let middle_height = height;

        let mut out = Vec::with_capacity(3 + 32 + 36 * (max_height - middle_height));
        out.push(terminal_height as u8);
        out.push(middle_height as u8);
        out.push(max_height as u8);

        if terminal_height < middle_height {
            out.extend_from_slice(&self.0[terminal_height].hash);
        }

        for entry in &self.0[middle_height..] {
            entry.write_to(&mut out);
        }

        out
    }

    /// Decode the list stored at `index`, checking that its size matches
    /// the index's slice size.
    pub fn decode(bytes: &[u8], index: u64) -> Result<Self> {
        let malformed = || Error::MalformedEntryList(index);

        let header: [u8; 3] = bytes
            .get(..3)
            .ok_or_else(malformed)?
            .try_into()
            .expect("3 bytes");
        let (terminal_height, middle_height, max_height) = (
            header[0] as usize,
            header[1] as usize,
            header[2] as usize,
        );
        if terminal_height > middle_height || middle_height > max_height {
            return Err(malformed());
        }
        if max_height != entry_list_size(index) {
            return Err(Error::EntryListSizeMismatch {
                index,
                expected: entry_list_size(index),
                actual: max_height,
            });
        }

        let mut entries = vec![Entry::default(); max_height];
        let mut rest = &bytes[3..];

        if terminal_height < middle_height {
            let (hash, after) = rest.split_at_checked(32).ok_or_else(malformed)?;
            let hash: LeafHash = hash.try_into().expect("32 bytes");
            for entry in &mut entries[terminal_height..middle_height] {
                *entry = Entry::leaf(hash);
            }
            rest = after;
        }

        for entry in &mut entries[middle_height..] {
            let (decoded, after) = Entry::read_from(rest).ok_or_else(malformed)?;
            *entry = decoded;
            rest = after;
        }

        if !rest.is_empty() {
            return Err(malformed());
        }

        Ok(Self(entries))
    }
}
