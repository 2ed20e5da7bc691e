//! Golomb-Rice coded set construction and membership queries.

use crate::bits::{BitStreamReader, BitStreamWriter};
use crate::{Error, Result};
use bitcoin::consensus::encode::VarInt;
use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::hashes::siphash24;
use std::collections::BTreeSet;

/// A set element: an opaque byte string of arbitrary length.
pub type Element = Vec<u8>;

/// Map `x`, uniform in `[0, 2^64)`, to a uniform value in `[0, n)`.
///
/// Returns the upper 64 bits of the 128-bit product `x * n`, computed with
/// piecewise 32-bit multiplications. This avoids both the modulo bias and
/// the division of `x % n`.
///
/// See: <https://lemire.me/blog/2016/06/27/a-fast-alternative-to-the-modulo-reduction/>
pub fn map_into_range(x: u64, n: u64) -> u64 {
    let x_hi = x >> 32;
    let x_lo = x & 0xFFFF_FFFF;
    let n_hi = n >> 32;
    let n_lo = n & 0xFFFF_FFFF;

    let ac = x_hi * n_hi;
    let ad = x_hi * n_lo;
    let bc = x_lo * n_hi;
    let bd = x_lo * n_lo;

    let mid34 = (bd >> 32) + (bc & 0xFFFF_FFFF) + (ad & 0xFFFF_FFFF);
    ac + (bc >> 32) + (ad >> 32) + (mid34 >> 32)
}

/// Golomb-Rice encode `n` with parameter `k`: the quotient `n >> k` in
/// unary (ones terminated by a zero), then the low `k` bits verbatim.
fn golomb_rice_encode(writer: &mut BitStreamWriter<'_>, k: u8, n: u64) {
    let mut quotient = n >> k;
    while quotient > 0 {
        let nbits = quotient.min(64) as u32;
        writer.write(u64::MAX, nbits);
        quotient -= u64::from(nbits);
    }
    writer.write(0, 1);

    // The remainder is just the bottom k bits of n, no masking needed.
    writer.write(n, u32::from(k));
}

fn golomb_rice_decode(reader: &mut BitStreamReader<'_>, k: u8) -> Result<u64> {
    let mut quotient = 0u64;
    while reader.read(1)? == 1 {
        quotient += 1;
    }
    let remainder = reader.read(u32::from(k))?;
    Ok((quotient << k) + remainder)
}

/// A Golomb-coded set over SipHash-2-4 hashed elements.
///
/// Parametrized by the two 64-bit SipHash keys, the Golomb-Rice parameter
/// `P` and the element count `N`; the hash range is `F = N * 2^P`. The
/// false positive rate of a membership query is roughly `2^-P`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcsFilter {
    siphash_k0: u64,
    siphash_k1: u64,
    p: u8,
    n: u64,
    f: u64,
    encoded: Vec<u8>,
}

impl GcsFilter {
    fn empty(siphash_k0: u64, siphash_k1: u64, p: u8) -> Result<Self> {
        if p > 32 {
            return Err(Error::PTooLarge);
        }
        Ok(Self {
            siphash_k0,
            siphash_k1,
            p,
            n: 0,
            f: 0,
            encoded: Vec::new(),
        })
    }

    /// Build a new filter from a set of elements.
    pub fn from_elements(
        siphash_k0: u64,
        siphash_k1: u64,
        p: u8,
        elements: &BTreeSet<Element>,
    ) -> Result<Self> {
        let mut filter = Self::empty(siphash_k0, siphash_k1, p)?;

        if elements.len() as u64 >= 1 << 32 {
            return Err(Error::NTooLarge);
        }
        filter.n = elements.len() as u64;
        filter.f = filter.n << filter.p;

        VarInt(filter.n)
            .consensus_encode(&mut filter.encoded)
            .expect("writing to a Vec cannot fail");

        if elements.is_empty() {
            return Ok(filter);
        }

        let hashed = filter_hashed_set(&filter, elements.iter());
        let mut writer = BitStreamWriter::new(&mut filter.encoded);
        let mut last_value = 0;
        for value in hashed {
            golomb_rice_encode(&mut writer, p, value - last_value);
            last_value = value;
        }
        writer.flush();

        Ok(filter)
    }

    /// Reconstruct an already-created filter from its encoding.
    ///
    /// The stream is fully decoded once so corruption surfaces here rather
    /// than on a later membership query.
    pub fn from_encoded(
        siphash_k0: u64,
        siphash_k1: u64,
        p: u8,
        encoded: Vec<u8>,
    ) -> Result<Self> {
        let mut filter = Self::empty(siphash_k0, siphash_k1, p)?;

        let mut cursor = encoded.as_slice();
        let n = VarInt::consensus_decode(&mut cursor)
            .map_err(|_| Error::InvalidCompactSize)?
            .0;
        if n >= 1 << 32 {
            return Err(Error::NTooLarge);
        }
        filter.n = n;
        filter.f = n << p;

        let mut reader = BitStreamReader::new(cursor);
        for _ in 0..n {
            golomb_rice_decode(&mut reader, p)?;
        }
        let trailing = cursor.len() - reader.bytes_consumed();
        if trailing > 0 {
            return Err(Error::TrailingBytes(trailing));
        }

        filter.encoded = encoded;
        Ok(filter)
    }

    /// Number of elements in the filter.
    pub fn n(&self) -> u64 {
        self.n
    }

    /// Golomb-Rice parameter.
    pub fn p(&self) -> u8 {
        self.p
    }

    /// The encoded filter payload.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Hash an element to an integer in `[0, F)`.
    fn hash_to_range(&self, element: &[u8]) -> u64 {
        let hash =
            siphash24::Hash::hash_to_u64_with_keys(self.siphash_k0, self.siphash_k1, element);
        map_into_range(hash, self.f)
    }

    /// Check whether `element` may be in the set.
    ///
    /// False positives occur with rate roughly `2^-P`; false negatives
    /// never.
    pub fn matches(&self, element: &[u8]) -> Result<bool> {
        let query = self.hash_to_range(element);

        let mut cursor = self.encoded.as_slice();
        let n = VarInt::consensus_decode(&mut cursor)
            .map_err(|_| Error::InvalidCompactSize)?
            .0;
        debug_assert_eq!(n, self.n);

        let mut reader = BitStreamReader::new(cursor);
        let mut value = 0u64;
        for _ in 0..self.n {
            value += golomb_rice_decode(&mut reader, self.p)?;
            if query == value {
                return Ok(true);
            } else if query < value {
                // The decoded sequence is sorted.
                break;
            }
        }
        Ok(false)
    }

    /// Check whether any of `elements` may be in the set.
    ///
    /// Hashes and sorts the queries once, then merges against the decoded
    /// sequence in a single pass; cheaper than repeated [`matches`] calls.
    ///
    /// [`matches`]: Self::matches
    pub fn matches_any(&self, elements: &BTreeSet<Element>) -> Result<bool> {
        let queries = filter_hashed_set(self, elements.iter());

        let mut cursor = self.encoded.as_slice();
        let n = VarInt::consensus_decode(&mut cursor)
            .map_err(|_| Error::InvalidCompactSize)?
            .0;
        debug_assert_eq!(n, self.n);

        let mut reader = BitStreamReader::new(cursor);
        let mut value = 0u64;
        let mut queries = queries.iter().peekable();
        for _ in 0..self.n {
            value += golomb_rice_decode(&mut reader, self.p)?;

            loop {
                match queries.peek() {
                    None => return Ok(false),
                    Some(&&query) if query == value => return Ok(true),
                    Some(&&query) if query > value => break,
                    Some(_) => {
                        queries.next();
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Hash every element into the filter's range and sort the results.
fn filter_hashed_set<'a>(
    filter: &GcsFilter,
    elements: impl Iterator<Item = &'a Element>,
) -> Vec<u64> {
    let mut hashed: Vec<u64> = elements.map(|e| filter.hash_to_range(e)).collect();
    hashed.sort_unstable();
    hashed
}
