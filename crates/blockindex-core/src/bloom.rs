//! Fixed-size block bloom filter.
//!
//! A [`Bloom`] is the 2048-bit (256-byte) summary stored with every block of a
//! smart-contract chain. Inputs are placed with the Ethereum yellow paper
//! M3:2048 scheme: three bits, each taken from the low 11 bits of one of the
//! first three byte pairs of the input's Keccak-256 hash.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (little-endian within a
//! byte).
//!
//! Equality and hashing are defined over the 256-byte content. A filter that
//! is mutated in place must not be used as a map key while it is stored.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tiny_keccak::{Hasher, Keccak};

use crate::error::IndexerError;

/// Length of the filter in bytes.
pub const BLOOM_LENGTH: usize = 256;

/// Number of addressable bits.
pub const BLOOM_BITS: usize = BLOOM_LENGTH * 8;

/// Number of bits set per added input.
const BITS_PER_INPUT: usize = 3;

/// A 2048-bit set-membership filter.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Bloom([u8; BLOOM_LENGTH]);

impl Bloom {
    /// An empty filter (all bits zero).
    pub const fn new() -> Self {
        Self([0u8; BLOOM_LENGTH])
    }

    /// Build a filter from exactly [`BLOOM_LENGTH`] bytes.
    ///
    /// The bytes are copied; later changes to `data` do not affect the filter.
    pub fn from_slice(data: &[u8]) -> Result<Self, IndexerError> {
        let bytes: [u8; BLOOM_LENGTH] = data.try_into().map_err(|_| {
            IndexerError::InvalidArgument(format!(
                "bloom data must be {BLOOM_LENGTH} bytes long, got {}",
                data.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Bitwise-OR `other` into this filter, producing a filter for both sets.
    pub fn union(&mut self, other: &Bloom) {
        for (byte, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *byte |= *theirs;
        }
    }

    /// Add an arbitrary byte series to the filter.
    pub fn add(&mut self, input: &[u8]) {
        let hash = keccak256(input);
        for pair in hash[..BITS_PER_INPUT * 2].chunks_exact(2) {
            let index = ((usize::from(pair[0]) << 8) | usize::from(pair[1])) & (BLOOM_BITS - 1);
            self.set(index);
        }
    }

    /// Set bit `index` (0..=2047) to one.
    pub fn set_bit(&mut self, index: usize) -> Result<(), IndexerError> {
        if index >= BLOOM_BITS {
            return Err(IndexerError::InvalidArgument(format!(
                "bit index {index} out of range 0..{BLOOM_BITS}"
            )));
        }
        self.set(index);
        Ok(())
    }

    /// Returns `true` if bit `index` is set. Out-of-range indices are never set.
    pub fn is_set(&self, index: usize) -> bool {
        index < BLOOM_BITS && self.0[index / 8] & (1 << (index % 8)) != 0
    }

    /// Returns `true` if `input` is possibly contained in the filter.
    pub fn contains_input(&self, input: &[u8]) -> bool {
        let mut candidate = Bloom::new();
        candidate.add(input);
        self.contains(&candidate)
    }

    /// Returns `true` if every bit set in `candidate` is also set here.
    ///
    /// Equivalent to OR-ing `candidate` into a copy of this filter and
    /// comparing the result with this filter.
    pub fn contains(&self, candidate: &Bloom) -> bool {
        self.0
            .iter()
            .zip(candidate.0.iter())
            .all(|(ours, theirs)| ours | theirs == *ours)
    }

    /// Returns `true` if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; BLOOM_LENGTH] {
        &self.0
    }

    /// Copy out the raw bytes.
    pub fn to_bytes(&self) -> [u8; BLOOM_LENGTH] {
        self.0
    }

    /// Replace the filter with exactly [`BLOOM_LENGTH`] bytes read from `reader`.
    ///
    /// On error the filter is left unchanged.
    pub fn read_from<R: Read>(&mut self, mut reader: R) -> io::Result<()> {
        let mut buf = [0u8; BLOOM_LENGTH];
        reader.read_exact(&mut buf)?;
        self.0 = buf;
        Ok(())
    }

    /// Decode a filter from a byte stream.
    pub fn decode<R: Read>(reader: R) -> io::Result<Self> {
        let mut bloom = Bloom::new();
        bloom.read_from(reader)?;
        Ok(bloom)
    }

    /// Write the [`BLOOM_LENGTH`] raw bytes to `writer`.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.0)
    }

    fn set(&mut self, index: usize) {
        self.0[index / 8] |= 1 << (index % 8);
    }
}

fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(input);
    hasher.finalize(&mut output);
    output
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new()
    }
}

impl From<[u8; BLOOM_LENGTH]> for Bloom {
    fn from(bytes: [u8; BLOOM_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Bloom {
    type Error = IndexerError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(data)
    }
}

impl BitOrAssign<&Bloom> for Bloom {
    fn bitor_assign(&mut self, rhs: &Bloom) {
        self.union(rhs);
    }
}

impl BitOr<&Bloom> for &Bloom {
    type Output = Bloom;

    fn bitor(self, rhs: &Bloom) -> Bloom {
        let mut out = self.clone();
        out.union(rhs);
        out
    }
}

impl fmt::Display for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Bloom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = (0..BLOOM_BITS).filter(|i| self.is_set(*i)).count();
        f.debug_struct("Bloom").field("bits_set", &set).finish()
    }
}

impl FromStr for Bloom {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits)
            .map_err(|e| IndexerError::InvalidArgument(format!("bloom hex: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Bloom {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bloom {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn with_bits(bits: &[usize]) -> Bloom {
        let mut bloom = Bloom::new();
        for bit in bits {
            bloom.set_bit(*bit).unwrap();
        }
        bloom
    }

    #[test]
    fn wrong_length_is_rejected() {
        for len in [0usize, 1, 255, 257, 512] {
            let err = Bloom::from_slice(&vec![0u8; len]).unwrap_err();
            assert!(matches!(err, IndexerError::InvalidArgument(_)), "len {len}");
        }
    }

    #[test]
    fn from_slice_copies_input() {
        let mut data = vec![0u8; BLOOM_LENGTH];
        data[7] = 0x81;
        let bloom = Bloom::from_slice(&data).unwrap();

        data[7] = 0;
        data[8] = 0xff;

        assert_eq!(bloom.as_bytes()[7], 0x81);
        assert_eq!(bloom.as_bytes()[8], 0);

        let mut out = bloom.to_bytes();
        out[0] = 0xff;
        assert_eq!(bloom.as_bytes()[0], 0);
    }

    #[test]
    fn set_bit_is_little_endian_within_byte() {
        let bloom = with_bits(&[0, 9, 2047]);
        let bytes = bloom.as_bytes();
        assert_eq!(bytes[0], 0b0000_0001);
        assert_eq!(bytes[1], 0b0000_0010);
        assert_eq!(bytes[255], 0b1000_0000);
        assert!(bloom.is_set(9));
        assert!(!bloom.is_set(8));
    }

    #[test]
    fn set_bit_out_of_range() {
        let mut bloom = Bloom::new();
        assert!(bloom.set_bit(BLOOM_BITS).is_err());
        assert!(bloom.is_empty());
    }

    #[test]
    fn union_commutative_and_idempotent() {
        let a = with_bits(&[1, 100, 2000]);
        let b = with_bits(&[2, 100, 1500]);

        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab, &a | &b);

        let mut aa = a.clone();
        aa.union(&a);
        assert_eq!(aa, a);
    }

    #[test]
    fn contains_subset_and_rejects_missing_bit() {
        let target = with_bits(&[3, 64, 700, 2047]);

        assert!(target.contains(&with_bits(&[3, 700])));
        assert!(target.contains(&Bloom::new()));
        assert!(target.contains(&target));

        assert!(!target.contains(&with_bits(&[3, 701])));
        assert!(!Bloom::new().contains(&with_bits(&[0])));
    }

    #[test]
    fn add_empty_input_sets_keccak_bits() {
        // keccak256("") = c5d2460186f7...; pairs (c5,d2) (46,01) (86,f7)
        let mut bloom = Bloom::new();
        bloom.add(b"");
        assert_eq!(bloom, with_bits(&[0x5d2, 0x601, 0x6f7]));
    }

    #[test]
    fn added_input_is_contained() {
        let mut bloom = Bloom::new();
        bloom.add(b"0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        bloom.add(b"transfer-topic");

        assert!(bloom.contains_input(b"0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(bloom.contains_input(b"transfer-topic"));

        let set = (0..BLOOM_BITS).filter(|i| bloom.is_set(*i)).count();
        assert!((1..=6).contains(&set));
    }

    #[test]
    fn equal_content_hashes_equal() {
        let a = with_bits(&[10, 20]);
        let b = Bloom::from_slice(a.as_bytes()).unwrap();

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&with_bits(&[10])));
    }

    #[test]
    fn stream_read_write() {
        let bloom = with_bits(&[5, 1024, 2046]);
        let mut buf = Vec::new();
        bloom.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOOM_LENGTH);

        let mut decoded = with_bits(&[0]);
        decoded.read_from(buf.as_slice()).unwrap();
        assert_eq!(decoded, bloom);

        let short = [0u8; 10];
        let mut untouched = bloom.clone();
        assert!(untouched.read_from(&short[..]).is_err());
        assert_eq!(untouched, bloom);
    }

    #[test]
    fn hex_and_serde() {
        let bloom = with_bits(&[0, 2047]);
        let text = bloom.to_string();
        assert!(text.starts_with("0x01"));
        assert!(text.ends_with("80"));
        assert_eq!(text.len(), 2 + BLOOM_LENGTH * 2);
        assert_eq!(text.parse::<Bloom>().unwrap(), bloom);
        assert_eq!(text[2..].parse::<Bloom>().unwrap(), bloom);
        assert!("0x00ff".parse::<Bloom>().is_err());

        let json = serde_json::to_string(&bloom).unwrap();
        assert_eq!(json, format!("\"{text}\""));
        let back: Bloom = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bloom);
    }
}
