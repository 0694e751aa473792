//! The file descriptor: the immutable, per-swarm manifest every peer agrees
//! on before exchanging a single block. Analogous to a `.torrent` file's
//! `info` dictionary, but scoped to exactly one fixed-size file and
//! block-granular rather than piece-granular (this system has no sub-block
//! transfer, so "block" is the only granularity there is).

use sha1::{Digest, Sha1};

use crate::{block_count, block_len_at, BlockIndex, Sha1Hash};

/// The file descriptor, immutable after creation.
///
/// `block_hashes` is the ordered sequence of per-block SHA-1 hashes used for
/// integrity checking on insert. `descriptor_hash()` is what peers exchange
/// at handshake time to agree they're part of the same swarm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    /// A human-readable name for the file (used only for the assembled
    /// output's default name, never interpreted as a path by this crate).
    pub name: String,
    /// The total length of the file, in bytes.
    pub total_len: u64,
    /// The uniform length of every block but the last.
    pub block_len: u32,
    /// The concatenation of all block SHA-1 hashes, 20 bytes per block.
    #[serde(with = "serde_bytes")]
    pub block_hashes: Vec<u8>,
}

impl Descriptor {
    /// Builds a descriptor from a file's raw bytes, splitting it into
    /// `block_len`-sized blocks and hashing each one.
    ///
    /// This is the inverse of [`Self::verify_block`] /
    /// [`crate::BlockLayout::assemble`]: splitting then assembling a file
    /// returns the original bytes unchanged, for any input length and any
    /// positive block length.
    pub fn from_bytes(name: impl Into<String>, data: &[u8], block_len: u32) -> Self {
        assert!(block_len > 0, "block_len must be positive");
        let total_len = data.len() as u64;
        let count = block_count(total_len, block_len);
        let mut block_hashes = Vec::with_capacity(count * 20);
        for index in 0..count {
            let len = block_len_at(total_len, block_len, index) as usize;
            let start = index * block_len as usize;
            let hash = Sha1::digest(&data[start..start + len]);
            block_hashes.extend_from_slice(&hash);
        }
        Self {
            name: name.into(),
            total_len,
            block_len,
            block_hashes,
        }
    }

    /// Parses a descriptor from its bencoded wire representation.
    pub fn from_bytes_bencoded(buf: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Serializes the descriptor to its bencoded wire representation.
    pub fn to_bencode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    /// The number of blocks the file splits into.
    pub fn block_count(&self) -> usize {
        block_count(self.total_len, self.block_len)
    }

    /// The length of the block at `index`, accounting for a possibly
    /// shorter last block.
    pub fn block_len_at(&self, index: BlockIndex) -> u32 {
        block_len_at(self.total_len, self.block_len, index)
    }

    /// Returns the expected hash of the block at `index`, or `None` if the
    /// index is out of range or the descriptor's hash list is truncated.
    pub fn expected_hash(&self, index: BlockIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(20)?;
        let end = start.checked_add(20)?;
        let slice = self.block_hashes.get(start..end)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// A content-addressed identity for this descriptor, exchanged at
    /// handshake time so two peers can confirm they're in the same swarm.
    pub fn descriptor_hash(&self) -> crate::error::Result<Sha1Hash> {
        let encoded = self.to_bencode()?;
        let digest = Sha1::digest(&encoded);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Ok(hash)
    }

    /// Returns `Ok(())` if the descriptor is well-formed enough to build a
    /// swarm from, or a `Configuration` error describing what's wrong.
    ///
    /// Per the design, an invalid descriptor (zero blocks, a hash list
    /// whose length isn't a multiple of 20, or a hash list shorter than the
    /// block count implies) is a fatal startup error, not a runtime one.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.total_len == 0 {
            return Err(crate::error::Error::Configuration(
                "descriptor has zero-length file".into(),
            ));
        }
        if self.block_len == 0 {
            return Err(crate::error::Error::Configuration(
                "descriptor has zero block length".into(),
            ));
        }
        if self.block_hashes.len() % 20 != 0 {
            return Err(crate::error::Error::Configuration(
                "descriptor block hash list is not a multiple of 20 bytes".into(),
            ));
        }
        let expected = self.block_count();
        if self.block_hashes.len() / 20 != expected {
            return Err(crate::error::Error::Configuration(format!(
                "descriptor has {} block hashes but {} blocks",
                self.block_hashes.len() / 20,
                expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_round_trips_through_bencode() {
        let data: Vec<u8> = (0..64u8).collect();
        let descriptor = Descriptor::from_bytes("sample", &data, 16);
        assert_eq!(descriptor.block_count(), 4);

        let encoded = descriptor.to_bencode().unwrap();
        let decoded = Descriptor::from_bytes_bencoded(&encoded).unwrap();
        assert_eq!(descriptor, decoded);
    }

    #[test]
    fn last_block_may_be_shorter() {
        let data: Vec<u8> = (0..50u8).collect();
        let descriptor = Descriptor::from_bytes("sample", &data, 16);
        assert_eq!(descriptor.block_count(), 4);
        assert_eq!(descriptor.block_len_at(0), 16);
        assert_eq!(descriptor.block_len_at(3), 2);
    }

    #[test]
    fn expected_hash_matches_actual_block_hash() {
        let data: Vec<u8> = (0..32u8).collect();
        let descriptor = Descriptor::from_bytes("sample", &data, 16);
        let expected = descriptor.expected_hash(1).unwrap();
        let actual = Sha1::digest(&data[16..32]);
        assert_eq!(&expected[..], &actual[..]);
    }

    #[test]
    fn validate_rejects_zero_length_file() {
        let descriptor = Descriptor {
            name: "x".into(),
            total_len: 0,
            block_len: 16,
            block_hashes: Vec::new(),
        };
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn validate_rejects_mismatched_hash_count() {
        let descriptor = Descriptor {
            name: "x".into(),
            total_len: 64,
            block_len: 16,
            block_hashes: vec![0; 20], // only one hash for four blocks
        };
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_descriptor() {
        let data: Vec<u8> = (0..64u8).collect();
        let descriptor = Descriptor::from_bytes("sample", &data, 16);
        assert!(descriptor.validate().is_ok());
    }
}
