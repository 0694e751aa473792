// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod choke;
pub mod conf;
pub mod descriptor;
pub mod error;
pub mod peer_directory;
pub mod rate_ledger;
pub mod scheduler;
mod store;
pub mod swarm;
pub mod tracker;
pub mod wire;

mod block_layout;

pub use block_layout::BlockLayout;
pub use store::BlockStoreHandle;

use bitvec::prelude::{BitVec, Msb0};

/// The index of a block within the file, in `[0, block_count)`.
pub type BlockIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long. Used both for a block's content hash
/// and for the file descriptor's identity hash.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents block availability, ours or a remote peer's.
///
/// It is a compact bool vector, most significant bit first within each byte,
/// in big endian byte order, matching the wire encoding: bit `i` is
/// `(byte[i/8] >> (7 - (i%8))) & 1`.
pub type Bitfield = BitVec<Msb0, u8>;

/// Returns the length of the block at `index`, given the uniform block
/// length and the total file length.
///
/// All blocks but the last are exactly `block_len` bytes; the last block may
/// be shorter.
///
/// # Panics
///
/// Panics if `index` is out of range for the given lengths.
pub(crate) fn block_len_at(total_len: u64, block_len: u32, index: BlockIndex) -> u32 {
    let offset = index as u64 * block_len as u64;
    assert!(offset < total_len, "block index {} out of range", index);
    let remaining = total_len - offset;
    std::cmp::min(remaining, block_len as u64) as u32
}

/// Returns the number of blocks a file of `total_len` bytes splits into at
/// `block_len` bytes per block.
pub(crate) fn block_count(total_len: u64, block_len: u32) -> usize {
    if total_len == 0 {
        return 0;
    }
    ((total_len + block_len as u64 - 1) / block_len as u64) as usize
}
