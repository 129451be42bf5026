pub mod conf;
pub mod conn;
mod counter;
pub mod disk;
pub mod encryption;
pub mod error;
pub mod manager;
pub mod peer;
pub mod piece_picker;
mod pool;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod torrent;

use bitvec::prelude::{BitVec, Msb0};

pub use counter::{ConnectionMonitor, Counter};
pub use pool::BufferPool;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// Each torrent gets an ID that is unique within the application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that the peer has pieces 0, 1, and 7). A truthy boolean value of
/// a piece's position in this vector means that the peer has the piece, while
/// a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Blocks are the granularity at which peers request and
/// serve torrent data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), for now.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the absolute byte offset of the block within its torrent,
    /// given the torrent's (non-last) piece length.
    pub fn absolute_offset(&self, piece_len: u32) -> u64 {
        self.piece_index as u64 * piece_len as u64 + self.offset as u64
    }
}
