//! The peer wire protocol: a handshake followed by length-prefixed
//! messages, each with its own codec.
pub mod handshake;
pub mod messages;

// re-exports
pub use handshake::*;
pub use messages::*;

use bytes::{BufMut, BytesMut};

use crate::error::Error;

/// Length of the blocks we request, 16 KiB. The last block of a piece may
/// be shorter.
pub const BLOCK_LEN: u32 = 16384;

/// The protocol string of the handshake.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// Bytes of a piece, as carried by a `Piece` message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    pub index: usize,
    /// Offset inside the piece.
    pub begin: u32,
    pub block: Vec<u8>,
}

impl Block {
    /// Write `<index><begin><bytes>`, the payload of a `Piece` message.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let piece_index: u32 = self.index.try_into().map_err(|_| {
            Error::MalformedMessage(format!(
                "piece index {} does not fit in 4 bytes",
                self.index
            ))
        })?;
        buf.put_u32(piece_index);
        buf.put_u32(self.begin);
        buf.extend_from_slice(&self.block);
        Ok(())
    }
}

/// Address of a block, the payload of `Request` and `Cancel`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index as u32,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_info_of_block() {
        let block = Block { index: 3, begin: BLOCK_LEN, block: vec![1; 7] };
        let info = BlockInfo::from(&block);
        assert_eq!(info, BlockInfo::new(3, BLOCK_LEN, 7));
    }

    #[test]
    fn pstr() {
        assert_eq!(PSTR.len(), 19);
        assert_eq!(&PSTR[..], b"BitTorrent protocol");
    }
}
