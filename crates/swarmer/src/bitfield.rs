//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// A zeroed bitfield with one bit per piece.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Like `get`, but out of range reads are false.
    fn has(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}
