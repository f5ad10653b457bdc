//! A piece of the torrent and the state of each of its blocks.
use std::net::SocketAddr;

use tokio::time::Instant;

use crate::tcp_wire::BlockInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No block was requested or received.
    Missing,
    /// Some blocks are requested or received.
    Pending,
    /// All blocks received, the hash is being checked.
    Complete,
    /// The hash matched and the bytes were handed to the disk.
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Needed,
    /// In flight, owned by exactly one connection.
    Requested { owner: SocketAddr, at: Instant },
    Received,
}

#[derive(Debug)]
pub struct Piece {
    pub index: usize,
    pub len: usize,
    pub hash: [u8; 20],
    pub state: PieceState,
    pub blocks: Vec<BlockInfo>,
    pub block_states: Vec<BlockState>,
    /// How many times this piece failed the hash check.
    pub failures: u32,
    /// allocated when the first block arrives.
    buf: Option<Vec<u8>>,
    received: usize,
}

impl Piece {
    pub fn new(
        index: usize,
        len: usize,
        hash: [u8; 20],
        blocks: Vec<BlockInfo>,
    ) -> Self {
        let block_states = vec![BlockState::Needed; blocks.len()];
        Self {
            index,
            len,
            hash,
            state: PieceState::Missing,
            blocks,
            block_states,
            failures: 0,
            buf: None,
            received: 0,
        }
    }

    /// Position of the block that starts at `begin`.
    pub fn block_position(&self, begin: u32) -> Option<usize> {
        self.blocks.iter().position(|b| b.begin == begin)
    }

    pub fn has_needed(&self) -> bool {
        self.block_states.iter().any(|s| *s == BlockState::Needed)
    }

    pub fn owner_of(&self, pos: usize) -> Option<SocketAddr> {
        match self.block_states.get(pos)? {
            BlockState::Requested { owner, .. } => Some(*owner),
            _ => None,
        }
    }

    /// Copy the bytes of a block into the piece buffer.
    pub fn store(&mut self, pos: usize, bytes: &[u8]) {
        let begin = self.blocks[pos].begin as usize;
        let len = self.len;
        let buf = self.buf.get_or_insert_with(|| vec![0; len]);
        buf[begin..begin + bytes.len()].copy_from_slice(bytes);
        self.block_states[pos] = BlockState::Received;
        self.received += 1;
    }

    pub fn is_full(&self) -> bool {
        self.received == self.blocks.len()
    }

    pub fn hash_matches(&self) -> bool {
        match &self.buf {
            Some(buf) => {
                sha1_smol::Sha1::from(buf).digest().bytes() == self.hash
            }
            None => false,
        }
    }

    pub fn take_buf(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }

    /// Set a requested block back to needed.
    pub fn release(&mut self, pos: usize) {
        self.block_states[pos] = BlockState::Needed;
        self.refresh_state();
    }

    /// Drop every received byte, all blocks become needed again.
    pub fn reset(&mut self) {
        self.block_states.fill(BlockState::Needed);
        self.buf = None;
        self.received = 0;
        self.state = PieceState::Missing;
    }

    /// Missing when nothing is in flight or received, pending otherwise.
    pub fn refresh_state(&mut self) {
        if matches!(self.state, PieceState::Verified | PieceState::Complete) {
            return;
        }
        let touched = self
            .block_states
            .iter()
            .any(|s| *s != BlockState::Needed);
        self.state = if touched {
            PieceState::Pending
        } else {
            PieceState::Missing
        };
    }
}
