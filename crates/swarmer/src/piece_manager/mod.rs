//! Global download state: which blocks are needed, who is downloading
//! them and which pieces are verified.
//!
//! Every connection of the torrent shares one [`PieceManager`]. All of its
//! methods take the same lock for a short moment and never await, so
//! selecting a block and marking it as requested is atomic.
mod piece;
mod strategy;

pub use piece::{BlockState, PieceState};
pub use strategy::PieceStrategy;

use std::{
    net::SocketAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    disk::DiskMsg,
    metainfo::Info,
    tcp_wire::{Block, BlockInfo, BLOCK_LEN},
    torrent::PeerBrMsg,
};

use piece::Piece;

/// What happened to a block handed to [`PieceManager::on_block_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// The block was not requested by this connection (stale, duplicated,
    /// unknown or with the wrong length). Nothing changed.
    Rejected,
    /// Stored, the piece still has blocks to go.
    Accepted,
    /// The block completed the piece and the hash matched.
    Verified(usize),
    /// The block completed the piece but the hash did not match. The piece
    /// was reset and will be downloaded again.
    Corrupt { index: usize, failures: u32 },
}

/// Snapshot of the download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub verified: usize,
    pub total: usize,
    /// Bytes of verified pieces.
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PieceManagerOptions {
    pub block_len: u32,
    pub strategy: PieceStrategy,
    pub max_hash_failures: u32,
}

impl Default for PieceManagerOptions {
    fn default() -> Self {
        Self {
            block_len: BLOCK_LEN,
            strategy: PieceStrategy::default(),
            max_hash_failures: 5,
        }
    }
}

impl From<&Config> for PieceManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            block_len: BLOCK_LEN,
            strategy: config.piece_strategy,
            max_hash_failures: config.max_hash_failures,
        }
    }
}

#[derive(Debug)]
struct Inner {
    pieces: Vec<Piece>,
    /// Static order of the strategy.
    order: Vec<usize>,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    have: Bitfield,
    verified: usize,
    downloaded: u64,
}

#[derive(Debug)]
pub struct PieceManager {
    inner: Mutex<Inner>,
    strategy: PieceStrategy,
    max_hash_failures: u32,
    total_size: u64,
    disk_tx: mpsc::UnboundedSender<DiskMsg>,
    peer_br_tx: broadcast::Sender<PeerBrMsg>,
}

impl PieceManager {
    pub fn new(
        info: &Info,
        options: PieceManagerOptions,
        disk_tx: mpsc::UnboundedSender<DiskMsg>,
        peer_br_tx: broadcast::Sender<PeerBrMsg>,
    ) -> Self {
        let block_len = options.block_len.max(1);

        let pieces: Vec<Piece> = (0..info.pieces())
            .map(|index| {
                Piece::new(
                    index,
                    info.piece_size(index),
                    info.piece_hash(index).unwrap_or_default(),
                    info.get_block_infos_of_piece(index, block_len),
                )
            })
            .collect();

        let n = pieces.len();

        Self {
            inner: Mutex::new(Inner {
                pieces,
                order: options.strategy.initial_order(n),
                availability: vec![0; n],
                have: Bitfield::from_piece(n),
                verified: 0,
                downloaded: 0,
            }),
            strategy: options.strategy,
            max_hash_failures: options.max_hash_failures,
            total_size: info.get_torrent_size() as u64,
            disk_tx,
            peer_br_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select up to `max` blocks that `peer_have` has and nobody is
    /// downloading, and mark them as requested by `owner`.
    ///
    /// Pieces that are already started come first, so that partial pieces
    /// are finished before new ones are opened. Then the missing pieces, in
    /// the order of the [`PieceStrategy`]. Blocks of a piece are returned
    /// in ascending offset.
    pub fn next_blocks_for(
        &self,
        owner: SocketAddr,
        peer_have: &Bitfield,
        max: usize,
    ) -> Vec<BlockInfo> {
        let mut result = Vec::new();
        if max == 0 {
            return result;
        }

        let now = Instant::now();
        let mut inner = self.lock();

        let eligible = |p: &Piece| peer_have.has(p.index) && p.has_needed();

        let mut pending: Vec<usize> = inner
            .pieces
            .iter()
            .filter(|p| p.state == PieceState::Pending && eligible(p))
            .map(|p| p.index)
            .collect();

        let mut missing: Vec<usize> = inner
            .order
            .iter()
            .copied()
            .filter(|&i| {
                let p = &inner.pieces[i];
                p.state == PieceState::Missing && eligible(p)
            })
            .collect();

        self.strategy.rank(&mut missing, &inner.availability);
        pending.append(&mut missing);

        for index in pending {
            if result.len() >= max {
                break;
            }
            let piece = &mut inner.pieces[index];
            for (pos, state) in piece.block_states.iter_mut().enumerate() {
                if result.len() >= max {
                    break;
                }
                if *state == BlockState::Needed {
                    *state = BlockState::Requested { owner, at: now };
                    result.push(piece.blocks[pos].clone());
                }
            }
            piece.refresh_state();
        }

        if !result.is_empty() {
            debug!("{owner} picked {} blocks", result.len());
        }

        result
    }

    /// Store a block received from `owner`.
    ///
    /// The block is ignored unless it is currently requested by `owner`,
    /// which makes late deliveries after a timeout, a cancel, or a
    /// duplicated `Piece` message harmless.
    pub fn on_block_received(
        &self,
        owner: SocketAddr,
        block: &Block,
    ) -> BlockAcceptance {
        let mut inner = self.lock();

        let Some(piece) = inner.pieces.get_mut(block.index) else {
            return BlockAcceptance::Rejected;
        };
        let Some(pos) = piece.block_position(block.begin) else {
            return BlockAcceptance::Rejected;
        };
        if piece.blocks[pos].len as usize != block.block.len()
            || piece.owner_of(pos) != Some(owner)
        {
            return BlockAcceptance::Rejected;
        }

        piece.store(pos, &block.block);

        if !piece.is_full() {
            return BlockAcceptance::Accepted;
        }

        piece.state = PieceState::Complete;
        let index = piece.index;

        if piece.hash_matches() {
            piece.state = PieceState::Verified;
            let len = piece.len as u64;
            let bytes = piece.take_buf();

            inner.have.set(index, true);
            inner.verified += 1;
            inner.downloaded += len;

            info!(
                "piece {index} verified, {}/{}",
                inner.verified,
                inner.pieces.len()
            );

            if self.disk_tx.send(DiskMsg::WritePiece { index, bytes }).is_err()
            {
                error!("disk is gone, piece {index} will not be written");
            }
            // no receivers just means no peer is connected right now.
            let _ = self.peer_br_tx.send(PeerBrMsg::HavePiece(index));

            BlockAcceptance::Verified(index)
        } else {
            piece.reset();
            piece.failures += 1;
            let failures = piece.failures;

            if failures > self.max_hash_failures {
                error!("piece {index} failed the hash check {failures} times");
            } else {
                warn!("piece {index} failed the hash check, downloading again");
            }

            BlockAcceptance::Corrupt { index, failures }
        }
    }

    /// Give back a block that `owner` requested but did not deliver in
    /// time. Returns false if the block was not requested by `owner`.
    pub fn on_request_timeout(
        &self,
        owner: SocketAddr,
        block: &BlockInfo,
    ) -> bool {
        let mut inner = self.lock();

        let Some(piece) = inner.pieces.get_mut(block.index as usize) else {
            return false;
        };
        let Some(pos) = piece.block_position(block.begin) else {
            return false;
        };
        if piece.owner_of(pos) != Some(owner) {
            return false;
        }

        piece.release(pos);
        true
    }

    /// Give back every block requested by `owner`, returns how many.
    pub fn release_all(&self, owner: SocketAddr) -> usize {
        let mut inner = self.lock();
        let mut count = 0;

        for piece in inner.pieces.iter_mut() {
            let mut touched = false;
            for state in piece.block_states.iter_mut() {
                let mine = matches!(
                    state,
                    BlockState::Requested { owner: o, .. } if *o == owner
                );
                if mine {
                    *state = BlockState::Needed;
                    touched = true;
                    count += 1;
                }
            }
            if touched {
                piece.refresh_state();
            }
        }

        if count > 0 {
            debug!("{owner} released {count} blocks");
        }

        count
    }

    /// Give back every requested block, used on shutdown.
    pub fn release_everything(&self) -> usize {
        let mut inner = self.lock();
        let mut count = 0;

        for piece in inner.pieces.iter_mut() {
            for state in piece.block_states.iter_mut() {
                if matches!(state, BlockState::Requested { .. }) {
                    *state = BlockState::Needed;
                    count += 1;
                }
            }
            piece.refresh_state();
        }

        count
    }

    /// Give back every block requested for longer than `timeout`. Returns
    /// the blocks and their previous owners.
    pub fn expire_requests(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let mut inner = self.lock();
        let mut expired = Vec::new();

        for piece in inner.pieces.iter_mut() {
            let before = expired.len();
            for (pos, state) in piece.block_states.iter_mut().enumerate() {
                if let BlockState::Requested { owner, at } = *state {
                    if now.saturating_duration_since(at) >= timeout {
                        *state = BlockState::Needed;
                        expired.push((owner, piece.blocks[pos].clone()));
                    }
                }
            }
            if expired.len() > before {
                piece.refresh_state();
            }
        }

        expired
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.lock();
        inner.verified == inner.pieces.len()
    }

    /// If the peer has any piece that is not verified yet.
    pub fn is_interesting(&self, peer_have: &Bitfield) -> bool {
        let inner = self.lock();
        peer_have
            .iter_ones()
            .any(|i| i < inner.have.len() && !inner.have[i])
    }

    /// Our pieces, one bit per verified piece.
    pub fn have_bitfield(&self) -> Bitfield {
        self.lock().have.clone()
    }

    pub fn pieces_count(&self) -> usize {
        self.lock().pieces.len()
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.lock().pieces.get(index).map(|p| p.state)
    }

    pub fn progress(&self) -> Progress {
        let inner = self.lock();
        Progress {
            verified: inner.verified,
            total: inner.pieces.len(),
            downloaded: inner.downloaded,
            left: self.total_size.saturating_sub(inner.downloaded),
        }
    }

    /// A peer sent its bitfield, count its pieces.
    pub fn register_peer_pieces(&self, peer_have: &Bitfield) {
        let mut inner = self.lock();
        for i in peer_have.iter_ones() {
            if let Some(a) = inner.availability.get_mut(i) {
                *a += 1;
            }
        }
    }

    /// A peer disconnected, forget its pieces.
    pub fn unregister_peer_pieces(&self, peer_have: &Bitfield) {
        let mut inner = self.lock();
        for i in peer_have.iter_ones() {
            if let Some(a) = inner.availability.get_mut(i) {
                *a = a.saturating_sub(1);
            }
        }
    }

    /// A peer sent a `Have` for a piece it did not have before.
    pub fn peer_has_piece(&self, index: usize) {
        if let Some(a) = self.lock().availability.get_mut(index) {
            *a += 1;
        }
    }
}
