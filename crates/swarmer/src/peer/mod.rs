//! A remote peer in the network that we download from.
mod request_manager;
pub mod session;
mod types;

// re-exports
pub use types::*;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{Sink, SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::broadcast::error::RecvError,
    time::{interval, interval_at, sleep_until, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    piece_manager::BlockAcceptance,
    tcp_wire::{
        Block, BlockInfo, Handshake, HandshakeCodec, Message, MessageCodec,
    },
    torrent::{PeerBrMsg, TorrentCtx},
};

use request_manager::RequestManager;
use session::{ConnectionState, Session};

/// Corrupt pieces tolerated from one peer.
pub const MAX_CORRUPT_PIECES: u32 = 3;

/// One connection with a remote peer, from the TCP connect to the close.
///
/// The blocks this connection requested are always given back to the
/// [`crate::piece_manager::PieceManager`] when it closes, whatever the
/// reason.
pub struct Peer {
    pub remote_addr: SocketAddr,
    /// Known after the handshake.
    pub id: Option<PeerId>,
    pub session: Session,
    /// The pieces of the remote peer.
    pub pieces: Bitfield,
    torrent_ctx: Arc<TorrentCtx>,
    outgoing_requests: RequestManager,
    /// If the peer told us about its pieces, with a bitfield or a have.
    knows_pieces: bool,
}

impl Peer {
    pub fn new(remote_addr: SocketAddr, torrent_ctx: Arc<TorrentCtx>) -> Self {
        let pieces =
            Bitfield::from_piece(torrent_ctx.piece_manager.pieces_count());
        Self {
            remote_addr,
            id: None,
            session: Session::default(),
            pieces,
            torrent_ctx,
            outgoing_requests: RequestManager::new(),
            knows_pieces: false,
        }
    }

    /// Connect to the peer and run the connection until it closes.
    #[tracing::instrument(skip_all, name = "peer", fields(remote = %self.remote_addr))]
    pub async fn run(&mut self) -> Result<(), Error> {
        let r = match self.connect().await {
            Ok(socket) => self.handshake_and_run(socket).await,
            Err(e) => Err(e),
        };
        self.close();
        r
    }

    /// Run an already connected socket until it closes.
    #[tracing::instrument(skip_all, name = "peer", fields(remote = %self.remote_addr))]
    pub async fn run_with_socket<S>(&mut self, socket: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let r = self.handshake_and_run(socket).await;
        self.close();
        r
    }

    async fn handshake_and_run<S>(&mut self, socket: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let socket = self.handshake(socket).await?;
        self.run_active(socket).await
    }

    /// Open the TCP connection, bounded by the connect timeout.
    pub async fn connect(&mut self) -> Result<TcpStream, Error> {
        let connect_timeout = self.torrent_ctx.config.connect_timeout();
        debug!("connecting");

        let connect = TcpStream::connect(self.remote_addr);
        let socket = timeout(connect_timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout)??;

        Ok(socket)
    }

    /// Send our handshake, wait for theirs and validate it. On success, the
    /// socket is switched to the [`MessageCodec`], keeping whatever the
    /// peer already pipelined after its handshake.
    pub async fn handshake<S>(
        &mut self,
        socket: S,
    ) -> Result<Framed<S, MessageCodec>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ctx = self.torrent_ctx.clone();
        let mut socket = Framed::new(socket, HandshakeCodec);

        let our_handshake =
            Handshake::new(ctx.info_hash.clone(), ctx.local_peer_id.clone());

        socket.send(our_handshake.clone()).await?;
        self.session.transition(ConnectionState::HandshakeSent);

        let their_handshake =
            match timeout(ctx.config.handshake_timeout(), socket.next()).await {
                Err(_) => return Err(Error::HandshakeTimeout),
                Ok(None) => return Err(Error::PeerClosedSocket),
                Ok(Some(handshake)) => handshake?,
            };

        our_handshake.validate(&their_handshake)?;

        debug!("handshake with {:?}", their_handshake.peer_id);
        self.id = Some(their_handshake.peer_id);
        self.session.transition(ConnectionState::HandshakeVerified);

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;

        Ok(Framed::from_parts(new_parts))
    }

    /// Send our bitfield and run the event loop of the connection. Returns
    /// Ok when the connection ends gracefully: the download finished, or
    /// the peer has nothing left that we want.
    pub async fn run_active<S>(
        &mut self,
        socket: Framed<S, MessageCodec>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ctx = self.torrent_ctx.clone();
        let config = ctx.config.clone();
        let (mut sink, mut stream) = socket.split();

        // subscribe before reading the bitfield, no Have can be missed.
        let mut peer_br_rx = ctx.peer_br_tx.subscribe();

        let bitfield = ctx.piece_manager.have_bitfield();
        debug!("sending bitfield");
        sink.send(Message::Bitfield(bitfield)).await?;

        self.session.transition(ConnectionState::Active);
        self.session.touch();

        let idle_timeout = config.idle_timeout();
        let keep_alive = config.keep_alive().max(Duration::from_millis(1));

        let mut request_timeout_interval = interval(
            (config.request_timeout() / 2)
                .clamp(Duration::from_millis(10), Duration::from_secs(1)),
        );

        // send message to keep the connection alive
        let mut keep_alive_interval =
            interval_at(Instant::now() + keep_alive, keep_alive);

        loop {
            select! {
                msg = stream.next() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::PeerClosedSocket),
                    };
                    self.session.touch();
                    self.handle_msg(msg)?;
                }
                _ = request_timeout_interval.tick() => {
                    // blocks that just timed out are left for the others
                    if self.check_request_timeout(&mut sink).await? > 0 {
                        continue;
                    }
                }
                _ = keep_alive_interval.tick() => {
                    sink.send(Message::KeepAlive).await?;
                    continue;
                }
                _ = sleep_until(self.session.last_activity + idle_timeout) => {
                    warn!("no message for {idle_timeout:?}");
                    return Err(Error::IdleTimeout);
                }
                msg = peer_br_rx.recv() => {
                    match msg {
                        Ok(PeerBrMsg::HavePiece(piece)) => {
                            // send Have to this peer if he doesnt have this piece
                            if !self.pieces.has(piece) {
                                debug!("sending have {piece}");
                                sink.send(Message::Have(piece as u32)).await?;
                            }
                        }
                        Ok(PeerBrMsg::Quit) | Err(RecvError::Closed) => {
                            debug!("quit");
                            return Ok(());
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!("lagged {n} broadcast messages");
                        }
                    }
                }
            }

            if !self.keep_going(&mut sink).await? {
                info!("peer has nothing we want, closing");
                return Ok(());
            }
        }
    }

    /// Handle a message of the peer. Answers, if any, are sent afterwards
    /// by the event loop.
    pub fn handle_msg(&mut self, msg: Message) -> Result<(), Error> {
        let pm = &self.torrent_ctx.piece_manager;
        let pieces_count = pm.pieces_count();

        match msg {
            Message::KeepAlive => {
                debug!("keepalive");
            }
            Message::Bitfield(bitfield) => {
                debug!("bitfield of {} bits", bitfield.len());

                if bitfield.len() != pieces_count.div_ceil(8) * 8 {
                    return Err(Error::ProtocolViolation(format!(
                        "bitfield of {} bytes for {pieces_count} pieces",
                        bitfield.len() / 8
                    )));
                }

                let mut bitfield = bitfield;
                bitfield.truncate(pieces_count);

                if self.knows_pieces {
                    pm.unregister_peer_pieces(&self.pieces);
                }
                pm.register_peer_pieces(&bitfield);

                self.pieces = bitfield;
                self.knows_pieces = true;
            }
            Message::Have(piece) => {
                let piece = piece as usize;
                debug!("have {piece}");

                if piece >= pieces_count {
                    return Err(Error::ProtocolViolation(format!(
                        "have {piece} out of {pieces_count} pieces"
                    )));
                }

                if !self.pieces.has(piece) {
                    self.pieces.set(piece, true);
                    pm.peer_has_piece(piece);
                }
                self.knows_pieces = true;
            }
            Message::Choke => {
                debug!("choke");
                self.session.state.peer_choking = true;
                self.free_pending_blocks();
            }
            Message::Unchoke => {
                debug!("unchoke");
                self.session.state.peer_choking = false;
            }
            Message::Interested => {
                debug!("interested");
                self.session.state.peer_interested = true;
            }
            Message::NotInterested => {
                debug!("not_interested");
                self.session.state.peer_interested = false;
            }
            Message::Piece(block) => {
                self.handle_piece_msg(block)?;
            }
            // we don't upload
            Message::Request(block_info) => {
                debug!("ignoring request {block_info:?}");
            }
            Message::Cancel(block_info) => {
                debug!("ignoring cancel {block_info:?}");
            }
        }

        Ok(())
    }

    /// Handle a new Piece msg from the peer, a Piece msg actually sends
    /// a block, and not a piece.
    ///
    /// A peer that completes [`MAX_CORRUPT_PIECES`] pieces that fail the
    /// hash check is disconnected.
    pub fn handle_piece_msg(&mut self, block: Block) -> Result<(), Error> {
        let block_info = BlockInfo::from(&block);

        // remove pending block request
        self.outgoing_requests.remove_request(&block_info);

        match self
            .torrent_ctx
            .piece_manager
            .on_block_received(self.remote_addr, &block)
        {
            BlockAcceptance::Rejected => {
                debug!("dropping unrequested block {block_info:?}");
            }
            BlockAcceptance::Accepted | BlockAcceptance::Verified(_) => {
                self.session.downloaded_blocks += 1;
            }
            BlockAcceptance::Corrupt { index, failures } => {
                warn!("piece {index} completed by us is corrupt ({failures})");
                self.session.downloaded_blocks += 1;
                self.session.corrupt_pieces += 1;

                if self.session.corrupt_pieces >= MAX_CORRUPT_PIECES {
                    return Err(Error::ProtocolViolation(format!(
                        "sent {} corrupt pieces",
                        self.session.corrupt_pieces
                    )));
                }
            }
        }

        Ok(())
    }

    /// Update our interest, fill the request pipeline and tell if the
    /// connection is still worth keeping.
    async fn keep_going<W>(&mut self, sink: &mut W) -> Result<bool, Error>
    where
        W: Sink<Message, Error = Error> + Unpin,
    {
        let interested = self.update_interest(sink).await?;
        self.request_blocks(sink).await?;

        Ok(!self.knows_pieces
            || interested
            || !self.outgoing_requests.is_empty())
    }

    /// Send interested or not interested.
    /// - if the peer has at least 1 piece which we don't have, interested.
    /// - later, if we already have all pieces which the peer has, and we are
    ///   interested, not interested.
    async fn update_interest<W>(&mut self, sink: &mut W) -> Result<bool, Error>
    where
        W: Sink<Message, Error = Error> + Unpin,
    {
        let should_be_interested =
            self.torrent_ctx.piece_manager.is_interesting(&self.pieces);
        let state = &mut self.session.state;

        if should_be_interested && !state.am_interested {
            debug!("sending interested");
            state.am_interested = true;
            sink.send(Message::Interested).await?;
        }

        // sorry, you're not the problem, it's me.
        if !should_be_interested && state.am_interested {
            debug!("sending not interested");
            state.am_interested = false;
            sink.send(Message::NotInterested).await?;
        }

        Ok(should_be_interested)
    }

    /// Check if we can request new blocks, if:
    /// - We are not being choked by the peer
    /// - We are interested in the peer
    /// - The capacity of inflight blocks is not full
    pub fn can_request(&self) -> bool {
        let state = &self.session.state;
        state.am_interested
            && !state.peer_choking
            && self.outgoing_requests.len()
                < self.torrent_ctx.config.max_outstanding_requests
    }

    /// Ask the piece manager for blocks that this peer has, and request them.
    pub async fn request_blocks<W>(&mut self, sink: &mut W) -> Result<(), Error>
    where
        W: Sink<Message, Error = Error> + Unpin,
    {
        if !self.can_request() {
            return Ok(());
        }

        let ctx = &self.torrent_ctx;
        let request_len = ctx
            .config
            .max_outstanding_requests
            .saturating_sub(self.outgoing_requests.len());

        let blocks = ctx.piece_manager.next_blocks_for(
            self.remote_addr,
            &self.pieces,
            request_len,
        );

        if blocks.is_empty() {
            return Ok(());
        }

        debug!("requesting {} blocks", blocks.len());

        let deadline = Instant::now() + ctx.config.request_timeout();

        for block_info in blocks {
            self.outgoing_requests.add_request(block_info.clone(), deadline);
            sink.feed(Message::Request(block_info)).await?;
        }
        sink.flush().await?;

        Ok(())
    }

    /// Give back the requests that passed their deadline and cancel them.
    /// Returns how many timed out.
    async fn check_request_timeout<W>(
        &mut self,
        sink: &mut W,
    ) -> Result<usize, Error>
    where
        W: Sink<Message, Error = Error> + Unpin,
    {
        let timed_out = self.outgoing_requests.take_timed_out(Instant::now());
        if timed_out.is_empty() {
            return Ok(0);
        }
        let count = timed_out.len();

        debug!("{} requests timed out", timed_out.len());

        for block_info in timed_out {
            self.session.timed_out_request_count += 1;
            self.torrent_ctx
                .piece_manager
                .on_request_timeout(self.remote_addr, &block_info);
            sink.feed(Message::Cancel(block_info)).await?;
        }
        sink.flush().await?;

        Ok(count)
    }

    /// Take outgoing block infos that are in queue and send them back
    /// to the piece manager so that other peers can request those blocks.
    pub fn free_pending_blocks(&mut self) -> usize {
        self.outgoing_requests.drain();
        self.torrent_ctx.piece_manager.release_all(self.remote_addr)
    }

    /// Terminal state of every connection.
    fn close(&mut self) {
        let freed = self.free_pending_blocks();
        if self.knows_pieces {
            self.torrent_ctx.piece_manager.unregister_peer_pieces(&self.pieces);
            self.knows_pieces = false;
        }
        self.session.transition(ConnectionState::Closed);
        debug!(
            "closed after {} blocks and {} timed out requests, freed {freed}",
            self.session.downloaded_blocks,
            self.session.timed_out_request_count,
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{duplex, DuplexStream},
        sync::mpsc,
    };

    use super::*;
    use crate::{
        config::Config,
        disk::DiskMsg,
        metainfo::Info,
        piece_manager::{PieceManagerOptions, PieceState},
        torrent::InfoHash,
    };

    const DATA: &[u8; 14] = b"abcdefghijklmn";

    fn ctx() -> (Arc<TorrentCtx>, mpsc::UnboundedReceiver<DiskMsg>) {
        ctx_with(Config { max_outstanding_requests: 2, ..Default::default() })
    }

    fn ctx_with(
        config: Config,
    ) -> (Arc<TorrentCtx>, mpsc::UnboundedReceiver<DiskMsg>) {
        let hashes: Vec<u8> = DATA
            .chunks(4)
            .flat_map(|c| sha1_smol::Sha1::from(c).digest().bytes())
            .collect();
        let info = Info::new("data", 14, 4, hashes).unwrap();
        let options =
            PieceManagerOptions { block_len: 2, ..Default::default() };
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let ctx = TorrentCtx::new(
            &info,
            PeerId::generate(),
            Arc::new(config),
            options,
            disk_tx,
        );
        (Arc::new(ctx), disk_rx)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:51413".parse().unwrap()
    }

    /// The remote side, after answering the handshake.
    async fn remote_handshake(
        socket: DuplexStream,
        info_hash: InfoHash,
    ) -> Framed<DuplexStream, MessageCodec> {
        let mut socket = Framed::new(socket, HandshakeCodec);
        let theirs = socket.next().await.unwrap().unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        socket
            .send(Handshake::new(info_hash, PeerId([9; 20])))
            .await
            .unwrap();
        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new(parts.io, MessageCodec);
        new_parts.read_buf = parts.read_buf;
        Framed::from_parts(new_parts)
    }

    fn full_bitfield() -> Bitfield {
        let mut b = Bitfield::from_piece(8);
        b[..4].fill(true);
        b
    }

    #[tokio::test]
    async fn downloads_everything_from_one_seeder() {
        let (ctx, mut disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        let seeder = tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;

            // our empty bitfield
            let msg = socket.next().await.unwrap().unwrap();
            assert_eq!(msg, Message::Bitfield(Bitfield::from_piece(8)));

            socket.send(Message::Bitfield(full_bitfield())).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();

            let mut served = 0;
            while let Some(Ok(msg)) = socket.next().await {
                if let Message::Request(b) = msg {
                    let start = b.index as usize * 4 + b.begin as usize;
                    let block = Block {
                        index: b.index as usize,
                        begin: b.begin,
                        block: DATA[start..start + b.len as usize].to_vec(),
                    };
                    socket.send(Message::Piece(block)).await.unwrap();
                    served += 1;
                }
            }
            served
        });

        let mut peer = Peer::new(addr(), ctx.clone());
        peer.run_with_socket(local).await.unwrap();

        assert_eq!(peer.session.connection, ConnectionState::Closed);
        assert!(ctx.piece_manager.is_complete());
        assert_eq!(peer.id, Some(PeerId([9; 20])));
        // 3 pieces of 2 blocks, and the last piece of 1
        assert_eq!(seeder.await.unwrap(), 7);
        assert_eq!(peer.session.downloaded_blocks, 7);

        let mut pieces = 0;
        while let Ok(DiskMsg::WritePiece { .. }) = disk_rx.try_recv() {
            pieces += 1;
        }
        assert_eq!(pieces, 4);
    }

    #[tokio::test]
    async fn wrong_info_hash_closes() {
        let (ctx, _disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);

        tokio::spawn(async move {
            let mut socket = Framed::new(remote, HandshakeCodec);
            let _ = socket.next().await;
            let _ = socket
                .send(Handshake::new(InfoHash([7; 20]), PeerId([9; 20])))
                .await;
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = peer.run_with_socket(local).await;
        assert!(matches!(r, Err(Error::InfoHashMismatch)));
        assert_eq!(peer.session.connection, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn garbage_instead_of_handshake() {
        let (ctx, _disk_rx) = ctx();
        let (local, mut remote) = duplex(1 << 16);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = remote.write_all(b"HTTP/1.1 400 Bad Request\r\n").await;
            // keep the socket open until the peer gives up
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = peer.run_with_socket(local).await;
        assert!(matches!(r, Err(Error::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn bitfield_with_wrong_length_is_a_violation() {
        let (ctx, _disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            let _ = socket.next().await;
            // 2 bytes for 4 pieces
            let _ = socket
                .send(Message::Bitfield(Bitfield::from_vec(vec![0xff, 0xff])))
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = peer.run_with_socket(local).await;
        assert!(matches!(r, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn have_out_of_range_is_a_violation() {
        let (ctx, _disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            let _ = socket.next().await;
            let _ = socket.send(Message::Have(4)).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = peer.run_with_socket(local).await;
        assert!(matches!(r, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn blocks_are_released_when_the_peer_leaves() {
        let (ctx, _disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        let seeder = tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            let _ = socket.next().await;
            socket.send(Message::Have(0)).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();

            // wait for the interested and the requests, then hang up
            let mut requests = vec![];
            while requests.len() < 2 {
                if let Some(Ok(Message::Request(b))) = socket.next().await {
                    requests.push(b);
                }
            }
            requests
        });

        let mut peer = Peer::new(addr(), ctx.clone());
        let r = peer.run_with_socket(local).await;
        assert!(matches!(r, Err(Error::PeerClosedSocket)));

        let requests = seeder.await.unwrap();
        assert_eq!(
            requests,
            vec![BlockInfo::new(0, 0, 2), BlockInfo::new(0, 2, 2)]
        );
        assert_eq!(ctx.piece_manager.piece_state(0), Some(PieceState::Missing));
        assert_eq!(ctx.piece_manager.release_all(addr()), 0);
    }

    #[tokio::test]
    async fn choke_releases_blocks() {
        let (ctx, _disk_rx) = ctx();
        let mut peer = Peer::new(addr(), ctx.clone());
        let mut sink = futures::sink::drain::<Message>()
            .sink_map_err(|_| Error::PeerClosedSocket);

        peer.handle_msg(Message::Bitfield(full_bitfield())).unwrap();
        peer.handle_msg(Message::Unchoke).unwrap();
        assert!(peer.keep_going(&mut sink).await.unwrap());
        assert!(peer.session.state.am_interested);
        assert_eq!(peer.outgoing_requests.len(), 2);
        assert_eq!(ctx.piece_manager.piece_state(0), Some(PieceState::Pending));

        peer.handle_msg(Message::Choke).unwrap();
        assert!(peer.outgoing_requests.is_empty());
        assert!(!peer.can_request());
        assert_eq!(ctx.piece_manager.piece_state(0), Some(PieceState::Missing));
    }

    #[tokio::test]
    async fn late_block_after_timeout_is_dropped() {
        let (ctx, _disk_rx) = ctx();
        let mut peer = Peer::new(addr(), ctx.clone());
        let mut sink = futures::sink::drain::<Message>()
            .sink_map_err(|_| Error::PeerClosedSocket);

        peer.handle_msg(Message::Bitfield(full_bitfield())).unwrap();
        peer.handle_msg(Message::Unchoke).unwrap();
        peer.keep_going(&mut sink).await.unwrap();

        // the piece manager expired our requests
        let later = Instant::now() + Duration::from_secs(3600);
        let expired =
            ctx.piece_manager.expire_requests(later, Duration::from_secs(1));
        assert_eq!(expired.len(), 2);

        let block = Block { index: 0, begin: 0, block: b"ab".to_vec() };
        peer.handle_piece_msg(block).unwrap();
        assert_eq!(peer.session.downloaded_blocks, 0);
        assert_eq!(peer.outgoing_requests.len(), 1);
    }

    #[tokio::test]
    async fn peer_sending_corrupt_pieces_is_dropped() {
        let (ctx, _disk_rx) = ctx();
        let mut peer = Peer::new(addr(), ctx.clone());
        let mut sink = futures::sink::drain::<Message>()
            .sink_map_err(|_| Error::PeerClosedSocket);

        let mut only_piece_3 = Bitfield::from_piece(8);
        only_piece_3.set(3, true);
        peer.handle_msg(Message::Bitfield(only_piece_3)).unwrap();
        peer.handle_msg(Message::Unchoke).unwrap();

        for round in 1..=MAX_CORRUPT_PIECES {
            peer.keep_going(&mut sink).await.unwrap();
            let r = peer.handle_piece_msg(Block {
                index: 3,
                begin: 0,
                block: b"xx".to_vec(),
            });
            if round < MAX_CORRUPT_PIECES {
                r.unwrap();
            } else {
                assert!(matches!(r, Err(Error::ProtocolViolation(_))));
            }
        }
        assert_eq!(peer.session.corrupt_pieces, MAX_CORRUPT_PIECES);
        assert_eq!(ctx.piece_manager.piece_state(3), Some(PieceState::Missing));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (ctx, _disk_rx) =
            ctx_with(Config { idle_timeout_secs: 1, ..Default::default() });
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            // read everything, answer nothing
            while socket.next().await.is_some() {}
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = timeout(Duration::from_secs(5), peer.run_with_socket(local))
            .await
            .unwrap();
        assert!(matches!(r, Err(Error::IdleTimeout)));
        assert_eq!(peer.session.connection, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn sends_keep_alives() {
        let (ctx, _disk_rx) =
            ctx_with(Config { keep_alive_secs: 1, ..Default::default() });
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();

        let remote = tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            let bitfield = socket.next().await.unwrap().unwrap();
            assert!(matches!(bitfield, Message::Bitfield(_)));

            let msg = timeout(Duration::from_secs(3), socket.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg, Message::KeepAlive);
        });

        let mut peer = Peer::new(addr(), ctx);
        let r = peer.run_with_socket(local).await;

        remote.await.unwrap();
        assert!(matches!(r, Err(Error::PeerClosedSocket)));
    }

    #[tokio::test]
    async fn quit_ends_the_connection() {
        let (ctx, _disk_rx) = ctx();
        let (local, remote) = duplex(1 << 16);
        let info_hash = ctx.info_hash.clone();
        let br_tx = ctx.peer_br_tx.clone();

        tokio::spawn(async move {
            let mut socket = remote_handshake(remote, info_hash).await;
            let _ = socket.next().await;
            // after our bitfield, the torrent quits
            let _ = br_tx.send(PeerBrMsg::Quit);
            while socket.next().await.is_some() {}
        });

        let mut peer = Peer::new(addr(), ctx);
        assert!(peer.run_with_socket(local).await.is_ok());
        assert_eq!(peer.session.connection, ConnectionState::Closed);
    }
}
