//! Shared setup of the integration tests.
//!
//! A test runs a real [`TorrentClient`] against seeders listening on
//! loopback TCP sockets, and a [`MockTracker`] that returns their
//! addresses.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use swarmer::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    error::Error,
    metainfo::Info,
    peer::PeerId,
    tcp_wire::{Block, Handshake, HandshakeCodec, Message, MessageCodec},
    torrent::InfoHash,
    tracker::{event::Event, AnnounceParams, AnnounceResponse, TrackerTrait},
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::codec::{Framed, FramedParts};

/// A torrent and its content.
pub struct TestTorrent {
    pub info: Info,
    pub data: Arc<Vec<u8>>,
}

impl TestTorrent {
    pub fn new(data: Vec<u8>, piece_length: usize) -> Self {
        let hashes: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|c| sha1_smol::Sha1::from(c).digest().bytes())
            .collect();
        let info =
            Info::new(random_name(), data.len(), piece_length, hashes).unwrap();
        Self { info, data: Arc::new(data) }
    }

    pub fn random(len: usize, piece_length: usize) -> Self {
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        Self::new(data, piece_length)
    }
}

pub fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// A random directory under the temp dir, removed on drop.
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new() -> Self {
        Self(std::env::temp_dir().join(format!("swarmer-{}", random_name())))
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Config with short timeouts, downloading into `dir`.
pub fn test_config(dir: &TempDir) -> Config {
    Config {
        download_dir: dir.0.clone(),
        max_peers: 4,
        request_timeout_secs: 1,
        connect_timeout_secs: 2,
        handshake_timeout_secs: 2,
        shutdown_grace_secs: 1,
        ..Default::default()
    }
}

/// How a seeder answers requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Honest,
    /// Every block of this piece is sent with flipped bits.
    Corrupt(usize),
    /// Accepts requests and never answers them.
    Stall,
    /// Waits this long before sending each block.
    Slow(Duration),
}

pub struct Seeder {
    pub addr: SocketAddr,
    /// How many blocks were sent, over all connections.
    pub served: Arc<AtomicUsize>,
}

impl Seeder {
    /// Listen on loopback and serve `pieces` of `torrent` to every
    /// connection.
    pub async fn spawn(
        torrent: &TestTorrent,
        pieces: &[usize],
        behavior: Behavior,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));

        let mut have = Bitfield::from_piece(torrent.info.pieces());
        for &piece in pieces {
            have.set(piece, true);
        }

        let data = torrent.data.clone();
        let info_hash = torrent.info.info_hash.clone();
        let piece_length = torrent.info.piece_length;
        let served_by_all = served.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let data = data.clone();
                let info_hash = info_hash.clone();
                let have = have.clone();
                let served = served_by_all.clone();

                tokio::spawn(async move {
                    let _ = serve(
                        socket,
                        data,
                        info_hash,
                        piece_length,
                        have,
                        behavior,
                        served,
                    )
                    .await;
                });
            }
        });

        Self { addr, served }
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

async fn serve(
    socket: TcpStream,
    data: Arc<Vec<u8>>,
    info_hash: InfoHash,
    piece_length: usize,
    have: Bitfield,
    behavior: Behavior,
    served: Arc<AtomicUsize>,
) -> Result<(), Error> {
    let mut socket = Framed::new(socket, HandshakeCodec);

    let theirs = socket.next().await.ok_or(Error::PeerClosedSocket)??;
    if theirs.info_hash != info_hash {
        return Err(Error::InfoHashMismatch);
    }
    socket.send(Handshake::new(info_hash, PeerId::generate())).await?;

    let parts = socket.into_parts();
    let mut new_parts = FramedParts::new(parts.io, MessageCodec);
    new_parts.read_buf = parts.read_buf;
    let mut socket = Framed::from_parts(new_parts);

    socket.send(Message::Bitfield(have.clone())).await?;
    socket.send(Message::Unchoke).await?;

    while let Some(msg) = socket.next().await {
        let Message::Request(req) = msg? else { continue };

        let index = req.index as usize;
        if behavior == Behavior::Stall || !have.has(index) {
            continue;
        }

        if let Behavior::Slow(delay) = behavior {
            sleep(delay).await;
        }

        let start = index * piece_length + req.begin as usize;
        let mut block = data[start..start + req.len as usize].to_vec();

        if behavior == Behavior::Corrupt(index) {
            block.iter_mut().for_each(|b| *b ^= 0xff);
        }

        socket
            .send(Message::Piece(Block { index, begin: req.begin, block }))
            .await?;
        served.fetch_add(1, Ordering::SeqCst);
    }

    Ok(())
}

/// A tracker that always returns the same peers, and records the events
/// it receives.
#[derive(Clone)]
pub struct MockTracker {
    pub peers: Vec<SocketAddr>,
    pub events: Arc<Mutex<Vec<Event>>>,
    /// Refuse every announce.
    pub fail: bool,
    pub interval: u32,
    /// Every announce after this many never gets an answer in time.
    pub hang_after: Option<usize>,
}

impl MockTracker {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            events: Arc::default(),
            fail: false,
            interval: 1800,
            hang_after: None,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl TrackerTrait for MockTracker {
    async fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        let announced = {
            let mut events = self.events.lock().unwrap();
            events.push(params.event);
            events.len()
        };

        if self.hang_after.is_some_and(|n| announced > n) {
            sleep(Duration::from_secs(20)).await;
        }

        if self.fail {
            return Err(Error::TrackerFailure("torrent not registered".into()));
        }

        Ok(AnnounceResponse {
            interval: self.interval,
            seeders: self.peers.len() as u32,
            leechers: 1,
            peers: self.peers.clone(),
        })
    }
}
