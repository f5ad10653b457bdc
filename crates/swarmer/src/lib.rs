//! A library to download single-file torrents with the BitTorrent protocol
//! V1.
//!
//! This is the library of swarmer, a leecher: it only downloads, it never
//! uploads to other peers. The binary `swarm` is a thin CLI over
//! [`torrent::TorrentClient`].
//!
//! The building blocks:
//!
//! * [`tcp_wire`], the codecs of the peer wire protocol.
//! * [`peer`], one TCP connection with a remote peer, from the handshake
//!   until it closes.
//! * [`piece_manager`], the state of every piece and block, shared by all
//!   connections. It decides which blocks each peer downloads and verifies
//!   the pieces.
//! * [`pool`], the bounded set of running connections.
//! * [`tracker`], UDP and HTTP trackers.
//! * [`disk`], writes the verified pieces to the output file.
//!
//! # Example
//!
//! ```no_run
//! use swarmer::{config::Config, metainfo::MetaInfo, torrent::TorrentClient};
//!
//! # async fn download() -> Result<(), swarmer::error::Error> {
//! let meta_info = MetaInfo::from_path("debian.iso.torrent").await?;
//! let config = Config::load(None)?;
//!
//! TorrentClient::from_metainfo(meta_info, config).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece_manager;
pub mod pool;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
pub mod utils;
