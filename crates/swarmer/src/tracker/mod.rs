//! A tracker is a server that knows the peers of a torrent.
//!
//! Two protocols are supported: [`udp`] (BEP 15) and [`http`] (BEP 3 with
//! the compact peer list of BEP 23). [`Tracker`] wraps the announce urls of
//! a torrent and sticks with the first one that answers.
pub mod announce;
pub mod connect;
pub mod event;
pub mod http;
pub mod udp;

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tracing::{debug, info, warn};

use crate::{
    error::Error,
    metainfo::MetaInfo,
    peer::PeerId,
    torrent::{InfoHash, Stats},
};

use self::{event::Event, http::HttpTracker, udp::UdpTracker};

pub(crate) const ACTION_CONNECT: u32 = 0;
pub(crate) const ACTION_ANNOUNCE: u32 = 1;
pub(crate) const ACTION_ERROR: u32 = 3;

/// What the local peer tells the tracker on every announce.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next regular announce.
    pub interval: u32,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
}

impl From<&AnnounceResponse> for Stats {
    fn from(value: &AnnounceResponse) -> Self {
        Self {
            interval: value.interval,
            seeders: value.seeders,
            leechers: value.leechers,
        }
    }
}

/// Trait that all trackers must implement.
pub trait TrackerTrait: Send {
    /// An announce is the communication of the local peer to the tracker,
    /// for example:
    /// - When the torrent starts, we announce with [`Event::Started`] to get
    ///   the list of peers for this torrent.
    /// - To update the tracker with the download stats, at every interval.
    /// - When the download completes or the client stops.
    fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> impl Future<Output = Result<AnnounceResponse, Error>> + Send;
}

/// A client for one tracker url, the protocol is picked from the scheme.
#[derive(Debug)]
pub enum TrackerClient {
    Udp(UdpTracker),
    Http(HttpTracker),
}

impl TrackerClient {
    pub async fn new(url: &str) -> Result<Self, Error> {
        if url.starts_with("udp://") {
            Ok(Self::Udp(UdpTracker::new(url).await?))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(HttpTracker::new(url)?))
        } else {
            Err(Error::TrackerUnsupportedScheme(url.to_owned()))
        }
    }
}

impl TrackerTrait for TrackerClient {
    async fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        match self {
            Self::Udp(tracker) => tracker.announce(params).await,
            Self::Http(tracker) => tracker.announce(params).await,
        }
    }
}

/// The trackers of a torrent, tried in order until one answers. Once a
/// tracker answers it is used for every following announce, until it
/// fails.
#[derive(Debug)]
pub struct Tracker {
    urls: Vec<String>,
    active: Option<(String, TrackerClient)>,
}

impl Tracker {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls, active: None }
    }

    pub fn from_metainfo(meta_info: &MetaInfo) -> Self {
        Self::new(meta_info.trackers())
    }
}

impl TrackerTrait for Tracker {
    async fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        if let Some((url, client)) = self.active.as_mut() {
            match client.announce(params.clone()).await {
                Ok(res) => return Ok(res),
                Err(e) => {
                    warn!("tracker {url} stopped answering: {e}");
                    self.active = None;
                }
            }
        }

        let mut last_err = Error::TrackerNoHosts;

        for url in &self.urls {
            debug!("trying tracker {url}");

            let mut client = match TrackerClient::new(url).await {
                Ok(client) => client,
                Err(e) => {
                    debug!("skipping tracker {url}: {e}");
                    last_err = e;
                    continue;
                }
            };

            match client.announce(params.clone()).await {
                Ok(res) => {
                    info!("using tracker {url}");
                    self.active = Some((url.clone(), client));
                    return Ok(res);
                }
                Err(e) => {
                    debug!("tracker {url} failed: {e}");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

/// Parse a compact peer list (BEP 23).
///
/// IPv4 peers come in chunks of 6 bytes, 4 for the ip and 2 for the port.
/// IPv6 peers come in chunks of 18 bytes, 16 for the ip and 2 for the
/// port.
pub fn parse_compact_peer_list(
    buf: &[u8],
    is_ipv6: bool,
) -> Result<Vec<SocketAddr>, Error> {
    let stride = if is_ipv6 { 18 } else { 6 };

    let chunks = buf.chunks_exact(stride);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let peers: Vec<SocketAddr> = chunks
        .map(|hostport| {
            let (ip, port) = hostport.split_at(stride - 2);
            let ip = if is_ipv6 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip);
                IpAddr::from(Ipv6Addr::from(octets))
            } else {
                IpAddr::from(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
            };
            let port = u16::from_be_bytes([port[0], port[1]]);
            SocketAddr::new(ip, port)
        })
        .collect();

    debug!("{} ips of peers", peers.len());

    Ok(peers)
}
