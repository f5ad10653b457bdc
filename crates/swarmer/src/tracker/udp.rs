//! UDP tracker protocol, BEP 15.
use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{lookup_host, UdpSocket},
    time::{timeout_at, Instant},
};
use tracing::{debug, warn};

use crate::error::Error;

use super::{
    announce, connect, parse_compact_peer_list, AnnounceParams,
    AnnounceResponse, ACTION_ANNOUNCE, ACTION_CONNECT, ACTION_ERROR,
};

/// A connection id may be used for one minute after it was received.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// How many times a request is sent again after a timeout, before giving
/// up on the tracker.
pub const MAX_RETRANSMITS: u32 = 3;

static ANNOUNCE_RES_BUF_LEN: usize = 8192;

#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    /// Remote addr of the tracker.
    addr: SocketAddr,
    connection: Option<(u64, Instant)>,
    /// Identifies this client across ip changes.
    key: u32,
    /// Timeout of the first try, doubled at each retransmission.
    base_timeout: Duration,
}

impl UdpTracker {
    pub async fn new(url: &str) -> Result<Self, Error> {
        Self::with_timeout(url, Duration::from_secs(15)).await
    }

    /// Like [`UdpTracker::new`] with a custom timeout for the first try.
    pub async fn with_timeout(
        url: &str,
        base_timeout: Duration,
    ) -> Result<Self, Error> {
        let host = url
            .strip_prefix("udp://")
            .ok_or_else(|| Error::TrackerUnsupportedScheme(url.to_owned()))?;
        let host = host.split('/').next().unwrap_or(host);

        let addr =
            lookup_host(host).await?.next().ok_or(Error::TrackerNoHosts)?;

        let local: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().map_err(|_| Error::TrackerSocketConnect)?
        } else {
            "0.0.0.0:0".parse().map_err(|_| Error::TrackerSocketConnect)?
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await.map_err(|_| Error::TrackerSocketConnect)?;

        Ok(Self {
            socket,
            addr,
            connection: None,
            key: rand::random(),
            base_timeout,
        })
    }

    /// Send `req` and wait for the answer, sending it again every time the
    /// timeout expires, with the timeout doubled: `base * 2^n`.
    ///
    /// Datagrams that do not carry `transaction_id` are stale answers to
    /// earlier requests and are skipped.
    async fn exchange(
        &self,
        req: &[u8],
        transaction_id: u32,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        for n in 0..=MAX_RETRANSMITS {
            self.socket.send(req).await?;

            let wait = self.base_timeout * 2_u32.pow(n);
            let deadline = Instant::now() + wait;

            loop {
                match timeout_at(deadline, self.socket.recv(buf)).await {
                    Ok(Ok(len)) => {
                        if len >= 8
                            && buf[4..8] == transaction_id.to_be_bytes()
                        {
                            return Ok(len);
                        }
                        debug!(
                            "ignoring {len} bytes from tracker {} with \
                             another transaction id",
                            self.addr
                        );
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        debug!(
                            "request to tracker {} was lost after {wait:?}",
                            self.addr
                        );
                        break;
                    }
                }
            }
        }

        warn!("tracker {} did not answer", self.addr);
        Err(Error::TrackerResponse)
    }

    /// The tracker answers with an error action and a message in place of
    /// the regular response.
    fn check_error(buf: &[u8]) -> Result<(), Error> {
        if buf.len() >= 8 && buf[..4] == ACTION_ERROR.to_be_bytes() {
            let msg = String::from_utf8_lossy(&buf[8..]).into_owned();
            return Err(Error::TrackerFailure(msg));
        }
        Ok(())
    }

    /// Before doing an `announce`, a client must perform a connect
    /// exchange to obtain a connection_id. The id is reused while it is
    /// valid.
    pub async fn connect(&mut self) -> Result<u64, Error> {
        if let Some((id, at)) = self.connection {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        let req = connect::Request::new();
        let mut buf = [0u8; 64];

        let len = self
            .exchange(&req.serialize()?, req.transaction_id, &mut buf)
            .await?;
        let buf = &buf[..len];
        Self::check_error(buf)?;

        let res = connect::Response::deserialize(buf)?;

        if res.transaction_id != req.transaction_id
            || res.action != ACTION_CONNECT
        {
            warn!("connect response is not valid {res:?}");
            return Err(Error::TrackerResponse);
        }

        self.connection = Some((res.connection_id, Instant::now()));

        Ok(res.connection_id)
    }

    pub async fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        debug!("announcing {:?} to {}", params.event, self.addr);

        let connection_id = self.connect().await?;
        let req = announce::Request::new(connection_id, self.key, &params);

        let mut buf = vec![0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self
            .exchange(&req.serialize()?, req.transaction_id, &mut buf)
            .await?;
        let buf = &buf[..len];

        if let Err(e) = Self::check_error(buf) {
            // the connection id may have expired on the tracker side
            self.connection = None;
            return Err(e);
        }

        let (res, payload) = announce::Response::deserialize(buf)?;

        if res.transaction_id != req.transaction_id
            || res.action != ACTION_ANNOUNCE
        {
            warn!("announce response is not valid {res:?}");
            return Err(Error::TrackerResponse);
        }

        let peers = parse_compact_peer_list(payload, self.addr.is_ipv6())?;

        Ok(AnnounceResponse {
            interval: res.interval,
            seeders: res.seeders,
            leechers: res.leechers,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use speedy::{BigEndian, Readable};

    use super::*;
    use crate::{peer::PeerId, torrent::InfoHash, tracker::event::Event};

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash([5; 20]),
            peer_id: PeerId::generate(),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Event::Started,
        }
    }

    /// Answers connect and announce requests, returns how many connects it
    /// answered. When `drop_first` is set, the first packet is ignored.
    async fn fake_tracker(
        drop_first: bool,
    ) -> (SocketAddr, tokio::task::JoinHandle<usize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut received = 0;
            let mut connects = 0;
            let mut dropped = !drop_first;

            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                received += 1;
                if !dropped {
                    dropped = true;
                    continue;
                }

                if len == connect::Request::LENGTH {
                    let req = connect::Request::deserialize(&buf[..len]).unwrap();
                    assert_eq!(req.protocol_id, connect::Request::MAGIC);
                    connects += 1;
                    let res = connect::Response {
                        action: ACTION_CONNECT,
                        transaction_id: req.transaction_id,
                        connection_id: 77,
                    };
                    socket.send_to(&res.serialize().unwrap(), from).await.unwrap();
                } else {
                    let req = announce::Request::read_from_buffer_with_ctx(
                        BigEndian {},
                        &buf[..len],
                    )
                    .unwrap();
                    assert_eq!(req.connection_id, 77);
                    assert_eq!(req.info_hash, InfoHash([5; 20]));

                    let res = announce::Response {
                        action: ACTION_ANNOUNCE,
                        transaction_id: req.transaction_id,
                        interval: 900,
                        leechers: 3,
                        seeders: 4,
                    };
                    let mut out = res.serialize().unwrap();
                    out.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
                    socket.send_to(&out, from).await.unwrap();
                }

                if received >= 5 {
                    break;
                }
            }
            connects
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn announce_and_reuse_connection_id() {
        let (addr, handle) = fake_tracker(false).await;
        let url = format!("udp://{addr}/announce");
        let mut tracker =
            UdpTracker::with_timeout(&url, Duration::from_millis(200))
                .await
                .unwrap();

        let res = tracker.announce(params()).await.unwrap();
        assert_eq!(res.interval, 900);
        assert_eq!(res.seeders, 4);
        assert_eq!(res.leechers, 3);
        assert_eq!(res.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        // second announce skips the connect exchange
        tracker.announce(params()).await.unwrap();
        assert_eq!(tracker.connection.map(|(id, _)| id), Some(77));

        handle.abort();
    }

    #[tokio::test]
    async fn retransmits_lost_request() {
        let (addr, handle) = fake_tracker(true).await;
        let url = format!("udp://{addr}");
        let mut tracker =
            UdpTracker::with_timeout(&url, Duration::from_millis(50))
                .await
                .unwrap();

        let res = tracker.announce(params()).await.unwrap();
        assert_eq!(res.peers.len(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn error_action() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = socket.recv_from(&mut buf).await.unwrap();
            let mut out = ACTION_ERROR.to_be_bytes().to_vec();
            out.extend_from_slice(&buf[12..16]);
            out.extend_from_slice(b"unregistered torrent");
            socket.send_to(&out, from).await.unwrap();
        });

        let url = format!("udp://{addr}");
        let mut tracker =
            UdpTracker::with_timeout(&url, Duration::from_millis(200))
                .await
                .unwrap();

        match tracker.announce(params()).await {
            Err(Error::TrackerFailure(msg)) => {
                assert_eq!(msg, "unregistered torrent")
            }
            other => panic!("unexpected {other:?}"),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn skips_answers_to_other_transactions() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let req = connect::Request::deserialize(&buf[..len]).unwrap();

            let stale = connect::Response {
                action: ACTION_CONNECT,
                transaction_id: req.transaction_id.wrapping_add(1),
                connection_id: 1,
            };
            socket.send_to(&stale.serialize().unwrap(), from).await.unwrap();

            let res = connect::Response {
                action: ACTION_CONNECT,
                transaction_id: req.transaction_id,
                connection_id: 42,
            };
            socket.send_to(&res.serialize().unwrap(), from).await.unwrap();
        });

        let url = format!("udp://{addr}");
        let mut tracker =
            UdpTracker::with_timeout(&url, Duration::from_millis(500))
                .await
                .unwrap();

        assert_eq!(tracker.connect().await.unwrap(), 42);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_on_silent_tracker() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let url = format!("udp://{addr}");

        let mut tracker =
            UdpTracker::with_timeout(&url, Duration::from_millis(5))
                .await
                .unwrap();

        assert!(matches!(
            tracker.announce(params()).await,
            Err(Error::TrackerResponse)
        ));
        drop(socket);
    }
}
