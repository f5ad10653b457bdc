//! HTTP tracker protocol, BEP 3 with the compact peer list of BEP 23.
use std::{net::SocketAddr, time::Duration};

use bendy::decoding::{self, FromBencode, Object, ResultExt};
use reqwest::Client;
use tracing::debug;

use crate::error::Error;

use super::{parse_compact_peer_list, AnnounceParams, AnnounceResponse};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self, Error> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::TrackerUnsupportedScheme(url.to_owned()));
        }

        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self { client, url: url.to_owned() })
    }

    /// The announce url with the query string of `params`. `info_hash` and
    /// `peer_id` are raw bytes, percent-encoded.
    pub fn announce_url(&self, params: &AnnounceParams) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{}{sep}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1",
            self.url,
            urlencoding::encode_binary(&params.info_hash.0),
            urlencoding::encode_binary(&params.peer_id.0),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );

        if let Some(event) = params.event.as_str() {
            url.push_str("&event=");
            url.push_str(event);
        }

        url
    }

    pub async fn announce(
        &mut self,
        params: AnnounceParams,
    ) -> Result<AnnounceResponse, Error> {
        debug!("announcing {:?} to {}", params.event, self.url);

        let url = self.announce_url(&params);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        HttpAnnounce::from_bencode(&bytes)?.into_response()
    }
}

/// The peers of an HTTP announce, either compact or a list of
/// dictionaries.
#[derive(Debug, PartialEq)]
enum HttpPeers {
    Compact(Vec<u8>),
    List(Vec<SocketAddr>),
}

/// Bencoded body of an HTTP announce response.
#[derive(Debug, Default, PartialEq)]
struct HttpAnnounce {
    failure_reason: Option<String>,
    interval: Option<u32>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    peers: Option<HttpPeers>,
    peers6: Option<Vec<u8>>,
}

impl HttpAnnounce {
    fn into_response(self) -> Result<AnnounceResponse, Error> {
        if let Some(reason) = self.failure_reason {
            return Err(Error::TrackerFailure(reason));
        }

        let interval = self.interval.ok_or(Error::TrackerResponse)?;

        let mut peers = match self.peers {
            Some(HttpPeers::Compact(buf)) => {
                parse_compact_peer_list(&buf, false)?
            }
            Some(HttpPeers::List(peers)) => peers,
            None => Vec::new(),
        };

        if let Some(buf) = self.peers6 {
            peers.extend(parse_compact_peer_list(&buf, true)?);
        }

        Ok(AnnounceResponse {
            interval,
            seeders: self.complete.unwrap_or_default(),
            leechers: self.incomplete.unwrap_or_default(),
            peers,
        })
    }
}

/// One entry of a non-compact peer list. Entries with an ip that is not a
/// literal address are skipped.
struct DictPeer(Option<SocketAddr>);

impl FromBencode for DictPeer {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut ip = None;
        let mut port = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"ip", value) => {
                    ip = String::decode_bencode_object(value)
                        .context("ip")
                        .map(Some)?;
                }
                (b"port", value) => {
                    port = u16::decode_bencode_object(value)
                        .context("port")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let port = port.ok_or_else(|| decoding::Error::missing_field("port"))?;
        let addr = ip
            .and_then(|ip| ip.parse().ok())
            .map(|ip| SocketAddr::new(ip, port));

        Ok(Self(addr))
    }
}

impl FromBencode for HttpAnnounce {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut res = HttpAnnounce::default();

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"complete", value) => {
                    res.complete = u32::decode_bencode_object(value)
                        .context("complete")
                        .map(Some)?;
                }
                (b"failure reason", value) => {
                    res.failure_reason = String::decode_bencode_object(value)
                        .context("failure reason")
                        .map(Some)?;
                }
                (b"incomplete", value) => {
                    res.incomplete = u32::decode_bencode_object(value)
                        .context("incomplete")
                        .map(Some)?;
                }
                (b"interval", value) => {
                    res.interval = u32::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?;
                }
                (b"peers", Object::Bytes(buf)) => {
                    res.peers = Some(HttpPeers::Compact(buf.to_vec()));
                }
                (b"peers", Object::List(mut list)) => {
                    let mut peers = Vec::new();
                    while let Some(item) = list.next_object()? {
                        if let DictPeer(Some(addr)) =
                            DictPeer::decode_bencode_object(item)
                                .context("peers")?
                        {
                            peers.push(addr);
                        }
                    }
                    res.peers = Some(HttpPeers::List(peers));
                }
                (b"peers6", Object::Bytes(buf)) => {
                    res.peers6 = Some(buf.to_vec());
                }
                _ => {}
            }
        }

        Ok(res)
    }
}
