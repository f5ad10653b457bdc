//! Announce exchange of the UDP tracker protocol.
use speedy::{BigEndian, Readable, Writable};

use crate::{
    error::Error,
    peer::PeerId,
    torrent::{InfoHash, Stats},
};

use super::{AnnounceParams, ACTION_ANNOUNCE};

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: u32,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    /// 0 lets the tracker use the source address of the packet.
    pub ip_address: u32,
    pub key: u32,
    /// -1 lets the tracker decide.
    pub num_want: i32,
    pub port: u16,
}

impl Request {
    pub(crate) const LENGTH: usize = 98;

    pub fn new(connection_id: u64, key: u32, params: &AnnounceParams) -> Self {
        Self {
            connection_id,
            action: ACTION_ANNOUNCE,
            transaction_id: rand::random(),
            info_hash: params.info_hash.clone(),
            peer_id: params.peer_id.clone(),
            downloaded: params.downloaded,
            left: params.left,
            uploaded: params.uploaded,
            event: params.event.into(),
            ip_address: 0,
            key,
            num_want: -1,
            port: params.port,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }
}

#[derive(Debug, PartialEq, Writable, Readable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    // binary of peers that will be deserialized on
}

impl From<&Response> for Stats {
    fn from(value: &Response) -> Self {
        Self {
            interval: value.interval,
            seeders: value.seeders,
            leechers: value.leechers,
        }
    }
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    /// Decode the header of the response, and return the compact peer list
    /// that follows it.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Response::MIN_LEN {
            return Err(Error::TrackerResponseLength);
        }

        let res = Self::read_from_buffer_with_ctx(
            BigEndian {},
            &buf[..Self::MIN_LEN],
        )?;

        Ok((res, &buf[Self::MIN_LEN..]))
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }
}
