use std::{fmt::Display, ops::Deref};

use speedy::{Readable, Writable};

/// Broadcasted messages for all peers in a torrent.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerBrMsg {
    /// When we download a full piece, we need to send Have's
    /// to peers that dont Have it.
    HavePiece(usize),
    /// The download finished or the client is shutting down. Peers release
    /// their blocks and close the connection.
    Quit,
}

/// Messages used to control a running torrent.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentMsg {
    /// Stop the download: peers close, the tracker gets a Stopped announce
    /// and the disk flushes the pieces verified so far.
    Quit,
}

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The infohash must have exactly 20 bytes")?;
        Ok(InfoHash(buff))
    }
}

/// Status of the current Torrent, updated at every announce request.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Stats {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_display() {
        let hash = InfoHash([0x0f; 20]);
        assert_eq!(hash.to_string(), "0f".repeat(20));
        assert_eq!(format!("{hash:?}"), "0f0f0f0f0f");
    }

    #[test]
    fn info_hash_try_from() {
        assert_eq!(
            InfoHash::try_from(vec![1u8; 20]).unwrap(),
            InfoHash([1; 20])
        );
        assert!(InfoHash::try_from(vec![1u8; 21]).is_err());
    }
}
