use std::io;

use thiserror::Error;

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::Bencode(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::Bencode(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out while connecting to the peer")]
    ConnectTimeout,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer did not send any message for too long")]
    IdleTimeout,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer answered the handshake with a different info_hash")]
    InfoHashMismatch,

    #[error("The peer violated the protocol: {0}")]
    ProtocolViolation(String),

    #[error(
        "All known peers were tried without completing the download, \
         {verified} of {total} pieces verified"
    )]
    PeersExhausted { verified: usize, total: usize },

    #[error("The download was stopped before it finished")]
    Cancelled,

    #[error("The tracker did not return any peer")]
    NoPeers,

    #[error("The response received from the tracker was wrong")]
    TrackerResponse,

    #[error(
        "The response length received from the tracker was less then 20 \
         bytes, when it should be larger"
    )]
    TrackerResponseLength,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Tracker resolved to no unusable addresses")]
    TrackerNoHosts,

    #[error("Could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("The tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("Unsupported tracker url `{0}`, only udp:// and http(s):// work")]
    TrackerUnsupportedScheme(String),

    #[error("HTTP error while talking to the tracker: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Error when serializing/deserializing: {0}")]
    SpeedyError(#[from] speedy::Error),

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    Bencode(String),

    #[error("Torrents with more than one file are not supported")]
    MultiFileUnsupported,

    #[error("The torrent metainfo is invalid: {0}")]
    MetainfoInvalid(String),

    #[error("Error while trying to load configuration: `{0}`")]
    Config(#[from] config::ConfigError),

    #[error("Could not serialize the configuration: `{0}`")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("The disk task stopped before the download finished")]
    DiskStopped,
}
