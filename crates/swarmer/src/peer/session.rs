use tokio::time::Instant;

/// The lifecycle of a connection with a remote peer.
///
/// ```text
/// Connecting -> HandshakeSent -> HandshakeVerified -> Active -> Closed
/// ```
///
/// Any state can go straight to `Closed`.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the TCP socket.
    #[default]
    Connecting,

    /// Our handshake was sent, waiting for the handshake of the peer.
    HandshakeSent,

    /// The handshake of the peer is for our torrent, about to send our
    /// bitfield.
    HandshakeVerified,

    /// Exchanging messages and downloading.
    Active,

    /// Terminal, the socket is gone and the blocks of this connection were
    /// released.
    Closed,
}

impl ConnectionState {
    /// If `next` may follow `self`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, HandshakeSent)
                | (HandshakeSent, HandshakeVerified)
                | (HandshakeVerified, Active)
                | (Connecting | HandshakeSent | HandshakeVerified | Active, Closed)
        )
    }
}

/// Contains the state of both sides of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreState {
    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// If the peer is choking us, it will not answer our requests.
    pub peer_choking: bool,

    /// If the peer is interested in us. We never upload, it is only
    /// recorded.
    pub peer_interested: bool,
}

impl Default for CoreState {
    /// By default, both sides of the connection start off as choked and not
    /// interested in the other.
    fn default() -> Self {
        Self { am_interested: false, peer_choking: true, peer_interested: false }
    }
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    /// The current state of the connection.
    pub connection: ConnectionState,

    pub state: CoreState,

    /// Last time any message was received from the peer.
    pub last_activity: Instant,

    pub downloaded_blocks: u64,
    pub timed_out_request_count: usize,
    /// Pieces completed by this peer that failed the hash check.
    pub corrupt_pieces: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            state: CoreState::default(),
            last_activity: Instant::now(),
            downloaded_blocks: 0,
            timed_out_request_count: 0,
            corrupt_pieces: 0,
        }
    }
}

impl Session {
    /// Move the connection to `next`. Illegal transitions are ignored and
    /// return false.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.connection.can_transition_to(next) {
            return false;
        }
        self.connection = next;
        true
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
