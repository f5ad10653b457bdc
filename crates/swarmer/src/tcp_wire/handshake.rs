//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`super::MessageCodec`], but care should be taken
//! not to discard the underlying receive and send buffers.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::PSTR;
use crate::{error::Error, peer::PeerId, torrent::InfoHash};

/// Size of a handshake on the wire.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(pstr_len);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek, the prefix is only consumed with the full handshake
        let prot_len = buf[0] as usize;
        if prot_len != PSTR.len() {
            return Err(Error::MalformedMessage(format!(
                "handshake protocol string length is {prot_len}"
            )));
        }

        if buf.len() < HANDSHAKE_LEN {
            buf.reserve(HANDSHAKE_LEN - buf.len());
            return Ok(None);
        }

        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);

        if pstr != PSTR {
            return Err(Error::MalformedMessage(
                "handshake protocol string is not \"BitTorrent protocol\""
                    .to_owned(),
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: prot_len as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field is 8 zero bytes, we don't advertise any
/// extension. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Validate the handshake of the remote against ours.
    pub fn validate(&self, target: &Self) -> Result<(), Error> {
        if target.pstr_len != 19 || target.pstr != PSTR {
            warn!("handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        if self.info_hash != target.info_hash {
            warn!("info_hash from receiving handshake does not match ours");
            return Err(Error::InfoHashMismatch);
        }
        Ok(())
    }
}
