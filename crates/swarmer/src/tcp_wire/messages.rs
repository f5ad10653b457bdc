//! Length-prefixed messages exchanged after the handshake.
//!
//! All of the messages take the form of
//! `<length prefix><message ID><payload>`. The length prefix is a four byte
//! big-endian value that covers the ID and the payload, a zero length is a
//! keep-alive.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// No message can be larger than this, the largest legit one is a bitfield
/// of a torrent with ~16 million pieces.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// The messages of the peer wire protocol, minus the handshake which has its
/// own [`super::HandshakeCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            _ => Err(Error::MalformedMessage(format!("unknown id {k}"))),
        }
    }
}

impl MessageId {
    /// Check the length prefix against what this message must carry.
    fn validate_len(self, size: usize) -> Result<(), Error> {
        use MessageId::*;
        let ok = match self {
            Choke | Unchoke | Interested | NotInterested => size == 1,
            Have => size == 1 + 4,
            Request | Cancel => size == 1 + 4 + 4 + 4,
            Piece => size >= 1 + 4 + 4,
            Bitfield => size >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::MalformedMessage(format!(
                "{self:?} cannot have a length of {size}"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.reserve(4 + 1 + v.len());
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.reserve(4 + 1 + 4 + 4 + block.block.len());
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                block.encode(buf)?;
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the message length header must be present at the minimum, otherwise
        // we can't determine the message type
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at length prefix without consuming
        let size =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if size > MAX_MESSAGE_SIZE {
            return Err(Error::MalformedMessage(format!(
                "length {size} is over the limit of {MAX_MESSAGE_SIZE}"
            )));
        }

        // the id is inside the declared length, so it can be checked as soon
        // as it arrives. Nothing is consumed until the whole frame is here.
        if buf.len() >= 5 {
            MessageId::try_from(buf[4])?.validate_len(size)?;
        }

        if buf.len() < 4 + size {
            buf.reserve(4 + size - buf.len());
            return Ok(None);
        }

        let msg_id = MessageId::try_from(buf[4])?;
        buf.advance(5);

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(buf.get_u32()),
            MessageId::Bitfield => {
                let bitfield = buf.split_to(size - 1).to_vec();
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                // size - 1 byte (msg_id) - 4 bytes (index) - 4 bytes (begin)
                let block = buf.split_to(size - 9).to_vec();
                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
        };

        Ok(Some(msg))
    }
}
