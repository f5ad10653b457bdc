//! Connect exchange of the UDP tracker protocol.
use speedy::{BigEndian, Readable, Writable};

use crate::error::Error;

use super::ACTION_CONNECT;

#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Request {
    pub protocol_id: u64,
    pub action: u32,
    pub transaction_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub(crate) const LENGTH: usize = 16;
    pub(crate) const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: ACTION_CONNECT,
            transaction_id: rand::random::<u32>(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::LENGTH {
            return Err(Error::TrackerResponse);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub(crate) const LENGTH: usize = 16;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerResponseLength);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])?)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(self.write_to_vec_with_ctx(BigEndian {})?)
    }
}
