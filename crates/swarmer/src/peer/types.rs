use std::fmt::Display;

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

/// Prefix of our peer ids, in the Azureus-style: client id and version.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-SW0100-";

#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a new peer id, the prefix followed by 12 random
    /// alphanumerics.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        let mut rng = rand::thread_rng();
        for b in id[8..].iter_mut() {
            *b = rng.sample(Alphanumeric);
        }
        Self(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] = value
            .try_into()
            .map_err(|_| "The PeerId must have exactly 20 bytes")?;
        Ok(PeerId(buff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_peer_id() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], PEER_ID_PREFIX);
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(PeerId::generate(), id);
    }

    #[test]
    fn display_is_hex() {
        let id = PeerId([0xab; 20]);
        assert_eq!(id.to_string(), "ab".repeat(20));
    }

    #[test]
    fn try_from_vec() {
        assert!(PeerId::try_from(vec![1u8; 20]).is_ok());
        assert!(PeerId::try_from(vec![1u8; 19]).is_err());
    }
}
