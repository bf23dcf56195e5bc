use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32;

use crate::error::{Error, Result};

/// Identifies a v1 torrent: the sha-1 of its bencoded info dictionary.
///
/// Magnet uris carry it as 40 hex characters or 32 base32 characters; both
/// forms are case-insensitive. The canonical textual view is lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub const LEN: usize = 20;

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// lowercase hex, the form used for cache keys and `to_uri`
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<InfoHash> {
        if s.len() != 2 * Self::LEN {
            return Err(Error::InvalidInfoHash);
        }

        let mut bytes = [0; Self::LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidInfoHash)?;

        Ok(InfoHash(bytes))
    }

    /// rfc 4648 base32, no padding; 32 characters decode to exactly 20 bytes
    pub fn from_base32(s: &str) -> Result<InfoHash> {
        if s.len() != 32 {
            return Err(Error::InvalidInfoHash);
        }

        let raw = BASE32
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidInfoHash)?;

        let bytes = raw.try_into().map_err(|_| Error::InvalidInfoHash)?;
        Ok(InfoHash(bytes))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        InfoHash(bytes)
    }
}

impl FromStr for InfoHash {
    type Err = Error;

    // hex and base32 encodings never share a length, so dispatch on it
    fn from_str(s: &str) -> Result<InfoHash> {
        match s.len() {
            40 => InfoHash::from_hex(s),
            32 => InfoHash::from_base32(s),
            _ => Err(Error::InvalidInfoHash),
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    // hex reads better than a byte list in peer logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}
