//! Payloads of the BEP 10 extension messages the engine consumes and
//! produces. Framing, the base peer wire, and the extension handshake
//! exchange itself belong to the caller's wire layer; this module only
//! reads and writes message bodies.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use byteorder::{ByteOrder, BE};
use serde::Deserialize;
use serde_bytes::ByteBuf;

use crate::peer::{PexEntry, PexFlags};

/// ut_metadata moves the info dictionary in fixed 16 KiB slices
pub const BLOCK_LEN: usize = 16 * 1024;

/// upper bound on a plausible info dictionary
pub const MAX_METADATA_SIZE: i64 = 64 << 20;

/// Decoded extended handshake (BEP 10). Unknown keys are ignored; every
/// field we care about is optional on the wire.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExtendedHandshake {
    #[serde(default)]
    pub m: ExtensionMap,

    #[serde(default)]
    pub metadata_size: Option<i64>,

    /// BEP 27; 1 marks the torrent private
    #[serde(default)]
    pub private: Option<i64>,

    /// our address as the remote sees it, 4 or 16 raw bytes
    #[serde(default)]
    pub yourip: Option<ByteBuf>,
}

/// The `m` dictionary: extension name to the message id the remote chose.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExtensionMap {
    #[serde(default)]
    pub ut_metadata: Option<u8>,

    #[serde(default)]
    pub ut_pex: Option<u8>,

    #[serde(default)]
    pub ut_holepunch: Option<u8>,
}

impl ExtendedHandshake {
    pub fn decode(raw: &[u8]) -> Option<ExtendedHandshake> {
        serde_bencode::from_bytes(raw).ok()
    }

    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }

    /// announced size, filtered down to something a sane client would send
    pub fn usable_metadata_size(&self) -> Option<i64> {
        self.metadata_size
            .filter(|&size| size > 0 && size <= MAX_METADATA_SIZE)
    }

    pub fn your_ip(&self) -> Option<IpAddr> {
        match self.yourip.as_deref()?.as_slice() {
            &[a, b, c, d] => Some(Ipv4Addr::new(a, b, c, d).into()),
            bytes if bytes.len() == 16 => {
                let mut v6 = [0; 16];
                v6.copy_from_slice(bytes);
                Some(IpAddr::from(v6))
            }
            _ => None,
        }
    }
}

/// Decoded ut_metadata message (BEP 9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadata {
    Request {
        piece: usize,
    },
    Piece {
        piece: usize,
        total_size: Option<i64>,
        data: Vec<u8>,
    },
    Reject {
        piece: usize,
    },
}

#[derive(Deserialize)]
struct UtMetadataPrefix {
    msg_type: i64,

    piece: i64,

    #[serde(default)]
    total_size: Option<i64>,
}

impl UtMetadata {
    const REQUEST: i64 = 0;
    const PIECE: i64 = 1;
    const REJECT: i64 = 2;

    /// Splits the bencoded prefix from the trailing block bytes and decodes
    /// it. The prefix is a flat dictionary of integers, so it ends at the
    /// first `ee` (integer end + dictionary end); a message without that
    /// marker is not a ut_metadata message and decodes to `None`.
    pub fn decode(raw: &[u8]) -> Option<UtMetadata> {
        let end = raw.windows(2).position(|w| w == b"ee")? + 2;
        let prefix: UtMetadataPrefix = serde_bencode::from_bytes(&raw[..end]).ok()?;

        let piece = usize::try_from(prefix.piece).ok()?;

        match prefix.msg_type {
            Self::REQUEST => Some(UtMetadata::Request { piece }),
            Self::PIECE => Some(UtMetadata::Piece {
                piece,
                total_size: prefix.total_size,
                data: raw[end..].to_vec(),
            }),
            Self::REJECT => Some(UtMetadata::Reject { piece }),
            _ => None,
        }
    }

    /// Encodes a block request, the only ut_metadata message this crate
    /// sends. The body is a fixed two-key dictionary.
    pub fn encode_request(piece: usize) -> Vec<u8> {
        format!("d8:msg_typei{}e5:piecei{}ee", Self::REQUEST, piece).into_bytes()
    }
}

/// Decoded ut_pex message (BEP 11). Dropped-peer lists are irrelevant to a
/// metadata download and are not decoded.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PexMessage {
    #[serde(default)]
    pub added: Option<ByteBuf>,

    #[serde(default, rename = "added.f")]
    pub added_f: Option<ByteBuf>,

    #[serde(default)]
    pub added6: Option<ByteBuf>,

    #[serde(default, rename = "added6.f")]
    pub added6_f: Option<ByteBuf>,
}

impl PexMessage {
    pub fn decode(raw: &[u8]) -> Option<PexMessage> {
        serde_bencode::from_bytes(raw).ok()
    }

    /// Pairs every compact address with its flag byte. Peers past the end
    /// of the flag list get empty flags.
    pub fn entries(&self) -> Vec<PexEntry> {
        let mut entries = Vec::new();

        let flags = |raw: &Option<ByteBuf>, i: usize| {
            raw.as_deref()
                .and_then(|f| f.get(i).copied())
                .map_or(PexFlags::empty(), PexFlags::from_bits_truncate)
        };

        if let Some(added) = self.added.as_deref() {
            for (i, addr) in decode_compact_v4(added).into_iter().enumerate() {
                entries.push(PexEntry { addr, flags: flags(&self.added_f, i) });
            }
        }

        if let Some(added6) = self.added6.as_deref() {
            for (i, addr) in decode_compact_v6(added6).into_iter().enumerate() {
                entries.push(PexEntry { addr, flags: flags(&self.added6_f, i) });
            }
        }

        entries
    }
}

// compact address lists: 4-byte ip + 2-byte big-endian port per entry
// (18 bytes for the v6 form); a trailing partial entry is discarded
pub fn decode_compact_v4(raw: &[u8]) -> Vec<SocketAddr> {
    raw.chunks_exact(6)
        .map(|host| {
            let ip = Ipv4Addr::new(host[0], host[1], host[2], host[3]);
            SocketAddrV4::new(ip, BE::read_u16(&host[4..])).into()
        })
        .collect()
}

pub fn decode_compact_v6(raw: &[u8]) -> Vec<SocketAddr> {
    raw.chunks_exact(18)
        .map(|host| {
            let mut ip = [0; 16];
            ip.copy_from_slice(&host[..16]);
            SocketAddrV6::new(ip.into(), BE::read_u16(&host[16..]), 0, 0).into()
        })
        .collect()
}
