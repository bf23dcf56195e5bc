//! Metadata acquisition core of a BitTorrent client.
//!
//! Given an info-hash, usually carried by a magnet uri, this crate
//! discovers peers (DHT, trackers, PEX, hole-punching), negotiates the
//! extension protocol, downloads the info dictionary over ut_metadata
//! (BEP 9), verifies it against the info-hash, and hands the verified
//! bytes to the caller. Verified metadata lands in an on-disk cache and is
//! served from there the next time the same torrent is requested. Web
//! seed urls (BEP 19) are parsed, validated, and exposed for the data
//! transfer that follows.
//!
//! The peer wire, the DHT node, and the tracker announce client are
//! consumed behind the [`Wire`], [`Dht`], and [`Announce`] traits; the
//! engine runs as a single task fed by one message channel, so its state
//! needs no locks.

mod assembler;
mod discovery;
mod error;
mod info_hash;
mod magnet;
mod peer;
mod registry;
mod scheduler;
mod webseed;
mod wire;

pub mod cache;
mod engine;

pub use discovery::{Announce, AnnounceResponse, Dht, Wire};
pub use engine::{Config, Event, EngineMsg, FailReason, MetadataDownload};
pub use error::{Error, Result};
pub use info_hash::InfoHash;
pub use magnet::MagnetDescriptor;
pub use peer::{generate_peer_id, PeerSource, PexEntry, PexFlags, Transport};
pub use webseed::WebSeeds;
pub use wire::{ExtendedHandshake, ExtensionMap, PexMessage, UtMetadata, BLOCK_LEN};

#[cfg(test)]
mod tests;
