use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use rand::{distributions::Alphanumeric, rngs::SmallRng, Rng, SeedableRng};

/// Where an address came from. Private torrents (BEP 27) reject `Pex`
/// candidates and shut the DHT down; everything else is always welcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Dht,
    Tracker,
    Pex,
    Holepunch,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Utp,
}

/// Lifecycle of a peer inside one download.
///
/// candidate -> connecting -> connected -> handshaken -> metadata-ready
///
/// `MetadataReady` requires both a `ut_metadata` id and an announced
/// metadata size; only those peers are eligible for block requests.
/// `Disposed` is terminal and the address stays on the seen-list, so a
/// flapping peer is not re-admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Candidate,
    Connecting,
    Connected,
    Handshaken,
    MetadataReady,
    Disposed,
}

#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub transport: Transport,
    pub state: PeerState,
    pub inbound: bool,

    /// remote id from the base wire handshake
    pub id: Option<[u8; 20]>,

    /// extension ids the remote assigned in its extended handshake
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub ut_holepunch: Option<u8>,
}

impl Peer {
    pub fn new(addr: SocketAddr, source: PeerSource, transport: Transport, inbound: bool) -> Peer {
        Peer {
            addr,
            source,
            transport,
            state: PeerState::Candidate,
            inbound,
            id: None,
            ut_metadata: None,
            ut_pex: None,
            ut_holepunch: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != PeerState::Disposed
    }
}

bitflags! {
    /// per-peer flags of a BEP 11 pex entry
    pub struct PexFlags: u8 {
        const PREFERS_ENCRYPTION = 1 << 0;
        const SEED_ONLY          = 1 << 1;
        const SUPPORTS_UTP       = 1 << 2;
        const SUPPORTS_HOLEPUNCH = 1 << 3;
        const REACHABLE          = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PexEntry {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

impl PexEntry {
    /// A peer that says it cannot be reached directly but speaks uTP or
    /// ut_holepunch wants a rendezvous through the peer that advertised it.
    pub fn wants_rendezvous(&self) -> bool {
        !self.flags.contains(PexFlags::REACHABLE)
            && self
                .flags
                .intersects(PexFlags::SUPPORTS_UTP | PexFlags::SUPPORTS_HOLEPUNCH)
    }
}

/// Azureus-style peer id: client tag, then random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as u64)
        .unwrap_or(0);
    let rng = SmallRng::seed_from_u64(seed);

    let mut id = *b"-RT0001-............";
    for (slot, c) in id[8..].iter_mut().zip(rng.sample_iter(&Alphanumeric)) {
        *slot = c;
    }

    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_shape() {
        let id = generate_peer_id();

        assert_eq!(&id[..8], b"-RT0001-");
        assert!(id[8..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn rendezvous_flags() {
        let addr = "10.0.0.1:6881".parse().unwrap();

        let direct = PexEntry { addr, flags: PexFlags::REACHABLE | PexFlags::SUPPORTS_UTP };
        assert!(!direct.wants_rendezvous());

        let natted = PexEntry { addr, flags: PexFlags::SUPPORTS_HOLEPUNCH };
        assert!(natted.wants_rendezvous());

        let unreachable_tcp = PexEntry { addr, flags: PexFlags::empty() };
        assert!(!unreachable_tcp.wants_rendezvous());
    }
}
