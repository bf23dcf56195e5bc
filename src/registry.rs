use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::debug;

use crate::peer::{Peer, PeerSource, PeerState, Transport};

/// Why a candidate was turned away. Rejections are bookkeeping, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OwnAddress,
    Ignored,
    AlreadySeen,
    DuplicateInbound,
}

/// Tracks every peer of one download, keyed by socket address.
///
/// An address is admitted at most once per download: disposed peers leave a
/// tombstone on the seen-list so churning peers cannot loop back in through
/// rediscovery.
pub struct Registry {
    peers: HashMap<SocketAddr, Peer>,
    seen: HashSet<SocketAddr>,

    // insertion-ordered so the scheduler's round-robin snapshot is stable
    available: Vec<SocketAddr>,

    // at most one inbound connection per remote ip
    inbound_ips: HashSet<IpAddr>,

    ignored: HashSet<IpAddr>,
    external_ip: Option<IpAddr>,
}

impl Registry {
    pub fn new(extra_ignored: &[IpAddr], external_ip: Option<IpAddr>) -> Registry {
        let mut ignored: HashSet<IpAddr> = [
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ]
        .into();
        ignored.extend(extra_ignored);

        Registry {
            peers: HashMap::new(),
            seen: HashSet::new(),
            available: Vec::new(),
            inbound_ips: HashSet::new(),
            ignored,
            external_ip,
        }
    }

    /// first writer wins; later reports cannot re-point it
    pub fn set_external_ip(&mut self, ip: IpAddr) {
        if self.external_ip.is_none() {
            self.external_ip = Some(ip);
        }
    }

    pub fn admit(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        transport: Transport,
        inbound: bool,
    ) -> Result<&mut Peer, Rejection> {
        if Some(addr.ip()) == self.external_ip {
            return Err(Rejection::OwnAddress);
        }
        if self.ignored.contains(&addr.ip()) {
            return Err(Rejection::Ignored);
        }
        if self.seen.contains(&addr) {
            return Err(Rejection::AlreadySeen);
        }
        if inbound && !self.inbound_ips.insert(addr.ip()) {
            debug!("dropping second inbound connection from {}", addr.ip());
            return Err(Rejection::DuplicateInbound);
        }

        self.seen.insert(addr);
        Ok(self
            .peers
            .entry(addr)
            .or_insert(Peer::new(addr, source, transport, inbound)))
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(&addr).filter(|p| p.is_active())
    }

    /// Disposes a peer and forgets its availability. The seen-list entry
    /// stays behind.
    pub fn remove(&mut self, addr: SocketAddr) -> Option<Peer> {
        let mut peer = self.peers.remove(&addr)?;
        peer.state = PeerState::Disposed;

        self.available.retain(|a| *a != addr);
        if peer.inbound {
            self.inbound_ips.remove(&addr.ip());
        }

        Some(peer)
    }

    /// Marks a peer eligible for block requests.
    pub fn mark_available(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.state = PeerState::MetadataReady;
            if !self.available.contains(&addr) {
                self.available.push(addr);
            }
        }
    }

    /// Snapshot of metadata-ready peers in admission order.
    pub fn available(&self) -> &[SocketAddr] {
        &self.available
    }

    pub fn active(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_active())
    }

    /// Drops every peer, returning their addresses so the caller can close
    /// the connections.
    pub fn clear(&mut self) -> Vec<SocketAddr> {
        let addrs = self.peers.keys().copied().collect();

        self.peers.clear();
        self.available.clear();
        self.inbound_ips.clear();

        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn admit(registry: &mut Registry, s: &str) -> Result<(), Rejection> {
        registry
            .admit(addr(s), PeerSource::Dht, Transport::Tcp, false)
            .map(|_| ())
    }

    #[test]
    fn dedupes_addresses() {
        let mut registry = Registry::new(&[], None);

        assert!(admit(&mut registry, "10.0.0.1:6881").is_ok());
        assert_eq!(
            admit(&mut registry, "10.0.0.1:6881"),
            Err(Rejection::AlreadySeen)
        );
        // same host, different port is a different peer
        assert!(admit(&mut registry, "10.0.0.1:6882").is_ok());
    }

    #[test]
    fn rejects_ignored_and_own_addresses() {
        let mut registry = Registry::new(
            &[addr("192.0.2.7:1").ip()],
            Some(addr("198.51.100.4:1").ip()),
        );

        assert_eq!(admit(&mut registry, "0.0.0.0:6881"), Err(Rejection::Ignored));
        assert_eq!(admit(&mut registry, "127.0.0.1:6881"), Err(Rejection::Ignored));
        assert_eq!(admit(&mut registry, "192.0.2.7:6881"), Err(Rejection::Ignored));
        assert_eq!(
            admit(&mut registry, "198.51.100.4:6881"),
            Err(Rejection::OwnAddress)
        );
    }

    #[test]
    fn one_inbound_per_ip() {
        let mut registry = Registry::new(&[], None);

        let first = registry.admit(addr("10.0.0.1:50000"), PeerSource::Incoming, Transport::Tcp, true);
        assert!(first.is_ok());

        let second = registry.admit(addr("10.0.0.1:50001"), PeerSource::Incoming, Transport::Tcp, true);
        assert_eq!(second.err(), Some(Rejection::DuplicateInbound));

        // outbound connections are not bound by the inbound rule
        let outbound = registry.admit(addr("10.0.0.1:6881"), PeerSource::Dht, Transport::Tcp, false);
        assert!(outbound.is_ok());
    }

    #[test]
    fn disposed_peers_stay_seen() {
        let mut registry = Registry::new(&[], None);

        admit(&mut registry, "10.0.0.1:6881").unwrap();
        registry.remove(addr("10.0.0.1:6881")).unwrap();

        assert_eq!(
            admit(&mut registry, "10.0.0.1:6881"),
            Err(Rejection::AlreadySeen)
        );
    }

    #[test]
    fn availability_tracks_admission_order() {
        let mut registry = Registry::new(&[], None);

        for peer in ["10.0.0.1:1", "10.0.0.2:1", "10.0.0.3:1"] {
            admit(&mut registry, peer).unwrap();
            registry.mark_available(addr(peer));
        }
        registry.remove(addr("10.0.0.2:1"));

        assert_eq!(registry.available(), [addr("10.0.0.1:1"), addr("10.0.0.3:1")]);
    }
}
