//! Fake collaborators for driving the engine without sockets, plus the
//! process-wide cache directory every test shares.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::cache;
use crate::discovery::{Announce, AnnounceResponse, Dht, Wire};
use crate::error::{Error, Result};
use crate::info_hash::InfoHash;
use crate::peer::Transport;

/// The cache directory is set-once per process, so every test funnels
/// through this one tempdir; per-test info hashes keep entries apart.
pub static CACHE_DIR: Lazy<TempDir> = Lazy::new(|| {
    let dir = tempfile::tempdir().unwrap();
    assert!(cache::set_directory(dir.path()));
    dir
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCall {
    Connect(SocketAddr, Transport),
    Request(SocketAddr, u8, usize),
    Rendezvous(SocketAddr, SocketAddr),
    Disconnect(SocketAddr),
}

/// Streams every command the engine issues back to the test.
#[derive(Clone)]
pub struct FakeWire {
    tx: UnboundedSender<WireCall>,
}

pub fn fake_wire() -> (FakeWire, UnboundedReceiver<WireCall>) {
    let (tx, rx) = unbounded_channel();
    (FakeWire { tx }, rx)
}

impl Wire for FakeWire {
    fn connect(&mut self, addr: SocketAddr, transport: Transport, _peer_id: [u8; 20]) {
        let _ = self.tx.send(WireCall::Connect(addr, transport));
    }

    fn request(&mut self, addr: SocketAddr, ut_metadata_id: u8, block: usize) {
        let _ = self.tx.send(WireCall::Request(addr, ut_metadata_id, block));
    }

    fn rendezvous(&mut self, relay: SocketAddr, target: SocketAddr) {
        let _ = self.tx.send(WireCall::Rendezvous(relay, target));
    }

    fn disconnect(&mut self, addr: SocketAddr) {
        let _ = self.tx.send(WireCall::Disconnect(addr));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtCall {
    Start,
    Lookup(InfoHash),
    Stop,
}

#[derive(Clone)]
pub struct FakeDht {
    tx: UnboundedSender<DhtCall>,
}

pub fn fake_dht() -> (FakeDht, UnboundedReceiver<DhtCall>) {
    let (tx, rx) = unbounded_channel();
    (FakeDht { tx }, rx)
}

impl Dht for FakeDht {
    fn start(&mut self) {
        let _ = self.tx.send(DhtCall::Start);
    }

    fn lookup(&mut self, info_hash: &InfoHash) {
        let _ = self.tx.send(DhtCall::Lookup(*info_hash));
    }

    fn stop(&mut self) {
        let _ = self.tx.send(DhtCall::Stop);
    }
}

/// A tracker client that never answers; tests push peers in directly.
pub struct SilentTracker;

impl Announce for SilentTracker {
    fn announce(
        &self,
        _url: &str,
        _info_hash: &InfoHash,
    ) -> BoxFuture<'static, Result<AnnounceResponse>> {
        async {
            Err(Error::InvalidTrackerResp {
                failure_reason: None,
            })
        }
        .boxed()
    }
}
