use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;

use crate::engine::EngineMsg;
use crate::error::Result;
use crate::info_hash::InfoHash;
use crate::peer::Transport;

/// Commands the engine issues to the peer-wire layer it was handed.
///
/// Implementations own the sockets, the base handshake, and the extension
/// handshake exchange; everything they learn flows back into the engine as
/// [`EngineMsg`]s on the channel the engine hands out.
pub trait Wire: Send {
    /// Open (or adopt) a connection to `addr` and run the handshakes,
    /// introducing ourselves as `peer_id`.
    fn connect(&mut self, addr: SocketAddr, transport: Transport, peer_id: [u8; 20]);

    /// Send a ut_metadata request for one block, addressed with the
    /// extension id the remote chose in its handshake.
    fn request(&mut self, addr: SocketAddr, ut_metadata_id: u8, block: usize);

    /// BEP 55 rendezvous: ask `relay` to introduce us to `target`.
    fn rendezvous(&mut self, relay: SocketAddr, target: SocketAddr);

    fn disconnect(&mut self, addr: SocketAddr);
}

/// The mainline DHT node, owned elsewhere. Peers found for an info-hash
/// come back as [`EngineMsg::DhtPeers`].
pub trait Dht: Send {
    fn start(&mut self);

    fn lookup(&mut self, info_hash: &InfoHash);

    fn stop(&mut self);
}

/// One announce against one tracker url.
pub trait Announce: Send + Sync {
    fn announce(
        &self,
        url: &str,
        info_hash: &InfoHash,
    ) -> BoxFuture<'static, Result<AnnounceResponse>>;
}

pub struct AnnounceResponse {
    /// seconds until the tracker wants to hear from us again
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

// re-announce pacing: never hammer a tracker, never trust a zero interval
const MIN_REANNOUNCE: Duration = Duration::from_secs(60);
const EMPTY_SCAN_DELAY: Duration = Duration::from_secs(120);

/// Walks the tracker tiers for one download, feeding every batch of peers
/// into the engine. Runs as its own task and dies by abort when the engine
/// stops.
pub(crate) struct TrackerScan {
    tiers: Vec<Vec<String>>,
    info_hash: InfoHash,
    announce: Arc<dyn Announce>,
    engine: UnboundedSender<EngineMsg>,
}

impl TrackerScan {
    pub(crate) fn new(
        tiers: Vec<Vec<String>>,
        info_hash: InfoHash,
        announce: Arc<dyn Announce>,
        engine: UnboundedSender<EngineMsg>,
    ) -> TrackerScan {
        TrackerScan {
            tiers,
            info_hash,
            announce,
            engine,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let delay = match self.scan().await {
                Some(interval) => MIN_REANNOUNCE.max(Duration::from_secs(interval)),
                None => EMPTY_SCAN_DELAY,
            };

            tokio::time::sleep(delay).await;
        }
    }

    /// Tries every tracker in tier order until one answers, then promotes
    /// the responder to the front of its tier so the next scan starts
    /// there (BEP 12). Returns the responder's re-announce interval, or
    /// `None` when every tier came up dry.
    async fn scan(&mut self) -> Option<u64> {
        for outer in 0..self.tiers.len() {
            for inner in 0..self.tiers[outer].len() {
                let tracker = &self.tiers[outer][inner];

                let resp = match self.announce.announce(tracker, &self.info_hash).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        debug!("tracker {} announce failed: {}", tracker, e);
                        continue;
                    }
                };

                info!("tracker {} returned {} peers", tracker, resp.peers.len());

                // keep the responder first in its own tier, preserving
                // tier order
                self.tiers[outer][..=inner].rotate_right(1);

                if self.engine.send(EngineMsg::TrackerPeers(resp.peers)).is_err() {
                    // engine is gone; this task is about to be aborted
                    return None;
                }

                return Some(resp.interval);
            }
        }

        None
    }
}
