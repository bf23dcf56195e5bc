use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::assembler::{Assembler, BlockOutcome, VerifyOutcome};
use crate::cache;
use crate::discovery::{Announce, Dht, TrackerScan, Wire};
use crate::magnet::MagnetDescriptor;
use crate::peer::{generate_peer_id, PeerSource, PeerState, PexFlags, Transport};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::wire::{ExtendedHandshake, PexMessage, UtMetadata};

/// Events surfaced to whoever started the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// percentage of metadata blocks landed, emitted in completion order
    Progress(u8),

    /// the verified info-dictionary bytes
    Complete(Vec<u8>),

    /// terminal failure; the engine has stopped
    Failed(FailReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// every verification attempt hashed wrong
    Verification,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Verification => write!(f, "metadata failed verification"),
        }
    }
}

/// Everything that can happen to a running download. Collaborators feed
/// these through the sender from [`MetadataDownload::sender`]; the engine
/// consumes them on its single task.
#[derive(Debug)]
pub enum EngineMsg {
    /// base wire handshake finished; the remote introduced itself
    Connected { addr: SocketAddr, peer_id: [u8; 20] },

    /// the remote's extended handshake arrived
    Handshake {
        addr: SocketAddr,
        handshake: ExtendedHandshake,
    },

    /// a ut_metadata message arrived
    Metadata { addr: SocketAddr, message: UtMetadata },

    /// a ut_pex message arrived
    Pex { addr: SocketAddr, message: PexMessage },

    /// the wire layer accepted an inbound connection
    InboundConnection { addr: SocketAddr },

    /// a rendezvous ended with a connectable peer
    HolepunchConnected { addr: SocketAddr },

    /// connection, handshake, or protocol failure; the peer is gone
    PeerFailed { addr: SocketAddr },

    DhtPeers(Vec<SocketAddr>),
    TrackerPeers(Vec<SocketAddr>),

    /// a per-request timer fired
    RequestExpired { addr: SocketAddr, block: usize },

    Stop,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// never admitted as peers, on top of the unspecified and loopback
    /// addresses
    pub ignored_ips: Vec<IpAddr>,

    /// our address as seen from outside, when the caller already knows it;
    /// otherwise the first `yourip` report fills it in
    pub external_ip: Option<IpAddr>,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Idle,
    Running,
}

/// Handle to one running metadata download.
///
/// Dropping the handle does not stop the engine; call
/// [`MetadataDownload::stop`] for that. Stopping twice is a no-op.
pub struct MetadataDownload {
    tx: UnboundedSender<EngineMsg>,
    task: JoinHandle<()>,
}

impl MetadataDownload {
    /// Spawns the engine for `descriptor` onto the current tokio runtime.
    ///
    /// A cached copy of the metadata settles the download immediately,
    /// without touching any collaborator. Otherwise the DHT is started, the
    /// tracker tiers are scanned, and `x.pe` peers from the magnet are
    /// dialed right away.
    pub fn start(
        descriptor: MagnetDescriptor,
        wire: Box<dyn Wire>,
        dht: Box<dyn Dht>,
        announce: Arc<dyn Announce>,
        config: Config,
    ) -> (MetadataDownload, UnboundedReceiver<Event>) {
        let (tx, rx) = unbounded_channel();
        let (events, events_rx) = unbounded_channel();

        let engine = Engine {
            peer_id: generate_peer_id(),
            state: State::Idle,
            private: false,
            registry: Registry::new(&config.ignored_ips, config.external_ip),
            scheduler: Scheduler::new(),
            assembler: Assembler::new(descriptor.info_hash),
            descriptor,
            wire,
            dht,
            announce,
            tracker_scan: None,
            tx: tx.clone(),
            events,
        };
        let task = tokio::spawn(engine.run(rx));

        (MetadataDownload { tx, task }, events_rx)
    }

    /// Channel for collaborator callbacks and external events.
    pub fn sender(&self) -> UnboundedSender<EngineMsg> {
        self.tx.clone()
    }

    pub fn stop(&self) {
        // the engine may already be gone, which is exactly a no-op
        let _ = self.tx.send(EngineMsg::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Engine {
    descriptor: MagnetDescriptor,
    peer_id: [u8; 20],
    state: State,

    /// BEP 27: sticky for the lifetime of the download
    private: bool,

    registry: Registry,
    scheduler: Scheduler,
    assembler: Assembler,

    wire: Box<dyn Wire>,
    dht: Box<dyn Dht>,
    announce: Arc<dyn Announce>,
    tracker_scan: Option<JoinHandle<()>>,

    tx: UnboundedSender<EngineMsg>,
    events: UnboundedSender<Event>,
}

impl Engine {
    async fn run(mut self, mut rx: UnboundedReceiver<EngineMsg>) {
        if let Some(bytes) = cache::read(&self.descriptor.info_hash) {
            info!(
                "metadata for {} served from cache",
                self.descriptor.info_hash
            );
            let _ = self.events.send(Event::Complete(bytes));
            return;
        }

        self.state = State::Running;

        self.dht.start();
        self.dht.lookup(&self.descriptor.info_hash);

        if !self.descriptor.tracker_tiers.is_empty() {
            let scan = TrackerScan::new(
                self.descriptor.tracker_tiers.clone(),
                self.descriptor.info_hash,
                self.announce.clone(),
                self.tx.clone(),
            );
            self.tracker_scan = Some(tokio::spawn(scan.run()));
        }

        // peers named in the magnet skip discovery entirely
        for addr in self.descriptor.peers.clone() {
            self.add_candidate(addr, PeerSource::Incoming, Transport::Tcp, false);
        }

        while self.state == State::Running {
            match rx.recv().await {
                Some(msg) => self.handle(msg),
                None => break,
            }
        }
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Connected { addr, peer_id } => self.on_connected(addr, peer_id),
            EngineMsg::Handshake { addr, handshake } => self.on_handshake(addr, handshake),
            EngineMsg::Metadata { addr, message } => self.on_metadata(addr, message),
            EngineMsg::Pex { addr, message } => self.on_pex(addr, message),
            EngineMsg::InboundConnection { addr } => {
                self.add_candidate(addr, PeerSource::Incoming, Transport::Tcp, true);
            }
            EngineMsg::HolepunchConnected { addr } => {
                self.add_candidate(addr, PeerSource::Holepunch, Transport::Utp, false);
            }
            EngineMsg::PeerFailed { addr } => self.on_peer_failed(addr),
            EngineMsg::DhtPeers(addrs) => {
                for addr in addrs {
                    self.add_candidate(addr, PeerSource::Dht, Transport::Tcp, false);
                }
            }
            EngineMsg::TrackerPeers(addrs) => {
                for addr in addrs {
                    self.add_candidate(addr, PeerSource::Tracker, Transport::Tcp, false);
                }
            }
            EngineMsg::RequestExpired { addr, block } => self.on_request_expired(addr, block),
            EngineMsg::Stop => self.stop(),
        }
    }

    fn add_candidate(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        transport: Transport,
        inbound: bool,
    ) {
        if self.state != State::Running {
            return;
        }
        if self.private && source == PeerSource::Pex {
            debug!("refusing pex candidate {} on a private torrent", addr);
            return;
        }

        match self.registry.admit(addr, source, transport, inbound) {
            Ok(peer) => {
                peer.state = PeerState::Connecting;
                trace!("dialing {} (source {:?})", addr, source);
                self.wire.connect(addr, transport, self.peer_id);
            }
            Err(rejection) => {
                trace!("candidate {} rejected: {:?}", addr, rejection);
                if inbound {
                    self.wire.disconnect(addr);
                }
            }
        }
    }

    fn on_connected(&mut self, addr: SocketAddr, peer_id: [u8; 20]) {
        match self.registry.get_mut(addr) {
            Some(peer) => {
                peer.state = PeerState::Connected;
                peer.id = Some(peer_id);
            }
            // connected callback for a peer we already gave up on
            None => self.wire.disconnect(addr),
        }
    }

    fn on_handshake(&mut self, addr: SocketAddr, handshake: ExtendedHandshake) {
        {
            let Some(peer) = self.registry.get_mut(addr) else {
                return;
            };

            peer.state = PeerState::Handshaken;
            peer.ut_metadata = handshake.m.ut_metadata;
            peer.ut_pex = handshake.m.ut_pex;
            peer.ut_holepunch = handshake.m.ut_holepunch;
        }

        if handshake.is_private() && !self.private {
            self.private = true;
            info!(
                "{} is a private torrent; dht stopped, pex disabled",
                self.descriptor.info_hash
            );
            self.dht.stop();
        }

        if let Some(ip) = handshake.your_ip() {
            self.registry.set_external_ip(ip);
        }

        if let Some(size) = handshake.usable_metadata_size() {
            match self.assembler.metadata_size() {
                None => {
                    let blocks = self.assembler.install_size(size as usize);
                    self.scheduler.refill(blocks);
                    info!("metadata size fixed at {} bytes ({} blocks)", size, blocks);
                }
                Some(known) if known != size as usize => {
                    // first writer wins; see the integration notes
                    debug!(
                        "{} announced metadata size {} after it was fixed at {}",
                        addr, size, known
                    );
                }
                Some(_) => {}
            }
        }

        let ready = handshake.m.ut_metadata.is_some() && handshake.usable_metadata_size().is_some();
        if ready {
            self.registry.mark_available(addr);
            self.schedule(Some(addr));
        }
    }

    fn on_metadata(&mut self, addr: SocketAddr, message: UtMetadata) {
        match message {
            UtMetadata::Piece { piece, data, .. } => {
                // cancel first: a timer that fires from here on finds its
                // key gone and no-ops
                let was_in_flight = self.scheduler.cancel_timer(addr, piece);
                self.scheduler.clear_retries(piece);

                match self.assembler.accept(piece, &data) {
                    BlockOutcome::Accepted {
                        percent,
                        buffer_full,
                    } => {
                        // after a timeout the block may be pending on
                        // another peer or waiting for its retry; either
                        // way it is settled now
                        self.scheduler.cancel_block(piece);
                        self.scheduler.unqueue(piece);

                        let _ = self.events.send(Event::Progress(percent));

                        if buffer_full {
                            self.finish_attempt();
                            if self.state == State::Idle {
                                return;
                            }
                        }
                    }

                    // a spent request whose payload didn't land leaves the
                    // block without a home; put it back in line
                    BlockOutcome::Ignored => {
                        if was_in_flight && !self.assembler.has_block(piece) {
                            self.scheduler.requeue(piece);
                        }
                    }
                }

                // keep the delivering peer's pipeline warm
                self.schedule(Some(addr));
            }

            UtMetadata::Reject { piece } => {
                debug!("{} rejected metadata block {}", addr, piece);

                if self.scheduler.cancel_timer(addr, piece) {
                    self.scheduler.requeue(piece);
                }
                self.schedule(None);
            }

            // serving metadata is someone else's job
            UtMetadata::Request { piece } => {
                trace!("ignoring metadata request for block {} from {}", piece, addr);
            }
        }
    }

    /// All blocks are down: run the sha-1 gate and settle or restart.
    fn finish_attempt(&mut self) {
        match self.assembler.verify() {
            VerifyOutcome::Verified(bytes) => {
                if let Err(e) = cache::write(&self.descriptor.info_hash, &bytes) {
                    warn!(
                        "could not cache metadata for {}: {}",
                        self.descriptor.info_hash, e
                    );
                }

                info!(
                    "metadata for {} verified, {} bytes",
                    self.descriptor.info_hash,
                    bytes.len()
                );
                let _ = self.events.send(Event::Complete(bytes));
                self.stop();
            }

            VerifyOutcome::Restarted => {
                self.scheduler.restart(self.assembler.block_count());
                self.schedule(None);
            }

            VerifyOutcome::Exhausted => {
                let _ = self.events.send(Event::Failed(FailReason::Verification));
                self.stop();
            }
        }
    }

    fn on_pex(&mut self, addr: SocketAddr, message: PexMessage) {
        if self.private {
            debug!("dropping pex message from {} on a private torrent", addr);
            return;
        }

        for entry in message.entries() {
            if entry.wants_rendezvous() {
                trace!("holepunch rendezvous for {} via {}", entry.addr, addr);
                self.wire.rendezvous(addr, entry.addr);
            } else {
                let transport = if entry.flags.contains(PexFlags::SUPPORTS_UTP) {
                    Transport::Utp
                } else {
                    Transport::Tcp
                };
                self.add_candidate(entry.addr, PeerSource::Pex, transport, false);
            }
        }
    }

    fn on_peer_failed(&mut self, addr: SocketAddr) {
        if self.registry.remove(addr).is_none() {
            return;
        }
        debug!("peer {} disposed", addr);

        // its outstanding blocks go back in line for everyone else
        for block in self.scheduler.cancel_peer(addr) {
            self.scheduler.requeue(block);
        }

        self.schedule(None);
    }

    fn on_request_expired(&mut self, addr: SocketAddr, block: usize) {
        if !self.scheduler.take_expired(addr, block) {
            // the response won the race
            return;
        }

        self.scheduler.record_retry(block);
        self.scheduler.requeue(block);
        self.schedule(None);
    }

    /// Issues requests until the queue or the availability set runs dry,
    /// arming one timer per request.
    fn schedule(&mut self, bias: Option<SocketAddr>) {
        if self.state != State::Running || !self.assembler.size_known() {
            return;
        }

        debug_assert_eq!(
            self.scheduler.queue_len() + self.scheduler.in_flight() + self.assembler.completed(),
            self.assembler.block_count(),
        );

        for (peer_addr, block) in self.scheduler.assign(self.registry.available(), bias) {
            let Some(id) = self.registry.get_mut(peer_addr).and_then(|p| p.ut_metadata) else {
                // availability raced with disposal; hand the block back
                self.scheduler.requeue(block);
                continue;
            };

            trace!("requesting metadata block {} from {}", block, peer_addr);
            self.wire.request(peer_addr, id, block);

            let deadline = self.scheduler.timeout_for(block);
            let tx = self.tx.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(EngineMsg::RequestExpired {
                    addr: peer_addr,
                    block,
                });
            });
            self.scheduler.install_timer(peer_addr, block, timer);
        }
    }

    /// Idempotent teardown: refuse re-entrancy first, then dismantle in
    /// dependency order.
    fn stop(&mut self) {
        if self.state == State::Idle {
            return;
        }
        self.state = State::Idle;

        debug!("disposing {} peers", self.registry.active().count());

        self.scheduler.cancel_all();
        for addr in self.registry.clear() {
            self.wire.disconnect(addr);
        }
        self.dht.stop();
        if let Some(scan) = self.tracker_scan.take() {
            scan.abort();
        }

        info!("metadata engine for {} stopped", self.descriptor.info_hash);
    }
}
