use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;

/// base per-request timeout, stretched by 5s per prior retry, capped at 30s
const BASE_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_STEP: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// retry counts at or past this are worth complaining about
const NOISY_RETRIES: u32 = 3;

/// Decides which block goes to which peer and babysits the outstanding
/// requests.
///
/// Blocks wait in a FIFO queue; a block leaves the queue when requested and
/// either comes back (timeout, reject, peer loss) or lands in the
/// assembler's completed set. While requested it is tracked by exactly one
/// timer under `(peer, block)`, so at any moment
/// `queue + in-flight + completed` partitions the block space.
pub struct Scheduler {
    queue: VecDeque<usize>,
    retries: HashMap<usize, u32>,
    timers: HashMap<(SocketAddr, usize), JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            queue: VecDeque::new(),
            retries: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Loads blocks `0..count`, dropping whatever was queued before.
    pub fn refill(&mut self, count: usize) {
        self.queue = (0..count).collect();
    }

    pub fn requeue(&mut self, block: usize) {
        self.queue.push_back(block);
    }

    /// Drops a block from the wait queue; pairs with [`Scheduler::cancel_block`]
    /// for blocks that complete while waiting for their retry.
    pub fn unqueue(&mut self, block: usize) {
        self.queue.retain(|b| *b != block);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.timers.len()
    }

    /// Pops as many assignments as both sides allow: one block each for
    /// `min(queue, peers)` peers, walking the snapshot round-robin from the
    /// biased peer (a peer that just delivered gets the next request first,
    /// which keeps its pipeline warm).
    pub fn assign(
        &mut self,
        available: &[SocketAddr],
        bias: Option<SocketAddr>,
    ) -> Vec<(SocketAddr, usize)> {
        if available.is_empty() {
            return Vec::new();
        }

        let start = bias
            .and_then(|b| available.iter().position(|a| *a == b))
            .unwrap_or(0);

        let count = self.queue.len().min(available.len());
        let mut assignments = Vec::with_capacity(count);

        for i in 0..count {
            let peer = available[(start + i) % available.len()];
            let block = match self.queue.pop_front() {
                Some(block) => block,
                None => break,
            };

            assignments.push((peer, block));
        }

        assignments
    }

    /// Timeout for the next request of `block`, grown by its retry history.
    pub fn timeout_for(&self, block: usize) -> Duration {
        let retries = self.retries.get(&block).copied().unwrap_or(0);

        (BASE_TIMEOUT + RETRY_STEP * retries).min(MAX_TIMEOUT)
    }

    /// Registers the cancellation handle of the request timer; a stale
    /// timer under the same key is cancelled first.
    pub fn install_timer(&mut self, peer: SocketAddr, block: usize, handle: JoinHandle<()>) {
        if let Some(stale) = self.timers.insert((peer, block), handle) {
            stale.abort();
        }
    }

    /// Cancels the timer for `(peer, block)`. Returns false when no such
    /// timer exists, which is how a late fire for an already-settled block
    /// turns into a no-op.
    pub fn cancel_timer(&mut self, peer: SocketAddr, block: usize) -> bool {
        match self.timers.remove(&(peer, block)) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drops the timer entry without aborting, for use from the timer's own
    /// expiry path.
    pub fn take_expired(&mut self, peer: SocketAddr, block: usize) -> bool {
        self.timers.remove(&(peer, block)).is_some()
    }

    /// Cancels every timer armed for `block`, whoever holds it. A block
    /// that timed out on one peer and was reassigned can still be answered
    /// by the first peer; once its bytes land, the reassigned request is
    /// moot.
    pub fn cancel_block(&mut self, block: usize) {
        let keys: Vec<_> = self
            .timers
            .keys()
            .filter(|(_, b)| *b == block)
            .copied()
            .collect();

        for (peer, block) in keys {
            self.cancel_timer(peer, block);
        }
    }

    /// Cancels every timer a peer holds and returns the blocks it was
    /// sitting on.
    pub fn cancel_peer(&mut self, peer: SocketAddr) -> Vec<usize> {
        let keys: Vec<_> = self
            .timers
            .keys()
            .filter(|(p, _)| *p == peer)
            .copied()
            .collect();

        keys.into_iter()
            .map(|(p, block)| {
                self.cancel_timer(p, block);
                block
            })
            .collect()
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Bumps the retry counter after an expiry. Chronic stragglers are
    /// logged but keep retrying; a dead peer set stalls a download either
    /// way, and a live one will eventually serve the block.
    pub fn record_retry(&mut self, block: usize) -> u32 {
        let count = self.retries.entry(block).or_insert(0);
        *count += 1;

        if *count >= NOISY_RETRIES {
            warn!("metadata block {} timed out {} times", block, count);
        }

        *count
    }

    pub fn clear_retries(&mut self, block: usize) {
        self.retries.remove(&block);
    }

    /// Full reset for a fresh verification attempt: requeues `0..count` and
    /// forgets all timers and retry history.
    pub fn restart(&mut self, count: usize) {
        self.cancel_all();
        self.retries.clear();
        self.refill(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("10.0.0.{}:6881", i + 1).parse().unwrap())
            .collect()
    }

    #[test]
    fn assign_round_robin() {
        let mut scheduler = Scheduler::new();
        scheduler.refill(2);

        let peers = addrs(3);
        let assignments = scheduler.assign(&peers, None);

        // two blocks, three peers: distinct peers in snapshot order
        assert_eq!(assignments, [(peers[0], 0), (peers[1], 1)]);
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn assign_starts_at_bias() {
        let mut scheduler = Scheduler::new();
        scheduler.refill(3);

        let peers = addrs(2);
        let assignments = scheduler.assign(&peers, Some(peers[1]));

        // min(3 blocks, 2 peers) requests, starting from the biased peer
        assert_eq!(assignments, [(peers[1], 0), (peers[0], 1)]);
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[test]
    fn assign_with_no_peers() {
        let mut scheduler = Scheduler::new();
        scheduler.refill(4);

        assert!(scheduler.assign(&[], None).is_empty());
        assert_eq!(scheduler.queue_len(), 4);
    }

    #[test]
    fn timeouts_grow_with_retries_and_cap() {
        let mut scheduler = Scheduler::new();

        assert_eq!(scheduler.timeout_for(7), Duration::from_secs(10));

        scheduler.record_retry(7);
        assert_eq!(scheduler.timeout_for(7), Duration::from_secs(15));

        for _ in 0..10 {
            scheduler.record_retry(7);
        }
        assert_eq!(scheduler.timeout_for(7), Duration::from_secs(30));

        scheduler.clear_retries(7);
        assert_eq!(scheduler.timeout_for(7), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timer_bookkeeping() {
        let mut scheduler = Scheduler::new();
        let peer = addrs(1)[0];

        scheduler.install_timer(peer, 0, tokio::spawn(std::future::pending()));
        scheduler.install_timer(peer, 1, tokio::spawn(std::future::pending()));
        assert_eq!(scheduler.in_flight(), 2);

        assert!(scheduler.cancel_timer(peer, 0));
        // second cancellation finds nothing, like a late fire
        assert!(!scheduler.cancel_timer(peer, 0));

        assert_eq!(scheduler.cancel_peer(peer), [1]);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn settling_a_block_clears_every_trace() {
        let mut scheduler = Scheduler::new();
        let peers = addrs(2);

        // block 0 timed out on peer 0 and was handed to peer 1, then the
        // original answer arrived anyway
        scheduler.requeue(0);
        scheduler.install_timer(peers[1], 0, tokio::spawn(std::future::pending()));

        scheduler.cancel_block(0);
        scheduler.unqueue(0);

        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn restart_forgets_everything() {
        let mut scheduler = Scheduler::new();
        let peer = addrs(1)[0];

        scheduler.refill(2);
        scheduler.record_retry(1);
        scheduler.install_timer(peer, 0, tokio::spawn(std::future::pending()));

        scheduler.restart(2);

        assert_eq!(scheduler.queue_len(), 2);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.timeout_for(1), Duration::from_secs(10));
    }
}
