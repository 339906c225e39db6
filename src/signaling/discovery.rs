//! Polling discovery of the peers in a network
//!
//! Every tick the loop lists the network, diffs the result against the peers
//! it already drives and starts or stops [`PeerConnectionDriver`]s.
//!
//! A remote peer may discover us first and send its offer before our own
//! poll has seen it. The loop keeps a subscription of its own and stashes
//! such early messages per sender; a new driver gets the ones dispatched
//! before its own subscription, ordered by dispatch sequence.
//!
//! The stash only holds messages from senders the loop has not seen yet.
//! Messages from a peer that dropped out of the last poll are discarded,
//! stashes age out after [`EARLY_SIGNAL_POLLS`] polls, and at most
//! [`EARLY_SIGNAL_PEERS`] senders are kept.

use peerlink_relay::{PeerId, PeerRecord};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::driver::{DriverContext, PeerConnectionDriver};
use super::listeners::{RelaySubscription, Relayed};
use super::types::ConnectionState;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Early messages kept per undiscovered sender
pub const EARLY_SIGNAL_BACKLOG: usize = 64;

/// Undiscovered senders stashed at once; the least recently active is evicted
pub const EARLY_SIGNAL_PEERS: usize = 32;

/// Polls a stash survives without its sender showing up
pub const EARLY_SIGNAL_POLLS: u64 = 5;

/// Running drivers of one session, keyed by remote peer
#[derive(Clone, Default)]
pub struct DriverSet {
    inner: Arc<Mutex<HashMap<PeerId, PeerConnectionDriver>>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, PeerConnectionDriver>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, driver: PeerConnectionDriver) {
        self.lock().insert(driver.remote().peer_id.clone(), driver);
    }

    fn remove(&self, peer_id: &PeerId) -> Option<PeerConnectionDriver> {
        self.lock().remove(peer_id)
    }

    fn take_all(&self) -> Vec<PeerConnectionDriver> {
        self.lock().drain().map(|(_, driver)| driver).collect()
    }

    pub fn states(&self) -> Vec<(PeerRecord, ConnectionState)> {
        let mut states: Vec<_> = self
            .lock()
            .values()
            .map(|d| (d.remote().clone(), d.state()))
            .collect();
        states.sort_by_key(|(record, _)| record.peer_index);
        states
    }

    pub fn watch(&self, peer_id: &PeerId) -> Option<watch::Receiver<ConnectionState>> {
        self.lock().get(peer_id).map(|d| d.watch_state())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Change between two polls
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryDelta {
    pub added: Vec<PeerRecord>,
    pub removed: Vec<PeerId>,
}

impl DiscoveryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff a fresh peer list against the known remote peers, ignoring `local`
pub fn diff(known: &HashMap<PeerId, PeerRecord>, records: &[PeerRecord], local: &PeerId) -> DiscoveryDelta {
    let added = records
        .iter()
        .filter(|r| &r.peer_id != local && !known.contains_key(&r.peer_id))
        .cloned()
        .collect();

    let mut removed: Vec<PeerId> = known
        .keys()
        .filter(|id| !records.iter().any(|r| &r.peer_id == *id))
        .cloned()
        .collect();
    removed.sort();

    DiscoveryDelta { added, removed }
}

struct EarlyQueue {
    messages: VecDeque<Relayed>,
    /// Poll count when the last message arrived
    last_poll: u64,
}

impl EarlyQueue {
    fn last_seq(&self) -> u64 {
        self.messages.back().map(|r| r.seq).unwrap_or(0)
    }
}

pub struct PeerDiscoveryLoop {
    ctx: DriverContext,
    poll_interval: Duration,
    known: HashMap<PeerId, PeerRecord>,
    drivers: DriverSet,
    early: RelaySubscription,
    stash: HashMap<PeerId, EarlyQueue>,
    /// Peers removed by the latest poll; their in-flight messages are stale
    departed: HashSet<PeerId>,
    polls: u64,
    backlog_limit: usize,
    stash_peers: usize,
}

impl PeerDiscoveryLoop {
    /// `early` must be subscribed before the join request goes out
    pub fn new(ctx: DriverContext, poll_interval: Duration, drivers: DriverSet, early: RelaySubscription) -> Self {
        Self {
            ctx,
            poll_interval,
            known: HashMap::new(),
            drivers,
            early,
            stash: HashMap::new(),
            departed: HashSet::new(),
            polls: 0,
            backlog_limit: EARLY_SIGNAL_BACKLOG,
            stash_peers: EARLY_SIGNAL_PEERS,
        }
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit;
        self
    }

    pub fn with_stash_peers(mut self, peers: usize) -> Self {
        self.stash_peers = peers.max(1);
        self
    }

    /// Poll until shutdown, then close every driver
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "Discovering peers in {} every {:?}",
            self.ctx.network_id, self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(relayed) = self.early.recv() => {
                    self.stash_message(relayed);
                }
                _ = ticker.tick() => {
                    let api = self.ctx.api.clone();
                    // Shutdown wins over a reply that is ready at the same time
                    let result = tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown_rx) => {
                            debug!("Discarding peer list of {} after shutdown", self.ctx.network_id);
                            break;
                        }
                        result = api.list(&self.ctx.network_id) => result,
                    };
                    match result {
                        Ok(records) => {
                            self.apply(&records).await;
                        }
                        Err(e) => warn!("Polling peers of {} failed: {}", self.ctx.network_id, e),
                    }
                }
            }
        }

        self.close_all().await;
        debug!("Discovery of {} stopped", self.ctx.network_id);
    }

    /// Start and stop drivers for the difference against `records`
    pub async fn apply(&mut self, records: &[PeerRecord]) -> DiscoveryDelta {
        // Whatever arrived while listing still belongs to the previous poll
        self.drain_early();
        self.polls += 1;
        self.departed.clear();
        self.expire_stash();

        let delta = diff(&self.known, records, &self.ctx.local.peer_id);
        if delta.is_empty() {
            return delta;
        }

        for peer_id in &delta.removed {
            self.known.remove(peer_id);
            self.stash.remove(peer_id);
            self.departed.insert(peer_id.clone());
            if let Some(driver) = self.drivers.remove(peer_id) {
                info!("Peer {} left {}", peer_id.short(), self.ctx.network_id);
                driver.close().await;
            }
        }

        for record in &delta.added {
            info!(
                "Peer {} (index {}) found in {}",
                record.peer_id.short(),
                record.peer_index,
                self.ctx.network_id
            );
            let subscription = self.ctx.api.listeners().subscribe();
            self.drain_early();

            let since = subscription.since();
            let backlog = self
                .stash
                .remove(&record.peer_id)
                .map(|queue| queue.messages)
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.seq < since)
                .map(|r| r.message)
                .collect();

            self.known.insert(record.peer_id.clone(), record.clone());
            self.drivers
                .insert(PeerConnectionDriver::spawn(&self.ctx, record.clone(), subscription, backlog));
        }

        delta
    }

    fn drain_early(&mut self) {
        while let Some(relayed) = self.early.try_recv() {
            self.stash_message(relayed);
        }
    }

    fn stash_message(&mut self, relayed: Relayed) {
        let message = &relayed.message;
        if message.network_id != self.ctx.network_id
            || message.target_peer_id != self.ctx.local.peer_id
            || self.known.contains_key(&message.from_peer_id)
        {
            return;
        }
        if self.departed.contains(&message.from_peer_id) {
            debug!(
                "Dropping late message from departed peer {}",
                message.from_peer_id.short()
            );
            return;
        }

        let from = message.from_peer_id.clone();
        if !self.stash.contains_key(&from) && self.stash.len() >= self.stash_peers {
            self.evict_idlest();
        }

        trace!("Stashing early message from {}", from.short());
        let polls = self.polls;
        let queue = self.stash.entry(from).or_insert_with(|| EarlyQueue {
            messages: VecDeque::new(),
            last_poll: polls,
        });
        queue.messages.push_back(relayed);
        queue.last_poll = polls;
        while queue.messages.len() > self.backlog_limit {
            queue.messages.pop_front();
        }
    }

    fn evict_idlest(&mut self) {
        let idlest = self
            .stash
            .iter()
            .min_by_key(|(_, queue)| queue.last_seq())
            .map(|(peer_id, _)| peer_id.clone());
        if let Some(peer_id) = idlest {
            debug!("Stash full, dropping early messages from {}", peer_id.short());
            self.stash.remove(&peer_id);
        }
    }

    fn expire_stash(&mut self) {
        let polls = self.polls;
        self.stash.retain(|peer_id, queue| {
            let keep = polls - queue.last_poll <= EARLY_SIGNAL_POLLS;
            if !keep {
                debug!("Expiring early messages from {}", peer_id.short());
            }
            keep
        });
    }

    /// Stashed messages from `peer_id`
    pub fn stashed(&self, peer_id: &PeerId) -> usize {
        self.stash.get(peer_id).map(|q| q.messages.len()).unwrap_or(0)
    }

    /// Senders with stashed messages
    pub fn stashed_peers(&self) -> usize {
        self.stash.len()
    }

    async fn close_all(&mut self) {
        for driver in self.drivers.take_all() {
            driver.close().await;
        }
        self.known.clear();
        self.stash.clear();
        self.departed.clear();
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::api::SignalingApi;
    use crate::signaling::error::{Result, SignalingError};
    use crate::signaling::listeners::RelayListeners;
    use crate::signaling::local::LocalSignaling;
    use crate::signaling::tests::{wait_until, Recorder};
    use crate::signaling::types::LocalPeer;
    use async_trait::async_trait;
    use peerlink_relay::{NetworkId, SignalMessage, SignalingHub, UserId};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    fn record(id: &str, index: u64) -> PeerRecord {
        PeerRecord {
            peer_id: PeerId::from(id),
            peer_index: index,
            user_id: UserId::from(id),
        }
    }

    #[test]
    fn test_diff_excludes_local_and_known() {
        let mut known = HashMap::new();
        known.insert(PeerId::from("b"), record("b", 1));
        known.insert(PeerId::from("c"), record("c", 2));

        let delta = diff(
            &known,
            &[record("me", 0), record("b", 1), record("d", 3)],
            &PeerId::from("me"),
        );
        assert_eq!(delta.added, vec![record("d", 3)]);
        assert_eq!(delta.removed, vec![PeerId::from("c")]);

        let delta = diff(&HashMap::new(), &[record("me", 0)], &PeerId::from("me"));
        assert!(delta.is_empty());
    }

    fn context(api: Arc<LocalSignaling>, recorder: &Recorder, index: u64) -> DriverContext {
        let peer_id = api.peer_id().clone();
        DriverContext {
            api,
            negotiator: Arc::new(recorder.clone()),
            network_id: NetworkId::from("net1"),
            local: LocalPeer {
                user_id: UserId::new(peer_id.as_str()),
                peer_id,
            },
            local_index: index,
        }
    }

    #[tokio::test]
    async fn test_apply_starts_and_stops_drivers() {
        let hub = Arc::new(SignalingHub::default());
        let b = Arc::new(LocalSignaling::connect(hub, PeerId::from("b")));
        let recorder = Recorder::default();
        let drivers = DriverSet::new();
        let early = b.listeners().subscribe();
        let mut discovery =
            PeerDiscoveryLoop::new(context(b.clone(), &recorder, 1), DEFAULT_POLL_INTERVAL, drivers.clone(), early);

        let delta = discovery.apply(&[record("a", 0), record("b", 1)]).await;
        assert_eq!(delta.added, vec![record("a", 0)]);
        assert_eq!(drivers.len(), 1);
        let mut state = drivers.watch(&PeerId::from("a")).unwrap();

        assert!(discovery.apply(&[record("a", 0), record("b", 1)]).await.is_empty());

        let delta = discovery.apply(&[record("b", 1)]).await;
        assert_eq!(delta.removed, vec![PeerId::from("a")]);
        assert!(drivers.is_empty());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_early_offer_reaches_new_driver_once() {
        let hub = Arc::new(SignalingHub::default());
        let net = NetworkId::from("net1");
        let a = LocalSignaling::connect(hub.clone(), PeerId::from("a"));
        let b = Arc::new(LocalSignaling::connect(hub, PeerId::from("b")));
        b.join(&net).await.unwrap();

        let recorder = Recorder::default();
        let early = b.listeners().subscribe();
        let mut discovery =
            PeerDiscoveryLoop::new(context(b.clone(), &recorder, 1), DEFAULT_POLL_INTERVAL, DriverSet::new(), early);

        // `a` sends before `b` has seen it in a peer list
        a.join(&net).await.unwrap();
        a.relay(&net, &PeerId::from("b"), json!({"type": "offer"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        discovery.apply(&[record("b", 0), record("a", 1)]).await;
        assert_eq!(discovery.stashed(&PeerId::from("a")), 0);
        wait_until(|| recorder.seen.lock().unwrap().len() == 1).await;

        a.relay(&net, &PeerId::from("b"), json!({"type": "candidate"})).await.unwrap();
        wait_until(|| recorder.seen.lock().unwrap().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![json!({"type": "offer"}), json!({"type": "candidate"})]
        );
        discovery.close_all().await;
    }

    #[tokio::test]
    async fn test_stash_is_bounded() {
        let hub = Arc::new(SignalingHub::default());
        let net = NetworkId::from("net1");
        let a = LocalSignaling::connect(hub.clone(), PeerId::from("a"));
        let b = Arc::new(LocalSignaling::connect(hub, PeerId::from("b")));
        b.join(&net).await.unwrap();

        let recorder = Recorder::default();
        let early = b.listeners().subscribe();
        let mut discovery =
            PeerDiscoveryLoop::new(context(b.clone(), &recorder, 1), DEFAULT_POLL_INTERVAL, DriverSet::new(), early)
                .with_backlog_limit(3);

        for n in 0..5 {
            a.relay(&net, &PeerId::from("b"), json!({"n": n})).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        discovery.drain_early();
        assert_eq!(discovery.stashed(&PeerId::from("a")), 3);

        discovery.apply(&[record("a", 0)]).await;
        wait_until(|| recorder.seen.lock().unwrap().len() == 3).await;
        assert_eq!(recorder.seen.lock().unwrap()[0], json!({"n": 2}));
        discovery.close_all().await;
    }

    #[tokio::test]
    async fn test_departed_peer_is_not_replayed_on_rejoin() {
        let hub = Arc::new(SignalingHub::default());
        let net = NetworkId::from("net1");
        let a = LocalSignaling::connect(hub.clone(), PeerId::from("a"));
        let b = Arc::new(LocalSignaling::connect(hub, PeerId::from("b")));
        b.join(&net).await.unwrap();
        a.join(&net).await.unwrap();

        let recorder = Recorder::default();
        let early = b.listeners().subscribe();
        let mut discovery =
            PeerDiscoveryLoop::new(context(b.clone(), &recorder, 0), DEFAULT_POLL_INTERVAL, DriverSet::new(), early);

        discovery.apply(&[record("b", 0), record("a", 1)]).await;
        discovery.apply(&[record("b", 0)]).await;

        // Still in flight when `a` dropped out of the list
        a.relay(&net, &PeerId::from("b"), json!({"type": "offer", "stale": true}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        discovery.apply(&[record("b", 0)]).await;
        assert_eq!(discovery.stashed(&PeerId::from("a")), 0);

        // `a` is back with a new session before our poll lists it
        a.relay(&net, &PeerId::from("b"), json!({"type": "offer", "fresh": true}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        discovery.apply(&[record("b", 0), record("a", 7)]).await;

        wait_until(|| recorder.seen.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![json!({"type": "offer", "fresh": true})]
        );
        discovery.close_all().await;
    }

    fn ghost_message(seq: u64, from: &str) -> Relayed {
        Relayed {
            seq,
            message: SignalMessage {
                network_id: NetworkId::from("net1"),
                from_peer_id: PeerId::from(from),
                target_peer_id: PeerId::from("b"),
                message: json!({"type": "offer"}),
            },
        }
    }

    #[tokio::test]
    async fn test_stash_caps_senders_and_expires() {
        let hub = Arc::new(SignalingHub::default());
        let b = Arc::new(LocalSignaling::connect(hub, PeerId::from("b")));
        let recorder = Recorder::default();
        let early = b.listeners().subscribe();
        let mut discovery =
            PeerDiscoveryLoop::new(context(b.clone(), &recorder, 0), DEFAULT_POLL_INTERVAL, DriverSet::new(), early)
                .with_stash_peers(4);

        for n in 0..10 {
            discovery.stash_message(ghost_message(n, &format!("ghost-{}", n)));
        }
        assert_eq!(discovery.stashed_peers(), 4);
        assert_eq!(discovery.stashed(&PeerId::from("ghost-0")), 0);
        assert_eq!(discovery.stashed(&PeerId::from("ghost-9")), 1);

        for _ in 0..EARLY_SIGNAL_POLLS {
            discovery.apply(&[record("b", 0)]).await;
        }
        assert_eq!(discovery.stashed_peers(), 4);
        discovery.apply(&[record("b", 0)]).await;
        assert_eq!(discovery.stashed_peers(), 0);
    }

    /// Holds `list` replies until the test releases them
    struct GatedList {
        peer_id: PeerId,
        listeners: RelayListeners,
        gate: Semaphore,
        listing: AtomicBool,
    }

    #[async_trait]
    impl SignalingApi for GatedList {
        fn peer_id(&self) -> &PeerId {
            &self.peer_id
        }

        async fn join(&self, _: &NetworkId) -> Result<u64> {
            Ok(0)
        }

        async fn relay(&self, _: &NetworkId, _: &PeerId, _: serde_json::Value) -> Result<SignalMessage> {
            Err(SignalingError::Closed)
        }

        async fn list(&self, _: &NetworkId) -> Result<Vec<PeerRecord>> {
            self.listing.store(true, Ordering::SeqCst);
            let permit = self.gate.acquire().await.map_err(|_| SignalingError::Closed)?;
            permit.forget();
            Ok(vec![record("me", 0), record("remote", 1)])
        }

        fn listeners(&self) -> &RelayListeners {
            &self.listeners
        }
    }

    #[tokio::test]
    async fn test_peer_list_after_shutdown_is_discarded() {
        let api = Arc::new(GatedList {
            peer_id: PeerId::from("me"),
            listeners: RelayListeners::new(),
            gate: Semaphore::new(0),
            listing: AtomicBool::new(false),
        });
        let recorder = Recorder::default();
        let drivers = DriverSet::new();
        let ctx = DriverContext {
            api: api.clone(),
            negotiator: Arc::new(recorder.clone()),
            network_id: NetworkId::from("net1"),
            local: LocalPeer {
                peer_id: PeerId::from("me"),
                user_id: UserId::from("me"),
            },
            local_index: 0,
        };
        let early = api.listeners().subscribe();
        let discovery = PeerDiscoveryLoop::new(ctx, Duration::from_millis(10), drivers.clone(), early);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(discovery.run(shutdown_rx));
        wait_until(|| api.listing.load(Ordering::SeqCst)).await;

        shutdown.send(true).unwrap();
        api.gate.add_permits(1);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("discovery kept running after shutdown")
            .unwrap();
        assert!(drivers.is_empty());
        assert!(recorder.links.lock().unwrap().is_empty());
        assert_eq!(api.listeners().len(), 0);
    }
}
