//! # Peer Manager
//!
//! Keeps the node maximally connected to the peers relevant to its topics
//! without manual intervention. Three independent background loops share one
//! cancellable lifetime:
//!
//! - **Discovery**: advertise + find peers on each rendezvous namespace,
//!   dialing results as they arrive.
//! - **Reconnect**: retry disconnected known peers under exponential backoff.
//! - **Keep-alive**: ping connected peers so NAT mappings and address-book
//!   TTLs stay fresh.
//!
//! All outbound connection attempts funnel through [`PeerManager::dial`], the
//! single choke point that suppresses duplicate concurrent dials to the same
//! peer and caps total dial concurrency with a semaphore. The semaphore is
//! acquired *before* the detached attempt is spawned, so discovery and
//! reconnect naturally back-pressure when the pool is saturated.
//!
//! Dial failures are never surfaced to callers; they only increment the
//! per-peer attempt counter that drives backoff. The mesh heals itself
//! silently.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, trace, warn};

use crate::host::{Connectedness, Discovery, Host, NetworkEvent, Pinger};
use crate::host::{CONNECTED_ADDR_TTL, TEMP_ADDR_TTL};
use crate::identity::PeerId;

/// Upper bound on tracked peer records.
/// SECURITY: Bounds memory growth under churn; least-recently-touched records
/// are evicted first, which doubles as the idle-eviction policy.
pub const MAX_TRACKED_PEERS: usize = 10_000;

/// Gap between advertising and querying a rendezvous namespace, so one pass
/// does not hammer the DHT with back-to-back operations.
const ADVERTISE_FIND_GAP: Duration = Duration::from_secs(1);

/// Configuration for the peer manager's loops and dial limits.
#[derive(Clone, Debug)]
pub struct PeerManagerConfig {
    /// How often the reconnect loop scans for disconnected peers.
    pub reconnect_interval: Duration,
    /// How often discovery re-runs across all rendezvous namespaces.
    pub discovery_interval: Duration,
    /// How often connected peers are pinged to keep NAT mappings alive.
    pub keep_alive_interval: Duration,
    /// Base delay for reconnect backoff (doubles per failed attempt).
    pub backoff_base: Duration,
    /// Hard cap on reconnect backoff.
    pub max_backoff: Duration,
    /// Maximum simultaneous outbound dial attempts.
    pub max_concurrent_dials: usize,
    /// Timeout for a single dial attempt.
    pub dial_timeout: Duration,
    /// Timeout for each advertise / find-peers operation.
    pub discovery_op_timeout: Duration,
    /// Timeout for a keep-alive ping.
    pub ping_timeout: Duration,
    /// Delay before the first discovery pass, letting the DHT bootstrap.
    pub initial_discovery_delay: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(2 * 60),
            keep_alive_interval: Duration::from_secs(45),
            backoff_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5 * 60),
            max_concurrent_dials: 10,
            dial_timeout: Duration::from_secs(15),
            discovery_op_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            initial_discovery_delay: Duration::from_secs(10),
        }
    }
}

/// The rendezvous namespaces derived from a chat topic: the topic itself plus
/// its global and discovery channels.
pub fn rendezvous_for(topic: &str) -> Vec<String> {
    vec![
        topic.to_string(),
        format!("{topic}-global"),
        format!("{topic}-discovery"),
    ]
}

/// Exponential reconnect backoff: `min(max, base * 2^attempts)`.
///
/// Monotonically non-decreasing in `attempts`; the shift is clamped so large
/// attempt counts saturate at `max` instead of overflowing.
pub(crate) fn backoff_for(attempts: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempts.min(16);
    match base.checked_mul(1u32 << shift) {
        Some(d) => d.min(max),
        None => max,
    }
}

/// Everything the manager remembers about a peer it has ever connected to or
/// discovered. Records persist across disconnects; they are the reconnect
/// candidate set.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Addresses last known reachable, refreshed from the address book on
    /// each successful connect.
    pub addrs: Vec<String>,
    /// Last confirmed connectivity (or record creation).
    pub last_seen: Instant,
    /// Consecutive failed dial attempts since the last success.
    pub attempts: u32,
    /// When the last dial attempt started; gates backoff.
    pub last_attempt: Option<Instant>,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            addrs: Vec::new(),
            last_seen: Instant::now(),
            attempts: 0,
            last_attempt: None,
        }
    }
}

/// Removes the peer from the inflight set when the dial attempt finishes,
/// no matter how it finishes.
struct DialGuard {
    inflight: Arc<Mutex<HashSet<PeerId>>>,
    peer: PeerId,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        lock_recovering(&self.inflight).remove(&self.peer);
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
/// The inflight set stays consistent either way: the guard that poisoned it
/// already removed its entry via Drop.
fn lock_recovering(m: &Mutex<HashSet<PeerId>>) -> MutexGuard<'_, HashSet<PeerId>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Peer lifecycle manager: discovery scheduling, reconnect backoff,
/// keep-alive, and dial de-duplication.
pub struct PeerManager<H: Host, D: Discovery, P: Pinger> {
    host: Arc<H>,
    discovery: Arc<D>,
    pinger: Arc<P>,
    config: PeerManagerConfig,
    known_peers: RwLock<LruCache<PeerId, PeerRecord>>,
    inflight: Arc<Mutex<HashSet<PeerId>>>,
    dial_permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl<H: Host, D: Discovery, P: Pinger> PeerManager<H, D, P> {
    pub fn new(host: Arc<H>, discovery: Arc<D>, pinger: Arc<P>, config: PeerManagerConfig) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_PEERS).expect("MAX_TRACKED_PEERS must be non-zero");
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            host,
            discovery,
            pinger,
            dial_permits: Arc::new(Semaphore::new(config.max_concurrent_dials)),
            config,
            known_peers: RwLock::new(LruCache::new(cap)),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
        }
    }

    /// Start the background loops (event pump, discovery, reconnect,
    /// keep-alive) against the given rendezvous namespaces.
    ///
    /// All loops observe [`PeerManager::shutdown`] and return within one tick.
    pub fn start(self: &Arc<Self>, rendezvous: Vec<String>) {
        // Event pump: transport notifications drive record state.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut events = this.host.subscribe_events().await;
                loop {
                    tokio::select! {
                        ev = events.recv() => match ev {
                            Some(NetworkEvent::Connected(peer)) => this.on_connected(peer).await,
                            Some(NetworkEvent::Disconnected(peer)) => this.on_disconnected(peer).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            });
        }

        // Discovery loop, delayed so the DHT can bootstrap first.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(this.config.initial_discovery_delay) => {}
                    _ = shutdown.changed() => return,
                }
                let mut tick = tokio::time::interval(this.config.discovery_interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.run_discovery(&rendezvous).await,
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }

        // Reconnect loop.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.config.reconnect_interval);
                tick.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.reconnect_pass().await,
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }

        // Keep-alive loop.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.config.keep_alive_interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.keep_alive_pass().await,
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }
    }

    /// Stop all background loops. In-flight dials run to their own timeout
    /// but no further work is scheduled.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Record a successful connection: upsert the peer, reset its failure
    /// streak, and refresh its addresses from the address book.
    pub async fn on_connected(&self, peer: PeerId) {
        let addrs = self.host.addresses(&peer).await;
        let mut peers = self.known_peers.write().await;
        let record = peers.get_or_insert_mut(peer, PeerRecord::new);
        record.attempts = 0;
        record.last_seen = Instant::now();
        if !addrs.is_empty() {
            record.addrs = addrs;
        }
        trace!(peer = %peer.short(), "peer connected and tracked");
    }

    /// Record a disconnect. The record stays: the peer remains a reconnect
    /// candidate.
    pub async fn on_disconnected(&self, peer: PeerId) {
        let mut peers = self.known_peers.write().await;
        if let Some(record) = peers.get_mut(&peer) {
            record.last_seen = Instant::now();
            debug!(peer = %peer.short(), "peer disconnected, will auto-reconnect");
        }
    }

    /// One discovery pass: advertise and query every rendezvous namespace,
    /// dialing results incrementally as they arrive.
    ///
    /// Skipped entirely while the routing table is empty; querying a cold DHT
    /// is futile.
    pub async fn run_discovery(self: &Arc<Self>, rendezvous: &[String]) {
        if self.host.peers().await.is_empty() {
            debug!("routing table empty, skipping discovery pass");
            return;
        }

        for namespace in rendezvous {
            match self
                .discovery
                .advertise(namespace, self.config.discovery_op_timeout)
                .await
            {
                Ok(()) => trace!(namespace = %namespace, "advertised"),
                Err(e) => debug!(namespace = %namespace, error = %e, "advertise failed"),
            }

            tokio::time::sleep(ADVERTISE_FIND_GAP).await;

            let stream = match self
                .discovery
                .find_peers(namespace, self.config.discovery_op_timeout)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    debug!(namespace = %namespace, error = %e, "find peers failed");
                    continue;
                }
            };

            let this = self.clone();
            let namespace = namespace.clone();
            tokio::spawn(async move {
                this.connect_discovered(stream, &namespace).await;
            });
        }
    }

    /// Consume a discovery result stream, dialing each peer as it arrives.
    async fn connect_discovered(
        self: Arc<Self>,
        mut stream: tokio::sync::mpsc::Receiver<crate::identity::PeerInfo>,
        namespace: &str,
    ) {
        let mut count = 0usize;
        while let Some(info) = stream.recv().await {
            if info.id == self.host.local_id() {
                continue;
            }
            count += 1;
            self.host
                .add_addresses(&info.id, &info.addrs, TEMP_ADDR_TTL)
                .await;
            self.dial(info.id, info.addrs).await;
        }
        if count > 0 {
            debug!(namespace = %namespace, count, "discovered peers");
        }
    }

    /// One reconnect pass: schedule a dial for every known disconnected peer
    /// whose backoff window has elapsed.
    pub async fn reconnect_pass(self: &Arc<Self>) {
        let snapshot: Vec<(PeerId, u32, Option<Instant>, Vec<String>)> = {
            let peers = self.known_peers.read().await;
            peers
                .iter()
                .map(|(id, r)| (*id, r.attempts, r.last_attempt, r.addrs.clone()))
                .collect()
        };

        let mut scheduled = 0usize;
        for (peer, attempts, last_attempt, record_addrs) in snapshot {
            if self.host.connectedness(&peer).await == Connectedness::Connected {
                continue;
            }

            let backoff = backoff_for(attempts, self.config.backoff_base, self.config.max_backoff);
            if let Some(at) = last_attempt {
                if at.elapsed() < backoff {
                    continue;
                }
            }

            let mut addrs = self.host.addresses(&peer).await;
            if addrs.is_empty() {
                addrs = record_addrs;
            }
            if addrs.is_empty() {
                continue;
            }

            scheduled += 1;
            self.dial(peer, addrs).await;
        }

        if scheduled > 0 {
            debug!(scheduled, "reconnect pass scheduled dials");
        }
    }

    /// The single choke point for all outbound connection attempts.
    ///
    /// No-op if the peer is already connected or a dial to it is already in
    /// flight. Otherwise waits for a dial permit (back-pressuring the caller),
    /// records the attempt, and spawns the detached network attempt. The
    /// inflight marker and the permit are released unconditionally when the
    /// attempt completes.
    pub async fn dial(self: &Arc<Self>, peer: PeerId, addrs: Vec<String>) {
        if self.host.connectedness(&peer).await == Connectedness::Connected {
            return;
        }

        let guard = {
            let mut inflight = lock_recovering(&self.inflight);
            if !inflight.insert(peer) {
                trace!(peer = %peer.short(), "dial already in flight, suppressed");
                return;
            }
            DialGuard {
                inflight: self.inflight.clone(),
                peer,
            }
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        let permit = tokio::select! {
            permit = self.dial_permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        {
            let mut peers = self.known_peers.write().await;
            let record = peers.get_or_insert_mut(peer, PeerRecord::new);
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt = Some(Instant::now());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;

            let addrs = if addrs.is_empty() {
                this.host.addresses(&peer).await
            } else {
                addrs
            };
            if addrs.is_empty() {
                debug!(peer = %peer.short(), "no known addresses, dial abandoned");
                return;
            }

            match this
                .host
                .connect(&peer, &addrs, this.config.dial_timeout)
                .await
            {
                Ok(()) => debug!(peer = %peer.short(), "dial succeeded"),
                Err(e) => debug!(peer = %peer.short(), error = %e, "dial failed"),
            }
        });
    }

    /// One keep-alive pass: probe every connected peer and refresh its
    /// address-book TTL on success. Ping failure is log-only; the transport's
    /// disconnect notification is authoritative.
    pub async fn keep_alive_pass(self: &Arc<Self>) {
        let peers = self.host.peers().await;
        if peers.is_empty() {
            return;
        }
        trace!(count = peers.len(), "keep-alive pass");

        for peer in peers {
            let this = self.clone();
            tokio::spawn(async move {
                match this.pinger.ping(&peer, this.config.ping_timeout).await {
                    Ok(rtt) => {
                        let addrs = this.host.addresses(&peer).await;
                        if !addrs.is_empty() {
                            this.host
                                .add_addresses(&peer, &addrs, CONNECTED_ADDR_TTL)
                                .await;
                        }
                        trace!(
                            peer = %peer.short(),
                            rtt_ms = rtt.as_millis() as u64,
                            "keep-alive ping ok"
                        );
                    }
                    Err(e) => {
                        warn!(peer = %peer.short(), error = %e, "keep-alive ping failed");
                    }
                }
            });
        }
    }

    /// Number of peers the manager has ever tracked (bounded by
    /// [`MAX_TRACKED_PEERS`]).
    pub async fn known_peer_count(&self) -> usize {
        self.known_peers.read().await.len()
    }

    /// Number of known peers the transport currently reports as connected.
    pub async fn connected_peer_count(&self) -> usize {
        let ids: Vec<PeerId> = {
            let peers = self.known_peers.read().await;
            peers.iter().map(|(id, _)| *id).collect()
        };
        let mut connected = 0;
        for id in ids {
            if self.host.connectedness(&id).await == Connectedness::Connected {
                connected += 1;
            }
        }
        connected
    }

    /// Snapshot of a peer's record, if tracked.
    pub async fn peer_record(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.known_peers.read().await.peek(peer).cloned()
    }

    /// Number of dials currently in flight.
    pub fn inflight_dials(&self) -> usize {
        lock_recovering(&self.inflight).len()
    }
}
