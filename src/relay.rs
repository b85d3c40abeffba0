//! # Relay Service
//!
//! Decides whether this node can usefully relay for others and ranks peers as
//! relay candidates for the router.
//!
//! ## Reachability
//!
//! At startup every locally bound address is classified; an address is public
//! when it is not private-range, not loopback, and not link-local (IPv4 or
//! IPv6). A node with at least one public address may enable relay serving,
//! subject to hard resource caps ([`RelayResources`]) that bound its exposure
//! as an altruistic relay.
//!
//! ## Scoring
//!
//! `score = success_weight * success_rate + latency_bonus + public_bonus + recency_bonus`
//!
//! with the observed tuning constants (50/30/20/10) as configurable defaults.
//! [`RelayService::update_peer_score`] is the sole write path for score state;
//! periodic maintenance refreshes liveness from the transport's live
//! connections and prunes peers idle for half an hour.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use lru::LruCache;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, trace};

use crate::host::Host;
use crate::identity::PeerId;
use crate::router::is_relay_addr;

/// Upper bound on tracked relay scores.
/// SECURITY: Bounds memory growth from peer churn; the periodic prune removes
/// idle entries well before this cap matters.
pub const MAX_TRACKED_SCORES: usize = 10_000;

/// Hard resource caps applied when this node serves as a relay.
/// These are ceilings, not hints: a serving relay never exceeds them.
#[derive(Clone, Copy, Debug)]
pub struct RelayResources {
    /// Maximum concurrent relay reservations.
    pub max_reservations: usize,
    /// Maximum concurrent relayed circuits.
    pub max_circuits: usize,
    /// Buffer size per circuit, bytes.
    pub buffer_size: usize,
}

impl Default for RelayResources {
    fn default() -> Self {
        Self {
            max_reservations: 512,
            max_circuits: 128,
            buffer_size: 4096,
        }
    }
}

/// Weights for the relay candidate scoring function.
///
/// The defaults reproduce the observed tuning: up to 50 points for success
/// rate, up to 30 for sub-second latency, a flat 20 for public reachability,
/// and 10 for activity within the last five minutes (maximum 110).
#[derive(Clone, Debug)]
pub struct ScoreWeights {
    pub success_weight: f64,
    pub latency_weight: f64,
    pub public_bonus: f64,
    pub recency_bonus: f64,
    /// Latencies at or above this window contribute nothing.
    pub latency_window: Duration,
    /// Peers seen within this window earn the recency bonus.
    pub recency_window: Duration,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success_weight: 50.0,
            latency_weight: 30.0,
            public_bonus: 20.0,
            recency_bonus: 10.0,
            latency_window: Duration::from_secs(1),
            recency_window: Duration::from_secs(5 * 60),
        }
    }
}

/// Reputation of one peer as a relay candidate.
#[derive(Clone, Debug)]
pub struct PeerScore {
    pub successful_relays: u32,
    pub failed_relays: u32,
    pub last_seen: Instant,
    /// Last observed round-trip estimate.
    pub latency: Duration,
    /// Whether any known connection to this peer used a publicly routable
    /// address. Never downgraded once set: public-ness is a durable property
    /// of a good relay.
    pub is_public: bool,
}

impl PeerScore {
    fn new() -> Self {
        Self {
            successful_relays: 0,
            failed_relays: 0,
            last_seen: Instant::now(),
            latency: Duration::ZERO,
            is_public: false,
        }
    }

    /// The candidate's score under the given weights. Bounded to
    /// `[0, success_weight + latency_weight + public_bonus + recency_bonus]`;
    /// no term ever contributes negatively.
    pub fn value(&self, weights: &ScoreWeights) -> f64 {
        let total = self.successful_relays + self.failed_relays;
        let success_rate = if total > 0 {
            f64::from(self.successful_relays) / f64::from(total)
        } else {
            0.0
        };

        let mut value = success_rate * weights.success_weight;

        if self.latency > Duration::ZERO && self.latency < weights.latency_window {
            let fraction = self.latency.as_secs_f64() / weights.latency_window.as_secs_f64();
            value += weights.latency_weight * (1.0 - fraction);
        }

        if self.is_public {
            value += weights.public_bonus;
        }

        if self.last_seen.elapsed() < weights.recency_window {
            value += weights.recency_bonus;
        }

        value
    }
}

/// Configuration for the relay service.
#[derive(Clone, Debug)]
pub struct RelayServiceConfig {
    pub weights: ScoreWeights,
    pub resources: RelayResources,
    /// How often liveness/public-ness of scored connected peers is refreshed.
    pub refresh_interval: Duration,
    /// How often idle scores are pruned.
    pub prune_interval: Duration,
    /// Scores unseen for this long are pruned.
    pub score_idle_timeout: Duration,
}

impl Default for RelayServiceConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            resources: RelayResources::default(),
            refresh_interval: Duration::from_secs(30),
            prune_interval: Duration::from_secs(5 * 60),
            score_idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Summary of the relay service's state, for observability.
#[derive(Clone, Debug)]
pub struct RelayInfo {
    pub is_public: bool,
    pub serving: bool,
    pub public_addr_count: usize,
    pub tracked_peers: usize,
    pub direct_conns: usize,
    pub relayed_conns: usize,
}

/// Whether a socket-address string (`ip:port` or bare IP) is publicly
/// routable: not private-range, not loopback, not link-local.
pub fn is_public_addr(addr: &str) -> bool {
    let ip = match addr.parse::<SocketAddr>() {
        Ok(socket) => socket.ip(),
        Err(_) => match addr.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => return false,
        },
    };

    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            // fe80::/10 link-local, fc00::/7 unique-local
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            !(v6.is_loopback() || v6.is_unspecified() || link_local || unique_local)
        }
    }
}

/// Relay reachability detector and candidate scorer.
pub struct RelayService<H: Host> {
    host: Arc<H>,
    config: RelayServiceConfig,
    is_public: AtomicBool,
    serving: AtomicBool,
    public_addrs: RwLock<Vec<String>>,
    scores: RwLock<LruCache<PeerId, PeerScore>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<H: Host> RelayService<H> {
    pub fn new(host: Arc<H>, config: RelayServiceConfig) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_SCORES).expect("MAX_TRACKED_SCORES must be non-zero");
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            host,
            config,
            is_public: AtomicBool::new(false),
            serving: AtomicBool::new(false),
            public_addrs: RwLock::new(Vec::new()),
            scores: RwLock::new(LruCache::new(cap)),
            shutdown_tx,
        }
    }

    /// Detect public reachability and start the maintenance loops.
    pub async fn start(self: &Arc<Self>) {
        self.detect_public_addresses().await;

        // Liveness/public-ness refresh for scored connected peers.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.config.refresh_interval);
                tick.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = tick.tick() => this.refresh_connected_scores().await,
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }

        // Idle score pruning.
        {
            let this = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.config.prune_interval);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            this.prune_idle_scores().await;
                            trace!("{}", this.format_scores().await);
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            });
        }
    }

    /// Stop the maintenance loops.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Classify every locally bound address and record whether any is public.
    pub async fn detect_public_addresses(&self) {
        let addrs = self.host.local_addrs().await;
        let public: Vec<String> = addrs.into_iter().filter(|a| is_public_addr(a)).collect();

        self.is_public.store(!public.is_empty(), Ordering::Relaxed);
        if public.is_empty() {
            info!("no public address detected, will use relay service from other peers");
        } else {
            info!(
                addrs = ?public,
                "public address detected, this node can act as a relay"
            );
        }
        *self.public_addrs.write().await = public;
    }

    /// Whether this node has a publicly routable address.
    pub fn is_public(&self) -> bool {
        self.is_public.load(Ordering::Relaxed)
    }

    /// Whether relay serving has been enabled.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Relaxed)
    }

    /// The hard resource caps a serving relay honors.
    pub fn resources(&self) -> RelayResources {
        self.config.resources
    }

    /// Enable relay serving for other peers. Fails unless this node is
    /// publicly reachable; serving is always bounded by
    /// [`RelayService::resources`].
    pub fn enable_relay_service(&self) -> Result<()> {
        if !self.is_public() {
            anyhow::bail!("cannot enable relay: no public address");
        }
        self.serving.store(true, Ordering::Relaxed);
        info!(
            max_reservations = self.config.resources.max_reservations,
            max_circuits = self.config.resources.max_circuits,
            buffer_size = self.config.resources.buffer_size,
            "relay service enabled, helping peers behind NAT"
        );
        Ok(())
    }

    /// Pick the candidate with the strictly highest score.
    ///
    /// Ties break toward the earlier candidate. When no candidate has a
    /// recorded score the first candidate is returned; only an empty
    /// candidate list is an error.
    pub async fn select_best_relay(&self, candidates: &[PeerId]) -> Result<PeerId> {
        if candidates.is_empty() {
            anyhow::bail!("no relay candidates available");
        }

        let scores = self.scores.read().await;
        let mut best: Option<(PeerId, f64)> = None;
        for peer in candidates {
            let Some(score) = scores.peek(peer) else {
                continue;
            };
            let value = score.value(&self.config.weights);
            match &best {
                Some((_, best_value)) if value <= *best_value => {}
                _ => best = Some((*peer, value)),
            }
        }

        match best {
            Some((peer, value)) => {
                trace!(peer = %peer.short(), score = value, "selected best relay");
                Ok(peer)
            }
            None => Ok(candidates[0]),
        }
    }

    /// Record the outcome of a relay attempt through `peer`. The sole write
    /// path for score state.
    pub async fn update_peer_score(&self, peer: &PeerId, success: bool, latency: Duration) {
        let mut scores = self.scores.write().await;
        let score = scores.get_or_insert_mut(*peer, PeerScore::new);
        if success {
            score.successful_relays = score.successful_relays.saturating_add(1);
        } else {
            score.failed_relays = score.failed_relays.saturating_add(1);
        }
        score.last_seen = Instant::now();
        score.latency = latency;
    }

    /// Refresh `last_seen` and `is_public` for every scored peer the
    /// transport currently reports connections to.
    async fn refresh_connected_scores(&self) {
        for peer in self.host.peers().await {
            let conns = self.host.connections_to(&peer).await;
            let mut scores = self.scores.write().await;
            if let Some(score) = scores.get_mut(&peer) {
                score.last_seen = Instant::now();
                if !score.is_public && conns.iter().any(|c| is_public_addr(&c.remote_addr)) {
                    score.is_public = true;
                }
            }
        }
    }

    /// Drop scores for peers unseen past the idle timeout. Returns the number
    /// removed.
    async fn prune_idle_scores(&self) -> usize {
        let timeout = self.config.score_idle_timeout;
        let mut scores = self.scores.write().await;
        let stale: Vec<PeerId> = scores
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        let removed = stale.len();
        for peer in stale {
            scores.pop(&peer);
        }
        if removed > 0 {
            debug!(removed, remaining = scores.len(), "pruned idle relay scores");
        }
        removed
    }

    /// Snapshot of all tracked scores.
    pub async fn peer_scores(&self) -> Vec<(PeerId, PeerScore)> {
        self.scores
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    /// Human-readable score dump, suitable for trace logging.
    pub async fn format_scores(&self) -> String {
        let scores = self.scores.read().await;
        let mut out = String::from("=== Relay Peer Scores ===");
        for (peer, score) in scores.iter() {
            out.push_str(&format!(
                "\n  {}: {:.1} (success: {}, failed: {}, public: {})",
                peer.short(),
                score.value(&self.config.weights),
                score.successful_relays,
                score.failed_relays,
                score.is_public,
            ));
        }
        out
    }

    /// Relay status summary: reachability, serving flag, and the breakdown of
    /// direct vs relayed connections.
    pub async fn relay_info(&self) -> RelayInfo {
        let mut direct_conns = 0usize;
        let mut relayed_conns = 0usize;
        for peer in self.host.peers().await {
            for conn in self.host.connections_to(&peer).await {
                if is_relay_addr(&conn.remote_addr) {
                    relayed_conns += 1;
                } else {
                    direct_conns += 1;
                }
            }
        }

        RelayInfo {
            is_public: self.is_public(),
            serving: self.is_serving(),
            public_addr_count: self.public_addrs.read().await.len(),
            tracked_peers: self.scores.read().await.len(),
            direct_conns,
            relayed_conns,
        }
    }
}
