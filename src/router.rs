//! # Smart Router
//!
//! Reaches a target peer by trying progressively less efficient strategies in
//! a fixed order: direct dial, relay circuit, then a patient DHT-assisted
//! retry. The ordering is by expected cost; it is deliberately static rather
//! than adaptive because predictability matters more here than marginal
//! latency gains.
//!
//! Each tier records its own attempt/success counters independently, and a
//! later tier never rolls back an earlier tier's stats. When the relay tier
//! synthesizes circuit candidates from connected peers, outcomes are reported
//! back to the [`RelayService`] scorer so future candidate selection improves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::host::{Connectedness, Host};
use crate::identity::{PeerId, PeerInfo};
use crate::relay::RelayService;

/// Marker protocol segment identifying a circuit-relay address.
const CIRCUIT_MARKER: &str = "/p2p-circuit";

/// How a connection to a peer was (or would be) established.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStrategy {
    /// Direct dial on the peer's known addresses. Cheapest and fastest.
    Direct,
    /// Through a circuit relay hop.
    Relay,
    /// Retry with a long timeout, giving DHT-sourced address records time to
    /// resolve. Last resort.
    DhtAssisted,
}

impl std::fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStrategy::Direct => write!(f, "Direct"),
            ConnectionStrategy::Relay => write!(f, "Relay"),
            ConnectionStrategy::DhtAssisted => write!(f, "DHT"),
        }
    }
}

/// Outcome of a single connection attempt. Transient: consumed by the caller
/// and by aggregate statistics, never persisted.
#[derive(Clone, Debug)]
pub struct ConnectionResult {
    pub strategy: ConnectionStrategy,
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub peer: PeerId,
    /// The remote address of the established connection, when known.
    pub address: Option<String>,
}

impl ConnectionResult {
    fn pending(strategy: ConnectionStrategy, peer: PeerId) -> Self {
        Self {
            strategy,
            success: false,
            latency: Duration::ZERO,
            error: None,
            peer,
            address: None,
        }
    }
}

/// Attempt/success counters for one strategy tier.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyStats {
    /// Success rate as a percentage; 0 when no attempts have been recorded.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        (self.successes as f64 / self.attempts as f64) * 100.0
    }
}

/// Cumulative routing statistics, monotonically increasing for the process
/// lifetime.
#[derive(Clone, Debug, Default)]
pub struct RouterStats {
    pub direct: StrategyStats,
    pub relay: StrategyStats,
    pub dht_assisted: StrategyStats,
    pub total_latency: Duration,
    pub connection_count: u64,
}

impl RouterStats {
    /// Running average latency across all successful connections.
    pub fn average_latency(&self) -> Duration {
        if self.connection_count == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.connection_count as u32
    }
}

/// Timeouts and fan-out limits for the router's tiers.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Timeout for the direct tier.
    pub direct_timeout: Duration,
    /// Timeout for the relay tier.
    pub relay_timeout: Duration,
    /// Timeout for the DHT-assisted tier.
    pub dht_timeout: Duration,
    /// Cap on synthesized relay-circuit candidates per attempt.
    pub max_relay_candidates: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            direct_timeout: Duration::from_secs(10),
            relay_timeout: Duration::from_secs(15),
            dht_timeout: Duration::from_secs(30),
            max_relay_candidates: 3,
        }
    }
}

/// Whether an address string is a circuit-relay address.
pub fn is_relay_addr(addr: &str) -> bool {
    addr.contains(CIRCUIT_MARKER)
}

/// Compose a circuit-relay address routing to `target` through a relay
/// reachable at `relay_addr`.
fn circuit_addr(relay_addr: &str, target: &PeerId) -> String {
    format!("{relay_addr}{CIRCUIT_MARKER}/p2p/{}", target.to_hex())
}

/// Connection router with ordered strategy fallback.
pub struct SmartRouter<H: Host> {
    host: Arc<H>,
    config: RouterConfig,
    /// Relay candidate scorer, consulted to order synthesized circuits and
    /// fed with relay attempt outcomes. Absent when no relay service is wired.
    relay_service: Option<Arc<RelayService<H>>>,
    stats: RwLock<RouterStats>,
}

impl<H: Host> SmartRouter<H> {
    pub fn new(host: Arc<H>, config: RouterConfig) -> Self {
        Self {
            host,
            config,
            relay_service: None,
            stats: RwLock::new(RouterStats::default()),
        }
    }

    /// Wire in the relay scorer at construction time.
    pub fn with_relay_service(mut self, relay_service: Arc<RelayService<H>>) -> Self {
        self.relay_service = Some(relay_service);
        self
    }

    /// Connect to a peer, trying Direct → Relay → DHT-assisted in order.
    ///
    /// Returns the first successful [`ConnectionResult`]; if every tier
    /// fails, returns an error naming the last failure.
    pub async fn connect_to_peer(&self, peer_info: &PeerInfo) -> Result<ConnectionResult> {
        let result = self.try_direct(peer_info).await;
        if result.success {
            self.record_success(&result).await;
            return Ok(result);
        }
        debug!(
            peer = %peer_info.id.short(),
            error = result.error.as_deref().unwrap_or("unknown"),
            "direct connection failed, trying relay"
        );

        let result = self.try_relay(peer_info).await;
        if result.success {
            self.record_success(&result).await;
            return Ok(result);
        }
        debug!(
            peer = %peer_info.id.short(),
            error = result.error.as_deref().unwrap_or("unknown"),
            "relay connection failed, trying DHT-assisted"
        );

        let result = self.try_dht_assisted(peer_info).await;
        if result.success {
            self.record_success(&result).await;
            return Ok(result);
        }

        anyhow::bail!(
            "all connection strategies exhausted for {}: last error: {}",
            peer_info.id.short(),
            result.error.as_deref().unwrap_or("unknown"),
        )
    }

    /// Direct tier: immediate success if already connected, otherwise a short
    /// dial on the peer's known addresses.
    async fn try_direct(&self, peer_info: &PeerInfo) -> ConnectionResult {
        self.stats.write().await.direct.attempts += 1;
        let start = Instant::now();
        let mut result = ConnectionResult::pending(ConnectionStrategy::Direct, peer_info.id);

        if self.host.connectedness(&peer_info.id).await == Connectedness::Connected {
            result.success = true;
            result.latency = start.elapsed();
            result.address = self.remote_address(&peer_info.id).await;
            self.stats.write().await.direct.successes += 1;
            return result;
        }

        match self
            .host
            .connect(&peer_info.id, &peer_info.addrs, self.config.direct_timeout)
            .await
        {
            Ok(()) => {
                result.success = true;
                result.latency = start.elapsed();
                result.address = self.remote_address(&peer_info.id).await;
                self.stats.write().await.direct.successes += 1;
                trace!(
                    peer = %peer_info.id.short(),
                    latency_ms = result.latency.as_millis() as u64,
                    "direct connection established"
                );
            }
            Err(e) => {
                result.latency = start.elapsed();
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Relay tier: dial through circuit-relay addresses, either taken from the
    /// peer's record or synthesized from currently-connected peers.
    ///
    /// Fails immediately, without consuming a dial attempt, when no candidate
    /// exists.
    async fn try_relay(&self, peer_info: &PeerInfo) -> ConnectionResult {
        let start = Instant::now();
        let mut result = ConnectionResult::pending(ConnectionStrategy::Relay, peer_info.id);

        let mut relay_addrs: Vec<String> = peer_info
            .addrs
            .iter()
            .filter(|a| is_relay_addr(a))
            .cloned()
            .collect();

        // The relay peer each synthesized circuit runs through, used for
        // outcome scoring. Record-sourced circuits have no known relay peer.
        let mut scored_relay: Option<PeerId> = None;

        if relay_addrs.is_empty() {
            let candidates = self.synthesize_relay_candidates(&peer_info.id).await;
            if !candidates.is_empty() {
                scored_relay = self.pick_scored_relay(&candidates).await;
                relay_addrs = order_candidates(candidates, scored_relay);
            }
        }

        if relay_addrs.is_empty() {
            result.error = Some("no relay addresses available".to_string());
            return result;
        }

        self.stats.write().await.relay.attempts += 1;

        match self
            .host
            .connect(&peer_info.id, &relay_addrs, self.config.relay_timeout)
            .await
        {
            Ok(()) => {
                result.success = true;
                result.latency = start.elapsed();
                result.address = self.remote_address(&peer_info.id).await;
                self.stats.write().await.relay.successes += 1;
                trace!(
                    peer = %peer_info.id.short(),
                    latency_ms = result.latency.as_millis() as u64,
                    "relay connection established"
                );
            }
            Err(e) => {
                result.latency = start.elapsed();
                result.error = Some(e.to_string());
            }
        }

        if let (Some(relay_service), Some(relay_peer)) = (&self.relay_service, scored_relay) {
            relay_service
                .update_peer_score(&relay_peer, result.success, result.latency)
                .await;
        }

        result
    }

    /// DHT-assisted tier: a retry of the known addresses with a long timeout,
    /// giving slow DHT-sourced address records time to resolve.
    async fn try_dht_assisted(&self, peer_info: &PeerInfo) -> ConnectionResult {
        self.stats.write().await.dht_assisted.attempts += 1;
        let start = Instant::now();
        let mut result = ConnectionResult::pending(ConnectionStrategy::DhtAssisted, peer_info.id);

        match self
            .host
            .connect(&peer_info.id, &peer_info.addrs, self.config.dht_timeout)
            .await
        {
            Ok(()) => {
                result.success = true;
                result.latency = start.elapsed();
                result.address = self.remote_address(&peer_info.id).await;
                self.stats.write().await.dht_assisted.successes += 1;
                trace!(
                    peer = %peer_info.id.short(),
                    latency_ms = result.latency.as_millis() as u64,
                    "DHT-assisted connection established"
                );
            }
            Err(e) => {
                result.latency = start.elapsed();
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Build circuit-relay candidates by composing the addresses of
    /// currently-connected peers with the target's id, capped to bound dial
    /// fan-out.
    async fn synthesize_relay_candidates(&self, target: &PeerId) -> Vec<(PeerId, String)> {
        let mut candidates = Vec::new();

        for relay_peer in self.host.peers().await {
            if relay_peer == *target {
                continue;
            }
            for conn in self.host.connections_to(&relay_peer).await {
                candidates.push((relay_peer, circuit_addr(&conn.remote_addr, target)));
                if candidates.len() >= self.config.max_relay_candidates {
                    return candidates;
                }
            }
        }

        candidates
    }

    /// Ask the relay scorer for the best candidate among the synthesized
    /// relays, if a scorer is wired in.
    async fn pick_scored_relay(&self, candidates: &[(PeerId, String)]) -> Option<PeerId> {
        let relay_service = self.relay_service.as_ref()?;
        let ids: Vec<PeerId> = candidates.iter().map(|(id, _)| *id).collect();
        relay_service.select_best_relay(&ids).await.ok()
    }

    /// The remote address of any live connection to the peer.
    async fn remote_address(&self, peer: &PeerId) -> Option<String> {
        self.host
            .connections_to(peer)
            .await
            .into_iter()
            .next()
            .map(|c| c.remote_addr)
    }

    async fn record_success(&self, result: &ConnectionResult) {
        let mut stats = self.stats.write().await;
        stats.connection_count += 1;
        stats.total_latency += result.latency;
        debug!(
            strategy = %result.strategy,
            avg_latency_ms = stats.average_latency().as_millis() as u64,
            "connection established"
        );
    }

    /// Snapshot of cumulative routing statistics.
    pub async fn stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    /// Human-readable statistics summary, suitable for logging.
    pub async fn format_stats(&self) -> String {
        let stats = self.stats().await;
        let mut out = String::from("=== Smart Routing Statistics ===\n");
        for (name, tier) in [
            ("Direct", &stats.direct),
            ("Relay", &stats.relay),
            ("DHT", &stats.dht_assisted),
        ] {
            out.push_str(&format!(
                "{name}: {} attempts, {} success ({:.1}%)\n",
                tier.attempts,
                tier.successes,
                tier.success_rate(),
            ));
        }
        if stats.connection_count > 0 {
            out.push_str(&format!(
                "Average latency: {}ms\n",
                stats.average_latency().as_millis()
            ));
        }
        out.push_str(&format!("Total connections: {}", stats.connection_count));
        out
    }

    /// Whether the transport currently reports this peer as connected.
    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.host.connectedness(peer).await == Connectedness::Connected
    }

    /// Classify the current connection to a peer.
    ///
    /// A peer with no live connection classifies as [`DhtAssisted`]: reaching
    /// it would require the last-resort path.
    ///
    /// [`DhtAssisted`]: ConnectionStrategy::DhtAssisted
    pub async fn connection_type(&self, peer: &PeerId) -> ConnectionStrategy {
        let conns = self.host.connections_to(peer).await;
        if conns.is_empty() {
            return ConnectionStrategy::DhtAssisted;
        }
        if conns.iter().any(|c| is_relay_addr(&c.remote_addr)) {
            return ConnectionStrategy::Relay;
        }
        ConnectionStrategy::Direct
    }

    /// Connection-type breakdown for every currently connected peer.
    pub async fn connected_peers(&self) -> Vec<(PeerId, ConnectionStrategy)> {
        let mut out = Vec::new();
        for peer in self.host.peers().await {
            out.push((peer, self.connection_type(&peer).await));
        }
        out
    }
}

/// Flatten candidates to an address list, moving the scored-best relay's
/// circuits to the front.
fn order_candidates(candidates: Vec<(PeerId, String)>, best: Option<PeerId>) -> Vec<String> {
    match best {
        None => candidates.into_iter().map(|(_, addr)| addr).collect(),
        Some(best) => {
            let mut ordered: Vec<String> = Vec::with_capacity(candidates.len());
            for (id, addr) in &candidates {
                if *id == best {
                    ordered.push(addr.clone());
                }
            }
            for (id, addr) in candidates {
                if id != best {
                    ordered.push(addr);
                }
            }
            ordered
        }
    }
}
