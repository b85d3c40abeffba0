//! # Chatmesh - Connectivity Resilience for a P2P Chat Mesh
//!
//! Chatmesh is the connectivity-resilience and routing layer of a serverless
//! peer-to-peer chat mesh. Nodes discover each other over a DHT and rendezvous
//! namespaces, exchange messages over a pubsub overlay, and must keep working
//! despite NAT boxes, flaky links, and continuous churn. This crate owns the
//! hard part of that: staying connected and deciding how to reach peers.
//!
//! ## Architecture
//!
//! The transport itself (dialing, connection state, address book), rendezvous
//! discovery, the DHT, and liveness probes are external collaborators reached
//! through the traits in [`host`]. Every component is generic over exactly the
//! collaborators it needs, so the whole layer runs unchanged against an
//! in-memory test double.
//!
//! Background responsibilities (discovery, reconnect, keep-alive, score
//! maintenance, cache sweeps) run as independent tokio tasks, each driven by
//! its own timer and all observing one shutdown signal per component.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | opaque `PeerId` and `PeerInfo` |
//! | `host` | collaborator traits: transport, discovery, DHT, ping |
//! | `messages` | chat payloads, bounded serialization, content keys |
//! | `peers` | peer lifecycle: discovery scheduling, reconnect backoff, keep-alive, dial de-duplication |
//! | `router` | ordered connection-strategy fallback (Direct → Relay → DHT) with stats |
//! | `relay` | public-reachability detection and relay candidate scoring |
//! | `store` | TTL-bounded content-addressed message cache over the DHT |
//!
//! ## Failure Model
//!
//! Transient connectivity failures (dial timeouts, unreachable relays, DHT
//! query timeouts) are absorbed into counters and backoff state and logged,
//! never surfaced to callers; every retry path is scheduled. Only
//! constructor-time failures of required collaborators propagate as errors.
//! The mesh heals itself silently.

pub mod host;
pub mod identity;
pub mod messages;
pub mod peers;
pub mod relay;
pub mod router;
pub mod store;

pub use host::{Connectedness, ConnectionInfo, ContentDht, Discovery, Host, NetworkEvent, Pinger};
pub use identity::{PeerId, PeerInfo};
pub use messages::{ChatMessage, ContentKey};
pub use peers::{rendezvous_for, PeerManager, PeerManagerConfig, PeerRecord};
pub use relay::{
    PeerScore, RelayInfo, RelayResources, RelayService, RelayServiceConfig, ScoreWeights,
};
pub use router::{
    ConnectionResult, ConnectionStrategy, RouterConfig, RouterStats, SmartRouter, StrategyStats,
};
pub use store::{CacheStats, DistributedStore, StoreConfig};
