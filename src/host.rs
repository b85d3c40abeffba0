//! Collaborator trait definitions for the connectivity layer.
//!
//! This module defines the traits that abstract over the external subsystems
//! the routing core depends on but does not implement. Each collaborator has
//! its own trait so components can be wired against exactly the capabilities
//! they need.
//!
//! ## Collaborator Traits
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport/host | [`Host`] | dialing, connection state, address book, events |
//! | Rendezvous discovery | [`Discovery`] | advertise + find peers in a namespace |
//! | DHT content store | [`ContentDht`] | provider records and key/value storage |
//! | Liveness probe | [`Pinger`] | round-trip probes for keep-alive |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Allow components ([`crate::peers`], [`crate::router`], [`crate::relay`],
//!   [`crate::store`]) to depend only on traits, not a concrete transport
//! - Keep the routing core testable against in-memory doubles
//! - Avoid circular dependencies between modules
//!
//! Discovery and provider results are delivered as bounded channel streams and
//! consumed incrementally, so a slow consumer never buffers a whole result set.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::{PeerId, PeerInfo};
use crate::messages::ContentKey;

/// Address-book TTL for addresses learned from discovery results.
/// Short-lived: discovery refreshes them on every pass.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Address-book TTL for addresses of peers we are actively connected to.
/// Refreshed by the keep-alive loop so a live connection never loses its
/// addresses to expiry.
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Connection state of a peer as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    Connected,
    NotConnected,
}

/// A live connection to a peer, including the remote address in use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub remote_addr: String,
}

/// Connect/disconnect notifications emitted by the transport.
///
/// Notifications may arrive out of order relative to in-flight dials;
/// consumers must treat derived state as eventually consistent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Transport/host abstraction: dialing, connection state, and the address book.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// This node's own identifier.
    fn local_id(&self) -> PeerId;

    /// Dial a peer at the given addresses, bounded by `timeout`.
    async fn connect(&self, peer: &PeerId, addrs: &[String], timeout: Duration) -> Result<()>;

    /// Current connection state for a peer.
    async fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// All currently connected peers.
    async fn peers(&self) -> Vec<PeerId>;

    /// Live connections to a specific peer, if any.
    async fn connections_to(&self, peer: &PeerId) -> Vec<ConnectionInfo>;

    /// Locally bound listen addresses.
    async fn local_addrs(&self) -> Vec<String>;

    /// Record addresses for a peer in the address book with the given TTL.
    async fn add_addresses(&self, peer: &PeerId, addrs: &[String], ttl: Duration);

    /// Known addresses for a peer from the address book.
    async fn addresses(&self, peer: &PeerId) -> Vec<String>;

    /// Subscribe to connect/disconnect notifications.
    async fn subscribe_events(&self) -> mpsc::Receiver<NetworkEvent>;
}

/// Rendezvous-based peer discovery.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Advertise our presence under a namespace, bounded by `timeout`.
    async fn advertise(&self, namespace: &str, timeout: Duration) -> Result<()>;

    /// Find peers advertising under a namespace.
    ///
    /// Results arrive incrementally on the returned channel; the stream ends
    /// (sender dropped) when the query completes or `timeout` elapses.
    async fn find_peers(
        &self,
        namespace: &str,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<PeerInfo>>;
}

/// DHT-backed content storage: provider records plus key/value records.
#[async_trait]
pub trait ContentDht: Send + Sync + 'static {
    /// Announce that this node can provide the content behind `key`.
    async fn provide(&self, key: &ContentKey, announce: bool) -> Result<()>;

    /// Store a value under a record key.
    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch a value by record key.
    async fn get_value(&self, key: &str) -> Result<Vec<u8>>;

    /// Find peers providing the content behind `key`, up to `max` results.
    ///
    /// Results arrive incrementally on the returned channel.
    async fn find_providers(
        &self,
        key: &ContentKey,
        max: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>>;
}

/// Liveness probe for connected peers.
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    /// Probe a peer, returning the observed round-trip time.
    async fn ping(&self, peer: &PeerId, timeout: Duration) -> Result<Duration>;
}
