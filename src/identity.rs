//! # Peer Identity Types
//!
//! This module defines the identity types used throughout chatmesh:
//!
//! - [`PeerId`]: opaque 32-byte peer identifier (stable, comparable, hashable)
//! - [`PeerInfo`]: a peer identifier together with its known network addresses
//!
//! Identity *derivation* (keypairs, signatures) is the transport's concern;
//! this layer only needs identifiers it can compare, hash, and log.

use serde::{Deserialize, Serialize};

/// Opaque 32-byte peer identifier.
///
/// Stable for the lifetime of a peer and usable as a map key. The routing
/// layer never interprets the bytes; it only compares them and renders them
/// as hex for logging.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Truncated hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<PeerId> for [u8; 32] {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer identifier with the addresses it was last known reachable at.
///
/// Addresses are opaque strings in the transport's own format; circuit-relay
/// addresses are recognized by the `/p2p-circuit` marker (see
/// [`crate::router`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// A peer info with a single address.
    pub fn single(id: PeerId, addr: String) -> Self {
        Self {
            id,
            addrs: vec![addr],
        }
    }
}
