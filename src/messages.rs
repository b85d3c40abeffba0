//! # Message Payloads and Content Addressing
//!
//! This module defines the serializable chat payload stored by the
//! distributed cache, together with its deterministic content key.
//! Payloads are serialized with bincode under an explicit size limit so a
//! malicious record fetched from the network can never balloon memory.
//!
//! ## Content Keys
//!
//! A [`ContentKey`] is a 32-byte blake3 digest computed over
//! `(origin, timestamp, text)`. Identical resubmissions of the same message
//! therefore collapse to the same key, which is what makes cache writes
//! idempotent.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::PeerId;

/// Maximum serialized size of a stored message (64 KiB).
/// Chat payloads are small; anything larger is rejected as hostile.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_MESSAGE_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize a value with the same options the bounded deserializer expects.
pub fn serialize_message(msg: &ChatMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(msg)
}

/// Deterministic identifier for a stored message.
///
/// Derived from the message's origin, timestamp, and text, so the same
/// logical message always maps to the same key regardless of who stores it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
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

    /// The DHT record key this content is stored under.
    pub fn record_key(&self) -> String {
        format!("/messages/{}", self.to_hex())
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..16])
    }
}

/// A chat message as replicated through the distributed cache.
///
/// `expires_at` is an absolute unix-seconds deadline embedded in the record
/// itself, so any node that fetches it from the network can judge staleness
/// without trusting the sender's clock beyond the original write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message kind, e.g. "chat".
    pub kind: String,
    /// The message text.
    pub text: String,
    /// Human-readable author name.
    pub author: String,
    /// Creation time, unix seconds.
    pub timestamp: u64,
    /// The peer that originated the message.
    pub origin: PeerId,
    /// Absolute expiry deadline, unix seconds. `None` until assigned by the
    /// cache on `put`.
    pub expires_at: Option<u64>,
}

impl ChatMessage {
    pub fn new(kind: &str, text: &str, author: &str, timestamp: u64, origin: PeerId) -> Self {
        Self {
            kind: kind.to_string(),
            text: text.to_string(),
            author: author.to_string(),
            timestamp,
            origin,
            expires_at: None,
        }
    }

    /// Deterministic content key over `(origin, timestamp, text)`.
    pub fn content_key(&self) -> ContentKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.origin.as_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(self.text.as_bytes());
        ContentKey(*hasher.finalize().as_bytes())
    }

    /// Whether the embedded deadline has passed at `now` (unix seconds).
    /// A message without a deadline is never considered expired.
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}
