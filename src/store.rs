//! # Distributed Content Cache
//!
//! Gives messages a short, bounded, best-effort existence in the network
//! beyond the originating node's own local log, so a node that was briefly
//! offline can still recover recent messages.
//!
//! The in-memory cache is the authoritative local copy; DHT announcement and
//! record storage are fire-and-forget. Every entry carries an absolute expiry
//! deadline, assigned on `put` (default one hour) and clamped so nothing ever
//! outlives the hard 24-hour cap. Expired entries are evicted lazily on read
//! and by a background sweep.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lru::LruCache;
use tokio::sync::{watch, RwLock};
use tracing::{debug, trace, warn};

use crate::host::{ContentDht, Host};
use crate::identity::PeerInfo;
use crate::messages::{deserialize_bounded, serialize_message, ChatMessage, ContentKey};

/// Default lifetime assigned to a message stored without an explicit expiry.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60 * 60);

/// Hard cap on message lifetime. Nothing in the cache outlives
/// `creation time + MAX_MESSAGE_TTL`, even if asked to.
pub const MAX_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on locally cached messages.
/// SECURITY: Bounds memory growth; oldest entries are evicted first.
pub const MAX_CACHE_ENTRIES: usize = 100_000;

/// Configuration for the distributed cache.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Lifetime assigned when a message carries no expiry.
    pub default_ttl: Duration,
    /// Hard lifetime cap applied to every stored message.
    pub max_ttl: Duration,
    /// How often the background sweep evicts expired entries.
    pub sweep_interval: Duration,
    /// Timeout for DHT queries on the read path.
    pub query_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_MESSAGE_TTL,
            max_ttl: MAX_MESSAGE_TTL,
            sweep_interval: Duration::from_secs(5 * 60),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Cache occupancy counters, for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub max_ttl: Duration,
}

/// Current unix time in seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// The deadline actually stored for a message: the requested expiry if any,
/// else `now + default_ttl`, clamped to `now + max_ttl`.
pub(crate) fn clamp_deadline(
    requested: Option<u64>,
    now: u64,
    default_ttl: Duration,
    max_ttl: Duration,
) -> u64 {
    let requested = requested.unwrap_or_else(|| now.saturating_add(default_ttl.as_secs()));
    requested.min(now.saturating_add(max_ttl.as_secs()))
}

/// TTL-bounded content-addressed message store over the DHT.
pub struct DistributedStore<H: Host, C: ContentDht> {
    host: Arc<H>,
    dht: Arc<C>,
    config: StoreConfig,
    cache: RwLock<LruCache<ContentKey, ChatMessage>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<H: Host, C: ContentDht> DistributedStore<H, C> {
    pub fn new(host: Arc<H>, dht: Arc<C>, config: StoreConfig) -> Self {
        let cap = NonZeroUsize::new(MAX_CACHE_ENTRIES).expect("MAX_CACHE_ENTRIES must be non-zero");
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            host,
            dht,
            config,
            cache: RwLock::new(LruCache::new(cap)),
            shutdown_tx,
        }
    }

    /// Start the background eviction sweep.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.sweep_interval);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => { this.sweep_expired().await; }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Stop the background sweep.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Store a message locally and replicate it to the network best-effort.
    ///
    /// Assigns the default lifetime when the message carries no expiry and
    /// clamps any supplied expiry to the hard cap. The local write is
    /// authoritative; DHT announcement and record storage happen in a
    /// detached task and their failures are only logged.
    pub async fn put(&self, mut msg: ChatMessage) -> Result<ContentKey> {
        let now = unix_now();
        msg.expires_at = Some(clamp_deadline(
            msg.expires_at,
            now,
            self.config.default_ttl,
            self.config.max_ttl,
        ));

        let data = serialize_message(&msg).context("failed to serialize message")?;
        let key = msg.content_key();

        self.cache.write().await.put(key, msg);

        let dht = self.dht.clone();
        tokio::spawn(async move {
            match dht.provide(&key, true).await {
                Ok(()) => trace!(key = ?key, "announced message to DHT"),
                Err(e) => debug!(key = ?key, error = %e, "failed to announce message to DHT"),
            }
            if let Err(e) = dht.put_value(&key.record_key(), data).await {
                debug!(key = ?key, error = %e, "failed to store message record in DHT");
            }
        });

        Ok(key)
    }

    /// Fetch a message by key: local cache first, then the DHT with a bounded
    /// timeout.
    ///
    /// A locally cached but expired entry is evicted and the lookup falls
    /// through to the network; a fetched record that is expired per its
    /// embedded deadline yields `None` rather than stale data.
    pub async fn get(&self, key: &ContentKey) -> Result<Option<ChatMessage>> {
        let now = unix_now();
        {
            let mut cache = self.cache.write().await;
            if let Some(msg) = cache.peek(key) {
                if msg.is_expired_at(now) {
                    cache.pop(key);
                    trace!(key = ?key, "evicted expired entry on read");
                } else {
                    return Ok(Some(msg.clone()));
                }
            }
        }

        let fetched = tokio::time::timeout(
            self.config.query_timeout,
            self.dht.get_value(&key.record_key()),
        )
        .await;
        let data = match fetched {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                debug!(key = ?key, error = %e, "message not found in DHT");
                return Ok(None);
            }
            Err(_) => {
                debug!(key = ?key, "DHT query timed out");
                return Ok(None);
            }
        };

        let msg: ChatMessage = match deserialize_bounded(&data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(key = ?key, error = %e, "malformed message record from DHT");
                return Ok(None);
            }
        };

        if msg.is_expired_at(unix_now()) {
            return Ok(None);
        }

        self.cache.write().await.put(*key, msg.clone());
        Ok(Some(msg))
    }

    /// Find peers providing the content behind `key`, excluding this node,
    /// capped to `max_count`.
    pub async fn find_providers(&self, key: &ContentKey, max_count: usize) -> Result<Vec<PeerInfo>> {
        let mut stream = self.dht.find_providers(key, max_count).await?;
        let local = self.host.local_id();

        let deadline = Instant::now() + self.config.query_timeout;
        let mut providers = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.recv()).await {
                Ok(Some(info)) => {
                    if info.id == local {
                        continue;
                    }
                    providers.push(info);
                    if providers.len() >= max_count {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        Ok(providers)
    }

    /// Best-effort enumeration of live cached messages, newest-first by
    /// cache recency, up to `limit`.
    pub async fn recent_messages(&self, limit: usize) -> Vec<ChatMessage> {
        let now = unix_now();
        self.cache
            .read()
            .await
            .iter()
            .filter(|(_, msg)| !msg.is_expired_at(now))
            .take(limit)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Evict every entry whose deadline has passed. Returns the number
    /// removed. The background sweep calls this in addition to the lazy
    /// eviction performed on reads.
    async fn sweep_expired(&self) -> usize {
        let now = unix_now();
        let mut cache = self.cache.write().await;
        let expired: Vec<ContentKey> = cache
            .iter()
            .filter(|(_, msg)| msg.is_expired_at(now))
            .map(|(key, _)| *key)
            .collect();
        let removed = expired.len();
        for key in expired {
            cache.pop(&key);
        }
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "swept expired messages");
        }
        removed
    }

    /// Cache occupancy counters.
    pub async fn stats(&self) -> CacheStats {
        let now = unix_now();
        let cache = self.cache.read().await;
        let mut active = 0usize;
        let mut expired = 0usize;
        for (_, msg) in cache.iter() {
            if msg.is_expired_at(now) {
                expired += 1;
            } else {
                active += 1;
            }
        }
        CacheStats {
            total: cache.len(),
            active,
            expired,
            max_ttl: self.config.max_ttl,
        }
    }
}
