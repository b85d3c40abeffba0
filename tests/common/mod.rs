//! Shared in-memory collaborator double for integration tests.
//!
//! `MeshDouble` implements every collaborator trait the connectivity layer
//! consumes (transport host, rendezvous discovery, content DHT, pinger) with
//! scriptable behavior: per-peer dial policies, injectable discovery results,
//! and call counters the tests assert against.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use chatmesh::{
    Connectedness, ConnectionInfo, ContentDht, ContentKey, Discovery, Host, NetworkEvent, PeerId,
    PeerInfo, Pinger,
};

/// How the double answers dial attempts for a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialPolicy {
    /// Every dial succeeds.
    Accept,
    /// Every dial fails.
    Refuse,
    /// Dials succeed only through a circuit-relay address.
    RelayOnly,
    /// Dials fail until `n` attempts to this peer have already been made.
    AcceptAfter(usize),
}

#[derive(Default)]
struct DoubleState {
    connected: HashSet<PeerId>,
    /// Remote addresses of live connections, per peer.
    conns: HashMap<PeerId, Vec<String>>,
    /// Address book: addresses plus the TTL they were last recorded with.
    addr_book: HashMap<PeerId, (Vec<String>, Duration)>,
    policies: HashMap<PeerId, DialPolicy>,
    local_addrs: Vec<String>,
    discoverable: Vec<PeerInfo>,
    connect_log: Vec<(PeerId, Vec<String>)>,
    event_subscribers: Vec<mpsc::Sender<NetworkEvent>>,
    ping_fail: HashSet<PeerId>,
    dial_delay: Duration,
    dht_values: HashMap<String, Vec<u8>>,
    dht_unavailable: bool,
    provided_keys: Vec<ContentKey>,
    providers: HashMap<String, Vec<PeerInfo>>,
}

pub struct MeshDouble {
    local: PeerId,
    state: Mutex<DoubleState>,
    advertise_calls: AtomicUsize,
    find_calls: AtomicUsize,
}

pub fn peer(byte: u8) -> PeerId {
    PeerId::from_bytes([byte; 32])
}

static TRACING: Once = Once::new();

/// Install a process-wide test subscriber once. Honors `RUST_LOG` so a
/// failing run can be re-executed with verbose output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

impl MeshDouble {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            state: Mutex::new(DoubleState::default()),
            advertise_calls: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DoubleState> {
        self.state.lock().expect("double state lock")
    }

    pub fn set_policy(&self, peer: PeerId, policy: DialPolicy) {
        self.state().policies.insert(peer, policy);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.state().dial_delay = delay;
    }

    pub fn set_local_addrs(&self, addrs: &[&str]) {
        self.state().local_addrs = addrs.iter().map(|a| a.to_string()).collect();
    }

    pub fn set_discoverable(&self, peers: Vec<PeerInfo>) {
        self.state().discoverable = peers;
    }

    pub fn set_ping_fail(&self, peer: PeerId) {
        self.state().ping_fail.insert(peer);
    }

    pub fn set_dht_unavailable(&self, unavailable: bool) {
        self.state().dht_unavailable = unavailable;
    }

    pub fn set_providers(&self, key: &ContentKey, providers: Vec<PeerInfo>) {
        self.state().providers.insert(key.to_hex(), providers);
    }

    pub fn insert_dht_value(&self, key: &str, value: Vec<u8>) {
        self.state().dht_values.insert(key.to_string(), value);
    }

    pub fn dht_value(&self, key: &str) -> Option<Vec<u8>> {
        self.state().dht_values.get(key).cloned()
    }

    pub fn provided_keys(&self) -> Vec<ContentKey> {
        self.state().provided_keys.clone()
    }

    /// Mark a peer connected with the given live connection addresses,
    /// notifying event subscribers.
    pub fn mark_connected(&self, peer: PeerId, remote_addrs: &[&str]) {
        let subscribers = {
            let mut state = self.state();
            state.connected.insert(peer);
            state
                .conns
                .insert(peer, remote_addrs.iter().map(|a| a.to_string()).collect());
            state.event_subscribers.clone()
        };
        for tx in subscribers {
            let _ = tx.try_send(NetworkEvent::Connected(peer));
        }
    }

    /// Mark a peer disconnected, notifying event subscribers.
    pub fn mark_disconnected(&self, peer: PeerId) {
        let subscribers = {
            let mut state = self.state();
            state.connected.remove(&peer);
            state.conns.remove(&peer);
            state.event_subscribers.clone()
        };
        for tx in subscribers {
            let _ = tx.try_send(NetworkEvent::Disconnected(peer));
        }
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_log.len()
    }

    pub fn connect_log(&self) -> Vec<(PeerId, Vec<String>)> {
        self.state().connect_log.clone()
    }

    pub fn advertise_count(&self) -> usize {
        self.advertise_calls.load(Ordering::SeqCst)
    }

    pub fn find_count(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn address_book_entry(&self, peer: &PeerId) -> Option<(Vec<String>, Duration)> {
        self.state().addr_book.get(peer).cloned()
    }
}

#[async_trait]
impl Host for MeshDouble {
    fn local_id(&self) -> PeerId {
        self.local
    }

    async fn connect(&self, peer: &PeerId, addrs: &[String], _timeout: Duration) -> Result<()> {
        let (policy, delay, prior_attempts) = {
            let mut state = self.state();
            let prior = state
                .connect_log
                .iter()
                .filter(|(logged, _)| logged == peer)
                .count();
            state.connect_log.push((*peer, addrs.to_vec()));
            (
                state.policies.get(peer).copied().unwrap_or(DialPolicy::Accept),
                state.dial_delay,
                prior,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let established = match policy {
            DialPolicy::Accept => addrs.first().cloned(),
            DialPolicy::Refuse => None,
            DialPolicy::RelayOnly => addrs.iter().find(|a| a.contains("/p2p-circuit")).cloned(),
            DialPolicy::AcceptAfter(n) => {
                if prior_attempts >= n {
                    addrs.first().cloned()
                } else {
                    None
                }
            }
        };

        match established {
            Some(addr) => {
                self.mark_connected(*peer, &[addr.as_str()]);
                Ok(())
            }
            None => anyhow::bail!("connection refused"),
        }
    }

    async fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.state().connected.contains(peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    async fn peers(&self) -> Vec<PeerId> {
        self.state().connected.iter().copied().collect()
    }

    async fn connections_to(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.state()
            .conns
            .get(peer)
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|a| ConnectionInfo {
                        peer: *peer,
                        remote_addr: a.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn local_addrs(&self) -> Vec<String> {
        self.state().local_addrs.clone()
    }

    async fn add_addresses(&self, peer: &PeerId, addrs: &[String], ttl: Duration) {
        let mut state = self.state();
        let entry = state
            .addr_book
            .entry(*peer)
            .or_insert_with(|| (Vec::new(), ttl));
        for addr in addrs {
            if !entry.0.contains(addr) {
                entry.0.push(addr.clone());
            }
        }
        entry.1 = ttl;
    }

    async fn addresses(&self, peer: &PeerId) -> Vec<String> {
        self.state()
            .addr_book
            .get(peer)
            .map(|(addrs, _)| addrs.clone())
            .unwrap_or_default()
    }

    async fn subscribe_events(&self) -> mpsc::Receiver<NetworkEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.state().event_subscribers.push(tx);
        rx
    }
}

#[async_trait]
impl Discovery for MeshDouble {
    async fn advertise(&self, _namespace: &str, _timeout: Duration) -> Result<()> {
        self.advertise_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_peers(
        &self,
        _namespace: &str,
        _timeout: Duration,
    ) -> Result<mpsc::Receiver<PeerInfo>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let results = self.state().discoverable.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for info in results {
                if tx.send(info).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl ContentDht for MeshDouble {
    async fn provide(&self, key: &ContentKey, _announce: bool) -> Result<()> {
        let mut state = self.state();
        if state.dht_unavailable {
            anyhow::bail!("DHT unavailable");
        }
        state.provided_keys.push(*key);
        Ok(())
    }

    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        if state.dht_unavailable {
            anyhow::bail!("DHT unavailable");
        }
        state.dht_values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
        let state = self.state();
        if state.dht_unavailable {
            anyhow::bail!("DHT unavailable");
        }
        state
            .dht_values
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("record not found"))
    }

    async fn find_providers(
        &self,
        key: &ContentKey,
        _max: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>> {
        let results = self
            .state()
            .providers
            .get(&key.to_hex())
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for info in results {
                if tx.send(info).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl Pinger for MeshDouble {
    async fn ping(&self, peer: &PeerId, _timeout: Duration) -> Result<Duration> {
        if self.state().ping_fail.contains(peer) {
            anyhow::bail!("ping timed out");
        }
        Ok(Duration::from_millis(5))
    }
}
