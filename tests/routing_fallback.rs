//! Integration tests for the smart router's ordered fallback: tier ordering,
//! per-tier statistics, relay candidate synthesis, and scorer feedback.

mod common;

use std::sync::Arc;

use chatmesh::{
    ConnectionStrategy, PeerInfo, RelayService, RelayServiceConfig, RouterConfig, SmartRouter,
};
use common::{init_tracing, peer, DialPolicy, MeshDouble};

fn router(double: &Arc<MeshDouble>) -> SmartRouter<MeshDouble> {
    SmartRouter::new(double.clone(), RouterConfig::default())
}

fn target_info(id: chatmesh::PeerId) -> PeerInfo {
    PeerInfo::single(id, "10.0.0.5:4001".to_string())
}

#[tokio::test]
async fn direct_tier_succeeds_when_already_connected() {
    init_tracing();
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    double.mark_connected(target, &["10.0.0.5:4001"]);
    let router = router(&double);

    let result = router
        .connect_to_peer(&target_info(target))
        .await
        .expect("already connected");

    assert_eq!(result.strategy, ConnectionStrategy::Direct);
    assert!(result.success);
    assert_eq!(result.address.as_deref(), Some("10.0.0.5:4001"));
    assert_eq!(double.connect_count(), 0, "no dial for a live connection");

    let stats = router.stats().await;
    assert_eq!(stats.direct.attempts, 1);
    assert_eq!(stats.direct.successes, 1);
    assert_eq!(stats.connection_count, 1);
}

#[tokio::test]
async fn falls_back_to_relay_when_direct_fails() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    double.set_policy(target, DialPolicy::RelayOnly);
    // A connected peer whose address can be composed into a circuit.
    double.mark_connected(peer(9), &["9.9.9.9:4001"]);
    let router = router(&double);

    let result = router
        .connect_to_peer(&target_info(target))
        .await
        .expect("relay path should succeed");

    assert_eq!(result.strategy, ConnectionStrategy::Relay);
    assert!(result.success);

    let stats = router.stats().await;
    assert_eq!(stats.direct.attempts, 1);
    assert_eq!(stats.direct.successes, 0);
    assert_eq!(stats.relay.attempts, 1);
    assert_eq!(stats.relay.successes, 1);
    assert_eq!(stats.dht_assisted.attempts, 0, "DHT tier never reached");

    // The relay dial used synthesized circuit addresses routing to the target.
    let log = double.connect_log();
    assert_eq!(log.len(), 2);
    assert!(log[1].1.iter().all(|a| a.contains("/p2p-circuit")));
    assert!(log[1].1[0].ends_with(&target.to_hex()));
    assert!(log[1].1.len() <= 3, "candidate fan-out must stay capped");
}

#[tokio::test]
async fn relay_tier_is_skipped_without_candidates() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    double.set_policy(target, DialPolicy::Refuse);
    let router = router(&double);

    let err = router
        .connect_to_peer(&target_info(target))
        .await
        .expect_err("every tier fails");
    assert!(err.to_string().contains("all connection strategies exhausted"));

    let stats = router.stats().await;
    assert_eq!(stats.direct.attempts, 1);
    // No candidates: the relay tier fails without consuming a dial attempt.
    assert_eq!(stats.relay.attempts, 0);
    assert_eq!(stats.dht_assisted.attempts, 1);
    assert_eq!(double.connect_count(), 2, "direct + DHT dials only");
}

#[tokio::test]
async fn dht_tier_succeeds_as_last_resort() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    // First attempt (direct) fails, second (DHT-assisted retry) succeeds.
    double.set_policy(target, DialPolicy::AcceptAfter(1));
    let router = router(&double);

    let result = router
        .connect_to_peer(&target_info(target))
        .await
        .expect("patient retry should land");

    assert_eq!(result.strategy, ConnectionStrategy::DhtAssisted);
    let stats = router.stats().await;
    assert_eq!(stats.direct.attempts, 1);
    assert_eq!(stats.relay.attempts, 0);
    assert_eq!(stats.dht_assisted.attempts, 1);
    assert_eq!(stats.dht_assisted.successes, 1);
}

#[tokio::test]
async fn exhaustion_counts_every_attempted_tier() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    double.set_policy(target, DialPolicy::Refuse);
    double.mark_connected(peer(9), &["9.9.9.9:4001"]);
    let router = router(&double);

    router
        .connect_to_peer(&target_info(target))
        .await
        .expect_err("every tier fails");

    let stats = router.stats().await;
    assert_eq!(stats.direct.attempts, 1);
    assert_eq!(stats.relay.attempts, 1);
    assert_eq!(stats.dht_assisted.attempts, 1);
    assert_eq!(stats.connection_count, 0);

    let rendered = router.format_stats().await;
    assert!(rendered.contains("Direct: 1 attempts, 0 success (0.0%)"));
    assert!(rendered.contains("Total connections: 0"));
}

#[tokio::test]
async fn relay_outcomes_feed_the_scorer() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let target = peer(1);
    let relay_peer = peer(9);
    double.set_policy(target, DialPolicy::RelayOnly);
    double.mark_connected(relay_peer, &["9.9.9.9:4001"]);

    let relay_service = Arc::new(RelayService::new(
        double.clone(),
        RelayServiceConfig::default(),
    ));
    let router =
        SmartRouter::new(double.clone(), RouterConfig::default()).with_relay_service(relay_service.clone());

    router
        .connect_to_peer(&target_info(target))
        .await
        .expect("relay path should succeed");

    let scores = relay_service.peer_scores().await;
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].0, relay_peer);
    assert_eq!(scores[0].1.successful_relays, 1);
    assert_eq!(scores[0].1.failed_relays, 0);
}

#[tokio::test]
async fn connection_type_classifies_live_connections() {
    let double = Arc::new(MeshDouble::new(peer(0)));
    let direct = peer(1);
    let relayed = peer(2);
    let absent = peer(3);
    double.mark_connected(direct, &["10.0.0.1:4001"]);
    double.mark_connected(
        relayed,
        &["9.9.9.9:4001/p2p-circuit/p2p/0202020202020202"],
    );
    let router = router(&double);

    assert_eq!(
        router.connection_type(&direct).await,
        ConnectionStrategy::Direct
    );
    assert_eq!(
        router.connection_type(&relayed).await,
        ConnectionStrategy::Relay
    );
    assert_eq!(
        router.connection_type(&absent).await,
        ConnectionStrategy::DhtAssisted
    );
    assert!(router.is_connected(&direct).await);
    assert!(!router.is_connected(&absent).await);

    let breakdown = router.connected_peers().await;
    assert_eq!(breakdown.len(), 2);
}
