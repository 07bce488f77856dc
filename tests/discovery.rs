//! Discovery integration: subscription-driven pairing through
//! intermediaries, TTL-bounded forwarding with loop suppression, and the
//! disconnect-after-pairing mode.

use std::time::Duration;

use chaski::{ChaskiNode, NodeConfig, OnPair};

mod util;
use util::wait_until;

fn node_config(name: &str, topics: &[&str]) -> NodeConfig {
    NodeConfig::default()
        .with_name(name)
        .with_subscriptions(topics.iter().copied())
        .with_reconnections(None)
        // Keep the periodic ticker out of the way; tests drive discovery
        // explicitly.
        .with_discovery_interval(Duration::from_secs(300))
}

async fn paired_on(node: &ChaskiNode, topic: &str) -> bool {
    node.edges()
        .await
        .unwrap()
        .iter()
        .any(|e| e.paired_topics.contains(&topic.to_string()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_discovery_without_shared_topics() {
    let a = ChaskiNode::start(node_config("A", &["A"])).await.unwrap();
    let b = ChaskiNode::start(node_config("B", &["B"])).await.unwrap();

    a.connect(&b.address().to_string()).await.unwrap();
    b.discovery(OnPair::None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(a.edges().await.unwrap().len(), 1);
    assert_eq!(b.edges().await.unwrap().len(), 1);
    assert!(!paired_on(&a, "A").await);
    assert!(!paired_on(&b, "B").await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_discover_each_other_through_a_hub() {
    let hub = ChaskiNode::start(node_config("Hub", &["A"])).await.unwrap();
    let left = ChaskiNode::start(node_config("Left", &["B"])).await.unwrap();
    let right = ChaskiNode::start(node_config("Right", &["B"])).await.unwrap();

    left.connect(&hub.address().to_string()).await.unwrap();
    right.connect(&hub.address().to_string()).await.unwrap();

    right.discovery(OnPair::None).await.unwrap();

    let discovered = wait_until(Duration::from_secs(3), || async {
        right.is_connected_to(left.address()).await.unwrap()
            && left.is_connected_to(right.address()).await.unwrap()
            && paired_on(&right, "B").await
            && paired_on(&left, "B").await
    })
    .await;
    assert!(discovered, "left and right must pair on B via the hub");

    assert_eq!(hub.edges().await.unwrap().len(), 2);
    assert_eq!(left.edges().await.unwrap().len(), 2);
    assert_eq!(right.edges().await.unwrap().len(), 2);

    hub.stop().await;
    left.stop().await;
    right.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_hop_discovery_pairs_the_far_ends() {
    // R subscribed to a,b; M subscribed to a; N subscribed to b.
    // N only knows M, M only knows R. Discovery pairs N directly with R.
    let r = ChaskiNode::start(node_config("R", &["a", "b"])).await.unwrap();
    let m = ChaskiNode::start(node_config("M", &["a"])).await.unwrap();
    let n = ChaskiNode::start(node_config("N", &["b"])).await.unwrap();

    m.connect(&r.address().to_string()).await.unwrap();
    n.connect(&m.address().to_string()).await.unwrap();

    n.discovery(OnPair::None).await.unwrap();

    let paired = wait_until(Duration::from_secs(3), || async {
        n.is_connected_to(r.address()).await.unwrap() && paired_on(&n, "b").await
    })
    .await;
    assert!(paired, "N must hold a direct paired edge to R");

    r.stop().await;
    m.stop().await;
    n.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ring_discovery_suppresses_loops() {
    // Triangle A-B-C-A, everyone subscribed to "t". A's discovery reaches
    // B and C once each; forwarded copies are dropped by the visited set
    // and the (origin, id) dedupe cache, so nothing is handled twice.
    let a = ChaskiNode::start(node_config("A", &["t"])).await.unwrap();
    let b = ChaskiNode::start(node_config("B", &["t"])).await.unwrap();
    let c = ChaskiNode::start(node_config("C", &["t"])).await.unwrap();

    a.connect(&b.address().to_string()).await.unwrap();
    b.connect(&c.address().to_string()).await.unwrap();
    c.connect(&a.address().to_string()).await.unwrap();

    a.discovery(OnPair::None).await.unwrap();

    let paired = wait_until(Duration::from_secs(3), || async {
        paired_on(&a, "t").await
    })
    .await;
    assert!(paired, "A must pair with a responder on t");

    tokio::time::sleep(Duration::from_millis(500)).await;

    // Loop suppression: every node still holds exactly its two ring edges,
    // no duplicates appeared.
    for (name, node) in [("A", &a), ("B", &b), ("C", &c)] {
        let edges = node.edges().await.unwrap();
        assert_eq!(edges.len(), 2, "{name} must keep exactly two edges");
        let mut addresses: Vec<String> =
            edges.iter().map(|e| e.address.to_string()).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), 2, "{name} must not hold duplicate edges");
    }

    // A accepted exactly one pairing per (topic, peer): at most one of
    // B / C won the round, the other was declined and rolled back.
    let a_paired: usize = a
        .edges()
        .await
        .unwrap()
        .iter()
        .filter(|e| e.paired_topics.contains(&"t".to_string()))
        .count();
    assert_eq!(a_paired, 1, "first responder wins, the rest are declined");

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn on_pair_disconnect_drops_the_forwarding_edge() {
    let hub = ChaskiNode::start(node_config("Hub", &["A"])).await.unwrap();
    let keeper = ChaskiNode::start(node_config("Keeper", &["B"])).await.unwrap();
    let roamer = ChaskiNode::start(node_config("Roamer", &["B"])).await.unwrap();

    keeper.connect(&hub.address().to_string()).await.unwrap();
    roamer.connect(&hub.address().to_string()).await.unwrap();

    roamer.discovery(OnPair::Disconnect).await.unwrap();

    let settled = wait_until(Duration::from_secs(3), || async {
        roamer.is_connected_to(keeper.address()).await.unwrap()
            && !roamer.is_connected_to(hub.address()).await.unwrap()
    })
    .await;
    assert!(
        settled,
        "roamer must hold only the paired edge after disconnect mode"
    );

    // The keeper stays connected to both.
    assert_eq!(keeper.edges().await.unwrap().len(), 2);
    let final_hub_edges = wait_until(Duration::from_secs(2), || async {
        hub.edges().await.unwrap().len() == 1
    })
    .await;
    assert!(final_hub_edges, "hub must only keep the keeper edge");

    hub.stop().await;
    keeper.stop().await;
    roamer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ttl_zero_is_not_forwarded() {
    // With ttl 0 the hub cannot forward, so the far peer never learns
    // about the initiator.
    let mut far_config = node_config("Far", &["B"]);
    far_config.ttl = 0;
    let hub = ChaskiNode::start(node_config("Hub", &["A"])).await.unwrap();
    let near = ChaskiNode::start(node_config("Near", &["B"])).await.unwrap();
    let far = ChaskiNode::start(far_config).await.unwrap();

    near.connect(&hub.address().to_string()).await.unwrap();
    far.connect(&hub.address().to_string()).await.unwrap();

    far.discovery(OnPair::None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(
        !far.is_connected_to(near.address()).await.unwrap(),
        "a zero-ttl discovery must die at the first hop"
    );

    hub.stop().await;
    near.stop().await;
    far.stop().await;
}
