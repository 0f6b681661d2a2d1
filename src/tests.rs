use crate::broadcast::DEFAULT_RETRANSMIT_MULT;
use crate::codec;
use crate::config::Config;
use crate::delegate::{Delegate, LogEvents, NodeDelegate};
use crate::error::Error;
use crate::join::JoinState;
use crate::node::Node;
use crate::ops::Mutation;
use crate::transport::memory::{MemoryNetwork, MemoryTransport};
use crate::transport::Transport;
use crate::types::Snapshot;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

async fn start(
    network: &MemoryNetwork,
    name: &str,
    seeds: &[&Node<MemoryTransport>],
) -> Node<MemoryTransport> {
    let seeds: Vec<String> = seeds.iter().map(|n| n.address().to_string()).collect();
    let config = Config::default()
        .with_name(name)
        .with_bind("127.0.0.1:0")
        .with_seeds(seeds);
    Node::start(config, |id| network.bind(id)).await.unwrap()
}

/// Gossip from every node until all broadcast queues are empty
fn gossip_until_quiet(nodes: &[&Node<MemoryTransport>]) {
    for _ in 0..100 {
        let sent: usize = nodes.iter().map(|n| n.transport().gossip()).sum();
        if sent == 0 {
            return;
        }
    }
    panic!("gossip did not settle");
}

#[tokio::test]
async fn test_basic_set_get() {
    let network = MemoryNetwork::new();
    let node = start(&network, "a", &[]).await;

    node.set("key1", "value1").unwrap();
    assert_eq!(node.get("key1").unwrap(), json!("value1"));

    node.set("key1", json!({"nested": [1, 2]})).unwrap();
    assert_eq!(node.get("key1").unwrap(), json!({"nested": [1, 2]}));

    let missing = node.get("nonexistent").unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_empty_value_is_not_absent() {
    let network = MemoryNetwork::new();
    let node = start(&network, "a", &[]).await;

    node.set("empty", "").unwrap();
    assert_eq!(node.get("empty").unwrap(), json!(""));
    node.set("null", json!(null)).unwrap();
    assert_eq!(node.get("null").unwrap(), json!(null));
}

#[tokio::test]
async fn test_delete_then_get() {
    let network = MemoryNetwork::new();
    let node = start(&network, "a", &[]).await;

    node.set("key1", "value1").unwrap();
    node.delete("key1").unwrap();
    assert!(matches!(node.get("key1"), Err(Error::NotFound(key)) if key == "key1"));

    // Never set
    node.delete("ghost").unwrap();
    assert!(node.get("ghost").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_single_node_completions_fire() {
    let network = MemoryNetwork::new();
    let node = start(&network, "a", &[]).await;
    assert_eq!(node.num_members(), 1);

    let completion = node.set("x", "1").unwrap();
    timeout(Duration::from_secs(1), completion)
        .await
        .expect("completion should fire without peers");
    assert_eq!(node.broadcasts().num_queued(), 0);
}

#[tokio::test]
async fn test_join_receives_existing_state() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    a.set("x", "1").unwrap();
    assert_eq!(a.join_state(), JoinState::Unjoined);

    let b = start(&network, "b", &[&a]).await;
    assert_eq!(b.join_state(), JoinState::Joined);
    assert_eq!(b.get("x").unwrap(), json!("1"));
    assert_eq!(a.num_members(), 2);
    assert_eq!(b.num_members(), 2);
}

#[tokio::test]
async fn test_join_is_bidirectional_and_overwrites() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[]).await;

    a.set("shared", "from-a").unwrap();
    a.set("only-a", 1).unwrap();
    b.set("shared", "from-b").unwrap();
    b.set("only-b", 2).unwrap();

    b.join(&[a.address().to_string()]).await.unwrap();

    // Both sides end up with every key; the shared one is whichever snapshot was merged last
    assert_eq!(a.store().keys(), b.store().keys());
    assert_eq!(a.get("only-b").unwrap(), json!(2));
    assert_eq!(b.get("only-a").unwrap(), json!(1));
    assert!(a.get("shared").is_ok());
    assert!(b.get("shared").is_ok());
}

#[tokio::test]
async fn test_mutations_gossip_to_peers() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;
    let c = start(&network, "c", &[&b]).await;

    a.set("k1", "v1").unwrap();
    c.set("k2", json!([1, 2, 3])).unwrap();
    gossip_until_quiet(&[&a, &b, &c]);

    for node in [&a, &b, &c] {
        assert_eq!(node.get("k1").unwrap(), json!("v1"));
        assert_eq!(node.get("k2").unwrap(), json!([1, 2, 3]));
    }
    assert_eq!(a.store().snapshot(), b.store().snapshot());
    assert_eq!(b.store().snapshot(), c.store().snapshot());
}

#[tokio::test]
async fn test_set_then_delete_propagates() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;

    a.set("x", "1").unwrap();
    a.delete("x").unwrap();
    assert_eq!(a.broadcasts().num_queued(), 2);

    gossip_until_quiet(&[&a, &b]);
    assert!(b.get("x").unwrap_err().is_not_found());
    assert!(b.store().is_empty());
}

#[tokio::test]
async fn test_received_mutations_are_not_rebroadcast() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;

    a.set("x", "1").unwrap();
    assert_eq!(a.transport().gossip(), 1);
    assert_eq!(b.get("x").unwrap(), json!("1"));
    assert_eq!(b.broadcasts().num_queued(), 0);
    assert_eq!(b.transport().gossip(), 0);
}

#[tokio::test]
async fn test_completion_fires_after_budget_exhausted() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let _b = start(&network, "b", &[&a]).await;

    let mut completion = a.set("x", "1").unwrap();
    assert_eq!(a.broadcasts().remaining_transmits(), vec![DEFAULT_RETRANSMIT_MULT]);

    for _ in 0..DEFAULT_RETRANSMIT_MULT - 1 {
        assert_eq!(a.transport().gossip(), 1);
        assert!(!completion.is_finished());
    }
    assert_eq!(a.transport().gossip(), 1);
    assert!(completion.is_finished());
    assert_eq!(a.transport().gossip(), 0);
}

#[tokio::test]
async fn test_background_gossip_converges() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;
    let ticker = a.transport().start_gossip(Duration::from_millis(5));

    let completion = a.set("x", "1").unwrap();
    timeout(Duration::from_secs(5), completion)
        .await
        .expect("broadcast should drain");
    ticker.abort();

    assert_eq!(b.get("x").unwrap(), json!("1"));
}

#[tokio::test]
async fn test_malformed_message_leaves_store_unchanged() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;
    b.set("k", "v").unwrap();
    let before = b.store().snapshot();

    for garbage in [&b""[..], b"d", b"d{{{", b"d[{\"Action\":1}]", b"\xff\x00", b"q[]"] {
        a.transport().send_to(b.address(), garbage).unwrap();
    }
    assert_eq!(b.store().snapshot(), before);
}

#[tokio::test]
async fn test_join_failure_keeps_node_usable() {
    let network = MemoryNetwork::new();
    let config = Config::default()
        .with_name("lonely")
        .with_seeds(["127.0.0.1:1", "127.0.0.1:2"]);
    let node = Node::start(config, |id| network.bind(id)).await.unwrap();
    assert_eq!(node.join_state(), JoinState::Unjoined);
    assert!(matches!(
        node.last_join_error(),
        Some(Error::JoinFailed { seeds: 2, .. })
    ));
    assert!(node.status().last_join_error.is_some());

    let err = node.join(&["127.0.0.1:1".to_string()]).await.unwrap_err();
    assert!(matches!(err, Error::JoinFailed { seeds: 1, .. }));
    let err = node.join(&[]).await.unwrap_err();
    assert!(matches!(err, Error::JoinFailed { seeds: 0, .. }));
    assert!(matches!(
        node.last_join_error(),
        Some(Error::JoinFailed { seeds: 0, .. })
    ));
    assert_eq!(node.join_state(), JoinState::Unjoined);

    node.set("x", "1").unwrap();
    assert_eq!(node.get("x").unwrap(), json!("1"));
}

#[tokio::test]
async fn test_join_error_cleared_by_successful_join() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    assert!(a.last_join_error().is_none());

    let config = Config::default()
        .with_name("b")
        .with_seeds(["127.0.0.1:1"]);
    let b = Node::start(config, |id| network.bind(id)).await.unwrap();
    assert!(b.last_join_error().is_some());

    b.join(&[a.address().to_string()]).await.unwrap();
    assert!(b.last_join_error().is_none());
    assert!(b.status().last_join_error.is_none());
}

#[tokio::test]
async fn test_completion_fires_after_peers_leave() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;

    let completion = a.set("x", "1").unwrap();
    assert_eq!(a.broadcasts().num_queued(), 1);
    b.leave().await;
    assert_eq!(a.num_members(), 1);

    let ticker = a.transport().start_gossip(Duration::from_millis(1));
    timeout(Duration::from_millis(500), completion)
        .await
        .expect("completion should fire once every peer has left");
    ticker.abort();
    assert_eq!(a.broadcasts().num_queued(), 0);
}

#[tokio::test]
async fn test_rejoin_keeps_joined_on_failure() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;
    let mut states = b.subscribe_join();
    assert_eq!(*states.borrow_and_update(), JoinState::Joined);

    assert!(b.join(&["127.0.0.1:1".to_string()]).await.is_err());
    assert_eq!(b.join_state(), JoinState::Joined);
    assert!(b.last_join_error().is_some());

    assert_eq!(b.join(&[a.address().to_string()]).await.unwrap(), 1);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow(), JoinState::Joined);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected_by_transport() {
    let network = MemoryNetwork::new();
    let _a = start(&network, "same", &[]).await;
    let result = Node::start(Config::default().with_name("same"), |id| network.bind(id)).await;
    assert!(matches!(result, Err(Error::Bind(_))));
}

#[tokio::test]
async fn test_invalid_bind_address_is_fatal() {
    let network = MemoryNetwork::new();
    let result = Node::start(Config::default().with_bind("no-port"), |id| network.bind(id)).await;
    assert!(matches!(result, Err(Error::InvalidAddress(_))));
    assert!(network.is_empty());
}

#[tokio::test]
async fn test_generated_names_are_unique() {
    let network = MemoryNetwork::new();
    let a = Node::start(Config::default(), |id| network.bind(id)).await.unwrap();
    let b = Node::start(Config::default(), |id| network.bind(id)).await.unwrap();
    assert_ne!(a.name(), b.name());
    assert_ne!(a.address(), b.address());
}

#[tokio::test]
async fn test_leave_releases_waiters() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;

    let completion = a.set("x", "1").unwrap();
    assert_eq!(a.broadcasts().num_queued(), 1);
    a.leave().await;
    timeout(Duration::from_secs(1), completion).await.unwrap();
    assert_eq!(b.num_members(), 1);
    assert_eq!(a.broadcasts().num_queued(), 0);
}

#[tokio::test]
async fn test_status() {
    let network = MemoryNetwork::new();
    let a = start(&network, "a", &[]).await;
    let b = start(&network, "b", &[&a]).await;
    b.set("k", "v").unwrap();

    let status = b.status();
    assert_eq!(status.name, "b");
    assert_eq!(status.n_kvs, 1);
    assert_eq!(status.queued_broadcasts, 1);
    assert_eq!(status.members, 2);
    assert_eq!(status.join_state, JoinState::Joined);
    assert_eq!(status.last_join_error, None);
    assert!(serde_json::to_string(&status).is_ok());
}

#[tokio::test]
async fn test_concurrent_writers_and_gossip() {
    let network = MemoryNetwork::new();
    let a = Arc::new(start(&network, "a", &[]).await);
    let b = start(&network, "b", &[a.as_ref()]).await;
    let ticker = a.transport().start_gossip(Duration::from_millis(1));

    let mut writers = Vec::new();
    for w in 0..4 {
        let a = a.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..25 {
                a.set(format!("w{w}-{i}"), i).unwrap();
                sleep(Duration::from_micros(100)).await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    timeout(Duration::from_secs(10), async {
        while a.broadcasts().num_queued() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue should drain");
    ticker.abort();

    assert_eq!(a.store().len(), 100);
    assert_eq!(a.store().snapshot(), b.store().snapshot());
}

#[test]
fn test_merge_policy_through_delegate() {
    let network = MemoryNetwork::new();
    let transport = network
        .bind(&crate::identity::NodeIdentity {
            name: "solo".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
        })
        .unwrap();
    let transport = Arc::new(transport);
    let broadcasts = Arc::new(crate::broadcast::TransmitLimitedQueue::new(
        transport.clone(),
        DEFAULT_RETRANSMIT_MULT,
    ));
    let store = Arc::new(crate::store::Store::new(broadcasts.clone()));
    let delegate = Arc::new(NodeDelegate::new(store.clone(), broadcasts));
    transport.attach(delegate.clone(), Arc::new(LogEvents));

    store.set("local", "kept").unwrap();
    store.set("shared", "old").unwrap();

    let remote = codec::encode_snapshot(&Snapshot::from([
        ("shared".to_string(), json!("new")),
        ("extra".to_string(), json!(3)),
    ]))
    .unwrap();

    delegate.merge_remote_state(&remote, false);
    assert_eq!(store.get("shared").unwrap(), json!("old"));
    assert!(store.get("extra").is_err());

    delegate.merge_remote_state(&remote, true);
    assert_eq!(store.get("shared").unwrap(), json!("new"));
    assert_eq!(store.get("extra").unwrap(), json!(3));
    assert_eq!(store.get("local").unwrap(), json!("kept"));
    assert_eq!(store.len(), 3);
}

fn arb_mutation() -> impl Strategy<Value = Mutation> {
    let key = "[a-d]";
    let value = prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(|s| json!(s)),
        Just(json!(null)),
    ];
    prop_oneof![
        (key, value).prop_map(|(k, v)| Mutation::set(k, v)),
        key.prop_map(|k| Mutation::delete(k)),
    ]
}

fn detached_store() -> crate::store::Store {
    struct Alone;
    impl crate::transport::Membership for Alone {
        fn num_members(&self) -> usize {
            1
        }
    }
    let queue =
        crate::broadcast::TransmitLimitedQueue::new(Arc::new(Alone), DEFAULT_RETRANSMIT_MULT);
    crate::store::Store::new(Arc::new(queue))
}

proptest! {
    #[test]
    fn prop_applying_batch_twice_is_idempotent(
        seed in prop::collection::vec(arb_mutation(), 0..8),
        batch in prop::collection::vec(arb_mutation(), 0..8),
    ) {
        let once = detached_store();
        let twice = detached_store();
        once.apply_remote(seed.clone());
        twice.apply_remote(seed);

        once.apply_remote(batch.clone());
        twice.apply_remote(batch.clone());
        twice.apply_remote(batch);
        prop_assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn prop_replicas_fed_the_same_mutations_converge(
        writes in prop::collection::vec(arb_mutation(), 0..16),
    ) {
        let origin = detached_store();
        let replica = detached_store();
        for mutation in writes {
            let msg = codec::encode_mutations(std::slice::from_ref(&mutation)).unwrap();
            origin.apply_remote(vec![mutation]);
            let Some(codec::Envelope::Data(batch)) = codec::decode_envelope(&msg).unwrap() else {
                unreachable!();
            };
            replica.apply_remote(batch);
        }
        prop_assert_eq!(origin.snapshot(), replica.snapshot());
    }

    #[test]
    fn prop_snapshot_merge_converges_when_replica_only_gains_keys(
        writes in prop::collection::vec(arb_mutation(), 0..16),
    ) {
        let origin = detached_store();
        origin.apply_remote(writes);
        let joiner = detached_store();
        joiner.merge_snapshot(origin.snapshot());
        prop_assert_eq!(origin.snapshot(), joiner.snapshot());
    }

    #[test]
    fn prop_non_join_merge_never_mutates(
        local in prop::collection::vec(arb_mutation(), 0..8),
        remote in prop::collection::vec(arb_mutation(), 0..8),
    ) {
        let store = Arc::new(detached_store());
        store.apply_remote(local);
        let other = detached_store();
        other.apply_remote(remote);

        let delegate = NodeDelegate::new(store.clone(), store.broadcasts().clone());
        let before = store.snapshot();
        delegate.merge_remote_state(&delegate_state(&other), false);
        prop_assert_eq!(store.snapshot(), before);
    }
}

fn delegate_state(store: &crate::store::Store) -> Vec<u8> {
    codec::encode_snapshot(&store.snapshot()).unwrap()
}
