use crate::broadcast::{Completion, MutationBroadcast, TransmitLimitedQueue};
use crate::codec;
use crate::delegate::{MutationSink, SnapshotProvider};
use crate::error::{Error, Result};
use crate::ops::{KvState, Mutation};
use crate::types::{Snapshot, Value};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

/// The node's authoritative key-value map.
///
/// - Readers share the lock; set, delete, remote batches and snapshot merges
///   take it exclusively
/// - Every local write is encoded before it is applied, then applied and
///   queued for broadcast under the same write lock
/// - Writes received from peers are applied but never queued again
pub struct Store {
    state: RwLock<KvState>,
    broadcasts: Arc<TransmitLimitedQueue>,
}

impl Store {
    pub fn new(broadcasts: Arc<TransmitLimitedQueue>) -> Self {
        Self {
            state: RwLock::new(KvState::new()),
            broadcasts,
        }
    }

    fn read(&self) -> RwLockReadGuard<KvState> {
        self.state.read().expect("Failed to lock store state")
    }

    fn write(&self) -> RwLockWriteGuard<KvState> {
        self.state.write().expect("Failed to lock store state")
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.read()
            .data()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().data().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Completion> {
        self.mutate(Mutation::set(key, value.into()))
    }

    /// Deleting a key that does not exist still succeeds and is broadcast
    pub fn delete(&self, key: impl Into<String>) -> Result<Completion> {
        self.mutate(Mutation::delete(key))
    }

    fn mutate(&self, mutation: Mutation) -> Result<Completion> {
        let msg = codec::encode_mutations(std::slice::from_ref(&mutation))?;
        let (broadcast, completion) = MutationBroadcast::new(msg);

        let mut state = self.write();
        state.execute(&mutation);
        self.broadcasts.queue_broadcast(Box::new(broadcast));
        drop(state);

        trace!(action = ?mutation.action, "Applied local mutation");
        Ok(completion)
    }

    pub fn len(&self) -> usize {
        self.read().data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().data().keys().cloned().collect()
    }

    /// Apply a batch received from a peer, without re-broadcasting it
    pub fn apply_remote(&self, batch: Vec<Mutation>) {
        let mut state = self.write();
        for mutation in &batch {
            if state.is_noop(mutation) {
                trace!("Skipping noop mutation: {mutation:?}");
                continue;
            }
            state.execute(mutation);
        }
    }

    /// Consistent copy of the whole map
    pub fn snapshot(&self) -> Snapshot {
        self.read().snapshot()
    }

    /// Overwrite local values with every key in `snapshot`; nothing is removed
    pub fn merge_snapshot(&self, snapshot: Snapshot) -> usize {
        let written = self.write().merge(snapshot);
        debug!(written, "Merged snapshot into store");
        written
    }

    pub fn broadcasts(&self) -> &Arc<TransmitLimitedQueue> {
        &self.broadcasts
    }
}

impl MutationSink for Store {
    fn apply_remote(&self, batch: Vec<Mutation>) {
        Store::apply_remote(self, batch)
    }
}

impl SnapshotProvider for Store {
    fn snapshot(&self) -> Snapshot {
        Store::snapshot(self)
    }

    fn merge_snapshot(&self, snapshot: Snapshot) -> usize {
        Store::merge_snapshot(self, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Membership;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Peers(AtomicUsize);

    impl Membership for Peers {
        fn num_members(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn store_with_members(n: usize) -> Store {
        let queue = TransmitLimitedQueue::new(Arc::new(Peers(AtomicUsize::new(n))), 3);
        Store::new(Arc::new(queue))
    }

    #[test]
    fn local_writes_are_queued_as_encoded_batches() {
        let store = store_with_members(2);
        store.set("x", "1").unwrap();
        store.delete("x").unwrap();

        let msgs = store.broadcasts().get_broadcasts(0, 1400);
        assert_eq!(
            msgs,
            vec![
                br#"d[{"Action":"set","Data":{"x":"1"}}]"#.to_vec(),
                br#"d[{"Action":"del","Data":{"x":null}}]"#.to_vec(),
            ]
        );
        assert!(!store.contains_key("x"));
    }

    #[test]
    fn remote_batches_apply_in_order_without_enqueueing() {
        let store = store_with_members(2);
        store.apply_remote(vec![
            Mutation::set("a", json!(1)),
            Mutation::set("b", json!(2)),
            Mutation::delete("a"),
        ]);
        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert_eq!(store.broadcasts().num_queued(), 0);
    }

    #[test]
    fn snapshot_merge_only_adds_and_overwrites() {
        let store = store_with_members(1);
        store.set("keep", "local").unwrap();
        store.set("shared", "local").unwrap();

        let written = store.merge_snapshot(Snapshot::from([
            ("shared".to_string(), json!("remote")),
            ("new".to_string(), json!(true)),
        ]));
        assert_eq!(written, 2);
        assert_eq!(store.get("keep").unwrap(), json!("local"));
        assert_eq!(store.get("shared").unwrap(), json!("remote"));
        assert_eq!(store.get("new").unwrap(), json!(true));
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = store_with_members(1);
        assert!(matches!(store.get("nope"), Err(Error::NotFound(key)) if key == "nope"));
        assert!(store.is_empty());
    }
}
