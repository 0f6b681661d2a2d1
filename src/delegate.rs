//! Callbacks the membership transport drives.
//!
//! The transport sees a single [`Delegate`]. Behind it, [`NodeDelegate`]
//! composes three narrow pieces so each can be exercised on its own:
//! - [`MutationSink`] applies received mutation batches
//! - [`SnapshotProvider`] exports and merges full state at join time
//! - [`BroadcastSource`] supplies outbound payloads

use crate::codec::{self, Envelope};
use crate::ops::Mutation;
use crate::types::{Member, Snapshot};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Transport-facing contract of a node.
pub trait Delegate: Send + Sync + 'static {
    /// Metadata attached to this node's membership record, at most `limit` bytes
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived from a peer
    fn notify_msg(&self, msg: &[u8]);

    /// Payloads to piggyback on the next outbound packet
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state for a push/pull exchange
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Remote state received in a push/pull exchange
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync + 'static {
    fn notify_join(&self, member: &Member);
    fn notify_leave(&self, member: &Member);
    fn notify_update(&self, member: &Member);
}

pub trait MutationSink: Send + Sync {
    /// Apply a batch received from a peer. Must not re-broadcast it.
    fn apply_remote(&self, batch: Vec<Mutation>);
}

pub trait SnapshotProvider: Send + Sync {
    fn snapshot(&self) -> Snapshot;

    /// Overwrite local keys with the remote values, returning how many were written
    fn merge_snapshot(&self, snapshot: Snapshot) -> usize;
}

pub trait BroadcastSource: Send + Sync {
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
}

pub struct NodeDelegate<S, B> {
    store: Arc<S>,
    broadcasts: Arc<B>,
}

impl<S, B> NodeDelegate<S, B>
where
    S: MutationSink + SnapshotProvider + 'static,
    B: BroadcastSource + 'static,
{
    pub fn new(store: Arc<S>, broadcasts: Arc<B>) -> Self {
        Self { store, broadcasts }
    }
}

impl<S, B> Delegate for NodeDelegate<S, B>
where
    S: MutationSink + SnapshotProvider + 'static,
    B: BroadcastSource + 'static,
{
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        match codec::decode_envelope(msg) {
            Ok(Some(Envelope::Data(batch))) => {
                trace!(mutations = batch.len(), "Applying remote mutation batch");
                self.store.apply_remote(batch);
            }
            Ok(None) => {
                debug!(len = msg.len(), "Ignoring message with unknown kind");
            }
            Err(e) => {
                warn!("Dropping malformed message: {e}");
            }
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, join: bool) -> Vec<u8> {
        let snapshot = self.store.snapshot();
        match codec::encode_snapshot(&snapshot) {
            Ok(buf) => {
                debug!(join, keys = snapshot.len(), "Exporting local state");
                buf
            }
            Err(e) => {
                warn!("Failed to encode local state: {e}");
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() || !join {
            trace!(join, len = buf.len(), "Ignoring non-join state exchange");
            return;
        }
        match codec::decode_snapshot(buf) {
            Ok(snapshot) => {
                let written = self.store.merge_snapshot(snapshot);
                info!(written, "Merged remote state");
            }
            Err(e) => {
                warn!("Dropping malformed remote state: {e}");
            }
        }
    }
}

/// Logs membership changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvents;

impl EventDelegate for LogEvents {
    fn notify_join(&self, member: &Member) {
        info!("A node has joined: {member}");
    }

    fn notify_leave(&self, member: &Member) {
        info!("A node has left: {member}");
    }

    fn notify_update(&self, member: &Member) {
        info!("A node was updated: {member}");
    }
}
