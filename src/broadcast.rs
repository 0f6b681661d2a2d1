//! Transmit-limited outbound queue.
//!
//! Every locally originated mutation envelope is queued here and handed to the
//! transport on each gossip tick until it has been sent
//! `retransmit_limit(mult, N)` times, where `N` is the live member count at
//! the moment the item was queued.

use crate::transport::Membership;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub const DEFAULT_RETRANSMIT_MULT: usize = 3;

/// A message the queue can disseminate.
pub trait Broadcast: Send + 'static {
    /// Whether queuing `self` makes the already-queued `other` redundant
    fn invalidates(&self, other: &dyn Broadcast) -> bool;

    fn message(&self) -> &[u8];

    /// Called exactly once when the item leaves the queue for any reason
    fn finished(self: Box<Self>);
}

/// Envelope produced by a local set or delete.
pub struct MutationBroadcast {
    msg: Vec<u8>,
    notify: oneshot::Sender<()>,
}

impl MutationBroadcast {
    pub fn new(msg: Vec<u8>) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let broadcast = Self { msg, notify: tx };
        (broadcast, Completion::new(rx))
    }
}

impl Broadcast for MutationBroadcast {
    // Two writes to the same key both retransmit to their full budget.
    fn invalidates(&self, _other: &dyn Broadcast) -> bool {
        false
    }

    fn message(&self) -> &[u8] {
        &self.msg
    }

    fn finished(self: Box<Self>) {
        let _ = self.notify.send(());
    }
}

/// Resolves once the broadcast it was issued for has left the queue.
///
/// Also resolves if the queue is dropped with the item still inside.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl Completion {
    fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx, done: false }
    }

    /// Non-blocking check
    pub fn is_finished(&mut self) -> bool {
        if !self.done {
            self.done = !matches!(self.rx.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        }
        self.done
    }
}

impl Future for Completion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => {
                self.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct QueueItem {
    id: u64,
    transmits: usize,
    remaining: usize,
    broadcast: Box<dyn Broadcast>,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueueItem>,
    next_id: u64,
}

/// Number of times an item is sent in a cluster of `num_nodes` members.
///
/// Computed as `retransmit_mult * ceil(log10(num_nodes + 1))`, the rounding
/// memberlist uses, rather than `ceil(retransmit_mult * log(num_nodes + 1))`.
/// The queue itself never uses this for a node without peers: with
/// `num_nodes <= 1` items are finished at once instead of sent.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).log10().ceil() as usize;
    retransmit_mult * node_scale
}

pub struct TransmitLimitedQueue {
    membership: Arc<dyn Membership>,
    retransmit_mult: usize,
    state: Mutex<QueueState>,
}

impl TransmitLimitedQueue {
    pub fn new(membership: Arc<dyn Membership>, retransmit_mult: usize) -> Self {
        Self {
            membership,
            retransmit_mult,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("Failed to lock broadcast queue")
    }

    pub fn retransmit_mult(&self) -> usize {
        self.retransmit_mult
    }

    /// Queue a broadcast, dropping any queued item it invalidates.
    ///
    /// With no peers in the cluster the item is finished immediately.
    pub fn queue_broadcast(&self, broadcast: Box<dyn Broadcast>) {
        let num_nodes = self.membership.num_members();
        let budget = if num_nodes <= 1 {
            0
        } else {
            retransmit_limit(self.retransmit_mult, num_nodes)
        };

        let mut finished = Vec::new();
        {
            let mut state = self.lock();
            let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
                .into_iter()
                .partition(|item| broadcast.invalidates(item.broadcast.as_ref()));
            state.items = kept;
            finished.extend(stale.into_iter().map(|item| item.broadcast));

            if budget == 0 {
                trace!(num_nodes, "No peers to broadcast to, finishing immediately");
                finished.push(broadcast);
            } else {
                let id = state.next_id;
                state.next_id += 1;
                trace!(id, budget, num_nodes, "Queued broadcast");
                state.items.push(QueueItem {
                    id,
                    transmits: 0,
                    remaining: budget,
                    broadcast,
                });
            }
        }

        for broadcast in finished {
            broadcast.finished();
        }
    }

    /// Select payloads for one outbound packet.
    ///
    /// Each selected payload costs `overhead + len` bytes of `limit`. Items
    /// sent the fewest times go first, oldest first among equals.
    ///
    /// If every peer has left since the items were queued, nothing is sent
    /// and every queued item is finished.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        if self.membership.num_members() <= 1 {
            let orphaned = std::mem::take(&mut self.lock().items);
            if !orphaned.is_empty() {
                debug!(count = orphaned.len(), "No peers left, finishing queued broadcasts");
            }
            for item in orphaned {
                item.broadcast.finished();
            }
            return Vec::new();
        }

        let mut finished = Vec::new();
        let mut to_send = Vec::new();
        {
            let mut state = self.lock();
            if state.items.is_empty() {
                return to_send;
            }

            state
                .items
                .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(a.id.cmp(&b.id)));

            let mut bytes_left = limit;
            for item in state.items.iter_mut() {
                if bytes_left <= overhead {
                    break;
                }
                let cost = overhead + item.broadcast.message().len();
                if cost > bytes_left {
                    continue;
                }
                bytes_left -= cost;
                to_send.push(item.broadcast.message().to_vec());
                item.transmits += 1;
                item.remaining -= 1;
            }

            let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.items)
                .into_iter()
                .partition(|item| item.remaining == 0);
            state.items = pending;
            finished.extend(done.into_iter().map(|item| item.broadcast));
        }

        if !finished.is_empty() {
            debug!(
                sent = to_send.len(),
                evicted = finished.len(),
                "Broadcasts exhausted their transmit budget"
            );
        }
        for broadcast in finished {
            broadcast.finished();
        }
        to_send
    }

    pub fn num_queued(&self) -> usize {
        self.lock().items.len()
    }

    /// Remaining transmit budget of each queued item, oldest first
    pub fn remaining_transmits(&self) -> Vec<usize> {
        let state = self.lock();
        let mut items: Vec<_> = state.items.iter().map(|i| (i.id, i.remaining)).collect();
        items.sort_unstable();
        items.into_iter().map(|(_, remaining)| remaining).collect()
    }

    /// Keep at most `max_retain` items, dropping the oldest
    pub fn prune(&self, max_retain: usize) -> usize {
        let dropped = {
            let mut state = self.lock();
            if state.items.len() <= max_retain {
                return 0;
            }
            state.items.sort_by_key(|item| item.id);
            let excess = state.items.len() - max_retain;
            state.items.drain(..excess).collect::<Vec<_>>()
        };
        let count = dropped.len();
        debug!(count, max_retain, "Pruned broadcast queue");
        for item in dropped {
            item.broadcast.finished();
        }
        count
    }

    /// Drop every queued item
    pub fn reset(&self) {
        let dropped = std::mem::take(&mut self.lock().items);
        for item in dropped {
            item.broadcast.finished();
        }
    }
}

impl crate::delegate::BroadcastSource for TransmitLimitedQueue {
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        TransmitLimitedQueue::get_broadcasts(self, overhead, limit)
    }
}
