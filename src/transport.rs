//! Seam to the membership / failure-detection layer.
//!
//! The node never talks to the network itself. A transport owns peer
//! discovery, liveness probing and delivery, and calls back into the node
//! through the [`Delegate`] it was attached to.

use crate::delegate::{Delegate, EventDelegate};
use crate::types::Member;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

pub mod memory;

/// Live view of cluster size.
pub trait Membership: Send + Sync {
    /// Number of live members, including this node
    fn num_members(&self) -> usize;
}

pub trait Transport: Membership + 'static {
    /// Register the callbacks; messages arriving before this are dropped
    fn attach(&self, delegate: Arc<dyn Delegate>, events: Arc<dyn EventDelegate>);

    fn local_member(&self) -> Member;

    fn members(&self) -> Vec<Member>;

    /// Contact every seed address, running a join-time push/pull with each
    /// one reached. Returns how many seeds were contacted.
    fn join(&self, seeds: &[String]) -> impl Future<Output = Result<usize>> + Send;

    fn leave(&self) -> impl Future<Output = Result<()>> + Send;
}
