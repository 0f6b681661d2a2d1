//! gossipkv - An embeddable, gossip-replicated, eventually consistent key-value store node
//!
//! gossipkv keeps an in-memory map approximately in sync across an ad-hoc cluster
//! of peers. Local writes are broadcast over the cluster's gossip layer a bounded
//! number of times; nodes that join exchange full snapshots with a seed.
//!
//! # Key Features
//!
//! - **Peer-to-peer architecture**: No leader, no coordinator, no minimum cluster size
//! - **Transmit-limited dissemination**: Each mutation is resent `mult * ceil(log10(N + 1))` times
//! - **Join-time reconciliation**: Joining nodes merge the seed's snapshot, and vice versa
//! - **Transport-agnostic**: Plug any membership layer in through [`transport::Transport`]
//! - **In-memory**: State lives for the lifetime of the process
//!
//! # Quick Start
//!
//! ```rust
//! use gossipkv::{transport::memory::MemoryNetwork, Config, Node};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let network = MemoryNetwork::new();
//! let a = Node::start(Config::default().with_name("a"), |id| network.bind(id))
//!     .await
//!     .unwrap();
//! a.set("x", "1").unwrap();
//!
//! let seeds = vec![a.address().to_string()];
//! let b = Node::start(Config::default().with_name("b").with_seeds(seeds), |id| {
//!     network.bind(id)
//! })
//! .await
//! .unwrap();
//! assert_eq!(b.get("x").unwrap(), "1");
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`store::Store`] - The local map; every local write becomes a [`ops::Mutation`]
//! - [`codec`] - Envelope and snapshot wire format
//! - [`broadcast::TransmitLimitedQueue`] - Outbound queue with per-item retransmit budgets
//! - [`delegate::NodeDelegate`] - Callbacks the transport drives
//! - [`join::Reconciler`] - Join state machine
//! - [`Node`] - Startup sequencing and the public API
//!
//! # Non-goals
//!
//! gossipkv intentionally does NOT provide:
//! - Consensus, linearizability or conflict resolution beyond last-applied-wins
//! - Persistence
//! - A network transport or an HTTP front end

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod delegate;
pub mod error;
pub mod identity;
pub mod join;
pub mod node;
pub mod ops;
pub mod store;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use node::Node;

#[cfg(test)]
mod tests;
