use crate::broadcast::{Completion, TransmitLimitedQueue};
use crate::config::Config;
use crate::delegate::{LogEvents, NodeDelegate};
use crate::error::{Error, Result};
use crate::identity::NodeIdentity;
use crate::join::{JoinState, Reconciler};
use crate::store::Store;
use crate::transport::{Membership, Transport};
use crate::types::{Member, Value};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub addr: SocketAddr,
    pub n_kvs: usize,
    pub queued_broadcasts: usize,
    pub members: usize,
    pub join_state: JoinState,
    pub last_join_error: Option<String>,
}

/// A cluster member serving a gossip-replicated key-value map.
pub struct Node<T: Transport> {
    identity: NodeIdentity,
    store: Arc<Store>,
    broadcasts: Arc<TransmitLimitedQueue>,
    transport: Arc<T>,
    reconciler: Reconciler<T>,
}

impl<T: Transport> Node<T> {
    /// Start a node.
    ///
    /// Resolves the identity, binds the transport through `bind`, builds the
    /// empty store and broadcast queue, attaches them to the transport and, if
    /// seeds are configured, joins the cluster. Only identity and bind errors
    /// are fatal. A failed join leaves the node running on its own and is
    /// reported by [`last_join_error`](Self::last_join_error).
    pub async fn start<F>(config: Config, bind: F) -> Result<Self>
    where
        F: FnOnce(&NodeIdentity) -> anyhow::Result<T>,
    {
        let identity = NodeIdentity::resolve(&config)?;
        let transport = Arc::new(bind(&identity).map_err(|e| Error::Bind(format!("{e:#}")))?);

        let membership: Arc<dyn Membership> = transport.clone();
        let broadcasts = Arc::new(TransmitLimitedQueue::new(
            membership,
            config.retransmit_mult,
        ));
        let store = Arc::new(Store::new(broadcasts.clone()));
        transport.attach(
            Arc::new(NodeDelegate::new(store.clone(), broadcasts.clone())),
            Arc::new(LogEvents),
        );

        let node = Self {
            reconciler: Reconciler::new(transport.clone()),
            identity,
            store,
            broadcasts,
            transport,
        };
        info!("Local member {}", node.address());

        if !config.seeds.is_empty() {
            if let Err(e) = node.join(&config.seeds).await {
                warn!("{e}; continuing as a single-member cluster");
            }
        }
        Ok(node)
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.store.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Completion> {
        self.store.set(key, value)
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<Completion> {
        self.store.delete(key)
    }

    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        self.reconciler.join(seeds).await
    }

    pub fn join_state(&self) -> JoinState {
        self.reconciler.state()
    }

    pub fn subscribe_join(&self) -> watch::Receiver<JoinState> {
        self.reconciler.subscribe()
    }

    /// `Error::JoinFailed` from the latest join attempt, including the one made
    /// at startup. `None` if no attempt was made or the latest one succeeded.
    pub fn last_join_error(&self) -> Option<Error> {
        self.reconciler.last_error()
    }

    /// Leave the cluster. Queued broadcasts are dropped and their waiters released.
    pub async fn leave(&self) {
        if let Err(e) = self.transport.leave().await {
            warn!("Failed to leave cluster cleanly: {e:#}");
        }
        self.broadcasts.reset();
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn address(&self) -> SocketAddr {
        self.transport.local_member().addr
    }

    pub fn members(&self) -> Vec<Member> {
        self.transport.members()
    }

    pub fn num_members(&self) -> usize {
        self.transport.num_members()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn broadcasts(&self) -> &Arc<TransmitLimitedQueue> {
        &self.broadcasts
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.identity.name.clone(),
            addr: self.address(),
            n_kvs: self.store.len(),
            queued_broadcasts: self.broadcasts.num_queued(),
            members: self.transport.num_members(),
            join_state: self.join_state(),
            last_join_error: self.last_join_error().map(|e| e.to_string()),
        }
    }
}
