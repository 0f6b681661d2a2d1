//! In-process transport.
//!
//! Simulates the membership layer for nodes living in one process: binding
//! registers an endpoint on a shared [`MemoryNetwork`], joining runs the
//! push/pull state exchange directly against the seed's delegate, and
//! [`MemoryTransport::gossip`] performs one gossip tick. Useful for tests and
//! for embedding a simulated cluster; it never touches a socket.

use super::{Membership, Transport};
use crate::delegate::{Delegate, EventDelegate};
use crate::identity::NodeIdentity;
use crate::types::Member;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Size of one simulated gossip packet
pub const PACKET_SIZE: usize = 1400;

/// Per-message framing cost inside a packet
pub const MESSAGE_OVERHEAD: usize = 2;

const FIRST_EPHEMERAL_PORT: u16 = 7946;

#[derive(Default)]
struct Registry {
    endpoints: HashMap<SocketAddr, Arc<Endpoint>>,
    next_port: u16,
}

/// A shared registry of in-process endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a transport for `identity`, rejecting duplicate names and taken addresses
    pub fn bind(&self, identity: &NodeIdentity) -> Result<MemoryTransport> {
        let ip = resolve_ip(&identity.bind_addr)?;
        let mut registry = self.registry.write().expect("Failed to lock network registry");

        if registry
            .endpoints
            .values()
            .any(|endpoint| endpoint.member.name == identity.name)
        {
            bail!("node name {:?} is already in use", identity.name);
        }

        let port = if identity.bind_port == 0 {
            registry.ephemeral_port(ip)?
        } else {
            identity.bind_port
        };
        let addr = SocketAddr::new(ip, port);
        if registry.endpoints.contains_key(&addr) {
            bail!("address {addr} is already in use");
        }

        let member = Member::new(identity.name.clone(), addr);
        let endpoint = Arc::new(Endpoint {
            member: member.clone(),
            members: RwLock::new(BTreeMap::from([(member.name.clone(), member)])),
            delegate: RwLock::new(None),
            events: RwLock::new(None),
            network: Arc::downgrade(&self.registry),
        });
        registry.endpoints.insert(addr, endpoint.clone());
        debug!(name = identity.name, %addr, "Bound in-memory endpoint");
        Ok(MemoryTransport { endpoint })
    }

    fn endpoint(&self, addr: &SocketAddr) -> Option<Arc<Endpoint>> {
        self.registry
            .read()
            .expect("Failed to lock network registry")
            .endpoints
            .get(addr)
            .cloned()
    }

    /// Number of bound endpoints
    pub fn len(&self) -> usize {
        self.registry
            .read()
            .expect("Failed to lock network registry")
            .endpoints
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry {
    fn ephemeral_port(&mut self, ip: IpAddr) -> Result<u16> {
        if self.next_port < FIRST_EPHEMERAL_PORT {
            self.next_port = FIRST_EPHEMERAL_PORT;
        }
        for _ in 0..=u16::MAX {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.endpoints.contains_key(&SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }
        Err(anyhow!("no free port left on {ip}"))
    }
}

fn resolve_ip(host: &str) -> Result<IpAddr> {
    if host == "localhost" {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse()
        .with_context(|| format!("cannot bind in-memory endpoint to host {host:?}"))
}

/// Parse a `host:port` seed, accepting the same hosts as [`MemoryNetwork::bind`]
fn resolve_seed(seed: &str) -> Result<SocketAddr> {
    if let Ok(addr) = seed.parse() {
        return Ok(addr);
    }
    let (host, port) = seed
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in {seed:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {seed:?}"))?;
    Ok(SocketAddr::new(resolve_ip(host)?, port))
}

struct Endpoint {
    member: Member,
    members: RwLock<BTreeMap<String, Member>>,
    delegate: RwLock<Option<Arc<dyn Delegate>>>,
    events: RwLock<Option<Arc<dyn EventDelegate>>>,
    network: Weak<RwLock<Registry>>,
}

impl Endpoint {
    fn delegate(&self) -> Option<Arc<dyn Delegate>> {
        self.delegate.read().expect("Failed to lock delegate").clone()
    }

    fn events(&self) -> Option<Arc<dyn EventDelegate>> {
        self.events.read().expect("Failed to lock events").clone()
    }

    fn network(&self) -> Result<MemoryNetwork> {
        let registry = self
            .network
            .upgrade()
            .ok_or_else(|| anyhow!("in-memory network has been dropped"))?;
        Ok(MemoryNetwork { registry })
    }

    fn member_list(&self) -> Vec<Member> {
        self.members
            .read()
            .expect("Failed to lock members")
            .values()
            .cloned()
            .collect()
    }

    /// Record members not yet known, returning the newly learned ones
    fn learn(&self, members: &[Member]) -> Vec<Member> {
        let mut known = self.members.write().expect("Failed to lock members");
        let mut learned = Vec::new();
        for member in members {
            if !known.contains_key(&member.name) {
                known.insert(member.name.clone(), member.clone());
                learned.push(member.clone());
            }
        }
        learned
    }

    fn forget(&self, name: &str) -> Option<Member> {
        self.members
            .write()
            .expect("Failed to lock members")
            .remove(name)
    }

    /// Live endpoints of every other known member
    fn peers(&self, network: &MemoryNetwork) -> Vec<Arc<Endpoint>> {
        self.member_list()
            .into_iter()
            .filter(|member| member.name != self.member.name)
            .filter_map(|member| network.endpoint(&member.addr))
            .collect()
    }
}

/// Transport handle for one node on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: Arc<Endpoint>,
}

impl MemoryTransport {
    /// One gossip tick: drain a packet's worth of broadcasts and deliver it
    /// to every other member. Returns the number of payloads sent.
    ///
    /// The queue is asked for broadcasts even when there are no peers, so it
    /// can release items whose recipients have all left.
    pub fn gossip(&self) -> usize {
        let Some(delegate) = self.endpoint.delegate() else {
            return 0;
        };
        let peers = match self.endpoint.network() {
            Ok(network) => self.endpoint.peers(&network),
            Err(_) => Vec::new(),
        };

        let msgs = delegate.get_broadcasts(MESSAGE_OVERHEAD, PACKET_SIZE);
        if peers.is_empty() {
            return 0;
        }
        for peer in &peers {
            let Some(remote) = peer.delegate() else {
                continue;
            };
            for msg in &msgs {
                remote.notify_msg(msg);
            }
        }
        msgs.len()
    }

    /// Run [`gossip`](Self::gossip) every `period` until the task is aborted
    pub fn start_gossip(&self, period: Duration) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let sent = transport.gossip();
                if sent > 0 {
                    trace!(sent, "Gossip tick");
                }
            }
        })
    }

    /// Deliver a raw user message straight to another member
    pub fn send_to(&self, addr: SocketAddr, msg: &[u8]) -> Result<()> {
        let peer = self
            .endpoint
            .network()?
            .endpoint(&addr)
            .ok_or_else(|| anyhow!("no member listening on {addr}"))?;
        let delegate = peer
            .delegate()
            .ok_or_else(|| anyhow!("member at {addr} has no delegate attached"))?;
        delegate.notify_msg(msg);
        Ok(())
    }

    fn push_pull(&self, peer: &Endpoint) {
        let (Some(local), Some(remote)) = (self.endpoint.delegate(), peer.delegate()) else {
            warn!(peer = peer.member.name, "Skipping state exchange, delegate not attached");
            return;
        };
        let ours = local.local_state(true);
        let theirs = remote.local_state(true);
        remote.merge_remote_state(&ours, true);
        local.merge_remote_state(&theirs, true);
    }

    /// Make every member known to either side known to all of them
    fn exchange_members(&self, network: &MemoryNetwork, peer: &Endpoint) {
        let mut everyone: BTreeMap<String, Member> = BTreeMap::new();
        for member in self
            .endpoint
            .member_list()
            .into_iter()
            .chain(peer.member_list())
        {
            everyone.insert(member.name.clone(), member);
        }
        let everyone: Vec<Member> = everyone.into_values().collect();

        for member in &everyone {
            let Some(endpoint) = network.endpoint(&member.addr) else {
                continue;
            };
            let learned = endpoint.learn(&everyone);
            if let Some(events) = endpoint.events() {
                for member in &learned {
                    events.notify_join(member);
                }
            }
        }
    }
}

impl Membership for MemoryTransport {
    fn num_members(&self) -> usize {
        self.endpoint
            .members
            .read()
            .expect("Failed to lock members")
            .len()
    }
}

impl Transport for MemoryTransport {
    fn attach(&self, delegate: Arc<dyn Delegate>, events: Arc<dyn EventDelegate>) {
        *self.endpoint.delegate.write().expect("Failed to lock delegate") = Some(delegate);
        *self.endpoint.events.write().expect("Failed to lock events") = Some(events);
    }

    fn local_member(&self) -> Member {
        let mut member = self.endpoint.member.clone();
        if let Some(delegate) = self.endpoint.delegate() {
            member.meta = delegate.node_meta(512);
        }
        member
    }

    fn members(&self) -> Vec<Member> {
        self.endpoint.member_list()
    }

    async fn join(&self, seeds: &[String]) -> Result<usize> {
        let network = self.endpoint.network()?;
        let mut contacted = 0;

        for seed in seeds {
            let addr = match resolve_seed(seed) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(seed, "Invalid seed address: {e:#}");
                    continue;
                }
            };
            if addr == self.endpoint.member.addr {
                debug!(seed, "Skipping self as seed");
                continue;
            }
            let Some(peer) = network.endpoint(&addr) else {
                warn!(seed, "Seed is unreachable");
                continue;
            };

            self.push_pull(&peer);
            self.exchange_members(&network, &peer);
            info!(seed, peer = peer.member.name, "Contacted seed");
            contacted += 1;
        }

        if contacted == 0 {
            bail!("none of {} seed(s) could be reached", seeds.len());
        }
        Ok(contacted)
    }

    async fn leave(&self) -> Result<()> {
        let network = self.endpoint.network()?;
        let peers = self.endpoint.peers(&network);

        network
            .registry
            .write()
            .expect("Failed to lock network registry")
            .endpoints
            .remove(&self.endpoint.member.addr);

        for peer in peers {
            let Some(left) = peer.forget(&self.endpoint.member.name) else {
                continue;
            };
            if let Some(events) = peer.events() {
                events.notify_leave(&left);
            }
            self.endpoint.forget(&peer.member.name);
        }
        info!(name = self.endpoint.member.name, "Left cluster");
        Ok(())
    }
}
