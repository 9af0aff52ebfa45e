//! Gossip membership
//!
//! A SWIM-style failure detector over UDP: each period we probe one random
//! member directly, fall back to indirect probes through a few others, and
//! suspect the member if nobody reaches it. Suspects that stay silent for
//! `ping_interval * suspicion_multiplier` are declared failed. State changes
//! ride on probe traffic as piggybacked gossip, and a periodic full-state
//! sync repairs anything the gossip missed.
//!
//! Members move `Alive -> Suspect -> Failed -> reaped` on missed probes and
//! `Alive -> Left -> dropped` on a graceful leave. Every transition that matters
//! to the rest of combainer is published as a [`MembershipEvent`].

use crate::config::{ClusterConfig, SwimConfig};
use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeGossipState, NodeId, NodeInfo, NodeState};
use crate::observability::ClusterMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[cfg(feature = "swim")]
use hmac::{Hmac, Mac};
#[cfg(feature = "swim")]
use sha2::Sha256;

/// Gossip items piggybacked on one probe or ack
const PIGGYBACK_LIMIT: usize = 8;

/// Datagrams handled per second before the receiver backs off
const RECV_BUDGET_PER_SEC: u32 = 10_000;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagrams exchanged between members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Are you there?
    Ping { source: NodeId, incarnation: u64 },
    /// Yes. Also relayed back for an indirect probe.
    Ack { source: NodeId, incarnation: u64 },
    /// Probe `target` for me
    PingReq {
        source: NodeId,
        target: NodeId,
        incarnation: u64,
    },
    /// Full member table of `source`
    Sync {
        source: NodeId,
        states: Vec<NodeGossipState>,
    },
    /// Sent to seeds; answered with a `Sync`
    Join { info: NodeInfo },
    /// Graceful departure
    Leave { node_id: NodeId, incarnation: u64 },
    /// `from` could not reach `node_id`
    Suspect {
        node_id: NodeId,
        incarnation: u64,
        from: NodeId,
    },
    /// `node_id` refutes a suspicion with a newer incarnation
    Alive { node_id: NodeId, incarnation: u64 },
    /// `node_id` stayed silent past the suspicion timeout
    Dead { node_id: NodeId, incarnation: u64 },
}

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node became alive (new join or recovery)
    Join(NodeInfo),
    /// A node announced a graceful leave
    Leave(NodeInfo),
    /// A node was detected as failed
    Fail(NodeInfo),
    /// A failed node was dropped from the member table
    Reap(NodeInfo),
}

impl MembershipEvent {
    /// The member the event is about
    pub fn node(&self) -> &NodeInfo {
        match self {
            MembershipEvent::Join(info)
            | MembershipEvent::Leave(info)
            | MembershipEvent::Fail(info)
            | MembershipEvent::Reap(info) => info,
        }
    }
}

/// Work out the gossip address other nodes should use to reach us.
///
/// An explicit advertise address wins, then a concrete bind IP. A wildcard
/// bind falls back to resolving the node name. Failing all three is fatal.
pub async fn resolve_advertise_addr(
    node_id: &str,
    advertise: Option<SocketAddr>,
    bound: SocketAddr,
) -> Result<SocketAddr> {
    if let Some(addr) = advertise {
        if addr.ip().is_unspecified() {
            return Err(ClusterError::AdvertiseAddress(format!(
                "advertise address {} is a wildcard",
                addr
            )));
        }
        return Ok(addr);
    }

    if !bound.ip().is_unspecified() {
        return Ok(bound);
    }

    let resolved = tokio::net::lookup_host((node_id, bound.port()))
        .await
        .map_err(|e| ClusterError::AdvertiseAddress(format!("lookup {}: {}", node_id, e)))?
        .find(|addr| !addr.ip().is_unspecified());

    resolved.ok_or_else(|| {
        ClusterError::AdvertiseAddress(format!(
            "bind address {} is a wildcard and {} does not resolve",
            bound, node_id
        ))
    })
}

/// Optional HMAC-SHA256 trailer on every datagram
struct PacketAuth {
    #[cfg(feature = "swim")]
    mac: Option<Hmac<Sha256>>,
}

#[cfg(feature = "swim")]
impl PacketAuth {
    /// SHA-256 output size
    const TAG_LEN: usize = 32;

    fn new(key: Option<&str>) -> Result<Self> {
        let mac = key
            .map(|k| {
                Hmac::<Sha256>::new_from_slice(k.as_bytes())
                    .map_err(|e| ClusterError::CryptoError(e.to_string()))
            })
            .transpose()?;
        Ok(Self { mac })
    }

    fn seal(&self, mut data: Vec<u8>) -> Vec<u8> {
        if let Some(mac) = &self.mac {
            let mut mac = mac.clone();
            mac.update(&data);
            data.extend_from_slice(&mac.finalize().into_bytes());
        }
        data
    }

    fn open<'a>(&self, packet: &'a [u8]) -> std::result::Result<&'a [u8], &'static str> {
        let Some(mac) = &self.mac else {
            return Ok(packet);
        };
        if packet.len() < Self::TAG_LEN {
            return Err("shorter than the HMAC tag");
        }
        let (payload, tag) = packet.split_at(packet.len() - Self::TAG_LEN);
        let mut mac = mac.clone();
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| "bad HMAC tag")?;
        Ok(payload)
    }
}

#[cfg(not(feature = "swim"))]
impl PacketAuth {
    fn new(key: Option<&str>) -> Result<Self> {
        if key.is_some() {
            warn!("Gossip key ignored: built without the swim feature");
        }
        Ok(Self {})
    }

    fn seal(&self, data: Vec<u8>) -> Vec<u8> {
        data
    }

    fn open<'a>(&self, packet: &'a [u8]) -> std::result::Result<&'a [u8], &'static str> {
        Ok(packet)
    }
}

/// State changes waiting to ride on outgoing probes. Each one is sent
/// `ceil(log2(members)) + 1` times.
#[derive(Default)]
struct Piggyback {
    queue: Mutex<Vec<(GossipMessage, u32)>>,
}

impl Piggyback {
    fn push(&self, msg: GossipMessage) {
        self.queue.lock().push((msg, 0));
    }

    fn take(&self, members: usize) -> Vec<GossipMessage> {
        let rounds = (members.max(2) as f64).log2().ceil() as u32 + 1;
        let mut queue = self.queue.lock();
        let batch: Vec<GossipMessage> = queue
            .iter_mut()
            .take(PIGGYBACK_LIMIT)
            .map(|(msg, sent)| {
                *sent += 1;
                msg.clone()
            })
            .collect();
        queue.retain(|(_, sent)| *sent < rounds);
        batch
    }
}

/// Gossip member table and failure detector
pub struct Membership {
    local_node: NodeInfo,
    /// Bumped to refute suspicion about ourselves
    incarnation: AtomicU64,
    members: DashMap<NodeId, Node>,
    config: SwimConfig,
    socket: UdpSocket,
    auth: PacketAuth,
    /// Direct probes awaiting an ack
    pending_pings: DashMap<NodeId, Instant>,
    /// Indirect probes we run for others: (requester, target) -> requester addr
    relayed_probes: DashMap<(NodeId, NodeId), SocketAddr>,
    piggyback: Piggyback,
    events: broadcast::Sender<MembershipEvent>,
    /// Woken when a full-state sync arrives; a seed answers joins that way
    synced: Notify,
}

impl Membership {
    /// Bind the gossip socket and resolve our advertised identity.
    ///
    /// Both failures are fatal to node startup.
    pub async fn new(config: &ClusterConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| ClusterError::Bind {
                addr: config.bind_addr,
                reason: e.to_string(),
            })?;
        let bound = socket.local_addr()?;
        let advertise = resolve_advertise_addr(&config.node_id, config.advertise_addr, bound).await?;
        let local_node = NodeInfo::new(
            config.node_id.clone(),
            advertise,
            config.raft_advertise_url(advertise),
        );

        Self::with_socket(local_node, config.swim.clone(), socket)
    }

    /// Membership over an already bound socket
    pub fn with_socket(local_node: NodeInfo, config: SwimConfig, socket: UdpSocket) -> Result<Self> {
        let auth = PacketAuth::new(config.auth_token.as_deref())?;
        let (events, _) = broadcast::channel(1024);

        let members = DashMap::new();
        let mut me = Node::new(local_node.clone());
        me.mark_alive(0);
        members.insert(local_node.id.clone(), me);

        info!(
            node_id = %local_node.id,
            gossip_addr = %local_node.gossip_addr,
            raft_addr = %local_node.raft_addr,
            "Membership initialized"
        );

        Ok(Self {
            local_node,
            incarnation: AtomicU64::new(0),
            members,
            config,
            socket,
            auth,
            pending_pings: DashMap::new(),
            relayed_probes: DashMap::new(),
            piggyback: Piggyback::default(),
            events,
            synced: Notify::new(),
        })
    }

    /// Our own identity
    pub fn local_node(&self) -> &NodeInfo {
        &self.local_node
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MembershipEvent) {
        debug!(?event, "Membership event");
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Identities of every alive member, ourselves included, sorted by name
    pub fn alive_members(&self) -> Vec<NodeInfo> {
        let mut alive: Vec<NodeInfo> = self
            .members
            .iter()
            .filter(|r| r.value().is_alive())
            .map(|r| r.value().info.clone())
            .collect();
        alive.sort_by(|a, b| a.id.cmp(&b.id));
        alive
    }

    /// Names of alive members; these are the hosts sessions dispatch to
    pub fn alive_hosts(&self) -> Vec<String> {
        self.alive_members().into_iter().map(|n| n.id).collect()
    }

    /// Every known member regardless of state
    pub fn members(&self) -> Vec<Node> {
        self.members.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get_member(&self, node_id: &str) -> Option<Node> {
        self.members.get(node_id).map(|r| r.value().clone())
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn alive_count(&self) -> usize {
        self.members.iter().filter(|r| r.value().is_alive()).count()
    }

    /// Join the cluster through the given seeds.
    ///
    /// Sends a join request to every seed and waits for one of them to answer
    /// with a state sync. Rounds repeat with exponential backoff until a seed
    /// answers or `join_max_attempts` is exhausted. Joining an already joined
    /// cluster is harmless. Returns the number of alive members afterwards.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        if seeds.is_empty() {
            debug!("No seeds configured, nothing to join");
            return Ok(self.alive_count());
        }

        let request = GossipMessage::Join {
            info: self.local_node.clone(),
        };
        let mut backoff = self.config.join_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // registered before sending so a fast answer is not missed
            let synced = self.synced.notified();
            tokio::pin!(synced);
            synced.as_mut().enable();

            let mut contacted = 0usize;
            for seed in seeds {
                let addrs = match tokio::net::lookup_host(seed.as_str()).await {
                    Ok(addrs) => addrs.collect::<Vec<_>>(),
                    Err(e) => {
                        warn!(seed = %seed, error = %e, "Cannot resolve seed address");
                        continue;
                    }
                };

                for addr in addrs.into_iter().filter(|a| *a != self.local_node.gossip_addr) {
                    match self.send(&request, addr).await {
                        Ok(()) => {
                            debug!(seed = %addr, attempt, "Sent join request");
                            contacted += 1;
                        }
                        Err(e) => warn!(seed = %addr, error = %e, "Failed to contact seed"),
                    }
                }
            }

            if contacted > 0
                && tokio::time::timeout(self.config.join_timeout, synced)
                    .await
                    .is_ok()
            {
                let alive = self.alive_count();
                info!(attempt, alive, "Joined cluster");
                return Ok(alive);
            }

            if self
                .config
                .join_max_attempts
                .is_some_and(|max| attempt >= max)
            {
                return Err(ClusterError::NoSeedNodes { attempts: attempt });
            }

            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "No seed answered, retrying join"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.join_max_backoff);
        }
    }

    /// Announce a graceful leave to every known member
    pub async fn leave(&self) -> Result<()> {
        if let Some(mut me) = self.members.get_mut(&self.local_node.id) {
            me.mark_leaving();
        }
        let notice = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };

        let peers = self.peer_addrs();
        for addr in &peers {
            if let Err(e) = self.send(&notice, *addr).await {
                debug!(peer = %addr, error = %e, "Leave notice not sent");
            }
        }

        info!(peers = peers.len(), "Announced leave");
        Ok(())
    }

    /// Run the receiver, the failure detector and the anti-entropy sync
    /// until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut loops = JoinSet::new();
        let this = self.clone();
        loops.spawn(async move { ("receiver", this.receive_loop().await) });
        let this = self.clone();
        loops.spawn(async move { ("failure detector", this.probe_loop().await) });
        let this = self.clone();
        loops.spawn(async move { ("sync", this.sync_loop().await) });

        tokio::select! {
            _ = cancel.cancelled() => info!("Membership shutting down"),
            Some(ended) = loops.join_next() => match ended {
                Ok((name, Err(e))) => error!(task = name, error = %e, "Membership task failed"),
                Ok((name, Ok(()))) => error!(task = name, "Membership task exited"),
                Err(e) => error!(error = %e, "Membership task panicked"),
            },
        }

        loops.shutdown().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wire
    // ------------------------------------------------------------------

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let packet = self.auth.seal(postcard::to_allocvec(msg)?);
        self.socket.send_to(&packet, addr).await?;
        Ok(())
    }

    /// Send `msg` followed by whatever gossip is queued
    async fn send_with_piggyback(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        self.send(msg, addr).await?;
        for item in self.piggyback.take(self.members.len()) {
            self.send(&item, addr).await?;
        }
        Ok(())
    }

    fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.members
            .iter()
            .filter(|m| m.key() != &self.local_node.id)
            .map(|m| m.value().gossip_addr())
            .collect()
    }

    async fn receive_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut window = tokio::time::Instant::now();
        let mut handled: u32 = 0;

        loop {
            if window.elapsed() >= Duration::from_secs(1) {
                window = tokio::time::Instant::now();
                handled = 0;
            } else if handled >= RECV_BUDGET_PER_SEC {
                tokio::time::sleep_until(window + Duration::from_secs(1)).await;
                continue;
            }

            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "Gossip socket receive failed");
                    continue;
                }
            };
            handled += 1;

            let payload = match self.auth.open(&buf[..len]) {
                Ok(p) => p,
                Err(reason) => {
                    warn!(from = %from, reason, "Dropping unauthenticated datagram");
                    continue;
                }
            };
            let msg: GossipMessage = match postcard::from_bytes(payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!(from = %from, error = %e, "Dropping undecodable datagram");
                    continue;
                }
            };

            trace!(from = %from, ?msg, "Gossip received");
            if let Err(e) = self.dispatch(msg, from).await {
                warn!(from = %from, error = %e, "Gossip handling failed");
            }
        }
    }

    async fn dispatch(&self, msg: GossipMessage, from: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { source, .. } => self.on_ping(&source, from).await,
            GossipMessage::Ack {
                source,
                incarnation,
            } => self.on_ack(&source, incarnation).await,
            GossipMessage::PingReq { source, target, .. } => {
                self.on_ping_req(source, target, from).await
            }
            GossipMessage::Sync { states, .. } => {
                for state in states {
                    self.merge_state(state);
                }
                self.synced.notify_waiters();
                Ok(())
            }
            GossipMessage::Join { info } => self.on_join(info).await,
            GossipMessage::Leave { node_id, .. } => {
                self.on_leave(&node_id);
                Ok(())
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
                ..
            } => {
                self.on_suspect(&node_id, incarnation);
                Ok(())
            }
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.on_alive(&node_id, incarnation);
                Ok(())
            }
            GossipMessage::Dead {
                node_id,
                incarnation,
            } => {
                self.on_dead(&node_id, incarnation);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn on_ping(&self, source: &str, from: SocketAddr) -> Result<()> {
        let ack = GossipMessage::Ack {
            source: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };
        self.send_with_piggyback(&ack, from).await?;

        if let Some(mut member) = self.members.get_mut(source) {
            member.touch();
        }
        Ok(())
    }

    async fn on_ack(&self, source: &str, incarnation: u64) -> Result<()> {
        self.pending_pings.remove(source);

        // relay to whoever asked us to probe `source`
        let requesters: Vec<((NodeId, NodeId), SocketAddr)> = self
            .relayed_probes
            .iter()
            .filter(|e| e.key().1 == source)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (key, addr) in requesters {
            self.relayed_probes.remove(&key);
            let relay = GossipMessage::Ack {
                source: source.to_string(),
                incarnation,
            };
            if let Err(e) = self.send(&relay, addr).await {
                debug!(requester = %key.0, error = %e, "Ack relay failed");
            }
        }

        let recovered = self.members.get_mut(source).and_then(|mut member| {
            let was_alive = member.is_alive();
            let incarnation = incarnation.max(member.incarnation);
            member.mark_alive(incarnation);
            (!was_alive).then(|| member.info.clone())
        });
        if let Some(info) = recovered {
            info!(node_id = %info.id, "Member recovered");
            self.emit(MembershipEvent::Join(info));
        }
        Ok(())
    }

    async fn on_ping_req(&self, source: NodeId, target: NodeId, from: SocketAddr) -> Result<()> {
        let Some(target_addr) = self.members.get(&target).map(|n| n.gossip_addr()) else {
            return Ok(());
        };
        let ping = GossipMessage::Ping {
            source: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };
        self.send(&ping, target_addr).await?;
        self.relayed_probes.insert((source, target), from);
        Ok(())
    }

    async fn on_join(&self, info: NodeInfo) -> Result<()> {
        let was_alive = self.members.get(&info.id).is_some_and(|n| n.is_alive());
        if was_alive {
            debug!(node_id = %info.id, "Known node joined again, updating info");
        } else {
            info!(node_id = %info.id, addr = %info.gossip_addr, "Node joining cluster");
        }

        let mut node = Node::new(info.clone());
        node.mark_alive(0);
        self.members.insert(info.id.clone(), node);

        // the joiner learns the whole cluster from our table
        let sync = GossipMessage::Sync {
            source: self.local_node.id.clone(),
            states: self.gossip_states(),
        };
        self.send(&sync, info.gossip_addr).await?;

        if !was_alive {
            ClusterMetrics::increment_node_joins();
            self.emit(MembershipEvent::Join(info));
        }
        Ok(())
    }

    fn on_leave(&self, node_id: &str) {
        if node_id == self.local_node.id {
            return;
        }

        let left = self.members.get_mut(node_id).and_then(|mut member| {
            (member.state != NodeState::Left).then(|| {
                member.mark_left();
                member.info.clone()
            })
        });
        if let Some(info) = left {
            info!(node_id = %node_id, "Node left cluster gracefully");
            ClusterMetrics::increment_node_leaves();
            self.emit(MembershipEvent::Leave(info));
        }
    }

    fn on_suspect(&self, node_id: &str, incarnation: u64) {
        if node_id == self.local_node.id {
            // outbid the suspicion so the cluster keeps us alive
            let previous = self
                .incarnation
                .fetch_max(incarnation + 1, Ordering::SeqCst);
            if previous <= incarnation {
                debug!(incarnation = incarnation + 1, "Refuting suspicion");
                self.piggyback.push(GossipMessage::Alive {
                    node_id: self.local_node.id.clone(),
                    incarnation: incarnation + 1,
                });
            }
            return;
        }

        if let Some(mut member) = self.members.get_mut(node_id) {
            if incarnation >= member.incarnation {
                member.mark_suspect();
            }
        }
    }

    fn on_alive(&self, node_id: &str, incarnation: u64) {
        let recovered = self.members.get_mut(node_id).and_then(|mut member| {
            if incarnation <= member.incarnation {
                return None;
            }
            let was_alive = member.is_alive();
            member.mark_alive(incarnation);
            (!was_alive).then(|| member.info.clone())
        });
        if let Some(info) = recovered {
            self.emit(MembershipEvent::Join(info));
        }
    }

    fn on_dead(&self, node_id: &str, incarnation: u64) {
        if node_id == self.local_node.id {
            return;
        }

        let failed = self.members.get_mut(node_id).and_then(|mut member| {
            (incarnation >= member.incarnation && member.state.is_reachable()).then(|| {
                member.mark_failed();
                member.info.clone()
            })
        });
        if let Some(info) = failed {
            ClusterMetrics::increment_node_failures();
            self.emit(MembershipEvent::Fail(info));
        }
    }

    /// Fold one entry of a peer's member table into ours
    fn merge_state(&self, state: NodeGossipState) {
        if state.id == self.local_node.id {
            return;
        }

        let event = match self.members.get_mut(&state.id) {
            Some(mut member) => {
                let newer = state.incarnation > member.incarnation
                    || (state.incarnation == member.incarnation
                        && member.state == NodeState::Unknown);
                if !newer {
                    return;
                }
                let was_alive = member.is_alive();
                match state.state {
                    NodeState::Alive => {
                        member.mark_alive(state.incarnation);
                        (!was_alive).then(|| MembershipEvent::Join(member.info.clone()))
                    }
                    NodeState::Suspect => {
                        member.mark_suspect();
                        None
                    }
                    NodeState::Failed if member.state.is_reachable() => {
                        member.mark_failed();
                        Some(MembershipEvent::Fail(member.info.clone()))
                    }
                    NodeState::Leaving | NodeState::Left if member.state != NodeState::Left => {
                        member.mark_left();
                        Some(MembershipEvent::Leave(member.info.clone()))
                    }
                    _ => None,
                }
            }
            None if state.state.is_reachable() => {
                let info = NodeInfo::from(&state);
                let mut node = Node::new(info.clone());
                node.mark_alive(state.incarnation);
                if state.state == NodeState::Suspect {
                    node.mark_suspect();
                }
                self.members.insert(state.id.clone(), node);
                Some(MembershipEvent::Join(info))
            }
            None => None,
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn gossip_states(&self) -> Vec<NodeGossipState> {
        self.members
            .iter()
            .map(|r| NodeGossipState::from(r.value()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Failure detection
    // ------------------------------------------------------------------

    /// One probe per `ping_interval`, then suspicion timeouts and reaping
    async fn probe_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.ping_interval);

        loop {
            ticker.tick().await;

            if let Some(target) = self.random_peer(|n| n.state.is_reachable()) {
                self.probe(target).await?;
            }

            self.expire_suspects();
            self.reap();
        }
    }

    /// Direct ping, then indirect probes, then suspicion
    async fn probe(&self, target: Node) -> Result<()> {
        let target_id = target.id().to_string();
        let ping = GossipMessage::Ping {
            source: self.local_node.id.clone(),
            incarnation: self.incarnation(),
        };
        self.pending_pings.insert(target_id.clone(), Instant::now());
        self.send_with_piggyback(&ping, target.gossip_addr()).await?;

        tokio::time::sleep(self.config.ping_timeout).await;
        if !self.pending_pings.contains_key(&target_id) {
            return Ok(());
        }

        let request = GossipMessage::PingReq {
            source: self.local_node.id.clone(),
            target: target_id.clone(),
            incarnation: self.incarnation(),
        };
        let helpers: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|r| r.key() != &self.local_node.id && r.key() != &target_id)
            .filter(|r| r.value().is_alive())
            .map(|r| r.value().gossip_addr())
            .choose_multiple(&mut rand::thread_rng(), self.config.indirect_probes);
        for addr in helpers {
            if let Err(e) = self.send(&request, addr).await {
                debug!(helper = %addr, error = %e, "Indirect probe not sent");
            }
        }

        tokio::time::sleep(self.config.ping_timeout * 2).await;
        if self.pending_pings.remove(&target_id).is_some() {
            self.suspect(&target_id);
        }
        Ok(())
    }

    fn random_peer(&self, pred: impl Fn(&Node) -> bool) -> Option<Node> {
        self.members
            .iter()
            .filter(|r| r.key() != &self.local_node.id && pred(r.value()))
            .choose(&mut rand::thread_rng())
            .map(|r| r.value().clone())
    }

    fn suspect(&self, node_id: &str) {
        let notice = self.members.get_mut(node_id).and_then(|mut member| {
            (member.state == NodeState::Alive).then(|| {
                member.mark_suspect();
                GossipMessage::Suspect {
                    node_id: node_id.to_string(),
                    incarnation: member.incarnation,
                    from: self.local_node.id.clone(),
                }
            })
        });

        if let Some(notice) = notice {
            debug!(node_id = %node_id, "Member suspected");
            self.piggyback.push(notice);
        }
    }

    /// Suspects that stayed silent for `ping_interval * suspicion_multiplier` fail
    fn expire_suspects(&self) {
        let timeout = self.config.ping_interval * self.config.suspicion_multiplier;

        let expired: Vec<NodeId> = self
            .members
            .iter()
            .filter(|m| m.state == NodeState::Suspect && m.last_seen.elapsed() > timeout)
            .map(|m| m.key().clone())
            .collect();

        for node_id in expired {
            let failed = self.members.get_mut(&node_id).map(|mut member| {
                member.mark_failed();
                (member.info.clone(), member.incarnation)
            });

            if let Some((info, incarnation)) = failed {
                warn!(node_id = %node_id, "Member failed");
                self.piggyback.push(GossipMessage::Dead {
                    node_id,
                    incarnation,
                });
                ClusterMetrics::increment_node_failures();
                self.emit(MembershipEvent::Fail(info));
            }
        }
    }

    /// Drop failed members past the reap timeout and departed members past
    /// the leave propagation window
    fn reap(&self) {
        let reap_timeout = self.config.reap_timeout;
        let leave_window = self.config.leave_propagation;

        let expired: Vec<(NodeId, NodeState)> = self
            .members
            .iter()
            .filter(|m| m.key() != &self.local_node.id)
            .filter(|m| match m.state {
                NodeState::Failed => m.state_changed.elapsed() > reap_timeout,
                NodeState::Left => m.state_changed.elapsed() > leave_window,
                _ => false,
            })
            .map(|m| (m.key().clone(), m.state))
            .collect();

        for (node_id, state) in expired {
            if let Some((_, node)) = self.members.remove(&node_id) {
                if state == NodeState::Failed {
                    info!(node_id = %node_id, "Reaped failed member");
                    self.emit(MembershipEvent::Reap(node.info));
                } else {
                    debug!(node_id = %node_id, "Dropped departed member");
                }
            }
        }
    }

    /// Push our full table to a random peer every `sync_interval`
    async fn sync_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.sync_interval);

        loop {
            ticker.tick().await;

            if let Some(peer) = self.random_peer(|n| n.state.is_reachable()) {
                let sync = GossipMessage::Sync {
                    source: self.local_node.id.clone(),
                    states: self.gossip_states(),
                };
                if let Err(e) = self.send(&sync, peer.gossip_addr()).await {
                    debug!(peer = %peer.id(), error = %e, "State sync not sent");
                }
            }
        }
    }
}
