//! Node types and member state

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Node name. Doubles as the host key of the assignment store.
pub type NodeId = String;

/// Member state as seen by the gossip layer.
///
/// Transitions: `Alive -> (Leaving | Suspect -> Failed) -> Left | reaped`.
/// Reaped members are dropped from the member table, so there is no
/// variant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Node is healthy and responding
    Alive,
    /// Node missed some pings, suspected but not confirmed dead
    Suspect,
    /// Node confirmed dead, reaped after the reap timeout
    Failed,
    /// Local node announced its departure
    Leaving,
    /// Node left gracefully
    Left,
    /// Node state is unknown (just learned about)
    #[default]
    Unknown,
}

impl NodeState {
    /// Only alive members count toward quorum and host lists
    pub fn is_alive(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    /// Check if node might be reachable
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

/// Static information about a cluster node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node name
    pub id: NodeId,

    /// Gossip address
    pub gossip_addr: SocketAddr,

    /// Raft HTTP transport base URL (e.g. `http://10.0.0.1:9001`)
    pub raft_addr: String,

    /// Node version (for compatibility checking)
    pub version: String,
}

impl NodeInfo {
    /// Create new node info
    pub fn new(id: impl Into<String>, gossip_addr: SocketAddr, raft_addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gossip_addr,
            raft_addr: raft_addr.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Full member state including runtime information
#[derive(Debug, Clone)]
pub struct Node {
    /// Static node information
    pub info: NodeInfo,

    /// Current node state
    pub state: NodeState,

    /// Incarnation number (for SWIM protocol)
    pub incarnation: u64,

    /// Last time we heard from this node
    pub last_seen: Instant,

    /// When `state` last changed
    pub state_changed: Instant,
}

impl Node {
    /// Create a new node from info
    pub fn new(info: NodeInfo) -> Self {
        let now = Instant::now();
        Self {
            info,
            state: NodeState::Unknown,
            incarnation: 0,
            last_seen: now,
            state_changed: now,
        }
    }

    fn set_state(&mut self, state: NodeState) {
        if self.state != state {
            self.state = state;
            self.state_changed = Instant::now();
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Mark as alive
    pub fn mark_alive(&mut self, incarnation: u64) {
        self.set_state(NodeState::Alive);
        self.incarnation = incarnation;
        self.touch();
    }

    /// Mark as suspect
    pub fn mark_suspect(&mut self) {
        if self.state == NodeState::Alive {
            self.set_state(NodeState::Suspect);
        }
    }

    /// Mark as failed
    pub fn mark_failed(&mut self) {
        self.set_state(NodeState::Failed);
    }

    /// Mark as leaving
    pub fn mark_leaving(&mut self) {
        self.set_state(NodeState::Leaving);
    }

    /// Mark as left
    pub fn mark_left(&mut self) {
        self.set_state(NodeState::Left);
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.info.gossip_addr
    }
}

/// Serializable node state for gossip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGossipState {
    pub id: NodeId,
    pub state: NodeState,
    pub incarnation: u64,
    pub gossip_addr: SocketAddr,
    pub raft_addr: String,
}

impl From<&Node> for NodeGossipState {
    fn from(node: &Node) -> Self {
        Self {
            id: node.info.id.clone(),
            state: node.state,
            incarnation: node.incarnation,
            gossip_addr: node.info.gossip_addr,
            raft_addr: node.info.raft_addr.clone(),
        }
    }
}

impl From<&NodeGossipState> for NodeInfo {
    fn from(state: &NodeGossipState) -> Self {
        NodeInfo::new(state.id.clone(), state.gossip_addr, state.raft_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> NodeInfo {
        NodeInfo::new(
            "node-1",
            "127.0.0.1:7946".parse().unwrap(),
            "http://127.0.0.1:9001",
        )
    }

    #[test]
    fn test_node_state_transitions() {
        let mut node = Node::new(info());

        assert_eq!(node.state, NodeState::Unknown);
        assert!(!node.is_alive());

        node.mark_alive(1);
        assert_eq!(node.state, NodeState::Alive);
        assert!(node.is_alive());

        node.mark_suspect();
        assert_eq!(node.state, NodeState::Suspect);
        assert!(!node.is_alive());
        assert!(node.state.is_reachable());

        node.mark_failed();
        assert_eq!(node.state, NodeState::Failed);
        assert!(!node.state.is_reachable());
    }

    #[test]
    fn test_suspect_only_from_alive() {
        let mut node = Node::new(info());
        node.mark_left();
        node.mark_suspect();
        assert_eq!(node.state, NodeState::Left);
    }

    #[test]
    fn test_gossip_state_roundtrips_info() {
        let mut node = Node::new(info());
        node.mark_alive(3);
        let gossip = NodeGossipState::from(&node);
        assert_eq!(gossip.incarnation, 3);
        assert_eq!(NodeInfo::from(&gossip), node.info);
    }
}
