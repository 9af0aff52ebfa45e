//! Cluster configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default raft transport port
pub const DEFAULT_RAFT_PORT: u16 = 9001;

/// Default gossip port
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Default port of the worker RPC service on every combainer host
pub const DEFAULT_WORKER_PORT: u16 = 10052;

/// Lower bound for the rebalance interval
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Node name, unique across the cluster. Also the host key in the
    /// assignment store and the hostname workers are reached at.
    pub node_id: String,

    /// Data directory for raft log and snapshots
    pub data_dir: PathBuf,

    /// Gossip bind address
    pub bind_addr: SocketAddr,

    /// Advertised gossip address (for NAT/container environments)
    pub advertise_addr: Option<SocketAddr>,

    /// Raft HTTP transport bind address
    pub raft_addr: SocketAddr,

    /// Seed nodes (gossip addresses) for initial cluster discovery
    pub seeds: Vec<String>,

    /// Number of alive members required before the raft group is bootstrapped
    pub bootstrap_expect: usize,

    /// Bootstrap a single-node raft group immediately
    pub start_as_leader: bool,

    /// Rebalance interval
    pub update_interval: Duration,

    /// Full member reconcile interval
    pub reconcile_interval: Duration,

    /// Upper bound on a single consensus apply
    pub raft_apply_timeout: Duration,

    /// Worker RPC port
    pub worker_port: u16,

    /// Shared bearer token for the raft HTTP routes
    pub cluster_auth_token: Option<String>,

    /// SWIM membership configuration
    pub swim: SwimConfig,

    /// Raft consensus configuration
    pub raft: RaftConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "combainer".to_string(),
            data_dir: PathBuf::from("./data"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT)),
            advertise_addr: None,
            raft_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RAFT_PORT)),
            seeds: vec![],
            bootstrap_expect: 1,
            start_as_leader: false,
            update_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(60),
            raft_apply_timeout: Duration::from_secs(10),
            worker_port: DEFAULT_WORKER_PORT,
            cluster_auth_token: None,
            swim: SwimConfig::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create cluster configuration builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
    }

    /// Rebalance interval, never shorter than [`MIN_UPDATE_INTERVAL`]
    pub fn effective_update_interval(&self) -> Duration {
        self.update_interval.max(MIN_UPDATE_INTERVAL)
    }

    /// Raft transport address other nodes dial, as an HTTP base URL.
    ///
    /// An unspecified bind IP is replaced by the advertised gossip IP.
    pub fn raft_advertise_url(&self, gossip_advertise: SocketAddr) -> String {
        let ip = if self.raft_addr.ip().is_unspecified() {
            gossip_advertise.ip()
        } else {
            self.raft_addr.ip()
        };
        format!("http://{}", SocketAddr::new(ip, self.raft_addr.port()))
    }
}

/// Builder for cluster configuration
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.config.advertise_addr = Some(addr);
        self
    }

    pub fn raft_addr(mut self, addr: SocketAddr) -> Self {
        self.config.raft_addr = addr;
        self
    }

    pub fn seeds(mut self, seeds: Vec<impl Into<String>>) -> Self {
        self.config.seeds = seeds.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn bootstrap_expect(mut self, expect: usize) -> Self {
        self.config.bootstrap_expect = expect;
        self
    }

    pub fn start_as_leader(mut self, enabled: bool) -> Self {
        self.config.start_as_leader = enabled;
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_interval = interval;
        self
    }

    pub fn worker_port(mut self, port: u16) -> Self {
        self.config.worker_port = port;
        self
    }

    pub fn cluster_auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.cluster_auth_token = Some(token.into());
        self
    }

    pub fn swim(mut self, config: SwimConfig) -> Self {
        self.config.swim = config;
        self
    }

    pub fn raft(mut self, config: RaftConfig) -> Self {
        self.config.raft = config;
        self
    }

    pub fn build(self) -> ClusterConfig {
        self.config
    }
}

/// SWIM protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwimConfig {
    /// Interval between probe rounds
    pub ping_interval: Duration,

    /// Timeout for direct ping
    pub ping_timeout: Duration,

    /// Number of indirect probes on ping failure
    pub indirect_probes: usize,

    /// Multiplier for suspicion timeout (suspicion_mult * ping_interval)
    pub suspicion_multiplier: u32,

    /// Interval for full state sync
    pub sync_interval: Duration,

    /// How long a failed member is kept before it is reaped
    pub reap_timeout: Duration,

    /// How long a member that left is kept so the departure can propagate
    pub leave_propagation: Duration,

    /// Time to wait for a seed to answer a join request
    pub join_timeout: Duration,

    /// Initial backoff between join rounds; doubles up to `join_max_backoff`
    pub join_backoff: Duration,

    /// Backoff ceiling between join rounds
    pub join_max_backoff: Duration,

    /// Join rounds before giving up; `None` retries forever
    pub join_max_attempts: Option<u32>,

    /// Shared secret for HMAC-signed gossip (None = unauthenticated)
    pub auth_token: Option<String>,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_millis(500),
            indirect_probes: 3,
            suspicion_multiplier: 4,
            sync_interval: Duration::from_secs(30),
            reap_timeout: Duration::from_secs(60),
            leave_propagation: Duration::from_secs(5),
            join_timeout: Duration::from_secs(1),
            join_backoff: Duration::from_millis(500),
            join_max_backoff: Duration::from_secs(30),
            join_max_attempts: None,
            auth_token: None,
        }
    }
}

/// Raft consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,

    /// Snapshot threshold (entries before snapshot)
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 10000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.raft_addr.port(), DEFAULT_RAFT_PORT);
        assert_eq!(config.bootstrap_expect, 1);
        assert_eq!(config.worker_port, 10052);
        assert!(config.seeds.is_empty());
    }

    #[test]
    fn test_cluster_config_builder() {
        let config = ClusterConfig::builder()
            .node_id("combainer-1")
            .seeds(vec!["10.0.0.1:7946", "10.0.0.2:7946"])
            .bootstrap_expect(3)
            .build();

        assert_eq!(config.node_id, "combainer-1");
        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.bootstrap_expect, 3);
    }

    #[test]
    fn test_update_interval_is_clamped() {
        let config = ClusterConfig::builder()
            .update_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.effective_update_interval(), MIN_UPDATE_INTERVAL);

        let config = ClusterConfig::builder()
            .update_interval(Duration::from_secs(30))
            .build();
        assert_eq!(config.effective_update_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_raft_advertise_url() {
        let config = ClusterConfig::default();
        let url = config.raft_advertise_url("10.1.2.3:7946".parse().unwrap());
        assert_eq!(url, "http://10.1.2.3:9001");

        let config = ClusterConfig::builder()
            .raft_addr("127.0.0.1:9101".parse().unwrap())
            .build();
        let url = config.raft_advertise_url("10.1.2.3:7946".parse().unwrap());
        assert_eq!(url, "http://127.0.0.1:9101");
    }
}
