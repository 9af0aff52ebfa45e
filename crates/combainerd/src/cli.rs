//! CLI argument parsing for the combainer daemon
//!
//! Flags override the `Combainer.Main.Cluster` section of `combaine.yaml`,
//! which in turn overrides the built-in defaults.

use clap::Parser;
use combainer_cluster::config::{DEFAULT_GOSSIP_PORT, DEFAULT_RAFT_PORT, DEFAULT_WORKER_PORT};
use combainer_cluster::repository::ClusterSection;
use combainer_cluster::{ClusterConfig, RaftConfig, SwimConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Hostname via the `hostname` command, falling back to "localhost"
fn hostname() -> String {
    std::process::Command::new("hostname")
        .arg("-f")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Combainer - distributed scheduler of parsing and aggregation sessions
///
/// Every node gossips membership, replicates the config assignment map
/// over raft and runs the sessions assigned to it.
#[derive(Parser, Debug)]
#[command(name = "combainerd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ============ Node ============
    /// Node name, unique across the cluster (defaults to the FQDN)
    #[arg(long, env = "COMBAINER_NODE_ID")]
    pub node_id: Option<String>,

    /// Directory holding combaine.yaml, parsing/ and aggregate/
    #[arg(short, long, default_value = "/etc/combaine", env = "COMBAINER_CONFIGS")]
    pub configs: PathBuf,

    /// Data directory for the raft log and snapshots
    #[arg(short, long, env = "COMBAINER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info", env = "COMBAINER_LOG_LEVEL")]
    pub log_level: String,

    // ============ Cluster ============
    /// Gossip bind address
    #[arg(short, long, env = "COMBAINER_BIND")]
    pub bind: Option<SocketAddr>,

    /// Public gossip address for NAT/container environments
    #[arg(long, env = "COMBAINER_ADVERTISE_ADDR")]
    pub advertise_addr: Option<SocketAddr>,

    /// Raft HTTP transport port; the observer REST endpoint shares it
    #[arg(long, env = "COMBAINER_RAFT_PORT")]
    pub raft_port: Option<u16>,

    /// Seed nodes (comma-separated gossip addresses)
    #[arg(long, value_delimiter = ',', env = "COMBAINER_SEEDS")]
    pub seeds: Vec<String>,

    /// Alive members required before the raft group is bootstrapped
    #[arg(long, env = "COMBAINER_BOOTSTRAP_EXPECT")]
    pub bootstrap_expect: Option<usize>,

    /// Bootstrap a single-node raft group immediately
    #[arg(long, default_value = "false", env = "COMBAINER_START_AS_LEADER")]
    pub start_as_leader: bool,

    /// Shared bearer token for the cluster HTTP routes
    #[arg(long, env = "COMBAINER_CLUSTER_AUTH_TOKEN")]
    pub cluster_auth_token: Option<String>,

    // ============ Scheduling ============
    /// Rebalance interval in seconds (never below 5)
    #[arg(long, default_value = "60", env = "COMBAINER_UPDATE_INTERVAL_SECS")]
    pub update_interval_secs: u64,

    /// Full member reconcile interval in seconds
    #[arg(long, default_value = "60", env = "COMBAINER_RECONCILE_INTERVAL_SECS")]
    pub reconcile_interval_secs: u64,

    /// Upper bound on one consensus apply in seconds
    #[arg(long, default_value = "10", env = "COMBAINER_RAFT_APPLY_TIMEOUT_SECS")]
    pub raft_apply_timeout_secs: u64,

    /// Port of the worker RPC service on every combainer host
    #[arg(long, default_value_t = DEFAULT_WORKER_PORT, env = "COMBAINER_WORKER_PORT")]
    pub worker_port: u16,

    // ============ SWIM ============
    /// SWIM protocol interval in milliseconds
    #[arg(long, default_value = "1000", env = "COMBAINER_SWIM_INTERVAL_MS")]
    pub swim_interval_ms: u64,

    /// SWIM suspicion multiplier
    #[arg(long, default_value = "4", env = "COMBAINER_SWIM_SUSPICION_MULT")]
    pub swim_suspicion_mult: u32,

    /// HMAC key for gossip messages
    #[arg(long, env = "COMBAINER_GOSSIP_KEY")]
    pub gossip_key: Option<String>,

    // ============ Raft ============
    /// Raft heartbeat interval in milliseconds
    #[arg(long, default_value = "50", env = "COMBAINER_RAFT_HEARTBEAT_MS")]
    pub raft_heartbeat_ms: u64,

    /// Raft election timeout minimum in milliseconds
    #[arg(long, default_value = "150", env = "COMBAINER_RAFT_ELECTION_MIN_MS")]
    pub raft_election_min_ms: u64,

    /// Raft election timeout maximum in milliseconds
    #[arg(long, default_value = "300", env = "COMBAINER_RAFT_ELECTION_MAX_MS")]
    pub raft_election_max_ms: u64,

    // ============ Metrics ============
    /// Prometheus exporter address (needs the metrics-prometheus feature)
    #[arg(long, env = "COMBAINER_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Validate flag combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.raft_election_min_ms <= self.raft_heartbeat_ms {
            return Err(format!(
                "raft_election_min_ms ({}) must be greater than raft_heartbeat_ms ({})",
                self.raft_election_min_ms, self.raft_heartbeat_ms
            ));
        }

        if self.raft_election_max_ms < self.raft_election_min_ms {
            return Err(format!(
                "raft_election_max_ms ({}) must be >= raft_election_min_ms ({})",
                self.raft_election_max_ms, self.raft_election_min_ms
            ));
        }

        if self.bootstrap_expect == Some(0) {
            return Err("bootstrap_expect must be at least 1".to_string());
        }

        if self.raft_apply_timeout_secs == 0 {
            return Err("raft_apply_timeout_secs must be at least 1".to_string());
        }

        if self.seeds.is_empty() && !self.start_as_leader {
            tracing::warn!("No seed nodes specified, waiting to be joined");
        }

        Ok(())
    }

    /// Effective node name
    pub fn effective_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(hostname)
    }

    /// Merge flags over the `Cluster` section of `combaine.yaml`
    pub fn to_cluster_config(&self, file: &ClusterSection) -> Result<ClusterConfig, String> {
        let bind_addr = match self.bind {
            Some(addr) => addr,
            None => file_bind_addr(&file.bind_addr)?,
        };

        let raft_port = self
            .raft_port
            .or((file.raft_port != 0).then_some(file.raft_port))
            .unwrap_or(DEFAULT_RAFT_PORT);

        let bootstrap_expect = self
            .bootstrap_expect
            .or((file.bootstrap_expect != 0).then_some(file.bootstrap_expect))
            .unwrap_or(1);

        let data_dir = self.data_dir.clone().unwrap_or_else(|| {
            if file.data_dir.is_empty() {
                PathBuf::from("/var/lib/combainer")
            } else {
                PathBuf::from(&file.data_dir)
            }
        });

        Ok(ClusterConfig {
            node_id: self.effective_node_id(),
            data_dir,
            bind_addr,
            advertise_addr: self.advertise_addr,
            raft_addr: SocketAddr::new(bind_addr.ip(), raft_port),
            seeds: self.seeds.clone(),
            bootstrap_expect,
            start_as_leader: self.start_as_leader || file.start_as_leader,
            update_interval: Duration::from_secs(self.update_interval_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            raft_apply_timeout: Duration::from_secs(self.raft_apply_timeout_secs),
            worker_port: self.worker_port,
            cluster_auth_token: self.cluster_auth_token.clone(),
            swim: SwimConfig {
                ping_interval: Duration::from_millis(self.swim_interval_ms),
                suspicion_multiplier: self.swim_suspicion_mult,
                auth_token: self.gossip_key.clone(),
                ..Default::default()
            },
            raft: RaftConfig {
                heartbeat_interval: Duration::from_millis(self.raft_heartbeat_ms),
                election_timeout_min: Duration::from_millis(self.raft_election_min_ms),
                election_timeout_max: Duration::from_millis(self.raft_election_max_ms),
                ..Default::default()
            },
        })
    }
}

/// `BindAddr` is either a bare IP (gossip on the default port) or a full
/// socket address
fn file_bind_addr(value: &str) -> Result<SocketAddr, String> {
    if value.is_empty() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT)));
    }
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_GOSSIP_PORT))
        .map_err(|e| format!("invalid Cluster.BindAddr {:?}: {}", value, e))
}
