//! # Combainer Cluster
//!
//! Coordination engine for a fleet of combainer nodes:
//! - **SWIM membership**: node discovery and failure detection
//! - **Raft assignment store**: replicated `host -> configs` map
//! - **Rebalancer / reconciler**: leader-only convergence of assignments and voters
//! - **Session client**: timed parsing and aggregation fan-out to workers
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Combainer Node                          │
//! ├──────────────┬──────────────────┬──────────────────────────────┤
//! │    SWIM      │       Raft       │         Sessions             │
//! │  Membership  │  Assignment FSM  │                              │
//! ├──────────────┼──────────────────┼──────────────────────────────┤
//! │ • Join/leave │ • AssignConfig   │ • One loop per local config  │
//! │ • Failure    │ • RemoveConfig   │ • Parsing (bounded)          │
//! │   detection  │ • Snapshots      │ • Aggregation (fan-out)      │
//! │ • Events ────┼─> Reconciler     │ • Observer stats             │
//! │              │   Rebalancer     │                              │
//! └──────────────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use combainer_cluster::{ClusterConfig, ClusterContext, FilesystemRepository};
//! use std::sync::Arc;
//!
//! let repo = Arc::new(FilesystemRepository::new("/etc/combaine")?);
//! let config = ClusterConfig::builder()
//!     .node_id("node-1")
//!     .seeds(vec!["node-2:7946"])
//!     .bootstrap_expect(3)
//!     .build();
//! let ctx = ClusterContext::new(config, repo).await?;
//! ctx.start().await?;
//! ```

pub mod assignment;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod leader;
pub mod membership;
pub mod node;
pub mod observability;
pub mod raft;
pub mod rebalancer;
pub mod reconciler;
pub mod repository;
pub mod session;
pub mod stats;
pub mod storage;

// Re-export main types
pub use assignment::{
    AssignmentCommand, AssignmentMap, AssignmentResponse, AssignmentStore, LocalTasks,
    SessionSpawner,
};
pub use config::{ClusterConfig, ClusterConfigBuilder, RaftConfig, SwimConfig};
pub use context::ClusterContext;
pub use error::{ClusterError, Result};
pub use fetcher::{FetcherRegistry, HostFetcher, Hosts, HttpFetcher, PredefineFetcher, TtlCache};
pub use leader::{LeaderDuties, LeaderElection, LeaderState};
pub use membership::{Membership, MembershipEvent};
pub use node::{Node, NodeId, NodeInfo, NodeState};
pub use observability::{init_metrics, ClusterMetrics, NetworkMetrics, RaftMetrics, SessionMetrics};
pub use raft::{hash_node_id, Proposer, RaftNode, SerializationFormat, TypeConfig, VoterControl};
pub use rebalancer::{PassReport, Rebalancer};
pub use reconciler::Reconciler;
pub use repository::{
    AggregationConfig, CombainerConfig, EncodedConfig, FilesystemRepository, ParsingConfig,
    PluginConfig, Repository,
};
pub use session::{
    AggregatingResult, AggregatingTask, HttpWorkerRpc, ParsingResult, ParsingTask, SessionClient,
    SessionParams, SessionRunner, TimeFrame, WorkerHosts, WorkerRpc,
};
pub use stats::{ClientStats, Observer, StatInfo};
