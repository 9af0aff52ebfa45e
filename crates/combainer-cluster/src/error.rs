//! Cluster error types

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Membership Errors ====================
    #[error("cannot resolve advertise address: {0}")]
    AdvertiseAddress(String),

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("no seed nodes reachable after {attempts} attempts")]
    NoSeedNodes { attempts: u32 },

    #[error("cluster join failed: {0}")]
    JoinFailed(String),

    // ==================== Consensus Errors ====================
    #[error("not leader: current leader is {leader:?}")]
    NotLeader { leader: Option<u64> },

    #[error("raft error: {0}")]
    Raft(String),

    #[error("raft storage error: {0}")]
    RaftStorage(String),

    #[error("raft not initialized")]
    RaftNotInitialized,

    #[error("proposal timeout")]
    ProposalTimeout,

    // ==================== Session Errors ====================
    #[error("no hosts in groups {0:?}")]
    NoHosts(Vec<String>),

    #[error("aggregation config {name}: {reason}")]
    AggregationConfig { name: String, reason: String },

    #[error("worker rpc {call} failed: {reason}")]
    Rpc { call: &'static str, reason: String },

    #[error("request timeout")]
    Timeout,

    // ==================== Repository / Fetcher Errors ====================
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("plugin section is missing the `type` key")]
    MissingPluginType,

    #[error("unknown fetcher type: {0}")]
    UnknownFetcher(String),

    #[error("fetcher error: {0}")]
    Fetcher(String),

    // ==================== Protocol Errors ====================
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ==================== Internal Errors ====================
    #[error("crypto error: {0}")]
    CryptoError(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::Timeout
                | ClusterError::ProposalTimeout
                | ClusterError::NotLeader { .. }
                | ClusterError::NoSeedNodes { .. }
                | ClusterError::NoHosts(_)
                | ClusterError::Rpc { .. }
                | ClusterError::Network(_)
        )
    }

    /// Expected on followers; callers log it at debug level and move on.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ClusterError::NotLeader { .. })
    }

    /// Get the leader id if this is a NotLeader error
    pub fn leader(&self) -> Option<u64> {
        match self {
            ClusterError::NotLeader { leader } => *leader,
            _ => None,
        }
    }

    /// Check if this is a fatal error requiring the process to stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::AdvertiseAddress(_)
                | ClusterError::Bind { .. }
                | ClusterError::RaftStorage(_)
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClusterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ClusterError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ClusterError::ChannelClosed
    }
}

impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(e: serde_yaml::Error) -> Self {
        ClusterError::Repository(e.to_string())
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClusterError::Timeout
        } else {
            ClusterError::Network(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for ClusterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ClusterError::Timeout
    }
}
