//! Raft consensus over the assignment store
//!
//! - **TypeConfig**: openraft type wiring (u64 node ids, `BasicNode` carrying the
//!   raft HTTP base URL, file-backed snapshots)
//! - **StateMachine**: applies [`AssignmentCommand`]s to the shared
//!   [`AssignmentStore`] and persists snapshots as files
//! - **NetworkFactory**: HTTP client for the `/raft/*` routes served by combainerd
//! - **RaftNode**: the handle used by the leader loop, rebalancer and reconciler
//!
//! Node ids are FNV-1a hashes of the node name, see [`hash_node_id`].

#![allow(clippy::result_large_err)]

use crate::assignment::{AssignmentCommand, AssignmentMap, AssignmentResponse, AssignmentStore};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::observability::{NetworkMetrics, RaftMetrics};
use crate::storage::RedbLogStore;
use async_trait::async_trait;
use openraft::error::{
    ClientWriteError, InitializeError, InstallSnapshotError, NetworkError, RPCError, RaftError,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::responder::OneshotResponder;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    AnyError, BasicNode, ChangeMembers, Entry, EntryPayload, LogId, Membership, RaftTypeConfig,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct NetworkErrorWrapper(String);

impl std::fmt::Display for NetworkErrorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NetworkErrorWrapper {}

// ============================================================================
// Type Configuration
// ============================================================================

/// Raft node id
pub type NodeId = u64;

/// Log entry payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftRequest {
    pub command: AssignmentCommand,
}

/// State machine output for one entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftResponse {
    pub response: AssignmentResponse,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = RaftRequest;
    type R = RaftResponse;
    type NodeId = NodeId;
    type Node = BasicNode;
    type Entry = Entry<TypeConfig>;
    /// Snapshots are files under `{data_dir}/snapshots`; openraft streams them
    /// in chunks
    type SnapshotData = tokio::fs::File;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = OneshotResponder<TypeConfig>;
}

/// Upper bound for a snapshot built locally or received from the leader
const MAX_SNAPSHOT_SIZE: usize = 64 * 1024 * 1024;

/// Snapshot files kept on disk
const SNAPSHOTS_TO_KEEP: usize = 3;

pub type RaftLogId = LogId<NodeId>;
pub type RaftVote = Vote<NodeId>;
pub type RaftEntry = Entry<TypeConfig>;
pub type RaftStoredMembership = StoredMembership<NodeId, BasicNode>;
pub type RaftSnapshot = Snapshot<TypeConfig>;
pub type RaftSnapshotMeta = SnapshotMeta<NodeId, BasicNode>;

// ============================================================================
// State Machine
// ============================================================================

fn sm_read_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_state_machine(AnyError::new(&e)),
    }
}

/// On-disk snapshot body
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotData {
    assignments: AssignmentMap,
    last_applied: Option<RaftLogId>,
    membership: RaftStoredMembership,
}

impl SnapshotData {
    fn snapshot_id(&self) -> String {
        format!(
            "snapshot-{}",
            self.last_applied.map(|l| l.index).unwrap_or(0)
        )
    }

    fn meta(&self) -> RaftSnapshotMeta {
        SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: self.snapshot_id(),
        }
    }
}

/// Raft state machine backed by a shared [`AssignmentStore`]
pub struct StateMachine {
    store: Arc<AssignmentStore>,
    last_applied: RwLock<Option<RaftLogId>>,
    membership: RwLock<RaftStoredMembership>,
    snapshot_dir: PathBuf,
    current_snapshot: RwLock<Option<RaftSnapshotMeta>>,
}

impl StateMachine {
    pub fn new(store: Arc<AssignmentStore>, snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_dir = snapshot_dir.into();
        std::fs::create_dir_all(&snapshot_dir).map_err(|e| {
            ClusterError::RaftStorage(format!("create {}: {}", snapshot_dir.display(), e))
        })?;
        Ok(Self {
            store,
            last_applied: RwLock::new(None),
            membership: RwLock::new(StoredMembership::new(None, Membership::new(vec![], ()))),
            snapshot_dir,
            current_snapshot: RwLock::new(None),
        })
    }

    pub fn store(&self) -> &Arc<AssignmentStore> {
        &self.store
    }

    async fn capture(&self) -> SnapshotData {
        let last_applied = self.last_applied.read().await;
        let membership = self.membership.read().await;
        SnapshotData {
            assignments: self.store.dump(),
            last_applied: *last_applied,
            membership: membership.clone(),
        }
    }

    fn restore(&self, data: &[u8]) -> std::result::Result<SnapshotData, StorageError<NodeId>> {
        let snapshot: SnapshotData = postcard::from_bytes(data).map_err(sm_read_err)?;
        self.store.replace(snapshot.assignments.clone());
        Ok(snapshot)
    }

    /// Restore the newest snapshot file, if any. Called before openraft takes
    /// ownership so the log does not have to be replayed from the start.
    pub async fn load_latest_snapshot(&self) -> std::result::Result<bool, StorageError<NodeId>> {
        let Some((_, path)) = list_snapshots(&self.snapshot_dir).await.pop() else {
            debug!(dir = %self.snapshot_dir.display(), "No snapshot on disk");
            return Ok(false);
        };

        let data = tokio::fs::read(&path).await.map_err(sm_read_err)?;
        let snapshot = self.restore(&data)?;
        *self.last_applied.write().await = snapshot.last_applied;
        *self.membership.write().await = snapshot.membership.clone();
        *self.current_snapshot.write().await = Some(snapshot.meta());

        info!(
            path = %path.display(),
            size_bytes = data.len(),
            last_applied = ?snapshot.last_applied,
            "Restored assignments from snapshot"
        );
        Ok(true)
    }

    async fn open_snapshot(
        &self,
        meta: RaftSnapshotMeta,
    ) -> std::result::Result<RaftSnapshot, StorageError<NodeId>> {
        let path = self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id));
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::read_snapshot(Some(meta.signature()), &e),
            })?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }
}

/// `(index, path)` of every `snapshot-{index}.snap` in `dir`, oldest first
async fn list_snapshots(dir: &Path) -> Vec<(u64, PathBuf)> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Vec::new();
    };

    let mut snaps = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("snap") {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("snapshot-"))
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(index) = index {
            snaps.push((index, path));
        }
    }
    snaps.sort_by_key(|(index, _)| *index);
    snaps
}

async fn prune_snapshots(dir: &Path, keep: usize) {
    let snaps = list_snapshots(dir).await;
    let excess = snaps.len().saturating_sub(keep);
    for (_, path) in snaps.into_iter().take(excess) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed old snapshot"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove old snapshot"),
        }
    }
}

/// Writes a frozen copy of the state machine to disk
pub struct SnapshotBuilder {
    data: SnapshotData,
    snapshot_dir: PathBuf,
}

impl SnapshotBuilder {
    async fn write(&self) -> std::result::Result<(RaftSnapshotMeta, PathBuf), StorageError<NodeId>> {
        let meta = self.data.meta();
        let bytes = postcard::to_allocvec(&self.data).map_err(sm_read_err)?;
        if bytes.len() > MAX_SNAPSHOT_SIZE {
            return Err(sm_read_err(std::io::Error::other(format!(
                "snapshot is {} bytes, limit is {}",
                bytes.len(),
                MAX_SNAPSHOT_SIZE
            ))));
        }

        let path = self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id));
        let tmp = self.snapshot_dir.join(format!("{}.snap.tmp", meta.snapshot_id));
        let write_err = |e: std::io::Error| StorageError::IO {
            source: StorageIOError::write_snapshot(Some(meta.signature()), &e),
        };
        tokio::fs::write(&tmp, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;

        prune_snapshots(&self.snapshot_dir, SNAPSHOTS_TO_KEEP).await;
        RaftMetrics::increment_snapshots();
        info!(
            snapshot_id = %meta.snapshot_id,
            hosts = self.data.assignments.len(),
            size_bytes = bytes.len(),
            "Built snapshot"
        );
        Ok((meta, path))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> std::result::Result<RaftSnapshot, StorageError<NodeId>> {
        let (meta, path) = self.write().await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::read_snapshot(Some(meta.signature()), &e),
            })?;
        Ok(Snapshot {
            meta,
            snapshot: Box::new(file),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<RaftLogId>, RaftStoredMembership), StorageError<NodeId>> {
        Ok((
            *self.last_applied.read().await,
            self.membership.read().await.clone(),
        ))
    }

    async fn apply<I>(
        &mut self,
        entries: I,
    ) -> std::result::Result<Vec<RaftResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            let response = match entry.payload {
                EntryPayload::Blank => AssignmentResponse::Success,
                EntryPayload::Normal(req) => self.store.apply(req.command),
                EntryPayload::Membership(membership) => {
                    *self.membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership);
                    AssignmentResponse::Success
                }
            };
            *self.last_applied.write().await = Some(entry.log_id);
            responses.push(RaftResponse { response });
        }
        Ok(responses)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<tokio::fs::File>, StorageError<NodeId>> {
        let path = self.snapshot_dir.join("incoming.snap.tmp");
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::write_snapshot(None, &e),
            })?;
        Ok(Box::new(file))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        mut snapshot: Box<tokio::fs::File>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        let started = Instant::now();
        let read_err = |e: std::io::Error| StorageError::IO {
            source: StorageIOError::read_snapshot(Some(meta.signature()), &e),
        };

        snapshot
            .seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(read_err)?;
        let mut data = Vec::new();
        snapshot.read_to_end(&mut data).await.map_err(read_err)?;
        if data.len() > MAX_SNAPSHOT_SIZE {
            return Err(read_err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("incoming snapshot is {} bytes", data.len()),
            )));
        }

        self.restore(&data)?;
        *self.last_applied.write().await = meta.last_log_id;
        *self.membership.write().await = meta.last_membership.clone();

        let path = self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id));
        let tmp = self.snapshot_dir.join("incoming.snap.tmp");
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::write_snapshot(Some(meta.signature()), &e),
            })?;
        *self.current_snapshot.write().await = Some(meta.clone());
        prune_snapshots(&self.snapshot_dir, SNAPSHOTS_TO_KEEP).await;

        RaftMetrics::record_snapshot_duration(started.elapsed());
        info!(
            snapshot_id = %meta.snapshot_id,
            size_bytes = data.len(),
            "Installed snapshot from leader"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<RaftSnapshot>, StorageError<NodeId>> {
        if let Some(meta) = self.current_snapshot.read().await.clone() {
            let path = self.snapshot_dir.join(format!("{}.snap", meta.snapshot_id));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return self.open_snapshot(meta).await.map(Some);
            }
        }

        let mut builder = self.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await?;
        *self.current_snapshot.write().await = Some(snapshot.meta.clone());
        Ok(Some(snapshot))
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            data: self.capture().await,
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// Wire format for raft RPC bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    Json,
    #[default]
    Binary,
}

impl SerializationFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            SerializationFormat::Json => "application/json",
            SerializationFormat::Binary => "application/octet-stream",
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> std::result::Result<Vec<u8>, String> {
        match self {
            SerializationFormat::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            SerializationFormat::Binary => postcard::to_allocvec(value).map_err(|e| e.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(self, data: &[u8]) -> std::result::Result<T, String> {
        match self {
            SerializationFormat::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            SerializationFormat::Binary => postcard::from_bytes(data).map_err(|e| e.to_string()),
        }
    }
}

/// Creates one [`Network`] per raft peer
#[derive(Clone)]
pub struct NetworkFactory {
    client: reqwest::Client,
    format: SerializationFormat,
    auth_token: Option<String>,
}

impl NetworkFactory {
    pub fn new(auth_token: Option<String>) -> Result<Self> {
        Self::with_format(SerializationFormat::Binary, auth_token)
    }

    pub fn with_format(format: SerializationFormat, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ClusterError::Network(format!("build http client: {}", e)))?;
        Ok(Self {
            client,
            format,
            auth_token,
        })
    }
}

/// HTTP connection to one raft peer
pub struct Network {
    target: NodeId,
    target_addr: String,
    client: reqwest::Client,
    format: SerializationFormat,
    auth_token: Option<String>,
}

fn rpc_err<E: std::error::Error>(msg: impl Into<String>) -> RPCError<NodeId, BasicNode, E> {
    RPCError::Network(NetworkError::new(&NetworkErrorWrapper(msg.into())))
}

impl Network {
    async fn send<Req, Resp, E>(
        &self,
        route: &'static str,
        rpc: &Req,
    ) -> std::result::Result<Resp, RPCError<NodeId, BasicNode, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error,
    {
        let body = self.format.encode(rpc).map_err(rpc_err)?;
        NetworkMetrics::add_bytes_sent(body.len() as u64);

        let mut request = self
            .client
            .post(format!("{}/raft/{}", self.target_addr, route))
            .header(reqwest::header::CONTENT_TYPE, self.format.content_type())
            .header(reqwest::header::ACCEPT, self.format.content_type())
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| {
            NetworkMetrics::increment_rpc_errors(route);
            RPCError::Network(NetworkError::new(&e))
        })?;
        if !resp.status().is_success() {
            NetworkMetrics::increment_rpc_errors(route);
            return Err(rpc_err(format!(
                "{} to node {} returned {}",
                route,
                self.target,
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        NetworkMetrics::add_bytes_received(bytes.len() as u64);
        self.format.decode(&bytes).map_err(rpc_err)
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = Network;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        Network {
            target,
            target_addr: node.addr.clone(),
            client: self.client.clone(),
            format: self.format,
            auth_token: self.auth_token.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for Network {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        AppendEntriesResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId>>,
    > {
        let start = Instant::now();
        RaftMetrics::increment_append_entries_sent();
        let resp = self.send("append", &rpc).await;
        RaftMetrics::record_append_entries_latency(start.elapsed());
        resp
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let start = Instant::now();
        let resp = self.send("snapshot", &rpc).await;
        RaftMetrics::record_snapshot_duration(start.elapsed());
        resp
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let start = Instant::now();
        let resp = self.send("vote", &rpc).await;
        RaftMetrics::record_vote_latency(start.elapsed());
        resp
    }
}

// ============================================================================
// Consensus seams
// ============================================================================

/// Submits assignment commands to the replicated log
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Resolves once the command is committed and applied locally. Fails with
    /// [`ClusterError::NotLeader`] on followers.
    async fn propose(&self, command: AssignmentCommand) -> Result<AssignmentResponse>;
}

/// Raft voter management used by the reconciler
#[async_trait]
pub trait VoterControl: Send + Sync {
    async fn add_voter(&self, name: &str, raft_addr: &str) -> Result<()>;

    async fn remove_voter(&self, name: &str) -> Result<()>;

    async fn remove_voter_id(&self, id: NodeId) -> Result<()>;

    /// Current voter ids
    fn voters(&self) -> BTreeMap<NodeId, String>;
}

// ============================================================================
// RaftNode
// ============================================================================

fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>) -> ClusterError {
    if let Some(forward) = e.forward_to_leader::<BasicNode>() {
        RaftMetrics::increment_not_leader();
        return ClusterError::NotLeader {
            leader: forward.leader_id,
        };
    }
    RaftMetrics::increment_proposal_failures();
    ClusterError::Raft(e.to_string())
}

/// Handle on the local raft member
pub struct RaftNode {
    raft: openraft::Raft<TypeConfig>,
    store: Arc<AssignmentStore>,
    node_id: NodeId,
    name: String,
    addr: String,
    apply_timeout: Duration,
}

impl RaftNode {
    /// Open storage under `config.data_dir` and start the raft instance.
    ///
    /// `addr` is the raft base URL peers use to reach this node. The group
    /// is not initialized; see [`RaftNode::bootstrap`].
    pub async fn start(
        config: &ClusterConfig,
        addr: impl Into<String>,
        store: Arc<AssignmentStore>,
    ) -> Result<Self> {
        let addr = addr.into();
        let node_id = hash_node_id(&config.node_id);

        let log_store = RedbLogStore::new(config.data_dir.join("raft.redb"))?;
        let state_machine = StateMachine::new(store.clone(), config.data_dir.join("snapshots"))?;
        match state_machine.load_latest_snapshot().await {
            Ok(true) => {}
            Ok(false) => debug!("Starting with empty assignment state"),
            Err(e) => return Err(ClusterError::RaftStorage(e.to_string())),
        }

        let raft_config = openraft::Config {
            cluster_name: "combainer".to_string(),
            heartbeat_interval: config.raft.heartbeat_interval.as_millis() as u64,
            election_timeout_min: config.raft.election_timeout_min.as_millis() as u64,
            election_timeout_max: config.raft.election_timeout_max.as_millis() as u64,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(
                config.raft.snapshot_threshold,
            ),
            max_in_snapshot_log_to_keep: 1000,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ClusterError::InvalidConfig(format!("raft: {}", e)))?;

        let network = NetworkFactory::new(config.cluster_auth_token.clone())?;
        let raft = openraft::Raft::new(
            node_id,
            Arc::new(raft_config),
            network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::RaftStorage(format!("start raft: {}", e)))?;

        info!(node_id, name = %config.node_id, addr = %addr, "Raft started");

        Ok(Self {
            raft,
            store,
            node_id,
            name: config.node_id.clone(),
            addr,
            apply_timeout: config.raft_apply_timeout,
        })
    }

    /// Initialize the group with the given `(name, raft addr)` members.
    ///
    /// A group that already has state is left untouched.
    pub async fn bootstrap(&self, members: &[(String, String)]) -> Result<()> {
        if self.is_initialized().await? {
            debug!("Raft group already initialized, skipping bootstrap");
            return Ok(());
        }

        let members: BTreeMap<NodeId, BasicNode> = members
            .iter()
            .map(|(name, addr)| (hash_node_id(name), BasicNode::new(addr.clone())))
            .collect();
        let count = members.len();

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(members = count, "Bootstrapped raft group");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                debug!(error = %e, "Raft group initialized concurrently");
                Ok(())
            }
            Err(e) => Err(ClusterError::Raft(format!("bootstrap: {}", e))),
        }
    }

    /// Bootstrap a single-member group made of this node
    pub async fn bootstrap_self(&self) -> Result<()> {
        self.bootstrap(&[(self.name.clone(), self.addr.clone())]).await
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        self.raft
            .is_initialized()
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))
    }

    /// Bound a consensus call by `raft_apply_timeout`
    async fn bounded<F: std::future::Future>(&self, fut: F) -> Result<F::Output> {
        tokio::time::timeout(self.apply_timeout, fut)
            .await
            .map_err(|_| {
                RaftMetrics::increment_proposal_failures();
                ClusterError::ProposalTimeout
            })
    }

    async fn write(&self, command: AssignmentCommand) -> Result<AssignmentResponse> {
        let start = Instant::now();
        let resp = self
            .bounded(self.raft.client_write(RaftRequest { command }))
            .await?
            .map_err(write_error)?;

        RaftMetrics::increment_proposals();
        RaftMetrics::record_proposal_latency(start.elapsed());
        Ok(resp.data.response)
    }

    /// Wait until every entry committed before this call is applied locally.
    /// Only succeeds on the leader.
    pub async fn barrier(&self) -> Result<()> {
        self.write(AssignmentCommand::Noop).await.map(|_| ())
    }

    /// Wait until some leader is known
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|_| ClusterError::Timeout)?;
        metrics.current_leader.ok_or(ClusterError::Timeout)
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.node_id)
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn store(&self) -> &Arc<AssignmentStore> {
        &self.store
    }

    /// Watch channel for leadership and membership changes
    pub fn metrics_watch(&self) -> watch::Receiver<openraft::RaftMetrics<NodeId, BasicNode>> {
        self.raft.metrics()
    }

    pub fn metrics(&self) -> openraft::RaftMetrics<NodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Force a snapshot
    pub async fn snapshot(&self) -> Result<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ClusterError::Raft(format!("trigger snapshot: {}", e)))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("shutdown: {}", e)))
    }

    // =========================================================================
    // RPC handlers, called by the HTTP transport
    // =========================================================================

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> Result<AppendEntriesResponse<NodeId>> {
        self.raft
            .append_entries(req)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> Result<InstallSnapshotResponse<NodeId>> {
        self.raft
            .install_snapshot(req)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))
    }

    pub async fn handle_vote(&self, req: VoteRequest<NodeId>) -> Result<VoteResponse<NodeId>> {
        self.raft
            .vote(req)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))
    }
}

#[async_trait]
impl Proposer for RaftNode {
    async fn propose(&self, command: AssignmentCommand) -> Result<AssignmentResponse> {
        self.write(command).await
    }
}

#[async_trait]
impl VoterControl for RaftNode {
    async fn add_voter(&self, name: &str, raft_addr: &str) -> Result<()> {
        let id = hash_node_id(name);
        if self.voters().contains_key(&id) {
            return Ok(());
        }

        // blocks until the learner caught up, which an unreachable peer never does
        self.bounded(self.raft.add_learner(id, BasicNode::new(raft_addr), true))
            .await?
            .map_err(write_error)?;
        self.bounded(
            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false),
        )
        .await?
        .map_err(write_error)?;

        let voters = self.voters().len();
        RaftMetrics::set_voter_count(voters);
        info!(name = %name, id, addr = %raft_addr, voters, "Added raft voter");
        Ok(())
    }

    async fn remove_voter(&self, name: &str) -> Result<()> {
        self.remove_voter_id(hash_node_id(name)).await
    }

    async fn remove_voter_id(&self, id: NodeId) -> Result<()> {
        if !self.voters().contains_key(&id) {
            return Ok(());
        }

        self.bounded(
            self.raft
                .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false),
        )
        .await?
        .map_err(write_error)?;

        let voters = self.voters().len();
        RaftMetrics::set_voter_count(voters);
        info!(id, voters, "Removed raft voter");
        Ok(())
    }

    fn voters(&self) -> BTreeMap<NodeId, String> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        membership
            .voter_ids()
            .map(|id| {
                let addr = membership
                    .get_node(&id)
                    .map(|n| n.addr.clone())
                    .unwrap_or_default();
                (id, addr)
            })
            .collect()
    }
}

/// Map a node name to a raft node id (FNV-1a, stable across platforms)
pub fn hash_node_id(name: &str) -> NodeId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
