//! Replicated config assignment state
//!
//! The raft state machine materializes into a map `host -> set of configs`.
//! It is only mutated by [`AssignmentCommand`]s applied in committed log order,
//! so every replica converges on the same map.
//!
//! Applying a command that targets the local host also drives the local session
//! loops: an assignment starts a loop unless one is already running for that
//! config, and a removal cancels it.

use crate::error::{ClusterError, Result};
use crate::observability::ClusterMetrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// `host -> configs` as replicated by raft
pub type AssignmentMap = BTreeMap<String, BTreeSet<String>>;

/// Raft log entry types for assignment operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssignmentCommand {
    /// Make `host` responsible for `config`
    AssignConfig { host: String, config: String },

    /// Release `config` from `host`
    RemoveConfig { host: String, config: String },

    /// No-op (leadership barrier)
    Noop,
}

impl AssignmentCommand {
    pub fn assign(host: impl Into<String>, config: impl Into<String>) -> Self {
        AssignmentCommand::AssignConfig {
            host: host.into(),
            config: config.into(),
        }
    }

    pub fn remove(host: impl Into<String>, config: impl Into<String>) -> Self {
        AssignmentCommand::RemoveConfig {
            host: host.into(),
            config: config.into(),
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AssignmentCommand::AssignConfig { .. } => "assign",
            AssignmentCommand::RemoveConfig { .. } => "remove",
            AssignmentCommand::Noop => "noop",
        }
    }
}

/// Result of applying an assignment command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssignmentResponse {
    Success,
    /// `newly` is false when the pair was already present
    Assigned { newly: bool },
    /// `existed` is false when the pair was already absent
    Removed { existed: bool },
}

/// Starts the session loop for a config assigned to this node.
///
/// The loop must exit once `cancel` fires.
pub trait SessionSpawner: Send + Sync {
    fn spawn_session(&self, config: String, cancel: CancellationToken);
}

/// Per-config stop signals for session loops running on this node
pub struct LocalTasks {
    host: String,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    spawner: Arc<dyn SessionSpawner>,
    parent: CancellationToken,
}

impl LocalTasks {
    /// `parent` cancels every loop at once on shutdown
    pub fn new(
        host: impl Into<String>,
        spawner: Arc<dyn SessionSpawner>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            host: host.into(),
            tokens: Mutex::new(HashMap::new()),
            spawner,
            parent,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Start a loop for `config` unless a live one exists. Returns whether a
    /// loop was spawned.
    fn start(&self, config: &str) -> bool {
        let token = {
            let mut tokens = self.tokens.lock();
            if tokens.get(config).is_some_and(|t| !t.is_cancelled()) {
                debug!(config = %config, "Session already running");
                return false;
            }
            let token = self.parent.child_token();
            tokens.insert(config.to_string(), token.clone());
            ClusterMetrics::set_local_sessions(tokens.len());
            token
        };

        info!(config = %config, "Starting session");
        self.spawner.spawn_session(config.to_string(), token);
        true
    }

    /// Cancel the loop for `config`, if any
    fn stop(&self, config: &str) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.remove(config) {
            Some(token) => {
                token.cancel();
                ClusterMetrics::set_local_sessions(tokens.len());
                info!(config = %config, "Stopped session");
                true
            }
            None => false,
        }
    }

    /// Make the running loops match `configs` exactly
    fn sync(&self, configs: &BTreeSet<String>) {
        let stale: Vec<String> = self
            .tokens
            .lock()
            .keys()
            .filter(|c| !configs.contains(*c))
            .cloned()
            .collect();
        for config in stale {
            self.stop(&config);
        }
        for config in configs {
            self.start(config);
        }
    }

    fn stop_all(&self) {
        let mut tokens = self.tokens.lock();
        for (_, token) in tokens.drain() {
            token.cancel();
        }
        ClusterMetrics::set_local_sessions(0);
    }

    fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .tokens
            .lock()
            .iter()
            .filter(|(_, t)| !t.is_cancelled())
            .map(|(c, _)| c.clone())
            .collect();
        running.sort();
        running
    }

    fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}

/// Materialized assignment state shared by the raft state machine, the
/// rebalancer and the reconciler
#[derive(Default)]
pub struct AssignmentStore {
    state: RwLock<AssignmentMap>,
    local: OnceLock<LocalTasks>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the local session hook. Can only be done once.
    pub fn attach_local_tasks(&self, tasks: LocalTasks) -> Result<()> {
        self.local
            .set(tasks)
            .map_err(|_| ClusterError::InvalidConfig("local tasks already attached".into()))?;

        // pick up assignments restored before the hook existed
        if let Some(local) = self.local.get() {
            let configs = self.state.read().get(local.host()).cloned().unwrap_or_default();
            local.sync(&configs);
        }
        Ok(())
    }

    /// Apply a committed command. Deterministic and idempotent per pair.
    pub fn apply(&self, cmd: AssignmentCommand) -> AssignmentResponse {
        match cmd {
            AssignmentCommand::AssignConfig { host, config } => {
                let newly = {
                    let mut state = self.state.write();
                    state
                        .entry(host.clone())
                        .or_default()
                        .insert(config.clone())
                };
                debug!(host = %host, config = %config, newly, "Applied AssignConfig");

                if let Some(local) = self.local_for(&host) {
                    local.start(&config);
                }
                AssignmentResponse::Assigned { newly }
            }
            AssignmentCommand::RemoveConfig { host, config } => {
                let existed = {
                    let mut state = self.state.write();
                    match state.get_mut(&host) {
                        Some(configs) => {
                            let existed = configs.remove(&config);
                            if configs.is_empty() {
                                state.remove(&host);
                            }
                            existed
                        }
                        None => false,
                    }
                };
                debug!(host = %host, config = %config, existed, "Applied RemoveConfig");

                if let Some(local) = self.local_for(&host) {
                    local.stop(&config);
                }
                AssignmentResponse::Removed { existed }
            }
            AssignmentCommand::Noop => AssignmentResponse::Success,
        }
    }

    fn local_for(&self, host: &str) -> Option<&LocalTasks> {
        self.local.get().filter(|l| l.host() == host)
    }

    /// Configs assigned to `host`, sorted
    pub fn list(&self, host: &str) -> Vec<String> {
        self.state
            .read()
            .get(host)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Hosts holding at least one config
    pub fn hosts(&self) -> Vec<String> {
        self.state.read().keys().cloned().collect()
    }

    /// Hosts currently holding `config`
    pub fn owners(&self, config: &str) -> Vec<String> {
        self.state
            .read()
            .iter()
            .filter(|(_, configs)| configs.contains(config))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// `(host, number of configs)` per host
    pub fn distribution(&self) -> Vec<(String, usize)> {
        self.state
            .read()
            .iter()
            .map(|(host, configs)| (host.clone(), configs.len()))
            .collect()
    }

    /// Total assignments across all hosts
    pub fn total_assigned(&self) -> usize {
        self.state.read().values().map(BTreeSet::len).sum()
    }

    /// Copy of the whole map (snapshot source)
    pub fn dump(&self) -> AssignmentMap {
        self.state.read().clone()
    }

    /// Replace the whole map (snapshot restore) and resync local sessions
    pub fn replace(&self, map: AssignmentMap) {
        let local_configs = self
            .local
            .get()
            .map(|l| map.get(l.host()).cloned().unwrap_or_default());
        *self.state.write() = map;

        if let (Some(local), Some(configs)) = (self.local.get(), local_configs) {
            local.sync(&configs);
        }
        info!(hosts = self.state.read().len(), "Assignment state replaced");
    }

    /// Configs with a live local session loop, sorted
    pub fn local_sessions(&self) -> Vec<String> {
        self.local.get().map(LocalTasks::running).unwrap_or_default()
    }

    /// Size of the local stop-signal map
    pub fn local_task_count(&self) -> usize {
        self.local.get().map(LocalTasks::len).unwrap_or(0)
    }

    /// Cancel every local session loop
    pub fn stop_local_tasks(&self) {
        if let Some(local) = self.local.get() {
            local.stop_all();
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(&*self.state.read())?)
    }

    pub fn deserialize(data: &[u8]) -> Result<AssignmentMap> {
        Ok(postcard::from_bytes(data)?)
    }
}
