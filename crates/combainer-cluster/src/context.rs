//! Process-wide wiring
//!
//! [`ClusterContext`] is built once at startup and owns every component:
//! gossip membership, the assignment store and its raft node, the session
//! runner, the observer and the config repository. Components receive what
//! they need from here; nothing is global.

use crate::assignment::{AssignmentStore, LocalTasks};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::fetcher::FetcherRegistry;
use crate::leader::{LeaderDuties, LeaderElection};
use crate::membership::{Membership, MembershipEvent};
use crate::observability::ClusterMetrics;
use crate::raft::RaftNode;
use crate::rebalancer::Rebalancer;
use crate::reconciler::Reconciler;
use crate::repository::Repository;
use crate::session::{HttpWorkerRpc, SessionRunner, WorkerHosts, WorkerRpc};
use crate::stats::Observer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Fetch cache lifetime when `combaine.yaml` sets none
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct ClusterContext {
    config: ClusterConfig,
    membership: Arc<Membership>,
    store: Arc<AssignmentStore>,
    raft: Arc<RaftNode>,
    observer: Arc<Observer>,
    repo: Arc<dyn Repository>,
    sessions: SessionRunner,
    election: Arc<LeaderElection>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ClusterContext {
    /// Build every component. Nothing runs until [`start`](Self::start).
    pub async fn new(config: ClusterConfig, repo: Arc<dyn Repository>) -> Result<Arc<Self>> {
        Self::with_worker_rpc(config, repo, None).await
    }

    /// Like [`new`](Self::new) with a custom worker transport
    pub async fn with_worker_rpc(
        config: ClusterConfig,
        repo: Arc<dyn Repository>,
        rpc: Option<Arc<dyn WorkerRpc>>,
    ) -> Result<Arc<Self>> {
        let defaults = repo.get_combainer_config()?;
        defaults.verify()?;
        let cache_ttl = defaults
            .main()
            .cache
            .get_u64("ttl")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CACHE_TTL);
        let fetchers = Arc::new(FetcherRegistry::with_defaults(cache_ttl)?);

        let membership = Arc::new(Membership::new(&config).await?);
        let observer = Arc::new(Observer::new());
        let store = Arc::new(AssignmentStore::new());
        let cancel = CancellationToken::new();

        let rpc = match rpc {
            Some(rpc) => rpc,
            None => Arc::new(HttpWorkerRpc::new(config.worker_port)?),
        };
        let sessions = SessionRunner::new(
            repo.clone(),
            fetchers,
            rpc,
            observer.clone(),
            membership.clone() as Arc<dyn WorkerHosts>,
            config.effective_update_interval(),
        );
        store.attach_local_tasks(LocalTasks::new(
            config.node_id.clone(),
            Arc::new(sessions.clone()),
            cancel.child_token(),
        ))?;

        let raft = Arc::new(
            RaftNode::start(&config, membership.local_node().raft_addr.clone(), store.clone())
                .await?,
        );

        let rebalancer = Arc::new(Rebalancer::new(repo.clone(), store.clone(), raft.clone()));
        let reconciler = Arc::new(Reconciler::new(
            config.node_id.clone(),
            raft.clone(),
            raft.clone(),
            store.clone(),
        ));
        let duties = Arc::new(LeaderDuties::new(
            raft.clone(),
            membership.clone(),
            rebalancer,
            reconciler,
            config.effective_update_interval(),
            config.reconcile_interval,
        ));
        let election = Arc::new(LeaderElection::new(raft.clone(), duties));

        Ok(Arc::new(Self {
            config,
            membership,
            store,
            raft,
            observer,
            repo,
            sessions,
            election,
            cancel,
            tasks: TaskTracker::new(),
        }))
    }

    /// Start gossip, join the seeds, bootstrap raft when due and follow
    /// leadership
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let membership = self.membership.clone();
        let token = self.cancel.child_token();
        self.tasks.spawn(async move {
            if let Err(e) = membership.run(token).await {
                error!(error = %e, "Membership loop failed");
            }
        });

        if !self.config.seeds.is_empty() {
            match self.membership.join(&self.config.seeds).await {
                Ok(alive) => info!(alive, "Joined cluster"),
                Err(e) => warn!(error = %e, "Unable to join seeds, waiting to be joined"),
            }
        }

        if self.config.start_as_leader {
            self.raft.bootstrap_self().await?;
        } else {
            let ctx = self.clone();
            let token = self.cancel.child_token();
            self.tasks
                .spawn(async move { ctx.bootstrap_when_expected(token).await });
        }

        let election = self.election.clone();
        let token = self.cancel.child_token();
        self.tasks.spawn(async move { election.run(token).await });

        let ctx = self.clone();
        let token = self.cancel.child_token();
        self.tasks.spawn(async move { ctx.track_membership(token).await });

        info!(node_id = %self.config.node_id, "Cluster context started");
        Ok(())
    }

    /// Initialize the raft group with every alive member once
    /// `bootstrap_expect` of them are seen
    async fn bootstrap_when_expected(&self, cancel: CancellationToken) {
        let expect = self.config.bootstrap_expect.max(1);
        let mut events = self.membership.subscribe();
        loop {
            match self.raft.is_initialized().await {
                Ok(true) => {
                    debug!("Raft group already initialized");
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Unable to read raft state"),
            }

            let alive = self.membership.alive_members();
            if alive.len() >= expect {
                let members: Vec<(String, String)> =
                    alive.into_iter().map(|n| (n.id, n.raft_addr)).collect();
                info!(members = members.len(), expect, "Bootstrapping raft group");
                if let Err(e) = self.raft.bootstrap(&members).await {
                    error!(error = %e, "Raft bootstrap failed");
                }
                return;
            }
            debug!(alive = alive.len(), expect, "Waiting for members before bootstrap");

            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    if let Err(RecvError::Closed) = event {
                        return;
                    }
                }
            }
        }
    }

    /// Keep membership gauges current
    async fn track_membership(&self, cancel: CancellationToken) {
        let mut events = self.membership.subscribe();
        ClusterMetrics::set_alive_members(self.membership.alive_count());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    match event {
                        Ok(MembershipEvent::Join(_)) => ClusterMetrics::increment_node_joins(),
                        Ok(MembershipEvent::Leave(_)) => ClusterMetrics::increment_node_leaves(),
                        Ok(MembershipEvent::Fail(_)) => ClusterMetrics::increment_node_failures(),
                        Ok(MembershipEvent::Reap(_)) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    }
                    ClusterMetrics::set_alive_members(self.membership.alive_count());
                }
            }
        }
    }

    /// Leave gossip, stop sessions and background loops, stop raft
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down cluster context");
        if let Err(e) = self.membership.leave().await {
            warn!(error = %e, "Failed to announce leave");
        }
        self.store.stop_local_tasks();
        self.cancel.cancel();
        self.sessions.wait().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.raft.shutdown().await
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn store(&self) -> &Arc<AssignmentStore> {
        &self.store
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Session loops currently running on this node
    pub fn running_sessions(&self) -> usize {
        self.sessions.running()
    }
}
