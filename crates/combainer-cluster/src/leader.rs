//! Leader-only duties
//!
//! [`LeaderElection`] follows raft leadership as a two-state machine.
//! Entering [`LeaderState::Leader`] spawns [`LeaderDuties`] under a child
//! cancellation token; leaving it cancels that token and waits for the
//! duties to return, so no pass outlives the leadership it started under.

use crate::membership::Membership;
use crate::observability::{ClusterMetrics, RaftMetrics};
use crate::raft::RaftNode;
use crate::rebalancer::Rebalancer;
use crate::reconciler::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaderState {
    #[default]
    Follower,
    Leader,
}

/// What to do after observing leadership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Acquired,
    Lost,
    Unchanged,
}

impl LeaderState {
    pub fn observe(self, is_leader: bool) -> (LeaderState, Transition) {
        match (self, is_leader) {
            (LeaderState::Follower, true) => (LeaderState::Leader, Transition::Acquired),
            (LeaderState::Leader, false) => (LeaderState::Follower, Transition::Lost),
            (state, _) => (state, Transition::Unchanged),
        }
    }
}

/// Rebalance and reconcile loop run while this node leads
pub struct LeaderDuties {
    raft: Arc<RaftNode>,
    membership: Arc<Membership>,
    rebalancer: Arc<Rebalancer>,
    reconciler: Arc<Reconciler>,
    update_interval: Duration,
    reconcile_interval: Duration,
}

impl LeaderDuties {
    pub fn new(
        raft: Arc<RaftNode>,
        membership: Arc<Membership>,
        rebalancer: Arc<Rebalancer>,
        reconciler: Arc<Reconciler>,
        update_interval: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            raft,
            membership,
            rebalancer,
            reconciler,
            update_interval,
            reconcile_interval,
        }
    }

    /// Barrier, full reconcile, then serve tickers and membership events
    /// until `cancel` fires. Events are only followed after a successful
    /// full reconcile.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut update = interval(self.update_interval);
        update.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = interval_at(
            Instant::now() + self.reconcile_interval,
            self.reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'reconcile: loop {
            let mut events = self.membership.subscribe();
            let follow_events = match self.raft.barrier().await {
                Err(e) => {
                    error!(error = %e, "Failed to wait for barrier");
                    false
                }
                Ok(()) => match self.reconciler.reconcile_all(&self.membership.members()).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(error = %e, "Failed to reconcile");
                        false
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'reconcile,
                    _ = reconcile.tick() => continue 'reconcile,
                    _ = update.tick() => {
                        let hosts = self.membership.alive_hosts();
                        if let Err(e) = self.rebalancer.run_pass(&hosts).await {
                            error!(error = %e, "Failed to distribute configs");
                        }
                    }
                    event = events.recv(), if follow_events => match event {
                        Ok(event) => {
                            if self.raft.is_leader() {
                                let _ = self.reconciler.reconcile_member(&event).await;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Membership events lagged, running full reconcile");
                            continue 'reconcile;
                        }
                        Err(RecvError::Closed) => break 'reconcile,
                    },
                }
            }
        }
        debug!("Leader duties stopped");
    }
}

/// Watches raft leadership and runs [`LeaderDuties`] while leading
pub struct LeaderElection {
    raft: Arc<RaftNode>,
    duties: Arc<LeaderDuties>,
}

impl LeaderElection {
    pub fn new(raft: Arc<RaftNode>, duties: Arc<LeaderDuties>) -> Self {
        Self { raft, duties }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut metrics = self.raft.metrics_watch();
        let mut state = LeaderState::Follower;
        let mut running: Option<(CancellationToken, JoinHandle<()>)> = None;

        loop {
            let is_leader = {
                let m = metrics.borrow_and_update();
                m.current_leader == Some(m.id)
            };

            let (next, transition) = state.observe(is_leader);
            state = next;
            match transition {
                Transition::Acquired => {
                    let token = cancel.child_token();
                    let duties = self.duties.clone();
                    let child = token.clone();
                    running = Some((token, tokio::spawn(async move { duties.run(child).await })));

                    RaftMetrics::set_is_leader(true);
                    ClusterMetrics::increment_leadership_transitions();
                    info!(node_id = self.raft.node_id(), "Cluster leadership acquired");
                }
                Transition::Lost => {
                    if let Some((token, handle)) = running.take() {
                        stop_duties(token, handle).await;
                    }
                    RaftMetrics::set_is_leader(false);
                    ClusterMetrics::increment_leadership_transitions();
                    info!(node_id = self.raft.node_id(), "Cluster leadership lost");
                }
                Transition::Unchanged => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = metrics.changed() => {
                    if changed.is_err() {
                        debug!("Raft metrics channel closed");
                        break;
                    }
                }
            }
        }

        if let Some((token, handle)) = running {
            stop_duties(token, handle).await;
        }
    }
}

async fn stop_duties(token: CancellationToken, handle: JoinHandle<()>) {
    token.cancel();
    if let Err(e) = handle.await {
        error!(error = %e, "Leader duties task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let s = LeaderState::default();
        assert_eq!(s.observe(false), (LeaderState::Follower, Transition::Unchanged));

        let (s, t) = s.observe(true);
        assert_eq!((s, t), (LeaderState::Leader, Transition::Acquired));
        assert_eq!(s.observe(true), (LeaderState::Leader, Transition::Unchanged));

        let (s, t) = s.observe(false);
        assert_eq!((s, t), (LeaderState::Follower, Transition::Lost));
    }

    use crate::assignment::AssignmentStore;
    use crate::config::ClusterConfig;
    use crate::error::Result;
    use crate::repository::tests::repo_dir;
    use crate::repository::{CombainerConfig, EncodedConfig, FilesystemRepository, Repository};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts listings, one per rebalance pass
    struct CountingRepo {
        inner: FilesystemRepository,
        listed: AtomicUsize,
    }

    impl Repository for CountingRepo {
        fn list_parsing_configs(&self) -> Result<Vec<String>> {
            self.listed.fetch_add(1, Ordering::SeqCst);
            self.inner.list_parsing_configs()
        }

        fn get_parsing_config(&self, name: &str) -> Result<EncodedConfig> {
            self.inner.get_parsing_config(name)
        }

        fn get_aggregation_config(&self, name: &str) -> Result<EncodedConfig> {
            self.inner.get_aggregation_config(name)
        }

        fn get_combainer_config(&self) -> Result<CombainerConfig> {
            self.inner.get_combainer_config()
        }

        fn parsing_config_exists(&self, name: &str) -> bool {
            self.inner.parsing_config_exists(name)
        }
    }

    struct Harness {
        _repo_dir: TempDir,
        _data_dir: TempDir,
        repo: Arc<CountingRepo>,
        raft: Arc<RaftNode>,
        duties: Arc<LeaderDuties>,
    }

    impl Harness {
        async fn leader() -> Self {
            let repo_dir = repo_dir();
            std::fs::write(repo_dir.path().join("parsing/cpu.yaml"), "groups: [photo]").unwrap();
            let repo = Arc::new(CountingRepo {
                inner: FilesystemRepository::new(repo_dir.path()).unwrap(),
                listed: AtomicUsize::new(0),
            });

            let data_dir = TempDir::new().unwrap();
            let config = ClusterConfig::builder()
                .node_id("solo")
                .data_dir(data_dir.path())
                .bind_addr("127.0.0.1:0".parse().unwrap())
                .build();
            let membership = Arc::new(Membership::new(&config).await.unwrap());
            let store = Arc::new(AssignmentStore::new());
            let raft = Arc::new(
                RaftNode::start(&config, "http://127.0.0.1:1", store.clone())
                    .await
                    .unwrap(),
            );
            raft.bootstrap_self().await.unwrap();
            raft.wait_for_leader(Duration::from_secs(5)).await.unwrap();

            let rebalancer = Arc::new(Rebalancer::new(repo.clone(), store.clone(), raft.clone()));
            let reconciler = Arc::new(Reconciler::new("solo", raft.clone(), raft.clone(), store));
            let duties = Arc::new(LeaderDuties::new(
                raft.clone(),
                membership,
                rebalancer,
                reconciler,
                Duration::from_millis(100),
                Duration::from_secs(3600),
            ));

            Self {
                _repo_dir: repo_dir,
                _data_dir: data_dir,
                repo,
                raft,
                duties,
            }
        }

        fn passes(&self) -> usize {
            self.repo.listed.load(Ordering::SeqCst)
        }

        async fn wait_for_passes(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(10), async {
                while self.passes() < n {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duties_stop_rebalancing_when_cancelled() {
        let h = Harness::leader().await;
        let token = CancellationToken::new();
        let duties = h.duties.clone();
        let child = token.clone();
        let task = tokio::spawn(async move { duties.run(child).await });

        h.wait_for_passes(3).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let passes = h.passes();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.passes(), passes);
        h.raft.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_election_waits_for_duties_on_exit() {
        let h = Harness::leader().await;
        let election = Arc::new(LeaderElection::new(h.raft.clone(), h.duties.clone()));
        let token = CancellationToken::new();
        let child = token.clone();
        let runner = election.clone();
        let task = tokio::spawn(async move { runner.run(child).await });

        h.wait_for_passes(2).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        // duties already returned, nothing proposes after the election loop
        let passes = h.passes();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.passes(), passes);
        h.raft.shutdown().await.unwrap();
    }
}
