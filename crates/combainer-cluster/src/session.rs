//! Session dispatch
//!
//! A [`SessionClient`] runs one parsing and aggregation iteration for a
//! config per [`SessionClient::dispatch`] call:
//!
//! ```text
//! start ──── parsing (0.8 × period) ────┬── aggregation ──┬── wait ──> start + period
//!            bounded by ParallelParsings │  all at once    │
//!                                        └ results merged ─┘
//! ```
//!
//! A failed host or aggregation is counted and skipped. Only a missing host
//! list, a broken aggregation config or an unusable parsing config abort
//! the iteration.
//!
//! [`SessionRunner`] owns the loops started for configs assigned to this
//! node.

use crate::assignment::SessionSpawner;
use crate::error::{ClusterError, Result};
use crate::fetcher::{FetcherRegistry, Hosts};
use crate::membership::Membership;
use crate::observability::{NetworkMetrics, SessionMetrics};
use crate::repository::{load_aggregation_configs, ParsingConfig, Repository};
use crate::stats::{ClientStats, Observer};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Share of the iteration reserved for parsing
const PARSING_SHARE: f64 = 0.8;

/// Measurement window, Unix seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub previous: i64,
    pub current: i64,
}

/// Parse one host for a config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingTask {
    pub id: String,
    pub frame: TimeFrame,
    pub host: String,
    pub parsing_config_name: String,
    pub encoded_parsing_config: Vec<u8>,
    pub encoded_aggregation_configs: Vec<u8>,
}

/// Reduce the parsing results of a session with one aggregation config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatingTask {
    pub id: String,
    pub frame: TimeFrame,
    pub config: String,
    pub parsing_config_name: String,
    pub encoded_parsing_config: Vec<u8>,
    pub encoded_aggregation_config: Vec<u8>,
    pub encoded_hosts: Vec<u8>,
    pub parsing_result: ParsingResult,
}

/// Parsed payloads keyed by worker-chosen keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingResult {
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatingResult {}

/// The two calls a worker fleet serves.
///
/// `workers` lists the hosts able to serve the call. Deadlines are enforced
/// by the caller dropping the future.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn do_parsing(&self, workers: &[String], task: &ParsingTask) -> Result<ParsingResult>;

    async fn do_aggregating(
        &self,
        workers: &[String],
        task: &AggregatingTask,
    ) -> Result<AggregatingResult>;
}

/// Worker RPC over HTTP with JSON bodies
pub struct HttpWorkerRpc {
    client: reqwest::Client,
    port: u16,
}

impl HttpWorkerRpc {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| ClusterError::Network(format!("build worker client: {}", e)))?;
        Ok(Self { client, port })
    }

    /// Try workers in random order until one accepts the connection. A
    /// worker that answers with an error status fails the call.
    async fn call<T, R>(&self, workers: &[String], path: &str, call: &'static str, body: &T) -> Result<R>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        if workers.is_empty() {
            return Err(ClusterError::Rpc {
                call,
                reason: "empty list of hosts".into(),
            });
        }
        let mut order: Vec<&String> = workers.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let payload = serde_json::to_vec(body)?;
        let mut last_error = String::new();
        for host in order {
            let url = format!("http://{}:{}{}", host, self.port, path);
            let resp = match self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.is_connect() => {
                    debug!(url = %url, error = %e, "Worker unreachable, trying next");
                    last_error = e.to_string();
                    continue;
                }
                Err(e) => {
                    NetworkMetrics::increment_rpc_errors(call);
                    return Err(ClusterError::Rpc {
                        call,
                        reason: e.to_string(),
                    });
                }
            };
            NetworkMetrics::add_bytes_sent(payload.len() as u64);

            if !resp.status().is_success() {
                NetworkMetrics::increment_rpc_errors(call);
                return Err(ClusterError::Rpc {
                    call,
                    reason: format!("{} answered with {}", url, resp.status()),
                });
            }
            let bytes = resp.bytes().await.map_err(|e| ClusterError::Rpc {
                call,
                reason: e.to_string(),
            })?;
            NetworkMetrics::add_bytes_received(bytes.len() as u64);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        NetworkMetrics::increment_rpc_errors(call);
        Err(ClusterError::Rpc {
            call,
            reason: format!("no worker reachable: {}", last_error),
        })
    }
}

#[async_trait]
impl WorkerRpc for HttpWorkerRpc {
    async fn do_parsing(&self, workers: &[String], task: &ParsingTask) -> Result<ParsingResult> {
        self.call(workers, "/worker/parsing", "parsing", task).await
    }

    async fn do_aggregating(
        &self,
        workers: &[String],
        task: &AggregatingTask,
    ) -> Result<AggregatingResult> {
        self.call(workers, "/worker/aggregating", "aggregating", task)
            .await
    }
}

/// Everything one iteration needs, rebuilt from the repository each time
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub parallel_parsings: usize,
    pub parsing_time: Duration,
    pub whole_time: Duration,
    pub parsing_tasks: Vec<ParsingTask>,
    pub aggregation_tasks: Vec<AggregatingTask>,
}

/// Parsing and whole-iteration durations for a period in seconds
pub fn session_time_frame(period_secs: u64) -> (Duration, Duration) {
    let whole = Duration::from_secs(period_secs);
    (whole.mul_f64(PARSING_SHARE), whole)
}

/// Dispatcher for a single config
pub struct SessionClient {
    id: String,
    repo: Arc<dyn Repository>,
    fetchers: Arc<FetcherRegistry>,
    rpc: Arc<dyn WorkerRpc>,
    stats: Arc<ClientStats>,
}

impl SessionClient {
    pub fn new(
        repo: Arc<dyn Repository>,
        fetchers: Arc<FetcherRegistry>,
        rpc: Arc<dyn WorkerRpc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repo,
            fetchers,
            rpc,
            stats: Arc::new(ClientStats::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    async fn resolve_hosts(&self, config: &str, parsing: &ParsingConfig) -> Result<Hosts> {
        let fetcher = self.fetchers.load(&parsing.host_fetcher)?;
        let mut all = Hosts::new();
        for group in &parsing.groups {
            match fetcher.fetch(group).await {
                Ok(hosts) => all.merge(hosts),
                Err(e) => warn!(config = %config, group = %group, error = %e, "Unable to get hosts"),
            }
        }
        Ok(all)
    }

    /// Load `config`, resolve its hosts and build the task sets
    pub async fn build_session_params(&self, config: &str) -> Result<SessionParams> {
        let mut parsing: ParsingConfig = self.repo.get_parsing_config(config)?.decode()?;
        let defaults = self.repo.get_combainer_config()?;
        parsing.update_by_combainer_config(&defaults);

        let aggregations = load_aggregation_configs(self.repo.as_ref(), &parsing)?;

        let hosts = self.resolve_hosts(config, &parsing).await?;
        let host_list = hosts.all_hosts();
        if host_list.is_empty() {
            warn!(config = %config, groups = ?parsing.groups, "No hosts in given groups");
            return Err(ClusterError::NoHosts(parsing.groups.clone()));
        }
        info!(config = %config, metahost = %parsing.metahost, hosts = host_list.len(), "Processing hosts");

        let parallel_parsings = match parsing.main.parallel_parsings {
            0 => host_list.len(),
            limit => limit.min(host_list.len()),
        };

        let encoded_parsing = serde_json::to_vec(&parsing)?;
        let encoded_aggregations = serde_json::to_vec(&aggregations)?;
        let encoded_hosts = serde_json::to_vec(&hosts)?;

        let parsing_tasks = host_list
            .into_iter()
            .map(|host| ParsingTask {
                host,
                parsing_config_name: config.to_string(),
                encoded_parsing_config: encoded_parsing.clone(),
                encoded_aggregation_configs: encoded_aggregations.clone(),
                ..Default::default()
            })
            .collect();

        let mut aggregation_tasks = Vec::with_capacity(parsing.agg_configs.len());
        for name in &parsing.agg_configs {
            aggregation_tasks.push(AggregatingTask {
                config: name.clone(),
                parsing_config_name: config.to_string(),
                encoded_parsing_config: encoded_parsing.clone(),
                encoded_aggregation_config: serde_json::to_vec(&aggregations.get(name))?,
                encoded_hosts: encoded_hosts.clone(),
                ..Default::default()
            });
        }

        let (parsing_time, whole_time) = session_time_frame(parsing.main.iteration_duration);
        Ok(SessionParams {
            parallel_parsings,
            parsing_time,
            whole_time,
            parsing_tasks,
            aggregation_tasks,
        })
    }

    /// Run one iteration against `workers`. An empty `session_id` gets a
    /// fresh one. With `should_wait` the call returns at the end of the
    /// iteration period.
    pub async fn dispatch(
        &self,
        workers: &[String],
        config: &str,
        session_id: &str,
        should_wait: bool,
    ) -> Result<()> {
        self.dispatch_until(workers, config, session_id, should_wait, &CancellationToken::new())
            .await
    }

    /// [`dispatch`](Self::dispatch) whose final wait ends early on `cancel`
    pub async fn dispatch_until(
        &self,
        workers: &[String],
        config: &str,
        session_id: &str,
        should_wait: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = if session_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            session_id.to_string()
        };

        let params = match self.build_session_params(config).await {
            Ok(params) => params,
            Err(e) => {
                error!(config = %config, session = %session, error = %e, "Unable to update session parameters");
                SessionMetrics::increment_aborted_iterations(config);
                return Err(e);
            }
        };

        let started = Instant::now();
        let whole_deadline = started + params.whole_time;
        let parsing_deadline = started + params.parsing_time;
        let now = chrono::Utc::now().timestamp();
        let frame = TimeFrame {
            previous: now,
            current: now + params.whole_time.as_secs() as i64,
        };

        if workers.is_empty() {
            error!(config = %config, session = %session, "Empty list of worker hosts");
            SessionMetrics::increment_aborted_iterations(config);
            return Err(ClusterError::NoHosts(vec![]));
        }
        let workers: Arc<[String]> = workers.into();

        info!(config = %config, session = %session, tasks = params.parsing_tasks.len(), "Starting parsing");
        let results = self
            .parsing_phase(&params, &workers, config, &session, frame, parsing_deadline)
            .await;
        info!(config = %config, session = %session, results = results.data.len(), "Parsing finished");

        self.aggregation_phase(params.aggregation_tasks, &workers, config, &session, frame, results, whole_deadline)
            .await;
        info!(config = %config, session = %session, "Aggregation finished");

        SessionMetrics::record_dispatch_duration(config, started.elapsed());

        if should_wait {
            tokio::select! {
                _ = sleep_until(whole_deadline) => {}
                _ = cancel.cancelled() => {}
            }
        }
        debug!(config = %config, session = %session, "Go to the next iteration");
        Ok(())
    }

    async fn parsing_phase(
        &self,
        params: &SessionParams,
        workers: &Arc<[String]>,
        config: &str,
        session: &str,
        frame: TimeFrame,
        deadline: Instant,
    ) -> ParsingResult {
        let tokens = Arc::new(Semaphore::new(params.parallel_parsings.max(1)));
        let merged = Arc::new(Mutex::new(ParsingResult::default()));
        let config: Arc<str> = config.into();
        let mut set = JoinSet::new();

        for task in &params.parsing_tasks {
            let Ok(permit) = tokens.clone().acquire_owned().await else {
                break;
            };
            let mut task = task.clone();
            task.id = session.to_string();
            task.frame = frame;

            let rpc = self.rpc.clone();
            let stats = self.stats.clone();
            let workers = workers.clone();
            let merged = merged.clone();
            let config = config.clone();
            set.spawn(async move {
                let _permit = permit;
                let outcome = match timeout_at(deadline, rpc.do_parsing(&workers, &task)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ClusterError::Timeout),
                };
                match outcome {
                    Ok(reply) => {
                        merged.lock().data.extend(reply.data);
                        stats.add_success_parsing();
                        SessionMetrics::increment_parsing(&config, true);
                    }
                    Err(e) => {
                        warn!(config = %config, session = %task.id, host = %task.host, error = %e, "Parsing failed");
                        stats.add_failed_parsing();
                        SessionMetrics::increment_parsing(&config, false);
                    }
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(config = %config, error = %e, "Parsing task panicked");
                self.stats.add_failed_parsing();
            }
        }

        let result = std::mem::take(&mut *merged.lock());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn aggregation_phase(
        &self,
        tasks: Vec<AggregatingTask>,
        workers: &Arc<[String]>,
        config: &str,
        session: &str,
        frame: TimeFrame,
        results: ParsingResult,
        deadline: Instant,
    ) {
        let config: Arc<str> = config.into();
        let mut set = JoinSet::new();
        for mut task in tasks {
            task.id = session.to_string();
            task.frame = frame;
            task.parsing_result = results.clone();

            let rpc = self.rpc.clone();
            let stats = self.stats.clone();
            let workers = workers.clone();
            let config = config.clone();
            set.spawn(async move {
                let outcome = match timeout_at(deadline, rpc.do_aggregating(&workers, &task)).await {
                    Ok(outcome) => outcome.map(|_| ()),
                    Err(_) => Err(ClusterError::Timeout),
                };
                match outcome {
                    Ok(()) => {
                        stats.add_success_aggregate();
                        SessionMetrics::increment_aggregating(&config, true);
                    }
                    Err(e) => {
                        warn!(config = %config, session = %task.id, aggregation = %task.config, error = %e, "Aggregation failed");
                        stats.add_failed_aggregate();
                        SessionMetrics::increment_aggregating(&config, false);
                    }
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(config = %config, error = %e, "Aggregation task panicked");
                self.stats.add_failed_aggregate();
            }
        }
    }
}

/// Keeps a client registered with the observer while alive
pub struct ObserverRegistration {
    observer: Arc<Observer>,
    client_id: String,
    config: String,
}

impl ObserverRegistration {
    pub fn new(observer: Arc<Observer>, client: &SessionClient, config: &str) -> Self {
        observer.register_client(client.id(), client.stats().clone(), config);
        Self {
            observer,
            client_id: client.id().to_string(),
            config: config.to_string(),
        }
    }
}

impl Drop for ObserverRegistration {
    fn drop(&mut self) {
        self.observer.unregister_client(&self.client_id, &self.config);
    }
}

/// Source of the worker hosts a session dispatches to
pub trait WorkerHosts: Send + Sync {
    fn worker_hosts(&self) -> Vec<String>;
}

impl WorkerHosts for Membership {
    fn worker_hosts(&self) -> Vec<String> {
        self.alive_hosts()
    }
}

/// Starts and tracks session loops for locally assigned configs
#[derive(Clone)]
pub struct SessionRunner {
    repo: Arc<dyn Repository>,
    fetchers: Arc<FetcherRegistry>,
    rpc: Arc<dyn WorkerRpc>,
    observer: Arc<Observer>,
    hosts: Arc<dyn WorkerHosts>,
    retry_interval: Duration,
    tracker: TaskTracker,
}

impl SessionRunner {
    pub fn new(
        repo: Arc<dyn Repository>,
        fetchers: Arc<FetcherRegistry>,
        rpc: Arc<dyn WorkerRpc>,
        observer: Arc<Observer>,
        hosts: Arc<dyn WorkerHosts>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            repo,
            fetchers,
            rpc,
            observer,
            hosts,
            retry_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// Number of session loops still running
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every loop to exit. Loops must have been cancelled.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Dispatch `config` until `cancel` fires. Iterations run back to back;
    /// a failed one is followed by a `retry_interval` pause.
    pub async fn run_session_loop(&self, config: String, cancel: CancellationToken) {
        let client = SessionClient::new(self.repo.clone(), self.fetchers.clone(), self.rpc.clone());
        info!(config = %config, client = %client.id(), "Session loop started");

        let mut iteration: u64 = 0;
        while !cancel.is_cancelled() {
            iteration += 1;
            let workers = self.hosts.worker_hosts();

            let outcome = {
                let _registration = ObserverRegistration::new(self.observer.clone(), &client, &config);
                client
                    .dispatch_until(&workers, &config, "", true, &cancel)
                    .await
            };

            if let Err(e) = outcome {
                error!(config = %config, iteration, error = %e, "Dispatch error");
                tokio::select! {
                    _ = sleep(self.retry_interval) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
        info!(config = %config, iterations = iteration, "Session loop stopped");
    }
}

impl SessionSpawner for SessionRunner {
    fn spawn_session(&self, config: String, cancel: CancellationToken) {
        let runner = self.clone();
        self.tracker
            .spawn(async move { runner.run_session_loop(config, cancel).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::repo_dir;
    use crate::repository::FilesystemRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Replies with one key per host and counts calls
    #[derive(Default)]
    struct EchoRpc {
        parsing: AtomicUsize,
        aggregating: AtomicUsize,
        last_aggregation_keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkerRpc for EchoRpc {
        async fn do_parsing(&self, _workers: &[String], task: &ParsingTask) -> Result<ParsingResult> {
            self.parsing.fetch_add(1, Ordering::SeqCst);
            let mut data = BTreeMap::new();
            data.insert(task.host.clone(), task.host.as_bytes().to_vec());
            Ok(ParsingResult { data })
        }

        async fn do_aggregating(
            &self,
            _workers: &[String],
            task: &AggregatingTask,
        ) -> Result<AggregatingResult> {
            self.aggregating.fetch_add(1, Ordering::SeqCst);
            *self.last_aggregation_keys.lock() = task.parsing_result.data.keys().cloned().collect();
            Ok(AggregatingResult {})
        }
    }

    struct StaticHosts(Vec<String>);

    impl WorkerHosts for StaticHosts {
        fn worker_hosts(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn fixture(parsing_yaml: &str) -> (TempDir, Arc<dyn Repository>) {
        let dir = repo_dir();
        std::fs::write(dir.path().join("parsing/cpu.yaml"), parsing_yaml).unwrap();
        std::fs::write(
            dir.path().join("aggregate/avg.yaml"),
            "data:\n  avg: {type: average}\nsenders:\n  g: {type: graphite}",
        )
        .unwrap();
        let repo = Arc::new(FilesystemRepository::new(dir.path()).unwrap());
        (dir, repo)
    }

    fn client(repo: Arc<dyn Repository>, rpc: Arc<dyn WorkerRpc>) -> SessionClient {
        let fetchers = Arc::new(FetcherRegistry::with_defaults(Duration::from_secs(60)).unwrap());
        SessionClient::new(repo, fetchers, rpc)
    }

    #[test]
    fn test_session_time_frame() {
        let (parsing, whole) = session_time_frame(60);
        assert_eq!(parsing, Duration::from_secs(48));
        assert_eq!(whole, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_build_session_params() {
        let (_dir, repo) = fixture(
            "groups: [photo]\nagg_configs: [avg]\nCombainer: {ParallelParsings: 1}",
        );
        let cl = client(repo, Arc::new(EchoRpc::default()));

        let params = cl.build_session_params("cpu").await.unwrap();
        assert_eq!(params.parallel_parsings, 1);
        assert_eq!(params.whole_time, Duration::from_secs(20));
        assert_eq!(params.parsing_time, Duration::from_secs(16));
        let hosts: Vec<&str> = params.parsing_tasks.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, vec!["h1", "h2"]);
        assert_eq!(params.aggregation_tasks.len(), 1);
        assert_eq!(params.aggregation_tasks[0].config, "avg");
    }

    #[tokio::test]
    async fn test_parallelism_clamped_to_host_count() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg]");
        let cl = client(repo, Arc::new(EchoRpc::default()));

        // combaine.yaml allows 10, the group has 2 hosts
        let params = cl.build_session_params("cpu").await.unwrap();
        assert_eq!(params.parallel_parsings, 2);
    }

    #[tokio::test]
    async fn test_unknown_group_is_no_hosts() {
        let (_dir, repo) = fixture("groups: [video]\nagg_configs: [avg]");
        let cl = client(repo, Arc::new(EchoRpc::default()));

        let err = cl.build_session_params("cpu").await.unwrap_err();
        assert!(matches!(err, ClusterError::NoHosts(ref groups) if groups == &["video"]));
    }

    #[tokio::test]
    async fn test_missing_aggregation_aborts_before_rpc() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg, absent]");
        let rpc = Arc::new(EchoRpc::default());
        let cl = client(repo, rpc.clone());

        let err = cl
            .dispatch(&["w1".to_string()], "cpu", "s1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AggregationConfig { .. }));
        assert_eq!(rpc.parsing.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_workers_is_no_hosts() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg]");
        let rpc = Arc::new(EchoRpc::default());
        let cl = client(repo, rpc.clone());

        assert!(matches!(
            cl.dispatch(&[], "cpu", "", false).await,
            Err(ClusterError::NoHosts(_))
        ));
        assert_eq!(rpc.parsing.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_feeds_parsing_results_to_aggregation() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg]");
        let rpc = Arc::new(EchoRpc::default());
        let cl = client(repo, rpc.clone());

        cl.dispatch(&["w1".to_string()], "cpu", "s1", false)
            .await
            .unwrap();

        assert_eq!(rpc.parsing.load(Ordering::SeqCst), 2);
        assert_eq!(rpc.aggregating.load(Ordering::SeqCst), 1);
        assert_eq!(*rpc.last_aggregation_keys.lock(), vec!["h1", "h2"]);

        let stats = cl.stats().snapshot();
        assert_eq!(stats.parsing_success, 2);
        assert_eq!(stats.aggregate_success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loop_stops_on_cancel() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg]");
        let rpc = Arc::new(EchoRpc::default());
        let observer = Arc::new(Observer::new());
        let runner = SessionRunner::new(
            repo,
            Arc::new(FetcherRegistry::with_defaults(Duration::from_secs(60)).unwrap()),
            rpc.clone(),
            observer.clone(),
            Arc::new(StaticHosts(vec!["w1".into()])),
            Duration::from_secs(5),
        );

        let cancel = CancellationToken::new();
        runner.spawn_session("cpu".into(), cancel.clone());
        assert_eq!(runner.running(), 1);

        // two full periods of 20s
        sleep(Duration::from_secs(45)).await;
        assert!(rpc.aggregating.load(Ordering::SeqCst) >= 2);
        assert!(observer.get_client_stats("cpu").is_some());

        cancel.cancel();
        runner.wait().await;
        assert_eq!(runner.running(), 0);
        assert!(observer.is_empty());
    }

    /// No workers, counting lookups
    #[derive(Default)]
    struct NoWorkers(AtomicUsize);

    impl WorkerHosts for NoWorkers {
        fn worker_hosts(&self) -> Vec<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_iteration_pauses_then_retries() {
        let (_dir, repo) = fixture("groups: [photo]\nagg_configs: [avg]");
        let hosts = Arc::new(NoWorkers::default());
        let runner = SessionRunner::new(
            repo,
            Arc::new(FetcherRegistry::with_defaults(Duration::from_secs(60)).unwrap()),
            Arc::new(EchoRpc::default()),
            Arc::new(Observer::new()),
            hosts.clone(),
            Duration::from_secs(5),
        );

        let cancel = CancellationToken::new();
        runner.spawn_session("cpu".into(), cancel.clone());

        // attempts at 0s, 5s and 10s
        sleep(Duration::from_secs(12)).await;
        assert_eq!(hosts.0.load(Ordering::SeqCst), 3);

        // cancelling mid-pause ends the loop without another attempt
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), runner.wait())
            .await
            .unwrap();
        assert_eq!(hosts.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_registration_guard_unregisters() {
        let (_dir, repo) = fixture("groups: [photo]");
        let observer = Arc::new(Observer::new());
        let first = client(repo.clone(), Arc::new(EchoRpc::default()));
        let second = client(repo, Arc::new(EchoRpc::default()));

        let stale = ObserverRegistration::new(observer.clone(), &first, "cpu");
        let current = ObserverRegistration::new(observer.clone(), &second, "cpu");
        drop(stale);
        assert_eq!(observer.len(), 1);

        drop(current);
        assert!(observer.is_empty());
    }
}
