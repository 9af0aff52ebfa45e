//! Session dispatch against a scripted worker fleet

mod common;

use async_trait::async_trait;
use combainer_cluster::{
    AggregatingResult, AggregatingTask, ClusterError, FetcherRegistry, ParsingResult, ParsingTask,
    Result, SessionClient, WorkerRpc,
};
use common::{push_aggregation_config, push_parsing_config, repo_with_configs};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Fails parsing for `failing` hosts, stalls for `slow` hosts and records
/// what aggregation received
#[derive(Default)]
struct ScriptedWorkers {
    failing: BTreeSet<String>,
    slow: BTreeSet<String>,
    stall: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    aggregated: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedWorkers {
    fn aggregated_keys(&self) -> Vec<String> {
        self.aggregated.lock()[0].1.clone()
    }
}

#[async_trait]
impl WorkerRpc for ScriptedWorkers {
    async fn do_parsing(&self, _workers: &[String], task: &ParsingTask) -> Result<ParsingResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.slow.contains(&task.host) {
            tokio::time::sleep(self.stall).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&task.host) {
            return Err(ClusterError::Rpc {
                call: "parsing",
                reason: format!("{} is broken", task.host),
            });
        }
        let mut data = BTreeMap::new();
        data.insert(task.host.clone(), b"payload".to_vec());
        Ok(ParsingResult { data })
    }

    async fn do_aggregating(
        &self,
        _workers: &[String],
        task: &AggregatingTask,
    ) -> Result<AggregatingResult> {
        let keys = task.parsing_result.data.keys().cloned().collect();
        self.aggregated.lock().push((task.config.clone(), keys));
        if task.config == "broken" {
            return Err(ClusterError::Rpc {
                call: "aggregating",
                reason: "sender down".into(),
            });
        }
        Ok(AggregatingResult {})
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn workers() -> Vec<String> {
    vec!["combainer-01".to_string()]
}

fn client_for(rpc: Arc<ScriptedWorkers>, aggregations: &[&str]) -> (tempfile::TempDir, SessionClient) {
    let (dir, repo) = repo_with_configs(&[]);
    for name in aggregations {
        push_aggregation_config(dir.path(), name, "data:\n  total: {type: summa}");
    }
    push_parsing_config(
        dir.path(),
        "nginx",
        &format!("groups: [front]\nagg_configs: [{}]", aggregations.join(", ")),
    );
    let fetchers = Arc::new(FetcherRegistry::with_defaults(Duration::from_secs(60)).unwrap());
    (dir, SessionClient::new(repo, fetchers, rpc))
}

#[tokio::test(start_paused = true)]
async fn test_partial_parsing_failure_still_aggregates() {
    let rpc = Arc::new(ScriptedWorkers {
        failing: set(&["front-02", "front-04"]),
        ..Default::default()
    });
    let (_dir, client) = client_for(rpc.clone(), &["total"]);

    client
        .dispatch(&workers(), "nginx", "session-1", false)
        .await
        .unwrap();

    assert_eq!(rpc.aggregated_keys(), vec!["front-01", "front-03", "front-05"]);
    let stats = client.stats().snapshot();
    assert_eq!(stats.parsing_failed, 2);
    assert_eq!(stats.parsing_success, 3);
    assert_eq!(stats.aggregate_success, 1);
}

#[tokio::test(start_paused = true)]
async fn test_parsing_parallelism_is_bounded() {
    let rpc = Arc::new(ScriptedWorkers::default());
    let (_dir, client) = client_for(rpc.clone(), &["total"]);

    client.dispatch(&workers(), "nginx", "", false).await.unwrap();

    // ParallelParsings: 2 in combaine.yaml
    assert_eq!(rpc.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(client.stats().snapshot().parsing_success, 5);
}

#[tokio::test(start_paused = true)]
async fn test_parsing_deadline_drops_slow_hosts() {
    let rpc = Arc::new(ScriptedWorkers {
        slow: set(&["front-05"]),
        stall: Duration::from_secs(30),
        ..Default::default()
    });
    let (_dir, client) = client_for(rpc.clone(), &["total"]);

    // MINIMUM_PERIOD is 5s: parsing closes at 4s
    let started = Instant::now();
    client
        .dispatch(&workers(), "nginx", "session-2", true)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!rpc.aggregated_keys().contains(&"front-05".to_string()));
    assert_eq!(rpc.aggregated_keys().len(), 4);
    assert_eq!(client.stats().snapshot().parsing_failed, 1);
    assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(5100), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_without_wait_returns_after_aggregation() {
    let rpc = Arc::new(ScriptedWorkers::default());
    let (_dir, client) = client_for(rpc.clone(), &["total"]);

    let started = Instant::now();
    client.dispatch(&workers(), "nginx", "", false).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_failed_aggregation_does_not_stop_siblings() {
    let rpc = Arc::new(ScriptedWorkers::default());
    let (_dir, client) = client_for(rpc.clone(), &["total", "broken"]);

    client.dispatch(&workers(), "nginx", "", false).await.unwrap();

    let configs: BTreeSet<String> = rpc
        .aggregated
        .lock()
        .iter()
        .map(|(config, _)| config.clone())
        .collect();
    assert_eq!(configs, set(&["broken", "total"]));
    let stats = client.stats().snapshot();
    assert_eq!(stats.aggregate_success, 1);
    assert_eq!(stats.aggregate_failed, 1);
}

#[tokio::test]
async fn test_unknown_parsing_config_aborts() {
    let rpc = Arc::new(ScriptedWorkers::default());
    let (_dir, client) = client_for(rpc.clone(), &["total"]);

    let err = client
        .dispatch(&workers(), "absent", "", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConfigNotFound(_)));
    assert!(rpc.aggregated.lock().is_empty());
}
