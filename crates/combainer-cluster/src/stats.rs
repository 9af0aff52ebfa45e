//! Per-client dispatch counters and the observer that exposes them
//!
//! Counters are lock-free. The observer maps a config name to the session
//! client most recently registered for it; a client unregistering with a
//! stale id leaves a newer registration alone.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Success/failure counters of one session client
#[derive(Debug, Default)]
pub struct ClientStats {
    success_parsing: AtomicU64,
    failed_parsing: AtomicU64,
    success_aggregate: AtomicU64,
    failed_aggregate: AtomicU64,
    /// Unix seconds of the last recorded outcome
    last: AtomicI64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.last.store(now_unix(), Ordering::Release);
    }

    pub fn add_success_parsing(&self) {
        self.bump(&self.success_parsing);
    }

    pub fn add_failed_parsing(&self) {
        self.bump(&self.failed_parsing);
    }

    pub fn add_success_aggregate(&self) {
        self.bump(&self.success_aggregate);
    }

    pub fn add_failed_aggregate(&self) {
        self.bump(&self.failed_aggregate);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> StatInfo {
        let parsing_success = self.success_parsing.load(Ordering::Relaxed);
        let parsing_failed = self.failed_parsing.load(Ordering::Relaxed);
        let aggregate_success = self.success_aggregate.load(Ordering::Relaxed);
        let aggregate_failed = self.failed_aggregate.load(Ordering::Relaxed);
        StatInfo {
            parsing_success,
            parsing_failed,
            parsing_total: parsing_success + parsing_failed,
            aggregate_success,
            aggregate_failed,
            aggregate_total: aggregate_success + aggregate_failed,
            heartbeated: self.last.load(Ordering::Acquire),
        }
    }
}

/// Serializable view of [`ClientStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatInfo {
    pub parsing_success: u64,
    pub parsing_failed: u64,
    pub parsing_total: u64,
    pub aggregate_success: u64,
    pub aggregate_failed: u64,
    pub aggregate_total: u64,
    pub heartbeated: i64,
}

#[derive(Debug, Clone)]
struct Registration {
    client_id: String,
    stats: Arc<ClientStats>,
}

/// Registry of active session clients by config name
#[derive(Debug, Default)]
pub struct Observer {
    clients: RwLock<HashMap<String, Registration>>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `client_id` the client reported for `config`, replacing any
    /// previous registration
    pub fn register_client(
        &self,
        client_id: impl Into<String>,
        stats: Arc<ClientStats>,
        config: impl Into<String>,
    ) {
        let client_id = client_id.into();
        let config = config.into();
        debug!(config = %config, client = %client_id, "Registered client");
        self.clients
            .write()
            .insert(config, Registration { client_id, stats });
    }

    /// Remove the registration for `config` if it still belongs to
    /// `client_id`. Returns whether anything was removed.
    pub fn unregister_client(&self, client_id: &str, config: &str) -> bool {
        let mut clients = self.clients.write();
        match clients.get(config) {
            Some(reg) if reg.client_id == client_id => {
                clients.remove(config);
                debug!(config = %config, client = %client_id, "Unregistered client");
                true
            }
            Some(reg) => {
                debug!(
                    config = %config,
                    client = %client_id,
                    current = %reg.client_id,
                    "Ignoring stale unregister"
                );
                false
            }
            None => false,
        }
    }

    /// Stats of every registered client, keyed by config
    pub fn get_clients_stats(&self) -> BTreeMap<String, StatInfo> {
        self.clients
            .read()
            .iter()
            .map(|(config, reg)| (config.clone(), reg.stats.snapshot()))
            .collect()
    }

    pub fn get_client_stats(&self, config: &str) -> Option<StatInfo> {
        self.clients.read().get(config).map(|r| r.stats.snapshot())
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ClientStats::new();
        assert_eq!(stats.snapshot(), StatInfo::default());

        stats.add_success_parsing();
        stats.add_success_parsing();
        stats.add_failed_parsing();
        stats.add_failed_aggregate();

        let info = stats.snapshot();
        assert_eq!(info.parsing_success, 2);
        assert_eq!(info.parsing_failed, 1);
        assert_eq!(info.parsing_total, 3);
        assert_eq!(info.aggregate_success, 0);
        assert_eq!(info.aggregate_total, 1);
        assert!(info.heartbeated > 0);
    }

    #[test]
    fn test_stat_info_json_field_names() {
        let json = serde_json::to_value(StatInfo::default()).unwrap();
        for key in [
            "ParsingSuccess",
            "ParsingFailed",
            "ParsingTotal",
            "AggregateSuccess",
            "AggregateFailed",
            "AggregateTotal",
            "Heartbeated",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_register_replaces_previous_client() {
        let observer = Observer::new();
        let first = Arc::new(ClientStats::new());
        let second = Arc::new(ClientStats::new());
        second.add_success_aggregate();

        observer.register_client("a", first.clone(), "cpu");
        observer.register_client("b", second.clone(), "cpu");

        assert_eq!(observer.len(), 1);
        assert_eq!(observer.get_client_stats("cpu").unwrap().aggregate_success, 1);
    }

    #[test]
    fn test_unregister_checks_client_id() {
        let observer = Observer::new();
        observer.register_client("a", Arc::new(ClientStats::new()), "cpu");

        assert!(!observer.unregister_client("other", "cpu"));
        assert!(observer.get_client_stats("cpu").is_some());

        assert!(observer.unregister_client("a", "cpu"));
        assert!(observer.is_empty());
        assert!(!observer.unregister_client("a", "cpu"));
    }

    #[test]
    fn test_clients_stats_snapshot() {
        let observer = Observer::new();
        let cpu = Arc::new(ClientStats::new());
        cpu.add_success_parsing();
        observer.register_client("a", cpu, "cpu");
        observer.register_client("b", Arc::new(ClientStats::new()), "mem");

        let all = observer.get_clients_stats();
        assert_eq!(all.len(), 2);
        assert_eq!(all["cpu"].parsing_success, 1);
        assert_eq!(all["mem"].parsing_total, 0);
    }
}
