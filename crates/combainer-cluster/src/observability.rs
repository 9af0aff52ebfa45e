//! Metrics for the combainer cluster
//!
//! Recorders go through the `metrics` facade, which is a no-op until a
//! recorder is installed. The Prometheus exporter sits behind the
//! `metrics-prometheus` feature.
//!
//! ```rust,ignore
//! use combainer_cluster::observability::{init_metrics, SessionMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! SessionMetrics::increment_parsing("cpu-usage", true);
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Raft Metrics
// ============================================================================

/// Raft consensus metrics
pub struct RaftMetrics;

impl RaftMetrics {
    /// Total number of proposals committed
    pub fn increment_proposals() {
        metrics::counter!("combainer_raft_proposals_total").increment(1);
    }

    /// Proposals rejected because this node is not the leader
    pub fn increment_not_leader() {
        metrics::counter!("combainer_raft_not_leader_total").increment(1);
    }

    /// Proposals that failed for any other reason
    pub fn increment_proposal_failures() {
        metrics::counter!("combainer_raft_proposal_failures_total").increment(1);
    }

    /// Total number of snapshots built or installed
    pub fn increment_snapshots() {
        metrics::counter!("combainer_raft_snapshots_total").increment(1);
    }

    /// Total AppendEntries RPCs sent
    pub fn increment_append_entries_sent() {
        metrics::counter!("combainer_raft_append_entries_sent_total").increment(1);
    }

    /// Whether this node is the leader (1 = yes, 0 = no)
    pub fn set_is_leader(is_leader: bool) {
        metrics::gauge!("combainer_raft_is_leader").set(if is_leader { 1.0 } else { 0.0 });
    }

    /// Number of voters in the current configuration
    pub fn set_voter_count(count: usize) {
        metrics::gauge!("combainer_raft_voter_count").set(count as f64);
    }

    /// Record proposal latency (time from propose to apply)
    pub fn record_proposal_latency(duration: Duration) {
        metrics::histogram!("combainer_raft_proposal_latency_seconds")
            .record(duration.as_secs_f64());
    }

    /// Record AppendEntries RPC latency
    pub fn record_append_entries_latency(duration: Duration) {
        metrics::histogram!("combainer_raft_append_entries_latency_seconds")
            .record(duration.as_secs_f64());
    }

    /// Record Vote RPC latency
    pub fn record_vote_latency(duration: Duration) {
        metrics::histogram!("combainer_raft_vote_latency_seconds").record(duration.as_secs_f64());
    }

    /// Record snapshot transfer time
    pub fn record_snapshot_duration(duration: Duration) {
        metrics::histogram!("combainer_raft_snapshot_duration_seconds")
            .record(duration.as_secs_f64());
    }
}

// ============================================================================
// Cluster Metrics
// ============================================================================

/// Membership, leadership and assignment metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    pub fn set_alive_members(count: usize) {
        metrics::gauge!("combainer_cluster_alive_members").set(count as f64);
    }

    pub fn increment_node_joins() {
        metrics::counter!("combainer_cluster_node_joins_total").increment(1);
    }

    pub fn increment_node_leaves() {
        metrics::counter!("combainer_cluster_node_leaves_total").increment(1);
    }

    pub fn increment_node_failures() {
        metrics::counter!("combainer_cluster_node_failures_total").increment(1);
    }

    /// Leadership acquired or lost
    pub fn increment_leadership_transitions() {
        metrics::counter!("combainer_cluster_leadership_transitions_total").increment(1);
    }

    /// Completed rebalance passes
    pub fn increment_rebalance_passes() {
        metrics::counter!("combainer_cluster_rebalance_passes_total").increment(1);
    }

    /// Assign/remove decisions proposed by the rebalancer or reconciler
    pub fn increment_assignment_commands(kind: &'static str) {
        metrics::counter!("combainer_cluster_assignment_commands_total", "kind" => kind)
            .increment(1);
    }

    /// Configs assigned cluster-wide
    pub fn set_assigned_configs(count: usize) {
        metrics::gauge!("combainer_cluster_assigned_configs").set(count as f64);
    }

    /// Session loops running on this node
    pub fn set_local_sessions(count: usize) {
        metrics::gauge!("combainer_cluster_local_sessions").set(count as f64);
    }
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Dispatch pipeline metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn increment_parsing(config: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(
            "combainer_session_parsing_total",
            "config" => config.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn increment_aggregating(config: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(
            "combainer_session_aggregating_total",
            "config" => config.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Iterations that aborted before dispatching anything
    pub fn increment_aborted_iterations(config: &str) {
        metrics::counter!(
            "combainer_session_aborted_iterations_total",
            "config" => config.to_string()
        )
        .increment(1);
    }

    pub fn record_dispatch_duration(config: &str, duration: Duration) {
        metrics::histogram!(
            "combainer_session_dispatch_duration_seconds",
            "config" => config.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

// ============================================================================
// Network Metrics
// ============================================================================

/// Network and RPC metrics
pub struct NetworkMetrics;

impl NetworkMetrics {
    pub fn add_bytes_sent(bytes: u64) {
        metrics::counter!("combainer_network_bytes_sent_total").increment(bytes);
    }

    pub fn add_bytes_received(bytes: u64) {
        metrics::counter!("combainer_network_bytes_received_total").increment(bytes);
    }

    pub fn increment_rpc_errors(rpc_type: &'static str) {
        metrics::counter!("combainer_network_rpc_errors_total", "rpc_type" => rpc_type)
            .increment(1);
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start a Prometheus exporter serving `/metrics` on `addr`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }

    /// Install the recorder without a listener, for embedding in an existing server
    pub fn init_prometheus_recorder() -> Result<
        metrics_exporter_prometheus::PrometheusHandle,
        Box<dyn std::error::Error + Send + Sync>,
    > {
        Ok(PrometheusBuilder::new().install_recorder()?)
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::{init_prometheus_exporter, init_prometheus_recorder};

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call more than once.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        if prometheus_addr.is_some() {
            tracing::warn!("Prometheus address given but metrics-prometheus feature is off");
        }

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        RaftMetrics::increment_proposals();
        RaftMetrics::set_is_leader(true);
        RaftMetrics::record_proposal_latency(Duration::from_millis(10));
        ClusterMetrics::set_alive_members(3);
        ClusterMetrics::increment_assignment_commands("assign");
        SessionMetrics::increment_parsing("cpu", false);
        SessionMetrics::record_dispatch_duration("cpu", Duration::from_secs(1));
        NetworkMetrics::increment_rpc_errors("vote");
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics(None).is_ok());
        assert!(init_metrics(None).is_ok());
    }
}
