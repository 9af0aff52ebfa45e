//! Combainer daemon (combainerd)
//!
//! Runs one combainer node: SWIM membership, the raft-replicated
//! assignment map, the leader duties and the local session loops. A
//! single HTTP listener carries raft traffic and the observer endpoint.
//!
//! ## Quick Start
//!
//! ```bash
//! # First node, bootstraps alone
//! combainerd --node-id combainer-01 --start-as-leader
//!
//! # Three-node cluster
//! combainerd --node-id combainer-02 --seeds combainer-01:7946 --bootstrap-expect 3
//! ```

pub mod cli;
pub mod raft_api;

pub use cli::Cli;
pub use raft_api::{create_router, serve, ApiState};

use std::future::Future;

/// Drive node startup unless `shutdown` resolves first.
///
/// Joining seeds can retry indefinitely, so a stop request must be able
/// to interrupt it. Returns `false` when shutdown won.
pub async fn start_or_shutdown<S, F>(start: S, shutdown: F) -> anyhow::Result<bool>
where
    S: Future<Output = combainer_cluster::Result<()>>,
    F: Future<Output = ()>,
{
    tokio::select! {
        res = start => {
            res.map_err(|e| anyhow::anyhow!("start cluster context: {}", e))?;
            Ok(true)
        }
        _ = shutdown => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use combainer_cluster::{ClusterConfig, ClusterContext, ClusterError, FilesystemRepository};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const COMBAINE_YAML: &str = r#"
Combainer:
  Main:
    MINIMUM_PERIOD: 20
cloud_config:
  HostFetcher:
    type: predefine
    Clusters:
      front: {dc1: [front-01]}
"#;

    #[tokio::test]
    async fn test_startup_error_is_reported() {
        let res = start_or_shutdown(
            async { Err(ClusterError::Timeout) },
            std::future::pending(),
        )
        .await;
        assert!(res.is_err());
        assert!(start_or_shutdown(async { Ok(()) }, std::future::pending())
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_interrupts_endless_join() {
        let repo_dir = TempDir::new().unwrap();
        std::fs::write(repo_dir.path().join("combaine.yaml"), COMBAINE_YAML).unwrap();
        std::fs::create_dir(repo_dir.path().join("parsing")).unwrap();
        std::fs::create_dir(repo_dir.path().join("aggregate")).unwrap();
        let repo = Arc::new(FilesystemRepository::new(repo_dir.path()).unwrap());

        let data_dir = TempDir::new().unwrap();
        // nothing answers on the seed, join retries until stopped
        let config = ClusterConfig::builder()
            .node_id("joiner")
            .data_dir(data_dir.path())
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .raft_addr("127.0.0.1:0".parse().unwrap())
            .seeds(vec!["127.0.0.1:9"])
            .build();
        let ctx = ClusterContext::new(config, repo).await.unwrap();

        let started = tokio::time::timeout(
            Duration::from_secs(10),
            start_or_shutdown(ctx.start(), tokio::time::sleep(Duration::from_millis(300))),
        )
        .await
        .expect("shutdown must win over a join that never completes")
        .unwrap();
        assert!(!started);

        ctx.shutdown().await.unwrap();
        assert_eq!(ctx.running_sessions(), 0);
    }
}
