//! Shared fixtures for combainer-cluster integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use combainer_cluster::{
    AssignmentCommand, AssignmentResponse, AssignmentStore, ClusterError, FilesystemRepository,
    Proposer, Result,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const COMBAINE_YAML: &str = r#"
Combainer:
  Main:
    ParallelParsings: 2
    MINIMUM_PERIOD: 5
cloud_config:
  HostFetcher:
    type: predefine
    Clusters:
      front:
        dc1: [front-01, front-02, front-03]
        dc2: [front-04, front-05]
"#;

/// Repository with one empty parsing config per name
pub fn repo_with_configs(names: &[&str]) -> (TempDir, Arc<FilesystemRepository>) {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("combaine.yaml"), COMBAINE_YAML).unwrap();
    std::fs::create_dir(dir.path().join("parsing")).unwrap();
    std::fs::create_dir(dir.path().join("aggregate")).unwrap();
    for name in names {
        push_parsing_config(dir.path(), name, "groups: [front]");
    }
    let repo = Arc::new(FilesystemRepository::new(dir.path()).unwrap());
    (dir, repo)
}

pub fn push_parsing_config(base: &Path, name: &str, body: &str) {
    std::fs::write(base.join("parsing").join(format!("{}.yaml", name)), body).unwrap();
}

pub fn push_aggregation_config(base: &Path, name: &str, body: &str) {
    std::fs::write(base.join("aggregate").join(format!("{}.yaml", name)), body).unwrap();
}

/// `c01`..`c{n}`
pub fn config_names(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("c{:02}", i)).collect()
}

/// Applies every proposal straight to the store, as a single-node leader
/// would after commit
pub struct InMemoryProposer {
    store: Arc<AssignmentStore>,
    reject: AtomicUsize,
}

impl InMemoryProposer {
    pub fn new(store: Arc<AssignmentStore>) -> Self {
        Self {
            store,
            reject: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` proposals
    pub fn reject_next(&self, n: usize) {
        self.reject.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Proposer for InMemoryProposer {
    async fn propose(&self, command: AssignmentCommand) -> Result<AssignmentResponse> {
        let pending = self.reject.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject.store(pending - 1, Ordering::SeqCst);
            return Err(ClusterError::ProposalTimeout);
        }
        Ok(self.store.apply(command))
    }
}
