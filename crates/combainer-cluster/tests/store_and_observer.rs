//! Assignment apply idempotence and observer registration handoff

use combainer_cluster::{
    AssignmentCommand, AssignmentResponse, AssignmentStore, ClientStats, LocalTasks, Observer,
    SessionSpawner,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSpawner {
    spawned: Mutex<Vec<(String, CancellationToken)>>,
}

impl SessionSpawner for RecordingSpawner {
    fn spawn_session(&self, config: String, cancel: CancellationToken) {
        self.spawned.lock().push((config, cancel));
    }
}

fn local_store(host: &str) -> (Arc<AssignmentStore>, Arc<RecordingSpawner>) {
    let store = Arc::new(AssignmentStore::new());
    let spawner = Arc::new(RecordingSpawner::default());
    store
        .attach_local_tasks(LocalTasks::new(host, spawner.clone(), CancellationToken::new()))
        .unwrap();
    (store, spawner)
}

#[test]
fn test_repeated_assign_is_idempotent() {
    let (store, spawner) = local_store("me");

    let first = store.apply(AssignmentCommand::assign("me", "nginx"));
    let before = store.dump();
    let second = store.apply(AssignmentCommand::assign("me", "nginx"));

    assert_eq!(first, AssignmentResponse::Assigned { newly: true });
    assert_eq!(second, AssignmentResponse::Assigned { newly: false });
    assert_eq!(store.dump(), before);
    assert_eq!(store.local_task_count(), 1);
    assert_eq!(spawner.spawned.lock().len(), 1);
}

#[test]
fn test_remove_of_absent_pair_is_a_no_op() {
    let (store, _) = local_store("me");
    store.apply(AssignmentCommand::assign("other", "nginx"));

    let resp = store.apply(AssignmentCommand::remove("me", "nginx"));
    assert_eq!(resp, AssignmentResponse::Removed { existed: false });
    assert_eq!(store.owners("nginx"), vec!["other"]);
}

#[test]
fn test_reassign_after_remove_spawns_fresh_loop() {
    let (store, spawner) = local_store("me");
    store.apply(AssignmentCommand::assign("me", "nginx"));
    store.apply(AssignmentCommand::remove("me", "nginx"));
    store.apply(AssignmentCommand::assign("me", "nginx"));

    let spawned = spawner.spawned.lock();
    assert_eq!(spawned.len(), 2);
    assert!(spawned[0].1.is_cancelled());
    assert!(!spawned[1].1.is_cancelled());
}

#[test]
fn test_observer_handoff_ignores_stale_unregister() {
    let observer = Observer::new();
    let old = Arc::new(ClientStats::new());
    let new = Arc::new(ClientStats::new());
    new.add_success_parsing();
    new.add_success_parsing();

    observer.register_client("client-old", old, "nginx");
    observer.register_client("client-new", new, "nginx");
    assert_eq!(observer.get_clients_stats()["nginx"].parsing_success, 2);

    assert!(!observer.unregister_client("client-old", "nginx"));
    assert_eq!(observer.get_clients_stats()["nginx"].parsing_success, 2);

    assert!(observer.unregister_client("client-new", "nginx"));
    assert!(observer.get_clients_stats().is_empty());
}
