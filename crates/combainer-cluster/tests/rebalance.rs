//! Rebalancer passes over fixture assignment maps

mod common;

use combainer_cluster::{AssignmentMap, AssignmentStore, Rebalancer};
use common::{config_names, push_parsing_config, repo_with_configs, InMemoryProposer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn map(entries: &[(&str, &[&str])]) -> AssignmentMap {
    entries
        .iter()
        .map(|(host, configs)| {
            (
                host.to_string(),
                configs.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            )
        })
        .collect()
}

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The fixture maps for 30 configs `c01`..`c30` on host1..host3.
/// `c77`, `c88`, `c99` do not exist in the repository.
fn even_fixtures() -> Vec<(&'static str, AssignmentMap)> {
    vec![
        ("EmptyMapEven", AssignmentMap::new()),
        (
            "FullMapEven",
            map(&[
                (
                    "host1",
                    &[
                        "c10", "c11", "c12", "c13", "c14", "c15", "c16", "c17", "c18", "c19",
                        "c20", "c21", "c22", "c23", "c24", "c25", "c26", "c27", "c28", "c29",
                    ],
                ),
                ("host2", &["c04", "c05", "c06", "c07", "c08", "c77", "c88", "c99"]),
                ("host3", &["c01", "c02", "c03", "c09", "c30"]),
            ]),
        ),
        (
            "PartialMap",
            map(&[
                (
                    "host1",
                    &["c10", "c11", "c12", "c13", "c14", "c26", "c27", "c28", "c29", "c30"],
                ),
                ("host2", &["c04", "c05", "c06"]),
                ("host3", &["c01", "c02", "c03"]),
            ]),
        ),
        (
            "OneEmptyMap",
            map(&[
                (
                    "host1",
                    &["c10", "c11", "c12", "c13", "c26", "c27", "c28", "c29", "c30"],
                ),
                (
                    "host2",
                    &["c04", "c05", "c06", "c07", "c08", "c09", "c77", "c88", "c99"],
                ),
                ("host3", &[]),
            ]),
        ),
        (
            "FirstFullMap",
            map(&[
                (
                    "host1",
                    &[
                        "c01", "c02", "c03", "c04", "c05", "c06", "c07", "c08", "c09", "c10",
                        "c11", "c12", "c13", "c14", "c15", "c16", "c17", "c18", "c19", "c20",
                        "c21", "c22", "c23", "c24", "c25", "c26", "c27", "c28", "c29", "c30",
                    ],
                ),
                ("host2", &["c77", "c88", "c99"]),
                ("host3", &[]),
            ]),
        ),
    ]
}

/// Panics if any config has more than one owner
fn assert_single_owner(store: &AssignmentStore, case: &str) {
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for (host, configs) in store.dump() {
        for config in configs {
            if let Some(previous) = owners.insert(config.clone(), host.clone()) {
                panic!("{case}: {config} dispatched to both {previous} and {host}");
            }
        }
    }
}

fn count(store: &AssignmentStore, host: &str) -> usize {
    store.list(host).len()
}

fn setup(names: &[String]) -> (tempfile::TempDir, Arc<AssignmentStore>, Arc<InMemoryProposer>, Rebalancer) {
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let (dir, repo) = repo_with_configs(&refs);
    let store = Arc::new(AssignmentStore::new());
    let proposer = Arc::new(InMemoryProposer::new(store.clone()));
    let rebalancer = Rebalancer::new(repo, store.clone(), proposer.clone());
    (dir, store, proposer, rebalancer)
}

#[tokio::test]
async fn test_empty_cluster_is_a_no_op() {
    let (_dir, store, _, rebalancer) = setup(&config_names(30));
    let report = rebalancer.run_pass(&[]).await.unwrap();
    assert_eq!(report.assigned, 0);
    assert!(store.dump().is_empty());
}

#[tokio::test]
async fn test_even_distribution_over_three_hosts() {
    let live = hosts(&["host1", "host2", "host3"]);
    for (case, fixture) in even_fixtures() {
        let (_dir, store, _, rebalancer) = setup(&config_names(30));
        store.replace(fixture);

        rebalancer.run_pass(&live).await.unwrap();

        for host in &live {
            let n = count(&store, host);
            assert!(n > 8 && n < 12, "{case}: 8 < {host}({n}) < 12, {:?}", store.distribution());
        }
        assert_eq!(store.total_assigned(), 30, "{case}");
        assert_single_owner(&store, case);
    }
}

#[tokio::test]
async fn test_empty_map_spread_is_at_most_one() {
    let live = hosts(&["a", "b", "c", "d"]);
    let (_dir, store, _, rebalancer) = setup(&config_names(30));

    rebalancer.run_pass(&live).await.unwrap();

    let counts: Vec<usize> = live.iter().map(|h| count(&store, h)).collect();
    let max = counts.iter().max().copied().unwrap();
    let min = counts.iter().min().copied().unwrap();
    assert!(max - min <= 1, "{counts:?}");
}

#[tokio::test]
async fn test_new_config_on_balanced_cluster() {
    let live = hosts(&["host1", "host2", "host3"]);
    let (dir, store, _, rebalancer) = setup(&config_names(30));
    store.replace(even_fixtures().remove(1).1);
    rebalancer.run_pass(&live).await.unwrap();

    push_parsing_config(dir.path(), "c55", "groups: [front]");
    rebalancer.run_pass(&live).await.unwrap();

    assert_eq!(store.owners("c55").len(), 1);
    assert_eq!(store.total_assigned(), 31);
    assert_single_owner(&store, "FullMapEven+c55");
}

#[tokio::test]
async fn test_dead_host_configs_are_reassigned() {
    let live = hosts(&["host1", "host2"]);
    for (case, fixture) in even_fixtures() {
        let (_dir, store, _, rebalancer) = setup(&config_names(30));
        store.replace(fixture);

        rebalancer.run_pass(&live).await.unwrap();

        let n = count(&store, "host1");
        assert!(n > 12 && n < 17, "{case}: 12 < host1({n}) < 17, {:?}", store.distribution());
        assert_eq!(count(&store, "host3"), 0, "{case}: dead node has configs");
        assert_eq!(store.total_assigned(), 30, "{case}: configs lost");
        assert_single_owner(&store, case);
    }
}

#[tokio::test]
async fn test_odd_distribution() {
    let names = config_names(7);
    let live = hosts(&["host1odd", "host2odd", "host3odd"]);
    let fixtures = vec![
        ("EmptyMapOdd", AssignmentMap::new()),
        (
            "FullMapOdd",
            map(&[
                ("host1odd", &["c10", "c11", "c12", "c13", "c14"]),
                ("host2odd", &["c04", "c05", "c06", "c07", "c08"]),
                ("host3odd", &[]),
            ]),
        ),
    ];

    for (case, fixture) in fixtures {
        let (_dir, store, _, rebalancer) = setup(&names);
        store.replace(fixture);

        rebalancer.run_pass(&live).await.unwrap();

        let n = count(&store, "host1odd");
        assert!(n > 2 && n < 5, "{case}: 2 < host1odd({n}) < 5, {:?}", store.distribution());
        for host in &live {
            assert!(count(&store, host) <= 3, "{case}: {host} above ceiling");
        }
        assert_eq!(store.total_assigned(), 7, "{case}");
        assert_single_owner(&store, case);
    }
}

#[tokio::test]
async fn test_failed_proposals_do_not_stop_the_pass() {
    let live = hosts(&["host1", "host2", "host3"]);
    let (_dir, store, proposer, rebalancer) = setup(&config_names(9));
    proposer.reject_next(2);

    let report = rebalancer.run_pass(&live).await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.assigned, 7);

    // the next pass converges
    let report = rebalancer.run_pass(&live).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(store.total_assigned(), 9);
    assert_single_owner(&store, "after retry");
}

#[tokio::test]
async fn test_deleted_config_is_released() {
    let live = hosts(&["host1", "host2"]);
    let (dir, store, _, rebalancer) = setup(&config_names(4));
    rebalancer.run_pass(&live).await.unwrap();
    assert_eq!(store.owners("c02").len(), 1);

    std::fs::remove_file(dir.path().join("parsing/c02.yaml")).unwrap();
    rebalancer.run_pass(&live).await.unwrap();

    assert!(store.owners("c02").is_empty());
    assert_eq!(store.total_assigned(), 3);
}
