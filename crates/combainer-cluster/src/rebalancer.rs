//! Leader-side config distribution
//!
//! A pass compares the configs in the repository with the assignment map
//! and proposes the commands that converge the two:
//!
//! 1. configs on hosts that are no longer alive are released
//! 2. configs that left the repository, and duplicate owners, are released
//! 3. every host gets a quota of `configs / hosts`, the remainder going one
//!    each to the least-loaded hosts, and hosts above quota release the excess
//! 4. what is left unassigned goes to a random host when fewer configs than
//!    hosts remain, otherwise round-robin starting at the least-loaded host
//!
//! Each decision is a separate proposal. A failed proposal is logged and the
//! pass goes on; the next pass picks up whatever did not converge.

use crate::assignment::{AssignmentCommand, AssignmentMap, AssignmentStore};
use crate::error::Result;
use crate::observability::ClusterMetrics;
use crate::raft::Proposer;
use crate::repository::Repository;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub removed: usize,
    pub assigned: usize,
    pub failed: usize,
}

/// Commands that move `current` towards one owner per config in `desired`,
/// balanced across `live_hosts`. Removals come first.
pub fn plan(
    current: &AssignmentMap,
    live_hosts: &[String],
    desired: &BTreeSet<String>,
) -> Vec<AssignmentCommand> {
    let live: BTreeSet<&str> = live_hosts.iter().map(String::as_str).collect();
    if live.is_empty() {
        return Vec::new();
    }

    let mut commands = Vec::new();
    let mut kept: BTreeMap<&str, Vec<&str>> = live.iter().map(|h| (*h, Vec::new())).collect();
    let mut owned: BTreeSet<&str> = BTreeSet::new();

    // dead hosts first, so their configs count as free below
    for (host, configs) in current {
        if !live.contains(host.as_str()) {
            for config in configs {
                debug!(host = %host, config = %config, "Releasing config from dead host");
                commands.push(AssignmentCommand::remove(host, config));
            }
        }
    }

    for (host, configs) in current {
        let Some(keep) = kept.get_mut(host.as_str()) else {
            continue;
        };
        for config in configs {
            if !desired.contains(config) {
                info!(host = %host, config = %config, "Releasing missing config");
                commands.push(AssignmentCommand::remove(host, config));
            } else if !owned.insert(config.as_str()) {
                warn!(host = %host, config = %config, "Releasing duplicate assignment");
                commands.push(AssignmentCommand::remove(host, config));
            } else {
                keep.push(config.as_str());
            }
        }
    }

    let target = host_targets(&kept, desired.len());
    for (host, configs) in kept.iter_mut() {
        let limit = target[host];
        while configs.len() > limit {
            if let Some(config) = configs.pop() {
                debug!(host = %host, config = %config, limit, "Releasing config from overloaded host");
                owned.remove(config);
                commands.push(AssignmentCommand::remove(*host, config));
            }
        }
    }

    let unassigned: Vec<&str> = desired
        .iter()
        .map(String::as_str)
        .filter(|c| !owned.contains(c))
        .collect();
    let mut load: BTreeMap<&str, usize> = kept.iter().map(|(h, c)| (*h, c.len())).collect();

    if unassigned.len() < live.len() {
        let mut rng = rand::thread_rng();
        for config in unassigned {
            let candidates: Vec<&str> = load
                .iter()
                .filter(|(h, n)| **n < target[*h])
                .map(|(h, _)| *h)
                .collect();
            let Some(host) = candidates.choose(&mut rng).copied() else {
                break;
            };
            *load.entry(host).or_default() += 1;
            commands.push(AssignmentCommand::assign(host, config));
        }
    } else {
        let mut order: Vec<&str> = load.keys().copied().collect();
        order.sort_by_key(|h| (load[h], *h));

        let mut idx = 0;
        for config in unassigned {
            let mut chosen = None;
            for _ in 0..order.len() {
                let host = order[idx % order.len()];
                idx += 1;
                if load[host] < target[host] {
                    chosen = Some(host);
                    break;
                }
            }
            let Some(host) = chosen else {
                break;
            };
            *load.entry(host).or_default() += 1;
            commands.push(AssignmentCommand::assign(host, config));
        }
    }

    commands
}

/// Per-host quota: `total / hosts`, plus one for `total % hosts` of them.
///
/// Hosts already holding exactly one extra config keep their slot so a
/// balanced map stays put. Remaining slots go to the least-loaded hosts.
fn host_targets<'a>(kept: &BTreeMap<&'a str, Vec<&str>>, total: usize) -> BTreeMap<&'a str, usize> {
    let mean = total / kept.len();
    let mut remainder = total % kept.len();

    let mut order: Vec<&'a str> = kept.keys().copied().collect();
    order.sort_by_key(|h| (kept[h].len(), *h));
    let mut target: BTreeMap<&'a str, usize> = order.iter().map(|h| (*h, mean)).collect();

    for host in order.iter().filter(|h| kept[*h].len() == mean + 1) {
        if remainder == 0 {
            break;
        }
        *target.entry(*host).or_default() += 1;
        remainder -= 1;
    }
    for host in order.iter().filter(|h| kept[*h].len() != mean + 1) {
        if remainder == 0 {
            break;
        }
        *target.entry(*host).or_default() += 1;
        remainder -= 1;
    }
    target
}

/// Distributes repository configs over live hosts. Leader only.
pub struct Rebalancer {
    repo: Arc<dyn Repository>,
    store: Arc<AssignmentStore>,
    proposer: Arc<dyn Proposer>,
}

impl Rebalancer {
    pub fn new(
        repo: Arc<dyn Repository>,
        store: Arc<AssignmentStore>,
        proposer: Arc<dyn Proposer>,
    ) -> Self {
        Self {
            repo,
            store,
            proposer,
        }
    }

    /// Run one pass over `live_hosts`
    pub async fn run_pass(&self, live_hosts: &[String]) -> Result<PassReport> {
        let desired: BTreeSet<String> = self.repo.list_parsing_configs()?.into_iter().collect();
        if live_hosts.is_empty() {
            warn!("Cluster is empty, nowhere to distribute configs");
            return Ok(PassReport::default());
        }

        let commands = plan(&self.store.dump(), live_hosts, &desired);
        debug!(
            configs = desired.len(),
            hosts = live_hosts.len(),
            commands = commands.len(),
            "Distributing configs"
        );

        let mut report = PassReport::default();
        for command in commands {
            let kind = command.kind();
            let is_assign = matches!(command, AssignmentCommand::AssignConfig { .. });
            match self.proposer.propose(command).await {
                Ok(_) => {
                    ClusterMetrics::increment_assignment_commands(kind);
                    if is_assign {
                        report.assigned += 1;
                    } else {
                        report.removed += 1;
                    }
                }
                Err(e) if e.is_not_leader() => {
                    debug!(error = %e, "Not leader, skipping proposal");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(kind, error = %e, "Failed to propose assignment change");
                    report.failed += 1;
                }
            }
        }

        ClusterMetrics::increment_rebalance_passes();
        ClusterMetrics::set_assigned_configs(self.store.total_assigned());
        info!(
            removed = report.removed,
            assigned = report.assigned,
            failed = report.failed,
            distribution = ?self.store.distribution(),
            "Rebalance pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn hosts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn apply(map: &mut AssignmentMap, commands: &[AssignmentCommand]) {
        for cmd in commands {
            match cmd {
                AssignmentCommand::AssignConfig { host, config } => {
                    map.entry(host.clone()).or_default().insert(config.clone());
                }
                AssignmentCommand::RemoveConfig { host, config } => {
                    if let Some(configs) = map.get_mut(host) {
                        configs.remove(config);
                    }
                }
                AssignmentCommand::Noop => {}
            }
        }
    }

    #[test]
    fn test_no_live_hosts_no_commands() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a"]));
        assert!(plan(&map, &[], &set(&["a"])).is_empty());
    }

    #[test]
    fn test_balanced_map_is_stable() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a", "b"]));
        map.insert("h2".into(), set(&["c", "d"]));
        assert!(plan(&map, &hosts(&["h1", "h2"]), &set(&["a", "b", "c", "d"])).is_empty());
    }

    #[test]
    fn test_removals_precede_assignments() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["gone"]));
        map.insert("dead".into(), set(&["a"]));

        let commands = plan(&map, &hosts(&["h1", "h2"]), &set(&["a", "b"]));
        let first_assign = commands
            .iter()
            .position(|c| matches!(c, AssignmentCommand::AssignConfig { .. }))
            .unwrap();
        assert!(commands[..first_assign]
            .iter()
            .all(|c| matches!(c, AssignmentCommand::RemoveConfig { .. })));
        assert_eq!(first_assign, 2);
    }

    #[test]
    fn test_duplicate_owner_released() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a"]));
        map.insert("h2".into(), set(&["a", "b"]));

        let commands = plan(&map, &hosts(&["h1", "h2"]), &set(&["a", "b"]));
        assert_eq!(commands, vec![AssignmentCommand::remove("h2", "a")]);
    }

    #[test]
    fn test_round_robin_starts_at_least_loaded() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a", "b"]));

        // 5 configs on 3 hosts: h1 keeps its extra slot, h2 gets the other
        let mut map_after = map.clone();
        let commands = plan(&map, &hosts(&["h1", "h2", "h3"]), &set(&["a", "b", "c", "d", "e"]));
        apply(&mut map_after, &commands);

        assert_eq!(commands[0], AssignmentCommand::assign("h2", "c"));
        assert_eq!(map_after["h1"].len(), 2);
        assert_eq!(map_after["h2"].len(), 2);
        assert_eq!(map_after["h3"].len(), 1);
    }

    #[test]
    fn test_sparse_remainder_respects_quota() {
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a", "b"]));
        map.insert("h2".into(), set(&["c", "d"]));
        map.insert("h3".into(), set(&["e"]));

        // one new config, only h3 is below its quota of 2
        for _ in 0..20 {
            let commands = plan(&map, &hosts(&["h1", "h2", "h3"]), &set(&["a", "b", "c", "d", "e", "f"]));
            assert_eq!(commands, vec![AssignmentCommand::assign("h3", "f")]);
        }
    }

    #[test]
    fn test_remainder_goes_to_least_loaded() {
        // 7 configs on 3 hosts; h1 only holds configs that are gone
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["x1", "x2", "x3", "x4", "x5"]));
        map.insert("h2".into(), set(&["d", "e", "f", "g", "x6"]));
        let live = hosts(&["h1", "h2", "h3"]);

        let mut after = map.clone();
        apply(&mut after, &plan(&map, &live, &set(&["a", "b", "c", "d", "e", "f", "g"])));

        let counts: Vec<usize> = live
            .iter()
            .map(|h| after.get(h).map_or(0, BTreeSet::len))
            .collect();
        assert_eq!(counts, vec![3, 2, 2]);
    }

    #[test]
    fn test_uneven_balanced_map_is_stable() {
        let desired = set(&["a", "b", "c", "d", "e", "f", "g"]);
        let live = hosts(&["h1", "h2", "h3"]);
        let mut map = AssignmentMap::new();
        map.insert("h1".into(), set(&["a", "b"]));
        map.insert("h2".into(), set(&["c", "d", "e"]));
        map.insert("h3".into(), set(&["f", "g"]));

        assert!(plan(&map, &live, &desired).is_empty());
    }
}
