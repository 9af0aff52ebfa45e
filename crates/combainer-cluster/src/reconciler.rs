//! Membership to raft reconciliation
//!
//! Keeps the raft voter set in line with gossip membership and releases the
//! configs of members that left. Only the leader runs it; on a follower
//! every proposal fails with `NotLeader` and the new leader's own pass does
//! the work.

use crate::assignment::{AssignmentCommand, AssignmentStore};
use crate::error::Result;
use crate::membership::MembershipEvent;
use crate::node::{Node, NodeState};
use crate::raft::{hash_node_id, Proposer, VoterControl};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Reconciler {
    local_name: String,
    voters: Arc<dyn VoterControl>,
    proposer: Arc<dyn Proposer>,
    store: Arc<AssignmentStore>,
}

impl Reconciler {
    pub fn new(
        local_name: impl Into<String>,
        voters: Arc<dyn VoterControl>,
        proposer: Arc<dyn Proposer>,
        store: Arc<AssignmentStore>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            voters,
            proposer,
            store,
        }
    }

    /// React to one membership change. Self and failed (not yet reaped)
    /// members are ignored.
    pub async fn reconcile_member(&self, event: &MembershipEvent) -> Result<()> {
        let node = event.node();
        if node.id == self.local_name {
            return Ok(());
        }

        let outcome = match event {
            MembershipEvent::Join(node) => self.voters.add_voter(&node.id, &node.raft_addr).await,
            MembershipEvent::Leave(node) | MembershipEvent::Reap(node) => {
                self.remove_member(&node.id).await
            }
            MembershipEvent::Fail(node) => {
                debug!(node_id = %node.id, "Member failed, waiting for reap");
                Ok(())
            }
        };

        match &outcome {
            Err(e) if e.is_not_leader() => {
                debug!(node_id = %node.id, error = %e, "Lost leadership during reconcile")
            }
            Err(e) => warn!(node_id = %node.id, error = %e, "Failed to reconcile member"),
            Ok(()) => {}
        }
        outcome
    }

    async fn remove_member(&self, name: &str) -> Result<()> {
        for config in self.store.list(name) {
            self.proposer
                .propose(AssignmentCommand::remove(name, &config))
                .await?;
            info!(node_id = %name, config = %config, "Released config of departed member");
        }
        self.voters.remove_voter(name).await
    }

    /// Reconcile every known member, then drop voters gossip no longer
    /// knows about. Stops at the first error.
    pub async fn reconcile_all(&self, members: &[Node]) -> Result<()> {
        for member in members {
            let event = match member.state {
                NodeState::Alive => MembershipEvent::Join(member.info.clone()),
                NodeState::Left => MembershipEvent::Leave(member.info.clone()),
                _ => continue,
            };
            self.reconcile_member(&event).await?;
        }

        let known: BTreeSet<u64> = members
            .iter()
            .map(|m| hash_node_id(&m.info.id))
            .chain(std::iter::once(hash_node_id(&self.local_name)))
            .collect();
        for (id, addr) in self.voters.voters() {
            if !known.contains(&id) {
                info!(id, addr = %addr, "Removing voter unknown to membership");
                self.voters.remove_voter_id(id).await?;
            }
        }
        Ok(())
    }
}
