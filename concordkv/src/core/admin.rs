//! Cluster formation and membership changes.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::core::LeaderState;
use crate::core::NodeCore;
use crate::core::Role;
use crate::error::InitializeError;
use crate::error::MembershipError;
use crate::network::RaftNetwork;
use crate::raft::LogEntry;
use crate::raft::Membership;
use crate::raft::MembershipResponseTx;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::NodeId;

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Form a cluster on a pristine node with the given voting members.
    ///
    /// Allowed only while the log is empty and the term is zero; anything
    /// else means the cluster is already in motion. The node campaigns
    /// immediately, and whichever member wins propagates the config as its
    /// first committed entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_initialize(
        &mut self,
        members: BTreeSet<NodeId>,
    ) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.current_term != 0 {
            return Err(InitializeError::NotAllowed);
        }
        if !members.contains(&self.id) {
            return Err(InitializeError::NotAllowed);
        }

        self.membership = Membership {
            voters: members,
            learners: BTreeSet::new(),
        };
        self.update_next_election_timeout(false);
        self.set_target_role(Role::Candidate);
        Ok(())
    }

    pub(super) fn reject_initialize(&self, tx: oneshot::Sender<Result<(), InitializeError>>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }

    pub(super) fn reject_membership_change(&self, tx: MembershipResponseTx) {
        let _ = tx.send(Err(MembershipError::ForwardToLeader(
            self.current_leader.clone(),
        )));
    }
}

impl<'a, N, L, M> LeaderState<'a, N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Add a voter. The config entry takes effect on append and the caller
    /// is answered once it commits under the new quorum.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target = %id))]
    pub(super) async fn add_server(&mut self, id: NodeId, tx: MembershipResponseTx) {
        if self.pending_membership.is_some() {
            let _ = tx.send(Err(MembershipError::ChangeInProgress));
            return;
        }
        if self.core.membership.is_voter(&id) {
            let _ = tx.send(Err(MembershipError::AlreadyMember(id)));
            return;
        }

        let membership = self.core.membership.with_voter(id.clone());
        self.commit_membership(membership, id, tx).await;
    }

    /// Remove a node. The leader keeps replicating to it until the config
    /// entry commits, then terminates its stream.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(target = %id))]
    pub(super) async fn remove_server(&mut self, id: NodeId, tx: MembershipResponseTx) {
        if self.pending_membership.is_some() {
            let _ = tx.send(Err(MembershipError::ChangeInProgress));
            return;
        }
        if !self.core.membership.contains(&id) {
            let _ = tx.send(Err(MembershipError::NotMember(id)));
            return;
        }

        let membership = self.core.membership.without_node(&id);
        self.commit_membership(membership, id, tx).await;
    }

    async fn commit_membership(
        &mut self,
        membership: Membership,
        affected: NodeId,
        tx: MembershipResponseTx,
    ) {
        let index = self.core.last_log_id.index + 1;
        let entry = LogEntry::config(index, self.core.current_term, &membership);
        let entry = match self.append_entry(entry).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(MembershipError::Raft(err)));
                return;
            }
        };

        self.core.update_membership(membership);
        if self.core.membership.contains(&affected) && !self.replicas.contains_key(&affected) {
            let replica = self.spawn_replica_stream(&affected);
            self.replicas.insert(affected.clone(), replica);
        }
        self.pending_membership = Some((index, affected, tx));
        self.fan_out_entry(&entry);
        if let Err(err) = self.advance_commit().await {
            tracing::error!(error = %err, "error advancing commit after membership append");
        }
    }
}
