//! InstallSnapshot handling on the receiving side.

use crate::core::NodeCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::storage::LogStore;
use crate::storage::SnapshotData;
use crate::storage::StateMachine;
use crate::MessageSummary;

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Handle an InstallSnapshot RPC: replace state up to the snapshot's
    /// last included position.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(super) async fn handle_install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        if rpc.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.update_next_election_timeout(true);
        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.save_hard_state().await?;
        }
        if self.target_role.is_leader() || self.target_role.is_candidate() {
            self.set_target_role(Role::Follower);
        }
        self.current_leader = Some(rpc.leader_id.clone());
        self.dc.observe_leader(&rpc.leader_id);

        let last_included = rpc.meta.last_included;
        if last_included.index <= self.last_applied.index {
            // Already covered by our state; nothing to install.
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.sm
            .install(last_included, &rpc.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let snapshot = SnapshotData {
            meta: rpc.meta.clone(),
            data: rpc.data,
        };
        self.log
            .save_snapshot(&snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // Keep our log suffix only if it agrees with the snapshot position.
        let suffix_agrees = match self
            .log
            .entry(last_included.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
        {
            Some(entry) => entry.term == last_included.term,
            None => false,
        };
        if !suffix_agrees {
            self.log
                .truncate_from(last_included.index + 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = last_included;
        }
        self.log
            .purge_through(last_included.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if self.last_log_id < last_included {
            self.last_log_id = last_included;
        }
        self.last_applied = last_included;
        self.commit_index = self.commit_index.max(last_included.index);
        self.snapshot_last = last_included;
        self.update_membership(rpc.meta.membership.clone());

        tracing::info!(id = %self.id, snapshot = %last_included, "snapshot installed");
        self.report_metrics();
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }
}
