//! AppendEntries handling on the receiving side.

use crate::core::NodeCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::EntryKind;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::MessageSummary;

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Handle an AppendEntries RPC from a leader.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(super) async fn handle_append_entries(
        &mut self,
        rpc: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if rpc.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_hint: None,
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
        // Heartbeats from primary-DC leaders reset the election gate of
        // secondary-DC nodes.
        self.dc.observe_leader(&rpc.leader_id);

        // Consistency check on the previous entry.
        if rpc.prev_log_index > 0 && !self.prev_entry_matches(&rpc).await? {
            let hint = self.conflict_hint(rpc.prev_log_index).await?;
            self.report_metrics();
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_hint: Some(hint),
            });
        }

        if !rpc.entries.is_empty() {
            self.append_new_entries(&rpc).await?;
        }

        if rpc.leader_commit > self.commit_index {
            self.commit_index = rpc.leader_commit.min(self.last_log_id.index);
            self.apply_committed().await?;
        }

        self.report_metrics();
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_hint: None,
        })
    }

    /// Whether our log (or snapshot) contains the leader's `prev_log` entry.
    async fn prev_entry_matches(&mut self, rpc: &AppendEntriesRequest) -> RaftResult<bool> {
        if rpc.prev_log_index == self.snapshot_last.index {
            return Ok(rpc.prev_log_term == self.snapshot_last.term);
        }
        let entry = self
            .log
            .entry(rpc.prev_log_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(match entry {
            Some(entry) => entry.term == rpc.prev_log_term,
            None => false,
        })
    }

    /// Compute the next-index hint returned on a consistency check failure:
    /// the first index of the conflicting term, so the leader can skip the
    /// whole term in one round trip.
    async fn conflict_hint(&mut self, prev_log_index: u64) -> RaftResult<u64> {
        if prev_log_index > self.last_log_id.index {
            return Ok(self.last_log_id.index + 1);
        }
        let conflicting = self
            .log
            .entry(prev_log_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let conflicting_term = match conflicting {
            Some(entry) => entry.term,
            // Purged into the snapshot; resume right after it.
            None => return Ok(self.snapshot_last.index + 1),
        };

        let mut first = prev_log_index;
        while first > 1 {
            match self
                .log
                .entry(first - 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?
            {
                Some(prev) if prev.term == conflicting_term => first -= 1,
                _ => break,
            }
        }
        Ok(first)
    }

    /// Append the request's entries, resolving conflicts by truncation and
    /// skipping entries we already hold.
    async fn append_new_entries(&mut self, rpc: &AppendEntriesRequest) -> RaftResult<()> {
        let mut to_append = Vec::with_capacity(rpc.entries.len());
        for entry in &rpc.entries {
            if entry.index <= self.last_log_id.index {
                let existing = self
                    .log
                    .entry(entry.index)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                match existing {
                    Some(existing) if existing.term == entry.term => continue,
                    _ => {
                        // Conflict with an uncommitted suffix: drop it and
                        // take the leader's entries from here.
                        self.log
                            .truncate_from(entry.index)
                            .await
                            .map_err(|err| self.map_fatal_storage_error(err))?;
                        self.last_log_id = if entry.index > 1 {
                            match self
                                .log
                                .entry(entry.index - 1)
                                .await
                                .map_err(|err| self.map_fatal_storage_error(err))?
                            {
                                Some(prev) => prev.log_id(),
                                None => self.snapshot_last,
                            }
                        } else {
                            Default::default()
                        };
                        to_append.push(entry.clone());
                    }
                }
            } else {
                to_append.push(entry.clone());
            }
        }

        if to_append.is_empty() {
            return Ok(());
        }

        self.log
            .append(&to_append)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last) = to_append.last() {
            self.last_log_id = last.log_id();
        }

        // Membership entries take effect as soon as they are appended.
        for entry in &to_append {
            if entry.kind == EntryKind::Config {
                if let Some(membership) = entry.membership() {
                    tracing::info!(id = %self.id, ?membership, "adopting appended membership config");
                    self.update_membership(membership);
                }
            }
        }
        Ok(())
    }
}
