//! Vote request and response handling.

use crate::core::NodeCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::LogStore;
use crate::storage::StateMachine;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Handle an incoming vote request.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub(super) async fn handle_vote_request(
        &mut self,
        rpc: VoteRequest,
    ) -> RaftResult<VoteResponse> {
        if rpc.term < self.current_term {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // A live leader suppresses votes: if we heard from a leader within
        // the minimum election timeout, this candidate is likely partitioned
        // and should not be able to disrupt the cluster.
        if let Some(last) = self.last_heartbeat {
            if last.elapsed().as_millis() <= u128::from(self.config.election_timeout_min) {
                tracing::debug!(candidate = %rpc.candidate_id, "vote denied, leader is live");
                return Ok(VoteResponse {
                    term: self.current_term,
                    granted: false,
                });
            }
        }

        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.update_next_election_timeout(false);
            if self.target_role.is_leader() || self.target_role.is_candidate() {
                self.set_target_role(Role::Follower);
                self.current_leader = None;
            }
            self.save_hard_state().await?;
        }

        // Election restriction: only grant to candidates whose log is at
        // least as up to date as ours.
        let candidate_log = LogId {
            term: rpc.last_log_term,
            index: rpc.last_log_index,
        };
        if candidate_log < self.last_log_id {
            return Ok(VoteResponse {
                term: self.current_term,
                granted: false,
            });
        }

        let granted = match &self.voted_for {
            None => true,
            Some(id) => id == &rpc.candidate_id,
        };
        if granted {
            self.voted_for = Some(rpc.candidate_id.clone());
            self.save_hard_state().await?;
            self.update_next_election_timeout(false);
            tracing::debug!(candidate = %rpc.candidate_id, term = rpc.term, "vote granted");
        }
        self.report_metrics();

        Ok(VoteResponse {
            term: self.current_term,
            granted,
        })
    }

    /// Tally a vote response while campaigning.
    pub(super) async fn handle_vote_response(
        &mut self,
        res: VoteResponse,
        peer: NodeId,
        granted: &mut usize,
        needed: usize,
    ) -> RaftResult<()> {
        if res.term > self.current_term {
            tracing::debug!(%peer, term = res.term, "newer term observed, reverting to follower");
            self.update_current_term(res.term, None);
            self.save_hard_state().await?;
            self.set_target_role(Role::Follower);
            return Ok(());
        }

        if res.granted && res.term == self.current_term {
            *granted += 1;
            if *granted >= needed {
                tracing::info!(id = %self.id, term = self.current_term, "election won");
                self.set_target_role(Role::Leader);
            }
        }
        Ok(())
    }
}
