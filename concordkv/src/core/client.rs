//! Client write and read paths on the leader.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::core::LeaderState;
use crate::core::NodeCore;
use crate::core::Role;
use crate::error::RaftResult;
use crate::error::ReadError;
use crate::error::WriteError;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::LogEntry;
use crate::raft::ReadResponseTx;
use crate::raft::WriteRequest;
use crate::raft::WriteResponse;
use crate::raft::WriteResponseTx;
use crate::replication::StreamMsg;
use crate::storage::LogStore;
use crate::storage::StateMachine;

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Redirect a write submitted to a non-leader.
    pub(super) fn forward_write(&self, tx: WriteResponseTx) {
        let _ = tx.send(Err(WriteError::ForwardToLeader(self.current_leader.clone())));
    }

    /// Redirect a read guard submitted to a non-leader.
    pub(super) fn forward_read(&self, tx: ReadResponseTx) {
        let _ = tx.send(Err(ReadError::ForwardToLeader(self.current_leader.clone())));
    }
}

impl<'a, N, L, M> LeaderState<'a, N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Commit the entry a new leader is obligated to create when coming to
    /// power: the initial config for a pristine cluster, else a no-op that
    /// establishes this term's commit point.
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let index = self.core.last_log_id.index + 1;
        let entry = if self.core.last_log_id.index == 0 {
            LogEntry::config(index, self.core.current_term, &self.core.membership)
        } else {
            LogEntry::noop(index, self.core.current_term)
        };
        self.term_start_index = index;
        let entry = self.append_entry(entry).await?;
        self.fan_out_entry(&entry);
        self.advance_commit().await
    }

    /// Assign the next index, append to the local log and publish metrics.
    pub(super) async fn append_entry(&mut self, entry: LogEntry) -> RaftResult<Arc<LogEntry>> {
        self.core
            .log
            .append(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id();
        self.core.report_metrics();
        Ok(Arc::new(entry))
    }

    /// Handle a client write: append, fan out, and answer once committed.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write(
        &mut self,
        rpc: WriteRequest,
        tx: WriteResponseTx,
    ) -> RaftResult<()> {
        let index = self.core.last_log_id.index + 1;
        let entry = LogEntry::normal(index, self.core.current_term, rpc.data);
        match self.append_entry(entry).await {
            Ok(entry) => {
                self.awaiting.insert(index, tx);
                self.fan_out_entry(&entry);
                // A single-voter cluster commits immediately.
                self.advance_commit().await
            }
            Err(err) => {
                let _ = tx.send(Err(WriteError::Raft(err)));
                Ok(())
            }
        }
    }

    /// Answer committed entries and resolve a completed membership change.
    pub(super) fn respond_committed(&mut self, responses: Vec<(u64, Vec<u8>)>) {
        for (index, data) in responses {
            if let Some(tx) = self.awaiting.remove(&index) {
                let _ = tx.send(Ok(WriteResponse { index, data }));
            }

            let membership_done = matches!(&self.pending_membership, Some((i, _, _)) if *i == index);
            if membership_done {
                if let Some((_, node, tx)) = self.pending_membership.take() {
                    if !self.core.membership.contains(&node) {
                        // Removal committed: stop replicating to the node.
                        if let Some(replica) = self.replicas.remove(&node) {
                            let _ = replica.stream.tx.send(StreamMsg::Terminate);
                        }
                    }
                    let _ = tx.send(Ok(()));
                }
            }
        }

        // A committed config that removed this node ends its leadership.
        if !self.core.membership.is_voter(&self.core.id) {
            tracing::info!(id = %self.core.id, "removed from voter set, stepping down");
            self.core.set_target_role(Role::Learner);
        }
    }

    /// Confirm leadership with a quorum before a linearizable read.
    ///
    /// A heartbeat round to every voter; any response carrying our term is a
    /// confirmation. A newer term aborts the read and steps down.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn handle_client_read(&mut self, tx: ReadResponseTx) {
        let needed = self.core.membership.quorum();
        let mut confirmed = 1usize; // ourselves

        if confirmed >= needed {
            let _ = tx.send(Ok(()));
            return;
        }

        let peers: Vec<_> = self
            .core
            .membership
            .voters
            .iter()
            .filter(|id| *id != &self.core.id)
            .cloned()
            .collect();
        let (res_tx, mut res_rx) = mpsc::channel(peers.len().max(1));
        let ttl = Duration::from_millis(self.core.config.heartbeat_interval);

        for peer in peers {
            let prev = self
                .replicas
                .get(&peer)
                .map(|r| r.matched)
                .unwrap_or_default();
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id.clone(),
                prev_log_index: prev.index,
                prev_log_term: prev.term,
                entries: Vec::new(),
                leader_commit: self.core.commit_index,
            };
            let network = self.core.network.clone();
            let res_tx = res_tx.clone();
            tokio::spawn(async move {
                match timeout(ttl, network.send_append_entries(&peer, rpc)).await {
                    Ok(Ok(res)) => {
                        let _ = res_tx.send((peer, Ok(res))).await;
                    }
                    Ok(Err(err)) => {
                        let _ = res_tx.send((peer, Err(err))).await;
                    }
                    Err(_) => {
                        let _ = res_tx
                            .send((peer, Err(anyhow::anyhow!("leadership confirmation timed out"))))
                            .await;
                    }
                }
            });
        }
        drop(res_tx);

        while let Some((peer, res)) = res_rx.recv().await {
            let res = match res {
                Ok(res) => res,
                Err(err) => {
                    tracing::warn!(target = %peer, error = %err, "error confirming leadership");
                    continue;
                }
            };
            if res.term > self.core.current_term {
                self.core.update_current_term(res.term, None);
                self.core.current_leader = None;
                self.core.set_target_role(Role::Follower);
                let _ = tx.send(Err(ReadError::ForwardToLeader(None)));
                return;
            }
            confirmed += 1;
            if confirmed >= needed {
                let _ = tx.send(Ok(()));
                return;
            }
        }

        let _ = tx.send(Err(ReadError::QuorumUnreachable));
    }
}
