//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::dc::DcRuntime;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::NodeMetrics;
use crate::network::RaftNetwork;
use crate::raft::ApiMsg;
use crate::raft::LogEntry;
use crate::raft::Membership;
use crate::raft::MembershipResponseTx;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::raft::WriteResponseTx;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicaStream;
use crate::replication::StreamMsg;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::storage::SnapshotData;
use crate::storage::SnapshotMeta;
use crate::storage::StateMachine;
use crate::LogId;
use crate::NodeId;

/// The role a Raft node currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Replicating entries without a vote or election timer.
    Learner,
    /// Replicating entries from the leader.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// The cluster leader.
    Leader,
    /// Shutting down.
    Shutdown,
}

impl Role {
    pub fn is_learner(&self) -> bool {
        matches!(self, Self::Learner)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The state driving one Raft node. Owned by its spawned task.
pub(crate) struct NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    id: NodeId,
    config: Arc<Config>,
    dc: Arc<DcRuntime>,
    network: Arc<N>,
    log: Arc<L>,
    sm: Arc<M>,

    membership: Membership,
    target_role: Role,

    current_term: u64,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,

    last_log_id: LogId,
    /// Highest index known committed cluster-wide. Starts at 0 on boot; only
    /// a leader's quorum accounting or its AppendEntries may raise it.
    commit_index: u64,
    last_applied: LogId,
    /// Position of the current snapshot, if any.
    snapshot_last: LogId,

    last_heartbeat: Option<Instant>,
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<ApiMsg>,
    tx_metrics: watch::Sender<NodeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N, L, M> NodeCore<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        dc: Arc<DcRuntime>,
        network: Arc<N>,
        log: Arc<L>,
        sm: Arc<M>,
        rx_api: mpsc::UnboundedReceiver<ApiMsg>,
        tx_metrics: watch::Sender<NodeMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let membership = Membership::new_initial(id.clone());
        let this = Self {
            id,
            config,
            dc,
            network,
            log,
            sm,
            membership,
            target_role: Role::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            last_log_id: LogId::default(),
            commit_index: 0,
            last_applied: LogId::default(),
            snapshot_last: LogId::default(),
            last_heartbeat: None,
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self
            .log
            .get_initial_state(&self.id)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.membership = state.membership;
        self.last_applied = state.last_applied;
        // The commit index must be re-learned from a leader; initializing it
        // from storage would risk exposing uncommitted entries.
        self.commit_index = 0;

        if let Some(snapshot) = self
            .log
            .current_snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?
        {
            self.snapshot_last = snapshot.meta.last_included;
        }

        let has_log = self.last_log_id.index != 0;
        let single = self.membership.voters.len() == 1;
        let is_voter = self.membership.is_voter(&self.id);

        self.target_role = match (has_log, single, is_voter) {
            // Pristine node: wait for initialize() or a leader's entries.
            (false, _, _) => Role::Learner,
            // Sole voter with live state: immediately lead.
            (true, true, true) => Role::Leader,
            (true, false, true) => Role::Follower,
            // Restarted with log but not (or no longer) a voter.
            (true, _, false) => Role::Learner,
        };

        if self.target_role.is_follower() {
            // Overhead on the first timeout so restarted nodes do not
            // disrupt a stable cluster before connectivity is established.
            let inst = Instant::now()
                + Duration::from_secs(1)
                + Duration::from_millis(self.config.new_rand_election_timeout());
            self.next_election_timeout = Some(inst);
        }

        tracing::debug!(role = ?self.target_role, "node initialized");
        self.report_metrics();

        loop {
            match self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => self.candidate_loop().await?,
                Role::Follower => self.follower_loop().await?,
                Role::Learner => self.learner_loop().await?,
                Role::Shutdown => {
                    tracing::info!(id = %self.id, "node has shut down");
                    return Ok(());
                }
            }
        }
    }

    fn report_metrics(&self) {
        let res = self.tx_metrics.send(NodeMetrics {
            id: self.id.clone(),
            role: self.target_role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader.clone(),
            membership: self.membership.clone(),
            snapshot: self.snapshot_last,
        });
        if let Err(err) = res {
            tracing::debug!(error = %err, "no metrics observers");
        }
    }

    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.log
            .save_hard_state(&hs)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the target role, ensuring non-voters never campaign.
    fn set_target_role(&mut self, role: Role) {
        if role == Role::Follower && !self.membership.is_voter(&self.id) {
            self.target_role = Role::Learner;
        } else {
            self.target_role = role;
        }
    }

    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = ?err, id = %self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        RaftError::Storage(err)
    }

    /// Adopt a new membership config.
    ///
    /// A config takes effect as soon as it is appended; the caller observing
    /// this node leave the voter set can use the Learner transition as its
    /// signal that removal is underway.
    fn update_membership(&mut self, membership: Membership) {
        self.membership = membership;
        if !self.membership.is_voter(&self.id) {
            if self.target_role != Role::Leader {
                self.set_target_role(Role::Learner);
            }
        } else if self.target_role == Role::Learner {
            self.set_target_role(Role::Follower);
        }
    }

    /// Apply all committed-but-unapplied entries, in index order.
    ///
    /// Returns `(index, response)` per applied entry so the leader can
    /// answer waiting clients. On the leader, committed entries are also
    /// forwarded to the async replication bridge.
    async fn apply_committed(&mut self) -> RaftResult<Vec<(u64, Vec<u8>)>> {
        let mut responses = Vec::new();
        if self.last_applied.index >= self.commit_index {
            return Ok(responses);
        }

        let entries = self
            .log
            .entries(self.last_applied.index + 1..self.commit_index + 1)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // Every entry reaches the state machine so its applied index stays
        // dense; non-Normal kinds are state no-ops. Every committed entry
        // also ships to remote DCs, so async replicas never observe a gap.
        let mut forward: Vec<LogEntry> = Vec::with_capacity(entries.len());
        for entry in &entries {
            let response = self
                .sm
                .apply(entry)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            forward.push(entry.clone());
            self.last_applied = entry.log_id();
            responses.push((entry.index, response));
        }

        if self.target_role.is_leader() && !forward.is_empty() {
            self.dc.forward_committed(forward);
        }

        self.maybe_snapshot().await?;
        self.report_metrics();
        Ok(responses)
    }

    /// Snapshot the state machine and purge the covered log once the policy
    /// threshold is reached.
    async fn maybe_snapshot(&mut self) -> RaftResult<()> {
        let SnapshotPolicy::LogsSinceLast(threshold) = self.config.snapshot_policy;
        if self.last_applied.index == 0
            || self.last_applied.index < self.snapshot_last.index + threshold
        {
            return Ok(());
        }

        let data = self
            .sm
            .snapshot()
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let snapshot = SnapshotData {
            meta: SnapshotMeta {
                last_included: self.last_applied,
                membership: self.membership.clone(),
            },
            data,
        };
        self.log
            .save_snapshot(&snapshot)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.log
            .purge_through(self.last_applied.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.snapshot_last = self.last_applied;
        tracing::info!(id = %self.id, snapshot = %self.snapshot_last, "log compacted into snapshot");
        Ok(())
    }

    /// Run the follower loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.id, raft_role = "follower"))]
    async fn follower_loop(&mut self) -> RaftResult<()> {
        self.report_metrics();
        loop {
            if !self.target_role.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    // Nodes outside the primary DC yield leadership until the
                    // primary DC has been silent long enough.
                    if self.dc.allow_election() {
                        self.set_target_role(Role::Candidate);
                    } else {
                        tracing::debug!(id = %self.id, "election deferred, primary DC recently active");
                        self.update_next_election_timeout(false);
                    }
                }
                Some(msg) = self.rx_api.recv() => self.handle_non_leader_msg(msg).await,
                Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
            }
        }
    }

    /// Run the learner loop: passive replication, no election timer.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.id, raft_role = "learner"))]
    async fn learner_loop(&mut self) -> RaftResult<()> {
        self.report_metrics();
        loop {
            if !self.target_role.is_learner() {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.rx_api.recv() => self.handle_non_leader_msg(msg).await,
                Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
            }
        }
    }

    /// Run the candidate loop. Each outer iteration is a new term.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.id, raft_role = "candidate"))]
    async fn candidate_loop(&mut self) -> RaftResult<()> {
        loop {
            if !self.target_role.is_candidate() {
                return Ok(());
            }

            // New term: vote for ourselves.
            self.update_next_election_timeout(false);
            self.current_term += 1;
            self.voted_for = Some(self.id.clone());
            self.current_leader = None;
            self.save_hard_state().await?;
            self.report_metrics();

            let mut granted = 1usize;
            let needed = self.membership.quorum();
            if granted >= needed {
                self.set_target_role(Role::Leader);
                continue;
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.target_role.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.get_next_election_timeout());

                tokio::select! {
                    // Election timed out; start a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => {
                        self.handle_vote_response(res, peer, &mut granted, needed).await?;
                    }
                    Some(msg) = self.rx_api.recv() => self.handle_non_leader_msg(msg).await,
                    Ok(_) = &mut self.rx_shutdown => self.set_target_role(Role::Shutdown),
                }
            }
        }
    }

    /// Fan out vote requests to all peers of the current term.
    fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let peers: Vec<NodeId> = self
            .membership
            .voters
            .iter()
            .filter(|id| *id != &self.id)
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let rpc = VoteRequest {
                term: self.current_term,
                candidate_id: self.id.clone(),
                last_log_index: self.last_log_id.index,
                last_log_term: self.last_log_id.term,
            };
            let network = self.network.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match network.send_vote(&peer, rpc).await {
                    Ok(res) => {
                        let _ = tx.send((res, peer)).await;
                    }
                    Err(err) => {
                        tracing::warn!(target = %peer, error = %err, "error sending vote request")
                    }
                }
            });
        }
        rx
    }

    /// Dispatch an API message in any non-leader role.
    async fn handle_non_leader_msg(&mut self, msg: ApiMsg) {
        match msg {
            ApiMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries(rpc).await);
            }
            ApiMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            ApiMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot(rpc).await);
            }
            ApiMsg::Write { rpc: _, tx } => self.forward_write(tx),
            ApiMsg::Read { tx } => self.forward_read(tx),
            ApiMsg::Initialize { members, tx } => {
                let _ = tx.send(self.handle_initialize(members).await);
            }
            ApiMsg::AddServer { tx, .. } | ApiMsg::RemoveServer { tx, .. } => {
                self.reject_membership_change(tx)
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Tracking of one replication target from the leader's perspective.
struct Replica {
    matched: LogId,
    stream: ReplicaStream,
}

/// Volatile state specific to the leader role.
pub(self) struct LeaderState<'a, N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    core: &'a mut NodeCore<N, L, M>,
    /// Replication streams, one per target node.
    replicas: BTreeMap<NodeId, Replica>,
    replica_tx: mpsc::UnboundedSender<ReplicaEvent>,
    replica_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// Client writes appended locally, awaiting commitment, keyed by index.
    awaiting: BTreeMap<u64, WriteResponseTx>,
    /// An uncommitted membership change: config entry index and reply
    /// channel. At most one change in flight.
    pending_membership: Option<(u64, NodeId, MembershipResponseTx)>,
    /// Index of the first entry of this leader's term. Entries below it
    /// belong to older terms and are only committed transitively.
    term_start_index: u64,
}

impl<'a, N, L, M> LeaderState<'a, N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    fn new(core: &'a mut NodeCore<N, L, M>) -> Self {
        let (replica_tx, replica_rx) = mpsc::unbounded_channel();
        Self {
            core,
            replicas: BTreeMap::new(),
            replica_tx,
            replica_rx,
            awaiting: BTreeMap::new(),
            pending_membership: None,
            term_start_index: 0,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.core.id, raft_role = "leader"))]
    async fn run(mut self) -> RaftResult<()> {
        let targets: Vec<NodeId> = self
            .core
            .membership
            .all_nodes()
            .into_iter()
            .filter(|id| id != &self.core.id)
            .collect();
        for target in targets {
            let replica = self.spawn_replica_stream(&target);
            self.replicas.insert(target, replica);
        }

        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.current_leader = Some(self.core.id.clone());
        self.core.report_metrics();

        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_role.is_leader() {
                tracing::info!(id = %self.core.id, role = ?self.core.target_role, "stepping down");
                for replica in self.replicas.values() {
                    let _ = replica.stream.tx.send(StreamMsg::Terminate);
                }
                self.abort_pending();
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => self.handle_msg(msg).await?,
                Some(event) = self.replica_rx.recv() => self.handle_replica_event(event).await?,
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }

    async fn handle_msg(&mut self, msg: ApiMsg) -> RaftResult<()> {
        match msg {
            ApiMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries(rpc).await);
            }
            ApiMsg::Vote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            ApiMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.core.handle_install_snapshot(rpc).await);
            }
            ApiMsg::Write { rpc, tx } => self.handle_client_write(rpc, tx).await?,
            ApiMsg::Read { tx } => self.handle_client_read(tx).await,
            ApiMsg::Initialize { tx, .. } => self.core.reject_initialize(tx),
            ApiMsg::AddServer { id, tx } => self.add_server(id, tx).await,
            ApiMsg::RemoveServer { id, tx } => self.remove_server(id, tx).await,
        }
        Ok(())
    }

    fn spawn_replica_stream(&self, target: &NodeId) -> Replica {
        Replica {
            matched: LogId::default(),
            stream: ReplicaStream::new(
                self.core.id.clone(),
                target.clone(),
                self.core.current_term,
                self.core.config.clone(),
                self.core.last_log_id,
                self.core.commit_index,
                self.core.network.clone(),
                self.core.log.clone(),
                self.replica_tx.clone(),
            ),
        }
    }

    /// Handle an event from one of the replication streams.
    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::Matched { target, matched } => {
                if let Some(replica) = self.replicas.get_mut(&target) {
                    replica.matched = matched;
                }
                self.advance_commit().await?;
            }
            ReplicaEvent::HigherTerm { target, term } => {
                tracing::info!(%target, term, "replication target observed newer term");
                if term > self.core.current_term {
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state().await?;
                    self.core.current_leader = None;
                    self.core.set_target_role(Role::Follower);
                }
            }
        }
        Ok(())
    }

    /// Recompute the commit index from the quorum of voter match indexes.
    async fn advance_commit(&mut self) -> RaftResult<()> {
        let mut indexes: Vec<u64> = self
            .core
            .membership
            .voters
            .iter()
            .map(|id| {
                if id == &self.core.id {
                    self.core.last_log_id.index
                } else {
                    self.replicas.get(id).map(|r| r.matched.index).unwrap_or(0)
                }
            })
            .collect();
        if indexes.is_empty() {
            return Ok(());
        }
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indexes[self.core.membership.quorum() - 1];

        // Only entries of the current term are committed by counting
        // replicas; earlier entries commit transitively.
        if candidate <= self.core.commit_index || candidate < self.term_start_index {
            return Ok(());
        }

        self.core.commit_index = candidate;
        self.fan_out_commit();
        let responses = self.core.apply_committed().await?;
        self.respond_committed(responses);
        Ok(())
    }

    /// Notify streams of a commit-index advance without new entries.
    fn fan_out_commit(&mut self) {
        for replica in self.replicas.values() {
            let _ = replica.stream.tx.send(StreamMsg::Commit {
                commit_index: self.core.commit_index,
            });
        }
    }

    /// Send a freshly appended entry to every replication stream.
    fn fan_out_entry(&mut self, entry: &Arc<LogEntry>) {
        for replica in self.replicas.values() {
            let _ = replica.stream.tx.send(StreamMsg::Replicate {
                entry: entry.clone(),
                commit_index: self.core.commit_index,
            });
        }
    }

    fn abort_pending(&mut self) {
        use crate::error::MembershipError;
        use crate::error::WriteError;

        let leader = self.core.current_leader.clone();
        for (_, tx) in std::mem::take(&mut self.awaiting) {
            let _ = tx.send(Err(WriteError::ForwardToLeader(leader.clone())));
        }
        if let Some((_, _, tx)) = self.pending_membership.take() {
            let _ = tx.send(Err(MembershipError::ForwardToLeader(leader)));
        }
    }
}
