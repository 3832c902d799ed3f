//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::NodeCore;
use crate::dc::DcRuntime;
use crate::error::InitializeError;
use crate::error::MembershipError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::ReadError;
use crate::error::WriteError;
use crate::metrics::NodeMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::storage::LogStore;
use crate::storage::SnapshotMeta;
use crate::storage::StateMachine;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The kind of payload a log entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An application command.
    Normal,
    /// A membership change; `data` holds the JSON-encoded [`Membership`].
    Config,
    /// An empty entry committed by a new leader to establish its term.
    NoOp,
}

/// A single entry of the replicated log.
///
/// `(index, term)` is unique; `term` is non-decreasing with `index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn normal(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            timestamp: Utc::now(),
            kind: EntryKind::Normal,
            data,
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self {
            index,
            term,
            timestamp: Utc::now(),
            kind: EntryKind::NoOp,
            data: Vec::new(),
        }
    }

    pub fn config(index: u64, term: u64, membership: &Membership) -> Self {
        let data = serde_json::to_vec(membership).unwrap_or_default();
        Self {
            index,
            term,
            timestamp: Utc::now(),
            kind: EntryKind::Config,
            data,
        }
    }

    pub fn log_id(&self) -> LogId {
        LogId {
            term: self.term,
            index: self.index,
        }
    }

    /// Decode the membership payload of a `Config` entry.
    pub fn membership(&self) -> Option<Membership> {
        if self.kind == EntryKind::Config {
            serde_json::from_slice(&self.data).ok()
        } else {
            None
        }
    }
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        format!("{}:{:?}", self.log_id(), self.kind)
    }
}

impl MessageSummary for &[LogEntry] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

/// The voting membership of the cluster, plus learners replicating without a
/// vote.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeSet<NodeId>,
    pub learners: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new_initial(id: NodeId) -> Self {
        let mut voters = BTreeSet::new();
        voters.insert(id);
        Self {
            voters,
            learners: BTreeSet::new(),
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.voters.contains(id) || self.learners.contains(id)
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.voters.contains(id)
    }

    /// All nodes which receive replication: voters and learners.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        self.voters.union(&self.learners).cloned().collect()
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn with_voter(&self, id: NodeId) -> Self {
        let mut next = self.clone();
        next.learners.remove(&id);
        next.voters.insert(id);
        next
    }

    pub fn without_node(&self, id: &NodeId) -> Self {
        let mut next = self.clone();
        next.voters.remove(id);
        next.learners.remove(id);
        next
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, candidate={}, last_log={}-{}",
            self.term, self.candidate_id, self.last_log_term, self.last_log_index
        )
    }
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Sent by the leader to replicate log entries, and as a heartbeat when
/// `entries` is empty.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev={}-{}, commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an [`AppendEntriesRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On log mismatch, the next index the leader should try. Lets a lagging
    /// follower skip over a whole conflicting term per round trip.
    pub conflict_hint: Option<u64>,
}

/// Sent by the leader to bring a follower up to speed from a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, last_included={}, len={}",
            self.term,
            self.leader_id,
            self.meta.last_included,
            self.data.len()
        )
    }
}

/// The response to an [`InstallSnapshotRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application command to be committed through the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub data: Vec<u8>,
}

/// The committed position and state-machine response of a write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub index: u64,
    pub data: Vec<u8>,
}

pub(crate) type WriteResponseTx = oneshot::Sender<Result<WriteResponse, WriteError>>;
pub(crate) type ReadResponseTx = oneshot::Sender<Result<(), ReadError>>;
pub(crate) type MembershipResponseTx = oneshot::Sender<Result<(), MembershipError>>;

/// A message from the public API into the core task.
pub(crate) enum ApiMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<RaftResult<AppendEntriesResponse>>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<RaftResult<VoteResponse>>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<RaftResult<InstallSnapshotResponse>>,
    },
    Write {
        rpc: WriteRequest,
        tx: WriteResponseTx,
    },
    Read {
        tx: ReadResponseTx,
    },
    Initialize {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    AddServer {
        id: NodeId,
        tx: MembershipResponseTx,
    },
    RemoveServer {
        id: NodeId,
        tx: MembershipResponseTx,
    },
}

struct RaftInner {
    tx_api: mpsc::UnboundedSender<ApiMsg>,
    rx_metrics: watch::Receiver<NodeMetrics>,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// A running Raft node.
///
/// The node itself runs as a spawned task; this handle is cheap to clone and
/// communicates with it over channels. All methods are cancel-safe: dropping
/// a call future abandons only the response, never the node.
pub struct RaftNode<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    inner: Arc<RaftInner>,
    _marker: std::marker::PhantomData<(N, L, M)>,
}

impl<N, L, M> Clone for RaftNode<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<N, L, M> RaftNode<N, L, M>
where
    N: RaftNetwork,
    L: LogStore,
    M: StateMachine,
{
    /// Create and spawn a new Raft node task.
    ///
    /// `dc` carries the datacenter view used for election gating and the
    /// bridge feeding committed entries to the async replicator; a
    /// single-DC deployment passes [`DcRuntime::single_dc`].
    #[tracing::instrument(level = "debug", skip(config, dc, network, log, state_machine), fields(cluster = %config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        dc: Arc<DcRuntime>,
        network: Arc<N>,
        log: Arc<L>,
        state_machine: Arc<M>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(NodeMetrics::new_initial(id.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = NodeCore::spawn(
            id,
            config,
            dc,
            network,
            log,
            state_machine,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        Self {
            inner: Arc::new(RaftInner {
                tx_api,
                rx_metrics,
                core_handle: Mutex::new(Some(core_handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
            }),
            _marker: std::marker::PhantomData,
        }
    }

    fn call<T: 'static>(
        &self,
        msg: ApiMsg,
        rx: oneshot::Receiver<RaftResult<T>>,
    ) -> impl std::future::Future<Output = RaftResult<T>> + '_ {
        let sent = self.inner.tx_api.send(msg).map_err(|_| RaftError::Shutdown);
        async move {
            sent?;
            rx.await.map_err(|_| RaftError::Shutdown)?
        }
    }

    /// Submit an AppendEntries RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(
        &self,
        rpc: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(ApiMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a VoteRequest RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn vote(&self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(ApiMsg::Vote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn install_snapshot(
        &self,
        rpc: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(ApiMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a client write. Resolves once the entry is committed and
    /// applied on this leader.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: WriteRequest) -> Result<WriteResponse, WriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Write { rpc, tx })
            .map_err(|_| WriteError::Raft(RaftError::Shutdown))?;
        rx.await
            .map_err(|_| WriteError::Raft(RaftError::Shutdown))?
    }

    /// Confirm this node is still leader, guarding a linearizable read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Read { tx })
            .map_err(|_| ReadError::Raft(RaftError::Shutdown))?;
        rx.await.map_err(|_| ReadError::Raft(RaftError::Shutdown))?
    }

    /// Initialize a pristine node with the given voting members.
    ///
    /// Returns `InitializeError::NotAllowed` when the cluster is already
    /// formed; callers may safely ignore that case.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::Initialize { members, tx })
            .map_err(|_| InitializeError::Raft(RaftError::Shutdown))?;
        rx.await
            .map_err(|_| InitializeError::Raft(RaftError::Shutdown))?
    }

    /// Add a server to the cluster: sync it as a learner, then commit a
    /// config entry promoting it to voter.
    #[tracing::instrument(level = "debug", skip(self), fields(target = %id))]
    pub async fn add_server(&self, id: NodeId) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::AddServer { id, tx })
            .map_err(|_| MembershipError::Raft(RaftError::Shutdown))?;
        rx.await
            .map_err(|_| MembershipError::Raft(RaftError::Shutdown))?
    }

    /// Remove a server from the cluster via a committed config entry.
    #[tracing::instrument(level = "debug", skip(self), fields(target = %id))]
    pub async fn remove_server(&self, id: NodeId) -> Result<(), MembershipError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ApiMsg::RemoveServer { id, tx })
            .map_err(|_| MembershipError::Raft(RaftError::Shutdown))?;
        rx.await
            .map_err(|_| MembershipError::Raft(RaftError::Shutdown))?
    }

    /// The last known leader, from the metrics channel. Cheap, may be stale;
    /// use [`Self::client_read`] to guard reads.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader.clone()
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<NodeMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or(Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut down this node and await its core task.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}
