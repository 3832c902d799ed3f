//! Error types, one enum per subsystem.
//!
//! Request-scoped errors are returned to the caller; background-worker errors
//! are logged, counted and folded into health state. Replication errors never
//! abort local commit.

use std::time::Duration;

use thiserror::Error;

use crate::DcId;
use crate::NodeId;
use crate::ShardId;

pub type RaftResult<T> = Result<T, RaftError>;

/// Fatal errors of a running Raft node.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft node is shutting down")]
    Shutdown,

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),
}

/// Errors returned from the client write path.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Consensus rejection: this node is not the leader. Carries a redirect
    /// hint when the leader is known.
    #[error("not the cluster leader, leader hint: {0:?}")]
    ForwardToLeader(Option<NodeId>),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors returned from the linearizable read guard.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("not the cluster leader, leader hint: {0:?}")]
    ForwardToLeader(Option<NodeId>),

    #[error("could not confirm leadership with a quorum")]
    QuorumUnreachable,

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors from cluster-membership changes.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("not the cluster leader, leader hint: {0:?}")]
    ForwardToLeader(Option<NodeId>),

    #[error("node {0} is already a cluster member")]
    AlreadyMember(NodeId),

    #[error("node {0} is not a cluster member")]
    NotMember(NodeId),

    #[error("another membership change is in progress")]
    ChangeInProgress,

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors from cluster initialization.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// The node already has log state or is part of a formed cluster.
    #[error("cluster is already initialized")]
    NotAllowed,

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors from the cross-DC async replicator.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Backpressure: the outbound queue for the DC is full.
    #[error("replication queue for dc {0} is full")]
    QueueFull(DcId),

    #[error("no replication target configured for dc {0}")]
    UnknownTarget(DcId),

    #[error("replicator is shutting down")]
    ShuttingDown,

    #[error("failed to encode batch payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Errors from the failover coordinator.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("failover operation {0} is already in progress")]
    AlreadyInProgress(u64),

    #[error("source dc {0} is not in a failed state")]
    SourceNotFailed(DcId),

    #[error("target dc {0} is not healthy")]
    TargetUnhealthy(DcId),

    #[error("consistency score {score:.3} below required {required:.3}")]
    ScoreTooLow { score: f64, required: f64 },

    #[error("manual failover requires operator confirmation")]
    ConfirmationRequired,

    #[error("unknown datacenter {0}")]
    UnknownDc(DcId),

    #[error("failover step {step} failed: {reason}")]
    StepFailed { step: &'static str, reason: String },
}

/// Errors from the topology service.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Invariant violation: a proposed shard version is not newer than the
    /// current one.
    #[error("version regression for shard {shard}: current {current}, proposed {proposed}")]
    VersionRegression {
        shard: ShardId,
        current: i64,
        proposed: i64,
    },
}

/// Errors from the smart router.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no shard owns key {0:?}")]
    UnknownShard(String),

    #[error("no healthy node available for shard {0}")]
    NoHealthyNode(ShardId),

    /// Short-circuit: the circuit breaker for the target is open.
    #[error("circuit open for node {node}, retry after {retry_after:?}")]
    CircuitOpen {
        node: NodeId,
        retry_after: Duration,
    },

    /// Writes to the shard are quiesced by an in-flight failover.
    #[error("writes quiesced for shard {0}")]
    WritesQuiesced(ShardId),

    #[error("topology unavailable")]
    TopologyUnavailable,
}

/// Errors from the shard-aware connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Backpressure: pool and wait queue are both at capacity.
    #[error("connection pool for shard {shard} node {node} exhausted")]
    Exhausted { shard: ShardId, node: NodeId },

    /// Cancellation: the caller's deadline expired while waiting.
    #[error("timed out after {waited:?} waiting for a connection to node {node}")]
    AcquireTimeout { node: NodeId, waited: Duration },

    #[error("connection pool is closed")]
    Closed,

    #[error("failed to establish connection: {0}")]
    ConnectFailed(#[source] anyhow::Error),
}

/// Configuration errors refuse startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address {address:?} for node {node}")]
    InvalidAddress { node: NodeId, address: String },

    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    #[error("duplicate datacenter id {0}")]
    DuplicateDc(DcId),

    #[error("node {node} references unknown datacenter {dc}")]
    UnknownDc { node: NodeId, dc: DcId },

    #[error("exactly one primary datacenter required, found {0}")]
    PrimaryDcCount(usize),

    #[error("{field}: min {min} must not exceed max {max}")]
    InvertedRange { field: &'static str, min: u64, max: u64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Error returned by metrics waiters on timeout.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("raft node shut down while waiting for {0}")]
    Shutdown(String),
}
