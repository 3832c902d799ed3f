//! Contracts between the core and the transport layer.
//!
//! Implementations are provided by the application: over HTTP in the
//! runnable node, over an in-process router in the test fixtures.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::SnapshotData;
use crate::DcId;
use crate::NodeId;

/// Consensus RPC transport.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn send_vote(&self, target: &NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    async fn send_append_entries(
        &self,
        target: &NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn send_install_snapshot(
        &self,
        target: &NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// The wire form of an async replication batch.
///
/// `payload` is the JSON-encoded entry list, gzip-compressed when
/// `compressed` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub batch_id: u64,
    pub target_dc: DcId,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

/// Acknowledgement of a delivered batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: u64,
    /// The highest index the receiving replica has applied.
    pub last_applied_index: u64,
}

/// Cross-DC shipping transport used by the async replicator and the
/// consistency recoverer.
#[async_trait]
pub trait BatchTransport: Send + Sync + 'static {
    async fn send_batch(&self, target: &NodeId, batch: BatchEnvelope) -> Result<BatchAck>;

    /// Ship a full snapshot to a replica, for recovery escalation.
    async fn send_snapshot(&self, target: &NodeId, snapshot: SnapshotData) -> Result<()>;
}

/// Why a probe failed, as far as the transport can tell. The failure
/// detector correlates these to classify DC failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Connection actively refused: the process is down.
    #[error("connection refused")]
    Refused,

    /// No response within the probe deadline.
    #[error("probe timed out")]
    Timeout,

    /// The host is unreachable at the network layer.
    #[error("host unreachable")]
    Unreachable,
}

/// Liveness probing used by the failure detector, the latency monitor and
/// the topology health-check pass.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Probe a node, returning the round-trip time on success.
    async fn probe(&self, target: &NodeId) -> Result<Duration, ProbeError>;
}
