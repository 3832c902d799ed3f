//! Node metrics published on a watch channel.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::core::Role;
use crate::error::WaitError;
use crate::raft::Membership;
use crate::LogId;
use crate::NodeId;

/// A snapshot of the observable state of a Raft node.
///
/// Published whenever state changes; observers hold the receiving end of the
/// watch channel and never contend with the core task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership: Membership,
    /// Position of the current snapshot.
    pub snapshot: LogId,
}

impl NodeMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id: id.clone(),
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            membership: Membership::new_initial(id),
            snapshot: LogId::default(),
        }
    }
}

/// Wait for node metrics to satisfy a condition, within a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<NodeMetrics>,
}

impl Wait {
    /// Wait until `predicate` holds, returning the satisfying metrics.
    #[tracing::instrument(level = "trace", skip(self, predicate), fields(msg = msg))]
    pub async fn metrics<F>(&self, predicate: F, msg: &str) -> Result<NodeMetrics, WaitError>
    where
        F: Fn(&NodeMetrics) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown(msg.to_string())),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for `last_log_index >= want`.
    pub async fn log(&self, want: u64, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= want, msg).await
    }

    /// Wait for `last_applied >= want`.
    pub async fn applied(&self, want: u64, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, msg).await
    }

    /// Wait for the node to assume `role`.
    pub async fn role(&self, role: Role, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.role == role, msg).await
    }

    /// Wait for the node to observe `leader`.
    pub async fn current_leader(
        &self,
        leader: NodeId,
        msg: &str,
    ) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.current_leader.as_ref() == Some(&leader), msg)
            .await
    }
}
