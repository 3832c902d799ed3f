//! Per-follower replication streams.
//!
//! The leader spawns one stream task per replication target. A stream owns
//! the position bookkeeping for its target and dispatches strictly in order:
//! a payload is never re-sent concurrently with a newer one, which preserves
//! in-order delivery per target.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;

use crate::config::Config;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::raft::LogEntry;
use crate::storage::LogStore;
use crate::LogId;
use crate::NodeId;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicaStream {
    pub tx: mpsc::UnboundedSender<StreamMsg>,
}

impl ReplicaStream {
    pub(crate) fn new<N: RaftNetwork, L: LogStore>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        log: Arc<L>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        StreamCore::spawn(
            id,
            target,
            term,
            config,
            last_log,
            commit_index,
            network,
            log,
            core_tx,
        )
    }
}

/// A command from the leader to one of its streams.
pub(crate) enum StreamMsg {
    /// A new entry was appended; its index is the new last log index.
    Replicate {
        entry: Arc<LogEntry>,
        commit_index: u64,
    },
    /// The commit index advanced without new entries.
    Commit { commit_index: u64 },
    Terminate,
}

/// An event from a stream back to the leader loop.
#[derive(Debug)]
pub(crate) enum ReplicaEvent {
    /// The target acknowledged replication up to `matched`.
    Matched { target: NodeId, matched: LogId },
    /// The target reported a newer term; the leader must step down.
    HigherTerm { target: NodeId, term: u64 },
}

#[derive(PartialEq, Eq)]
enum StreamState {
    Streaming,
    Snapshotting,
    Shutdown,
}

struct StreamCore<N: RaftNetwork, L: LogStore> {
    id: NodeId,
    target: NodeId,
    term: u64,
    config: Arc<Config>,
    network: Arc<N>,
    log: Arc<L>,

    state: StreamState,
    /// Index of the next entry to send.
    next_index: u64,
    /// Last position known replicated on the target; also the `prev_log`
    /// reference of the next payload.
    matched: LogId,
    last_log_index: u64,
    commit_index: u64,
    /// Highest match already reported to the leader loop.
    reported: u64,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    install_snapshot_timeout: Duration,

    rx: mpsc::UnboundedReceiver<StreamMsg>,
    core_tx: mpsc::UnboundedSender<ReplicaEvent>,
}

impl<N: RaftNetwork, L: LogStore> StreamCore<N, L> {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        log: Arc<L>,
        core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ReplicaStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let install_snapshot_timeout = Duration::from_millis(config.install_snapshot_timeout);
        let this = Self {
            id,
            target,
            term,
            config,
            network,
            log,
            state: StreamState::Streaming,
            next_index: last_log.index + 1,
            matched: last_log,
            last_log_index: last_log.index,
            commit_index,
            reported: u64::MAX,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            install_snapshot_timeout,
            rx,
            core_tx,
        };
        tokio::spawn(this.main());
        ReplicaStream { tx }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = %self.id, target = %self.target))]
    async fn main(mut self) {
        // Announce leadership immediately with an initial heartbeat.
        self.send_append_entries().await;

        loop {
            match self.state {
                StreamState::Streaming => self.stream_loop().await,
                StreamState::Snapshotting => self.install_snapshot().await,
                StreamState::Shutdown => return,
            }
        }
    }

    async fn stream_loop(&mut self) {
        loop {
            if self.state != StreamState::Streaming {
                return;
            }

            if self.next_index <= self.last_log_index {
                let ok = self.send_append_entries().await;
                if self.state != StreamState::Streaming {
                    return;
                }
                if !ok {
                    // Pace retries at the heartbeat cadence, staying
                    // responsive to leader commands.
                    tokio::select! {
                        _ = sleep(self.heartbeat_timeout) => {}
                        msg = self.rx.recv() => match msg {
                            Some(msg) => self.drain_msgs(msg),
                            None => self.state = StreamState::Shutdown,
                        }
                    }
                } else {
                    // Pick up anything that arrived while sending.
                    if let Some(Some(msg)) = self.rx.recv().now_or_never() {
                        self.drain_msgs(msg);
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.send_append_entries().await;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.drain_msgs(msg),
                    None => self.state = StreamState::Shutdown,
                }
            }
        }
    }

    /// Apply a command and whatever else is already queued behind it.
    fn drain_msgs(&mut self, first: StreamMsg) {
        let mut next = Some(first);
        while let Some(msg) = next.take() {
            match msg {
                StreamMsg::Replicate { entry, commit_index } => {
                    self.last_log_index = entry.index;
                    self.commit_index = commit_index;
                }
                StreamMsg::Commit { commit_index } => {
                    self.commit_index = commit_index;
                }
                StreamMsg::Terminate => {
                    self.state = StreamState::Shutdown;
                    return;
                }
            }
            if let Some(Some(msg)) = self.rx.recv().now_or_never() {
                next = Some(msg);
            }
        }
    }

    /// Send one AppendEntries payload. Returns false on transport failure.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) -> bool {
        let entries = match self.fetch_payload().await {
            Ok(entries) => entries,
            Err(()) => return false,
        };
        if self.state != StreamState::Streaming {
            return true;
        }

        let last_sent = entries.last().map(|e| e.log_id());
        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_index: self.matched.index,
            prev_log_term: self.matched.term,
            entries,
            leader_commit: self.commit_index,
        };

        let res = match timeout(
            self.heartbeat_timeout,
            self.network.send_append_entries(&self.target, rpc),
        )
        .await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(target = %self.target, error = %err, "error sending AppendEntries");
                return false;
            }
            Err(_) => {
                tracing::warn!(target = %self.target, "timeout sending AppendEntries");
                return false;
            }
        };

        if res.success {
            if let Some(log_id) = last_sent {
                self.matched = log_id;
                self.next_index = log_id.index + 1;
            }
            if self.matched.index != self.reported || self.reported == u64::MAX {
                self.reported = self.matched.index;
                let _ = self.core_tx.send(ReplicaEvent::Matched {
                    target: self.target.clone(),
                    matched: self.matched,
                });
            }
            return true;
        }

        if res.term > self.term {
            tracing::debug!(target = %self.target, term = res.term, "target term is newer, stepping down");
            let _ = self.core_tx.send(ReplicaEvent::HigherTerm {
                target: self.target.clone(),
                term: res.term,
            });
            self.state = StreamState::Shutdown;
            return true;
        }

        // Log mismatch: rewind to the follower's hint and retry.
        let hint = res.conflict_hint.unwrap_or(self.matched.index).max(1);
        self.next_index = hint;
        self.rewind_matched(hint).await;
        true
    }

    /// Point `matched` at the entry just before `next`, falling back to
    /// snapshotting when that entry is no longer retained.
    async fn rewind_matched(&mut self, next: u64) {
        if next <= 1 {
            self.matched = LogId::default();
            return;
        }
        match self.log.entry(next - 1).await {
            Ok(Some(entry)) => self.matched = entry.log_id(),
            Ok(None) => {
                // Purged into the snapshot.
                self.state = StreamState::Snapshotting;
            }
            Err(err) => {
                tracing::error!(error = %err, "storage error while rewinding replication stream");
                self.state = StreamState::Shutdown;
            }
        }
    }

    /// Fetch the next payload from the log store. `Err(())` signals a
    /// transient condition already handled (state change or storage error).
    async fn fetch_payload(&mut self) -> Result<Vec<LogEntry>, ()> {
        if self.next_index > self.last_log_index {
            return Ok(Vec::new());
        }
        let stop = self
            .last_log_index
            .saturating_add(1)
            .min(self.next_index + self.config.max_payload_entries);
        match self.log.entries(self.next_index..stop).await {
            Ok(entries) => {
                if entries.is_empty() || entries[0].index != self.next_index {
                    // The range was compacted away under us.
                    self.state = StreamState::Snapshotting;
                    return Err(());
                }
                Ok(entries)
            }
            Err(err) => {
                tracing::error!(error = %err, "storage error while fetching replication payload");
                self.state = StreamState::Shutdown;
                Err(())
            }
        }
    }

    /// Bring the target up to speed from the current snapshot.
    #[tracing::instrument(level = "trace", skip(self), fields(target = %self.target))]
    async fn install_snapshot(&mut self) {
        let snapshot = match self.log.current_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                // Entries were purged but no snapshot exists; nothing to do
                // except fall back and let the conflict loop retry.
                tracing::error!(target = %self.target, "no snapshot available for lagging target");
                self.state = StreamState::Shutdown;
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "storage error fetching snapshot");
                self.state = StreamState::Shutdown;
                return;
            }
        };

        let meta = snapshot.meta.clone();
        let rpc = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.id.clone(),
            meta: meta.clone(),
            data: snapshot.data,
        };

        let res = match timeout(
            self.install_snapshot_timeout,
            self.network.send_install_snapshot(&self.target, rpc),
        )
        .await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(target = %self.target, error = %err, "error sending InstallSnapshot");
                self.pause_before_retry().await;
                return;
            }
            Err(_) => {
                tracing::warn!(target = %self.target, "timeout sending InstallSnapshot");
                self.pause_before_retry().await;
                return;
            }
        };

        if res.term > self.term {
            let _ = self.core_tx.send(ReplicaEvent::HigherTerm {
                target: self.target.clone(),
                term: res.term,
            });
            self.state = StreamState::Shutdown;
            return;
        }

        self.matched = meta.last_included;
        self.next_index = meta.last_included.index + 1;
        self.reported = self.matched.index;
        let _ = self.core_tx.send(ReplicaEvent::Matched {
            target: self.target.clone(),
            matched: self.matched,
        });
        self.state = StreamState::Streaming;
    }

    async fn pause_before_retry(&mut self) {
        tokio::select! {
            _ = sleep(self.heartbeat_timeout) => {}
            msg = self.rx.recv() => match msg {
                Some(msg) => self.drain_msgs(msg),
                None => self.state = StreamState::Shutdown,
            }
        }
    }
}
