//! Cross-DC consistency estimation and catch-up.
//!
//! A periodic snapshot pass collects `{last_index, last_term, checksum}` per
//! DC and condenses them into a consistency score. When the failure detector
//! reports a DC as recovering, the catch-up driver replays the missing log
//! range from an authoritative DC through the async replicator, verifies the
//! checksum, and escalates to a snapshot install when verification fails.
//! Catch-up is rate limited and never blocks foreground writes.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep;

use crate::config::Config;
use crate::config::RecoveryConfig;
use crate::multidc::detector::DetectorEvent;
use crate::multidc::detector::HealthView;
use crate::multidc::replicator::BatchPriority;
use crate::multidc::replicator::Replicator;
use crate::network::BatchTransport;
use crate::raft::LogEntry;
use crate::storage::SnapshotData;
use crate::DcId;
use crate::NodeId;

/// Applied-state summary of one DC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DcConsistency {
    pub last_index: u64,
    pub last_term: u64,
    pub checksum: u64,
}

/// A point-in-time view of cross-DC agreement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsistencySnapshot {
    pub timestamp: DateTime<Utc>,
    pub per_dc: HashMap<DcId, DcConsistency>,
    pub globally_consistent: bool,
    /// `(fraction of DCs current) * (1 - normalized lag)`, in `[0, 1]`.
    pub score: f64,
}

/// Reads the applied-state summary of any DC.
#[async_trait]
pub trait DcStateSource: Send + Sync + 'static {
    async fn dc_state(&self, dc: &DcId) -> Result<DcConsistency>;
}

/// Read access to an authoritative DC's log and snapshot for catch-up.
#[async_trait]
pub trait CatchUpSource: Send + Sync + 'static {
    /// Entries `[range.start, range.end)` as committed at `dc`.
    async fn entries(&self, dc: &DcId, range: Range<u64>) -> Result<Vec<LogEntry>>;

    /// A full snapshot of `dc`'s state machine.
    async fn snapshot(&self, dc: &DcId) -> Result<SnapshotData>;
}

/// Read-only access to the latest consistency score.
pub trait ScoreView: Send + Sync + 'static {
    fn consistency_score(&self) -> Option<f64>;
}

impl<S, C, H, T> ScoreView for RecoveryManager<S, C, H, T>
where
    S: DcStateSource,
    C: CatchUpSource,
    H: HealthView,
    T: BatchTransport,
{
    fn consistency_score(&self) -> Option<f64> {
        self.latest().map(|s| s.score)
    }
}

/// Drives consistency snapshots and per-DC catch-up.
pub struct RecoveryManager<S, C, H, T>
where
    S: DcStateSource,
    C: CatchUpSource,
    H: HealthView,
    T: BatchTransport,
{
    cfg: RecoveryConfig,
    primary_dc: DcId,
    all_dcs: Vec<DcId>,
    nodes_by_dc: HashMap<DcId, Vec<NodeId>>,
    source: Arc<S>,
    catch_up: Arc<C>,
    health: Arc<H>,
    replicator: Arc<Replicator<T>>,
    transport: Arc<T>,
    latest: watch::Sender<Option<ConsistencySnapshot>>,
}

impl<S, C, H, T> RecoveryManager<S, C, H, T>
where
    S: DcStateSource,
    C: CatchUpSource,
    H: HealthView,
    T: BatchTransport,
{
    pub fn new(
        config: &Config,
        source: Arc<S>,
        catch_up: Arc<C>,
        health: Arc<H>,
        replicator: Arc<Replicator<T>>,
        transport: Arc<T>,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        let primary_dc = config
            .primary_dc()
            .map(|d| d.id.clone())
            .unwrap_or_else(|| DcId::new("default"));
        Self {
            cfg: config.recovery.clone(),
            primary_dc,
            all_dcs: config.datacenters.iter().map(|d| d.id.clone()).collect(),
            nodes_by_dc: config
                .datacenters
                .iter()
                .map(|d| {
                    (
                        d.id.clone(),
                        config.nodes_in_dc(&d.id).iter().map(|s| s.id.clone()).collect(),
                    )
                })
                .collect(),
            source,
            catch_up,
            health,
            replicator,
            transport,
            latest,
        }
    }

    /// The most recent consistency snapshot, if one has been taken.
    pub fn latest(&self) -> Option<ConsistencySnapshot> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<ConsistencySnapshot>> {
        self.latest.subscribe()
    }

    /// Spawn the snapshot loop and the detector-event-driven catch-up loop.
    pub fn start(self: &Arc<Self>, mut events: broadcast::Receiver<DetectorEvent>) -> Vec<JoinHandle<()>> {
        let snapshotter = {
            let this = self.clone();
            crate::supervise("consistency-snapshots", move || {
                let this = this.clone();
                async move {
                    let mut ticker = interval(Duration::from_millis(this.cfg.snapshot_interval.max(1)));
                    loop {
                        ticker.tick().await;
                        this.take_snapshot().await;
                    }
                }
            })
        };

        let this = self.clone();
        let recoverer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DetectorEvent::Recovering { dc }) => {
                        if let Err(err) = this.recover_dc(&dc).await {
                            tracing::error!(dc = %dc, error = %err, "dc catch-up failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "recovery loop lagged behind detector events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        vec![snapshotter, recoverer]
    }

    /// Collect one consistency snapshot across all DCs.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn take_snapshot(&self) -> Option<ConsistencySnapshot> {
        let mut per_dc = HashMap::new();
        for dc in &self.all_dcs {
            match self.source.dc_state(dc).await {
                Ok(state) => {
                    per_dc.insert(dc.clone(), state);
                }
                Err(err) => {
                    tracing::debug!(dc = %dc, error = %err, "dc state unavailable for snapshot");
                }
            }
        }
        if per_dc.is_empty() {
            return None;
        }

        let max_index = per_dc.values().map(|s| s.last_index).max().unwrap_or(0);
        let min_index = per_dc.values().map(|s| s.last_index).min().unwrap_or(0);
        let max_lag = max_index - min_index;

        let checksums_agree = {
            let mut iter = per_dc.values().map(|s| s.checksum);
            let first = iter.next();
            first.map(|f| iter.all(|c| c == f)).unwrap_or(true)
        };
        let globally_consistent = checksums_agree && max_lag <= self.cfg.max_lag_tolerance;

        let current = per_dc
            .values()
            .filter(|s| max_index - s.last_index <= self.cfg.max_lag_tolerance)
            .count();
        let fraction_current = current as f64 / per_dc.len() as f64;
        // Lag saturates at ten tolerances.
        let lag_scale = (self.cfg.max_lag_tolerance.max(1) * 10) as f64;
        let normalized_lag = (max_lag as f64 / lag_scale).min(1.0);
        let score = fraction_current * (1.0 - normalized_lag);

        let snapshot = ConsistencySnapshot {
            timestamp: Utc::now(),
            per_dc,
            globally_consistent,
            score,
        };
        let _ = self.latest.send(Some(snapshot.clone()));
        Some(snapshot)
    }

    /// Pick the authoritative DC for catch-up: the primary DC when healthy,
    /// else the DC with the highest applied index.
    async fn authoritative_for(&self, recovering: &DcId) -> Result<(DcId, DcConsistency)> {
        if &self.primary_dc != recovering && self.health.is_dc_healthy(&self.primary_dc) {
            let state = self.source.dc_state(&self.primary_dc).await?;
            return Ok((self.primary_dc.clone(), state));
        }
        // Local DCs are not tracked by the detector, which only watches
        // remote DCs; treat the primary DC as a candidate regardless.
        let mut best: Option<(DcId, DcConsistency)> = None;
        for dc in &self.all_dcs {
            if dc == recovering {
                continue;
            }
            if let Ok(state) = self.source.dc_state(dc).await {
                if best.as_ref().map(|(_, b)| state.last_index > b.last_index).unwrap_or(true) {
                    best = Some((dc.clone(), state));
                }
            }
        }
        best.ok_or_else(|| anyhow::anyhow!("no authoritative dc available"))
    }

    /// Replay the missing range into `dc` and verify the result.
    #[tracing::instrument(level = "info", skip(self), fields(dc = %dc))]
    pub async fn recover_dc(&self, dc: &DcId) -> Result<()> {
        let behind = self.source.dc_state(dc).await?;
        let (auth_dc, auth) = self.authoritative_for(dc).await?;
        if behind.last_index >= auth.last_index {
            tracing::info!(dc = %dc, "dc already caught up");
            return self.verify_or_escalate(dc, &auth_dc).await;
        }

        tracing::info!(
            dc = %dc,
            from = behind.last_index + 1,
            to = auth.last_index,
            authority = %auth_dc,
            "starting dc catch-up"
        );

        let chunk = self.cfg.catch_up_chunk.max(1) as u64;
        let mut next = behind.last_index + 1;
        while next <= auth.last_index {
            let stop = (next + chunk).min(auth.last_index + 1);
            let entries = self.catch_up.entries(&auth_dc, next..stop).await?;
            if entries.is_empty() {
                // The range was compacted at the authority; only a snapshot
                // can cover it.
                return self.install_snapshot_from(dc, &auth_dc).await;
            }
            let count = entries.len() as u64;
            self.replicator
                .replicate_to(dc, entries, BatchPriority::High)
                .await?;
            next += count;

            // Bounded bandwidth.
            let budget = self.cfg.rate_limit_entries_per_sec.max(1);
            sleep(Duration::from_millis(count * 1_000 / budget)).await;
        }

        // Give the replicator time to drain, then verify.
        for _ in 0..50 {
            let state = self.source.dc_state(dc).await?;
            if state.last_index >= auth.last_index {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        self.verify_or_escalate(dc, &auth_dc).await
    }

    /// Compare checksums against the authority; install a snapshot when they
    /// disagree.
    async fn verify_or_escalate(&self, dc: &DcId, auth_dc: &DcId) -> Result<()> {
        let behind = self.source.dc_state(dc).await?;
        let auth = self.source.dc_state(auth_dc).await?;
        if behind.last_index >= auth.last_index && behind.checksum == auth.checksum {
            tracing::info!(dc = %dc, "dc catch-up verified");
            return Ok(());
        }
        tracing::warn!(
            dc = %dc,
            dc_checksum = behind.checksum,
            auth_checksum = auth.checksum,
            "catch-up verification failed, escalating to snapshot install"
        );
        self.install_snapshot_from(dc, auth_dc).await
    }

    async fn install_snapshot_from(&self, dc: &DcId, auth_dc: &DcId) -> Result<()> {
        let snapshot = self.catch_up.snapshot(auth_dc).await?;
        let nodes = self
            .nodes_by_dc
            .get(dc)
            .cloned()
            .unwrap_or_default();
        let mut any_ok = false;
        let mut last_err = None;
        for node in &nodes {
            match self.transport.send_snapshot(node, snapshot.clone()).await {
                Ok(()) => {
                    any_ok = true;
                    tracing::info!(dc = %dc, node = %node, "recovery snapshot installed");
                }
                Err(err) => {
                    tracing::warn!(dc = %dc, node = %node, error = %err, "snapshot install failed");
                    last_err = Some(err);
                }
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no nodes configured for dc {dc}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::config::DataCenter;
    use crate::config::ReplicaRole;
    use crate::config::Server;
    use crate::network::BatchAck;
    use crate::network::BatchEnvelope;
    use crate::storage::SnapshotMeta;
    use crate::LogId;

    /// One struct backing every recovery collaborator: authoritative log,
    /// per-DC applied state, transport that applies delivered batches.
    struct TestBackend {
        log: Vec<LogEntry>,
        states: Mutex<HashMap<DcId, DcConsistency>>,
        /// When set, dc2's checksum stays wrong until a snapshot lands.
        corrupt: Mutex<bool>,
        snapshots_installed: Mutex<u32>,
    }

    impl TestBackend {
        fn new(auth_last: u64, behind_last: u64, corrupt: bool) -> Self {
            let log: Vec<LogEntry> = (1..=auth_last)
                .map(|i| LogEntry::normal(i, 1, format!("v{i}").into_bytes()))
                .collect();
            let mut states = HashMap::new();
            states.insert(
                DcId::new("dc1"),
                DcConsistency {
                    last_index: auth_last,
                    last_term: 1,
                    checksum: 42,
                },
            );
            states.insert(
                DcId::new("dc2"),
                DcConsistency {
                    last_index: behind_last,
                    last_term: 1,
                    checksum: if behind_last == auth_last && !corrupt { 42 } else { 7 },
                },
            );
            Self {
                log,
                states: Mutex::new(states),
                corrupt: Mutex::new(corrupt),
                snapshots_installed: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl DcStateSource for TestBackend {
        async fn dc_state(&self, dc: &DcId) -> Result<DcConsistency> {
            self.states
                .lock()
                .unwrap()
                .get(dc)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown dc"))
        }
    }

    #[async_trait]
    impl CatchUpSource for TestBackend {
        async fn entries(&self, _dc: &DcId, range: Range<u64>) -> Result<Vec<LogEntry>> {
            Ok(self
                .log
                .iter()
                .filter(|e| range.contains(&e.index))
                .cloned()
                .collect())
        }

        async fn snapshot(&self, _dc: &DcId) -> Result<SnapshotData> {
            Ok(SnapshotData {
                meta: SnapshotMeta {
                    last_included: LogId::new(1, self.log.len() as u64),
                    membership: Default::default(),
                },
                data: b"snapshot".to_vec(),
            })
        }
    }

    #[async_trait]
    impl BatchTransport for TestBackend {
        async fn send_batch(&self, _target: &NodeId, batch: BatchEnvelope) -> Result<BatchAck> {
            let entries =
                crate::multidc::replicator::decode_payload(&batch.payload, batch.compressed)?;
            let last = entries.last().map(|e| e.index).unwrap_or(0);
            let mut states = self.states.lock().unwrap();
            let state = states.get_mut(&batch.target_dc).unwrap();
            state.last_index = state.last_index.max(last);
            let done = state.last_index as usize >= self.log.len();
            if done && !*self.corrupt.lock().unwrap() {
                state.checksum = 42;
            }
            Ok(BatchAck {
                batch_id: batch.batch_id,
                last_applied_index: state.last_index,
            })
        }

        async fn send_snapshot(&self, _target: &NodeId, snapshot: SnapshotData) -> Result<()> {
            *self.snapshots_installed.lock().unwrap() += 1;
            *self.corrupt.lock().unwrap() = false;
            let mut states = self.states.lock().unwrap();
            let state = states.get_mut(&DcId::new("dc2")).unwrap();
            state.last_index = snapshot.meta.last_included.index;
            state.checksum = 42;
            Ok(())
        }
    }

    struct AlwaysHealthy;

    impl HealthView for AlwaysHealthy {
        fn is_dc_healthy(&self, _dc: &DcId) -> bool {
            true
        }
    }

    fn config() -> Arc<Config> {
        let mut recovery = RecoveryConfig::default();
        recovery.catch_up_chunk = 2;
        recovery.rate_limit_entries_per_sec = 100_000;
        recovery.max_lag_tolerance = 1;
        let mut repl = crate::config::ReplicatorConfig::default();
        repl.flush_interval = 5;
        Arc::new(
            Config::build("recovery-test")
                .datacenter(DataCenter::new("dc1", "east").primary())
                .datacenter(DataCenter::new("dc2", "west"))
                .server(Server {
                    id: "n1".into(),
                    address: "10.0.0.1:7000".to_string(),
                    dc: "dc1".into(),
                    replica_role: ReplicaRole::Primary,
                })
                .server(Server {
                    id: "n4".into(),
                    address: "10.0.1.1:7000".to_string(),
                    dc: "dc2".into(),
                    replica_role: ReplicaRole::AsyncReplica,
                })
                .recovery(recovery)
                .replicator(repl)
                .validate()
                .unwrap(),
        )
    }

    fn manager(
        backend: Arc<TestBackend>,
    ) -> Arc<RecoveryManager<TestBackend, TestBackend, AlwaysHealthy, TestBackend>> {
        let config = config();
        let replicator = Arc::new(Replicator::new(config.clone(), "dc1".into(), backend.clone()));
        replicator.start();
        Arc::new(RecoveryManager::new(
            &config,
            backend.clone(),
            backend.clone(),
            Arc::new(AlwaysHealthy),
            replicator,
            backend,
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_scores_divergence() {
        let backend = Arc::new(TestBackend::new(10, 2, false));
        let manager = manager(backend);
        let snapshot = manager.take_snapshot().await.unwrap();
        assert!(!snapshot.globally_consistent);
        assert!(snapshot.score < 1.0);
        assert_eq!(snapshot.per_dc.len(), 2);

        // Watchable.
        assert!(manager.latest().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_reports_consistency() {
        let backend = Arc::new(TestBackend::new(5, 5, false));
        let manager = manager(backend);
        let snapshot = manager.take_snapshot().await.unwrap();
        assert!(snapshot.globally_consistent);
        assert!((snapshot.score - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catch_up_replays_missing_range() {
        let backend = Arc::new(TestBackend::new(10, 3, false));
        let manager = manager(backend.clone());
        manager.recover_dc(&"dc2".into()).await.unwrap();

        let state = backend.states.lock().unwrap();
        let dc2 = state.get(&DcId::new("dc2")).unwrap();
        assert_eq!(dc2.last_index, 10);
        assert_eq!(dc2.checksum, 42);
        assert_eq!(*backend.snapshots_installed.lock().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checksum_mismatch_escalates_to_snapshot() {
        let backend = Arc::new(TestBackend::new(6, 4, true));
        let manager = manager(backend.clone());
        manager.recover_dc(&"dc2".into()).await.unwrap();

        assert_eq!(*backend.snapshots_installed.lock().unwrap(), 1);
        let state = backend.states.lock().unwrap();
        let dc2 = state.get(&DcId::new("dc2")).unwrap();
        assert_eq!(dc2.checksum, 42);
        assert_eq!(dc2.last_index, 6);
    }
}
