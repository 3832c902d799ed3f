//! DC-level failure detection.
//!
//! Each remote DC walks `Healthy -> Suspect -> Failed -> Recovering ->
//! Healthy`. A single bad signal only raises suspicion; failure is confirmed
//! when enough independent signal sources agree within the confirmation
//! window, which keeps the false-positive rate low. Signal sources are the
//! Raft heartbeat tracker, the replicator's target health, active probes and
//! replication lag.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::Instant;

use crate::config::Config;
use crate::config::DetectorConfig;
use crate::network::ProbeError;
use crate::network::Prober;
use crate::DcId;
use crate::NodeId;

/// Health of one datacenter as seen by the detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcHealth {
    Healthy,
    Suspect,
    Failed,
    Recovering,
}

/// Classified cause of a DC failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    Timeout,
    NetworkPartition,
    ProcessDown,
    ResourceExhaustion,
}

/// How bad a confirmed failure is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// A confirmed or in-progress failure of one DC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub dc_id: DcId,
    pub detection_time: DateTime<Utc>,
    pub failure_type: FailureType,
    pub severity: Severity,
    pub confirmation_count: u32,
    pub confirmed: bool,
}

/// An independent evidence source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalSource {
    Heartbeat,
    ReplicatorHealth,
    Probe,
    ReplicationLag,
}

/// Emitted on every health transition.
#[derive(Clone, Debug)]
pub enum DetectorEvent {
    Suspect { dc: DcId },
    Failed { record: FailureRecord },
    Recovering { dc: DcId },
    Healthy { dc: DcId },
}

struct Signal {
    source: SignalSource,
    at: Instant,
    failure_type: FailureType,
}

struct DcRecord {
    health: DcHealth,
    last_heartbeat: Instant,
    signals: Vec<Signal>,
    recovery_streak: u32,
    failure: Option<FailureRecord>,
    avg_probe_ms: f64,
}

impl DcRecord {
    fn new() -> Self {
        Self {
            health: DcHealth::Healthy,
            last_heartbeat: Instant::now(),
            signals: Vec::new(),
            recovery_streak: 0,
            failure: None,
            avg_probe_ms: 0.0,
        }
    }

    fn prune_signals(&mut self, window: Duration) {
        self.signals.retain(|s| s.at.elapsed() <= window);
    }

    fn confirmation_count(&self) -> u32 {
        let distinct: HashSet<SignalSource> = self.signals.iter().map(|s| s.source).collect();
        distinct.len() as u32
    }

    /// Correlate signal evidence into a failure classification.
    fn classify(&self) -> FailureType {
        let types: HashSet<FailureType> = self.signals.iter().map(|s| s.failure_type).collect();
        if types.contains(&FailureType::ProcessDown) {
            FailureType::ProcessDown
        } else if types.contains(&FailureType::NetworkPartition) {
            FailureType::NetworkPartition
        } else if types.contains(&FailureType::ResourceExhaustion) {
            FailureType::ResourceExhaustion
        } else {
            FailureType::Timeout
        }
    }
}

fn severity_of(failure_type: FailureType, confirmations: u32, min_confirmations: u32) -> Severity {
    match failure_type {
        FailureType::ProcessDown => Severity::Critical,
        FailureType::NetworkPartition => Severity::Major,
        FailureType::ResourceExhaustion => Severity::Minor,
        FailureType::Timeout => {
            if confirmations > min_confirmations {
                Severity::Major
            } else {
                Severity::Minor
            }
        }
    }
}

/// Read-only DC health, for subsystems that only need yes/no answers.
pub trait HealthView: Send + Sync + 'static {
    fn is_dc_healthy(&self, dc: &DcId) -> bool;
}

impl<P: Prober> HealthView for FailureDetector<P> {
    fn is_dc_healthy(&self, dc: &DcId) -> bool {
        self.is_healthy(dc)
    }
}

/// The DC failure detector.
pub struct FailureDetector<P: Prober> {
    cfg: DetectorConfig,
    prober: Arc<P>,
    /// One lock per DC record.
    dcs: HashMap<DcId, Mutex<DcRecord>>,
    nodes_by_dc: HashMap<DcId, Vec<NodeId>>,
    events: broadcast::Sender<DetectorEvent>,
}

impl<P: Prober> FailureDetector<P> {
    /// Track every DC other than the local one.
    pub fn new(config: &Config, local_dc: &DcId, prober: Arc<P>) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut dcs = HashMap::new();
        let mut nodes_by_dc = HashMap::new();
        for dc in config.remote_dcs(local_dc) {
            dcs.insert(dc.id.clone(), Mutex::new(DcRecord::new()));
            nodes_by_dc.insert(
                dc.id.clone(),
                config.nodes_in_dc(&dc.id).iter().map(|s| s.id.clone()).collect(),
            );
        }
        Self {
            cfg: config.detector.clone(),
            prober,
            dcs,
            nodes_by_dc,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    pub fn health(&self, dc: &DcId) -> Option<DcHealth> {
        self.dcs.get(dc).map(|r| r.lock().unwrap().health)
    }

    /// Whether a DC is healthy. DCs the detector does not track (including
    /// the local one) are assumed healthy.
    pub fn is_healthy(&self, dc: &DcId) -> bool {
        self.health(dc).map_or(true, |h| h == DcHealth::Healthy)
    }

    /// All failures currently confirmed or suspected.
    pub fn get_current_failures(&self) -> Vec<FailureRecord> {
        self.dcs
            .values()
            .filter_map(|r| r.lock().unwrap().failure.clone())
            .collect()
    }

    /// A heartbeat (or any proof of liveness) arrived from the DC.
    pub fn report_heartbeat(&self, dc: &DcId) {
        self.record_success(dc, None);
    }

    /// Replicator target health changed.
    pub fn report_replication_health(&self, dc: &DcId, healthy: bool) {
        if healthy {
            self.record_success(dc, None);
        } else {
            self.raise_signal(dc, SignalSource::ReplicatorHealth, FailureType::Timeout);
        }
    }

    /// Replication lag crossed the configured tolerance.
    pub fn report_replication_lag(&self, dc: &DcId, lag: u64, tolerance: u64) {
        if lag > tolerance {
            self.raise_signal(dc, SignalSource::ReplicationLag, FailureType::ResourceExhaustion);
        }
    }

    /// Spawn the background worker: heartbeat staleness checks plus an
    /// active probe sweep per tick.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        crate::supervise("dc-failure-detector", move || {
            let this = this.clone();
            async move {
                let mut ticker = interval(Duration::from_millis(this.cfg.probe_interval.max(1)));
                loop {
                    ticker.tick().await;
                    this.check_heartbeats();
                    this.probe_pass().await;
                }
            }
        })
    }

    /// One heartbeat staleness check over all tracked DCs.
    pub fn check_heartbeats(&self) {
        let stale_after = Duration::from_millis(
            (self.cfg.heartbeat_interval as f64 * self.cfg.suspect_factor) as u64,
        );
        for dc in self.dcs.keys() {
            let stale = {
                let record = self.dcs[dc].lock().unwrap();
                record.last_heartbeat.elapsed() > stale_after
            };
            if stale {
                self.raise_signal(dc, SignalSource::Heartbeat, FailureType::Timeout);
            }
        }
    }

    /// One active probe sweep over all tracked DCs.
    pub async fn probe_pass(&self) {
        for (dc, nodes) in &self.nodes_by_dc {
            if nodes.is_empty() {
                continue;
            }
            let mut successes = 0usize;
            let mut best_latency: Option<Duration> = None;
            let mut errors: Vec<ProbeError> = Vec::new();
            for node in nodes {
                match self.prober.probe(node).await {
                    Ok(rtt) => {
                        successes += 1;
                        best_latency = Some(best_latency.map_or(rtt, |b| b.min(rtt)));
                    }
                    Err(err) => errors.push(err),
                }
            }

            if successes == nodes.len() {
                self.record_success(dc, best_latency);
            } else if successes > 0 {
                // Partial reachability: some nodes answer, some do not.
                self.raise_signal(dc, SignalSource::Probe, FailureType::NetworkPartition);
            } else {
                let failure_type = if errors.iter().any(|e| *e == ProbeError::Refused) {
                    FailureType::ProcessDown
                } else if errors.iter().any(|e| *e == ProbeError::Unreachable) {
                    FailureType::NetworkPartition
                } else {
                    FailureType::Timeout
                };
                self.raise_signal(dc, SignalSource::Probe, failure_type);
            }
        }
    }

    /// Record one piece of failure evidence and run the state machine.
    fn raise_signal(&self, dc: &DcId, source: SignalSource, failure_type: FailureType) {
        let record = match self.dcs.get(dc) {
            Some(record) => record,
            None => return,
        };
        let event = {
            let mut record = record.lock().unwrap();
            record.recovery_streak = 0;
            record.signals.push(Signal {
                source,
                at: Instant::now(),
                failure_type,
            });
            record.prune_signals(Duration::from_millis(self.cfg.confirmation_window));
            let confirmations = record.confirmation_count();

            match record.health {
                DcHealth::Healthy => {
                    record.health = DcHealth::Suspect;
                    record.failure = Some(FailureRecord {
                        dc_id: dc.clone(),
                        detection_time: Utc::now(),
                        failure_type: record.classify(),
                        severity: severity_of(failure_type, confirmations, self.cfg.min_confirmations),
                        confirmation_count: confirmations,
                        confirmed: false,
                    });
                    Some(DetectorEvent::Suspect { dc: dc.clone() })
                }
                DcHealth::Suspect => {
                    let failure_type = record.classify();
                    let confirmed = confirmations >= self.cfg.min_confirmations;
                    let failure = FailureRecord {
                        dc_id: dc.clone(),
                        detection_time: record
                            .failure
                            .as_ref()
                            .map(|f| f.detection_time)
                            .unwrap_or_else(Utc::now),
                        failure_type,
                        severity: severity_of(failure_type, confirmations, self.cfg.min_confirmations),
                        confirmation_count: confirmations,
                        confirmed,
                    };
                    record.failure = Some(failure.clone());
                    if confirmed {
                        record.health = DcHealth::Failed;
                        Some(DetectorEvent::Failed { record: failure })
                    } else {
                        None
                    }
                }
                DcHealth::Failed | DcHealth::Recovering => {
                    if record.health == DcHealth::Recovering {
                        // Recovery interrupted.
                        record.health = DcHealth::Failed;
                    }
                    if let Some(failure) = record.failure.as_mut() {
                        failure.confirmation_count = confirmations.max(failure.confirmation_count);
                    }
                    None
                }
            }
        };
        if let Some(event) = event {
            tracing::info!(dc = %dc, ?event, "dc health transition");
            let _ = self.events.send(event);
        }
    }

    /// Record a liveness success and run the recovery side of the state
    /// machine. A latency spike with success classifies as resource
    /// exhaustion rather than recovery evidence.
    fn record_success(&self, dc: &DcId, latency: Option<Duration>) {
        let record = match self.dcs.get(dc) {
            Some(record) => record,
            None => return,
        };
        let mut spike = false;
        let event = {
            let mut record = record.lock().unwrap();
            record.last_heartbeat = Instant::now();

            if let Some(latency) = latency {
                let ms = latency.as_secs_f64() * 1_000.0;
                if record.avg_probe_ms > 0.0 && ms > record.avg_probe_ms * self.cfg.latency_spike_factor
                {
                    spike = true;
                } else {
                    record.avg_probe_ms = if record.avg_probe_ms == 0.0 {
                        ms
                    } else {
                        0.8 * record.avg_probe_ms + 0.2 * ms
                    };
                }
            }

            if spike {
                None
            } else {
                match record.health {
                    DcHealth::Healthy => None,
                    DcHealth::Suspect => {
                        record.health = DcHealth::Healthy;
                        record.signals.clear();
                        record.failure = None;
                        Some(DetectorEvent::Healthy { dc: dc.clone() })
                    }
                    DcHealth::Failed => {
                        record.health = DcHealth::Recovering;
                        record.recovery_streak = 1;
                        Some(DetectorEvent::Recovering { dc: dc.clone() })
                    }
                    DcHealth::Recovering => {
                        record.recovery_streak += 1;
                        if record.recovery_streak >= self.cfg.recovery_streak {
                            record.health = DcHealth::Healthy;
                            record.signals.clear();
                            record.failure = None;
                            record.recovery_streak = 0;
                            Some(DetectorEvent::Healthy { dc: dc.clone() })
                        } else {
                            None
                        }
                    }
                }
            }
        };

        if spike {
            self.raise_signal(dc, SignalSource::Probe, FailureType::ResourceExhaustion);
            return;
        }
        if let Some(event) = event {
            tracing::info!(dc = %dc, ?event, "dc health transition");
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use async_trait::async_trait;

    use crate::config::DataCenter;
    use crate::config::ReplicaRole;
    use crate::config::Server;

    /// Prober scripted per node.
    struct ScriptedProber {
        script: Mutex<HashMap<NodeId, VecDeque<Result<Duration, ProbeError>>>>,
        fallback: Result<Duration, ProbeError>,
    }

    impl ScriptedProber {
        fn new(fallback: Result<Duration, ProbeError>) -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                fallback,
            }
        }

        fn push(&self, node: &str, outcome: Result<Duration, ProbeError>) {
            self.script
                .lock()
                .unwrap()
                .entry(node.into())
                .or_default()
                .push_back(outcome);
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, target: &NodeId) -> Result<Duration, ProbeError> {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(target).and_then(|q| q.pop_front()) {
                Some(outcome) => outcome,
                None => self.fallback,
            }
        }
    }

    fn detector(fallback: Result<Duration, ProbeError>) -> Arc<FailureDetector<ScriptedProber>> {
        let mut det_cfg = DetectorConfig::default();
        det_cfg.min_confirmations = 3;
        det_cfg.recovery_streak = 2;
        det_cfg.heartbeat_interval = 10;
        det_cfg.suspect_factor = 1.0;
        let config = Config::build("detector-test")
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
            .server(Server {
                id: "n5".into(),
                address: "10.0.1.2:7000".to_string(),
                dc: "dc2".into(),
                replica_role: ReplicaRole::AsyncReplica,
            })
            .detector(det_cfg)
            .validate()
            .unwrap();
        Arc::new(FailureDetector::new(
            &config,
            &"dc1".into(),
            Arc::new(ScriptedProber::new(fallback)),
        ))
    }

    #[tokio::test]
    async fn requires_min_confirmations_to_fail() {
        let detector = detector(Err(ProbeError::Timeout));
        let dc2: DcId = "dc2".into();

        // One source: only Suspect.
        detector.raise_signal(&dc2, SignalSource::Heartbeat, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Suspect));
        detector.raise_signal(&dc2, SignalSource::Heartbeat, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Suspect));

        // Second and third independent sources confirm.
        detector.raise_signal(&dc2, SignalSource::ReplicatorHealth, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Suspect));
        detector.raise_signal(&dc2, SignalSource::Probe, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Failed));

        let failures = detector.get_current_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].confirmed);
        assert_eq!(failures[0].confirmation_count, 3);
    }

    #[tokio::test]
    async fn recovery_needs_streak() {
        let detector = detector(Ok(Duration::from_millis(5)));
        let dc2: DcId = "dc2".into();

        detector.raise_signal(&dc2, SignalSource::Heartbeat, FailureType::Timeout);
        detector.raise_signal(&dc2, SignalSource::ReplicatorHealth, FailureType::Timeout);
        detector.raise_signal(&dc2, SignalSource::Probe, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Failed));

        // First success: Recovering, not yet Healthy.
        detector.report_heartbeat(&dc2);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Recovering));
        detector.report_heartbeat(&dc2);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Healthy));
        assert!(detector.get_current_failures().is_empty());
    }

    #[tokio::test]
    async fn partial_reachability_classifies_as_partition() {
        let detector = detector(Ok(Duration::from_millis(5)));
        let dc2: DcId = "dc2".into();

        // n4 answers, n5 does not: a partial partition.
        detector.prober.push("n5", Err(ProbeError::Unreachable));
        detector.probe_pass().await;
        assert_eq!(detector.health(&dc2), Some(DcHealth::Suspect));
        let failures = detector.get_current_failures();
        assert_eq!(failures[0].failure_type, FailureType::NetworkPartition);
    }

    #[tokio::test]
    async fn connect_refused_classifies_as_process_down() {
        let detector = detector(Err(ProbeError::Refused));
        let dc2: DcId = "dc2".into();

        detector.probe_pass().await;
        detector.raise_signal(&dc2, SignalSource::Heartbeat, FailureType::Timeout);
        detector.raise_signal(&dc2, SignalSource::ReplicatorHealth, FailureType::Timeout);
        assert_eq!(detector.health(&dc2), Some(DcHealth::Failed));
        let failures = detector.get_current_failures();
        assert_eq!(failures[0].failure_type, FailureType::ProcessDown);
        assert_eq!(failures[0].severity, Severity::Critical);
    }
}
