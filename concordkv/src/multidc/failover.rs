//! DC failover coordination.
//!
//! Converts a confirmed DC failure, or a manual request, into a safe
//! transfer of write leadership to a target DC. Each operation walks six
//! idempotent steps; a failing step rolls the completed ones back in LIFO
//! order. At most one operation is in progress at any time, and every
//! decision path that declines a failover still leaves a `Failed` record in
//! the history.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;

use crate::config::FailoverConfig;
use crate::error::FailoverError;
use crate::multidc::detector::DetectorEvent;
use crate::multidc::detector::HealthView;
use crate::multidc::recovery::DcStateSource;
use crate::multidc::recovery::ScoreView;
use crate::topology::ShardInfo;
use crate::topology::TopologyService;
use crate::DcId;
use crate::ShardId;

/// Status of a failover operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverStatus {
    Planned,
    InProgress,
    Completed,
    RolledBack,
    Failed,
}

/// The six steps of a failover, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverStep {
    PreChecks,
    QuiesceSource,
    PromoteTarget,
    VerifyCatchUp,
    PublishTopology,
    ResumeWrites,
}

impl FailoverStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreChecks => "pre_checks",
            Self::QuiesceSource => "quiesce_source",
            Self::PromoteTarget => "promote_target",
            Self::VerifyCatchUp => "verify_catch_up",
            Self::PublishTopology => "publish_topology",
            Self::ResumeWrites => "resume_writes",
        }
    }
}

/// Outcome of one executed step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Completed,
    Failed,
    RolledBack,
}

/// Record of one step of one operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: FailoverStep,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// A failover operation and its full step history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailoverOperation {
    pub op_id: u64,
    pub source_dc: DcId,
    pub target_dc: DcId,
    pub reason: String,
    pub status: FailoverStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
}

/// Stops and resumes writes per shard. Implemented by the smart router.
pub trait WriteGate: Send + Sync + 'static {
    fn quiesce(&self, shards: &[ShardId]);
    fn resume(&self, shards: &[ShardId]);
}

/// The failover coordinator.
pub struct FailoverCoordinator<S, H, V, G>
where
    S: DcStateSource,
    H: HealthView,
    V: ScoreView,
    G: WriteGate,
{
    cfg: FailoverConfig,
    topology: Arc<TopologyService>,
    states: Arc<S>,
    health: Arc<H>,
    scores: Arc<V>,
    gate: Arc<G>,
    /// The process-wide single-failover gate.
    in_progress: Mutex<Option<u64>>,
    history: Mutex<Vec<FailoverOperation>>,
    op_seq: AtomicU64,
}

impl<S, H, V, G> FailoverCoordinator<S, H, V, G>
where
    S: DcStateSource,
    H: HealthView,
    V: ScoreView,
    G: WriteGate,
{
    pub fn new(
        cfg: FailoverConfig,
        topology: Arc<TopologyService>,
        states: Arc<S>,
        health: Arc<H>,
        scores: Arc<V>,
        gate: Arc<G>,
    ) -> Self {
        Self {
            cfg,
            topology,
            states,
            health,
            scores,
            gate,
            in_progress: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            op_seq: AtomicU64::new(1),
        }
    }

    /// Full operation history, oldest first.
    pub fn history(&self) -> Vec<FailoverOperation> {
        self.history.lock().unwrap().clone()
    }

    /// The id of the operation currently in progress, if any.
    pub fn in_progress(&self) -> Option<u64> {
        *self.in_progress.lock().unwrap()
    }

    /// React to confirmed DC failures from the detector.
    pub fn start(self: &Arc<Self>, mut events: broadcast::Receiver<DetectorEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DetectorEvent::Failed { record }) => {
                        if !record.confirmed {
                            continue;
                        }
                        if !this.cfg.auto_failover_enabled {
                            this.record_declined(
                                &record.dc_id,
                                None,
                                "auto failover disabled".to_string(),
                            );
                            continue;
                        }
                        let reason = format!("auto: confirmed {:?} failure", record.failure_type);
                        match this.pick_target(&record.dc_id).await {
                            Some(target) => {
                                if let Err(err) =
                                    this.execute(record.dc_id.clone(), target, reason).await
                                {
                                    tracing::error!(error = %err, "auto failover did not complete");
                                }
                            }
                            None => {
                                this.record_declined(
                                    &record.dc_id,
                                    None,
                                    "no healthy target dc available".to_string(),
                                );
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "failover loop lagged behind detector events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Operator-initiated failover.
    ///
    /// With `manual_confirmation_required` set (the production default), the
    /// call must carry `operator_confirmed = true`; tests disable the
    /// requirement for deterministic flows.
    pub async fn trigger_manual_failover(
        &self,
        source: DcId,
        target: DcId,
        reason: impl Into<String>,
        operator_confirmed: bool,
    ) -> Result<FailoverOperation, FailoverError> {
        let reason = reason.into();
        if self.cfg.manual_confirmation_required && !operator_confirmed {
            self.record_declined(&source, Some(&target), "operator confirmation missing".to_string());
            return Err(FailoverError::ConfirmationRequired);
        }
        self.execute(source, target, reason).await
    }

    /// Choose the healthiest, most caught-up DC to take over from `failed`.
    async fn pick_target(&self, failed: &DcId) -> Option<DcId> {
        let snapshot = self.topology.get_snapshot();
        let mut best: Option<(DcId, u64)> = None;
        for dc in snapshot.dcs.keys() {
            if dc == failed || !self.health.is_dc_healthy(dc) {
                continue;
            }
            let last_index = match self.states.dc_state(dc).await {
                Ok(state) => state.last_index,
                Err(_) => continue,
            };
            if best.as_ref().map(|(_, b)| last_index > *b).unwrap_or(true) {
                best = Some((dc.clone(), last_index));
            }
        }
        best.map(|(dc, _)| dc)
    }

    /// Record an operation that was declined before any step ran.
    fn record_declined(&self, source: &DcId, target: Option<&DcId>, reason: String) {
        let now = Utc::now();
        let op = FailoverOperation {
            op_id: self.op_seq.fetch_add(1, Ordering::Relaxed),
            source_dc: source.clone(),
            target_dc: target.cloned().unwrap_or_else(|| DcId::new("")),
            reason,
            status: FailoverStatus::Failed,
            started_at: now,
            finished_at: Some(now),
            steps: Vec::new(),
        };
        tracing::warn!(source = %op.source_dc, reason = %op.reason, "failover declined");
        self.history.lock().unwrap().push(op);
    }

    /// Run one failover operation through the step machine.
    #[tracing::instrument(level = "info", skip(self, reason), fields(source = %source, target = %target))]
    pub async fn execute(
        &self,
        source: DcId,
        target: DcId,
        reason: String,
    ) -> Result<FailoverOperation, FailoverError> {
        let op_id = self.op_seq.fetch_add(1, Ordering::Relaxed);

        // Global single-operation gate: a second attempt fails fast.
        {
            let mut guard = self.in_progress.lock().unwrap();
            if let Some(current) = *guard {
                self.record_declined(
                    &source,
                    Some(&target),
                    format!("operation {current} already in progress"),
                );
                return Err(FailoverError::AlreadyInProgress(current));
            }
            *guard = Some(op_id);
        }

        let mut op = FailoverOperation {
            op_id,
            source_dc: source.clone(),
            target_dc: target.clone(),
            reason,
            status: FailoverStatus::Planned,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        };
        op.status = FailoverStatus::InProgress;

        let result = self.run_steps(&mut op).await;
        op.finished_at = Some(Utc::now());
        match &result {
            Ok(()) => op.status = FailoverStatus::Completed,
            Err(_) if op.steps.iter().any(|s| s.status == StepStatus::RolledBack) => {
                op.status = FailoverStatus::RolledBack
            }
            Err(_) => op.status = FailoverStatus::Failed,
        }

        tracing::info!(op_id, status = ?op.status, "failover operation finished");
        self.history.lock().unwrap().push(op.clone());
        *self.in_progress.lock().unwrap() = None;

        result.map(|()| op)
    }

    async fn run_steps(&self, op: &mut FailoverOperation) -> Result<(), FailoverError> {
        // Step 1: pre-checks.
        let started = Utc::now();
        match self.pre_checks(op).await {
            Ok(()) => {
                op.steps.push(StepRecord {
                    step: FailoverStep::PreChecks,
                    status: StepStatus::Completed,
                    started_at: started,
                    finished_at: Utc::now(),
                    error: None,
                });
            }
            Err(err) => {
                op.steps.push(StepRecord {
                    step: FailoverStep::PreChecks,
                    status: StepStatus::Failed,
                    started_at: started,
                    finished_at: Utc::now(),
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        }

        let affected = self.topology.shards_with_primary_in(&op.source_dc);
        let shard_ids: Vec<ShardId> = affected.iter().map(|s| s.id.clone()).collect();

        // Step 2: quiesce writes to affected shards.
        self.gate.quiesce(&shard_ids);
        self.step_ok(op, FailoverStep::QuiesceSource);

        // Step 3: stage promotions, remembering prior state for rollback.
        // The caller owns the staged list so that a promotion failing
        // midway still rolls back the shards staged before it.
        let mut staged = Vec::with_capacity(affected.len());
        match self.promote_target(op, &affected, &mut staged) {
            Ok(()) => self.step_ok(op, FailoverStep::PromoteTarget),
            Err(err) => {
                self.step_failed(op, FailoverStep::PromoteTarget, &err);
                self.rollback(op, staged, &shard_ids);
                return Err(err);
            }
        }

        // Step 4: catch-up verification.
        if let Err(err) = self.verify_catch_up(op).await {
            self.step_failed(op, FailoverStep::VerifyCatchUp, &err);
            self.rollback(op, staged, &shard_ids);
            return Err(err);
        }
        self.step_ok(op, FailoverStep::VerifyCatchUp);

        // Step 5: publish the staged updates under one version bump.
        self.topology.publish_shard_updates(&shard_ids);
        self.step_ok(op, FailoverStep::PublishTopology);

        // Step 6: resume writes.
        self.gate.resume(&shard_ids);
        self.step_ok(op, FailoverStep::ResumeWrites);
        Ok(())
    }

    async fn pre_checks(&self, op: &FailoverOperation) -> Result<(), FailoverError> {
        if op.source_dc == op.target_dc {
            return Err(FailoverError::TargetUnhealthy(op.target_dc.clone()));
        }
        if self.topology.get_snapshot().dcs.get(&op.target_dc).is_none() {
            return Err(FailoverError::UnknownDc(op.target_dc.clone()));
        }
        if !self.health.is_dc_healthy(&op.target_dc) {
            return Err(FailoverError::TargetUnhealthy(op.target_dc.clone()));
        }
        match self.scores.consistency_score() {
            Some(score) if score < self.cfg.min_score_for_failover => {
                return Err(FailoverError::ScoreTooLow {
                    score,
                    required: self.cfg.min_score_for_failover,
                });
            }
            Some(_) => {}
            None => {
                tracing::warn!("no consistency snapshot available, skipping score pre-check");
            }
        }
        Ok(())
    }

    /// Stage a promotion for every affected shard, recording each prior
    /// shard into `staged` as it is promoted.
    ///
    /// On failure, `staged` holds exactly the shards already promoted, so
    /// the caller's rollback reverts the partial promotion too.
    fn promote_target(
        &self,
        op: &FailoverOperation,
        affected: &[ShardInfo],
        staged: &mut Vec<ShardInfo>,
    ) -> Result<(), FailoverError> {
        let candidates = self.topology.healthy_nodes_in(&op.target_dc);
        if candidates.is_empty() {
            return Err(FailoverError::StepFailed {
                step: FailoverStep::PromoteTarget.name(),
                reason: format!("no healthy nodes in target dc {}", op.target_dc),
            });
        }

        for (i, shard) in affected.iter().enumerate() {
            // Prefer an existing replica living in the target DC.
            let replica_in_target = shard
                .replicas
                .iter()
                .find(|r| candidates.contains(r))
                .cloned();
            let new_primary = replica_in_target.unwrap_or_else(|| candidates[i % candidates.len()].clone());

            let mut next = shard.clone();
            next.primary = new_primary;
            next.replicas.retain(|r| r != &next.primary);
            next.version = shard.version + 1;
            self.topology
                .update_shard_silent(next)
                .map_err(|err| FailoverError::StepFailed {
                    step: FailoverStep::PromoteTarget.name(),
                    reason: err.to_string(),
                })?;
            staged.push(shard.clone());
        }
        Ok(())
    }

    /// Ensure the target DC has replayed up to the source's last known
    /// committed index, within the configured budget.
    async fn verify_catch_up(&self, op: &FailoverOperation) -> Result<(), FailoverError> {
        let wanted = match self.states.dc_state(&op.source_dc).await {
            Ok(state) => state.last_index,
            Err(err) => {
                // The failed DC may be unreachable; its last known state is
                // whatever the target already has.
                tracing::warn!(error = %err, "source dc state unavailable, skipping catch-up target");
                return Ok(());
            }
        };

        let budget = Duration::from_millis(self.cfg.catch_up_timeout.max(1));
        let poll = async {
            loop {
                match self.states.dc_state(&op.target_dc).await {
                    Ok(state) if state.last_index >= wanted => return,
                    _ => sleep(Duration::from_millis(25)).await,
                }
            }
        };
        timeout(budget, poll)
            .await
            .map_err(|_| FailoverError::StepFailed {
                step: FailoverStep::VerifyCatchUp.name(),
                reason: format!(
                    "target dc {} did not reach index {wanted} within {budget:?}",
                    op.target_dc
                ),
            })
    }

    /// Reverse the completed steps in LIFO order.
    fn rollback(&self, op: &mut FailoverOperation, staged: Vec<ShardInfo>, shard_ids: &[ShardId]) {
        for prior in staged.into_iter().rev() {
            self.topology.revert_shard(prior);
        }
        self.mark_rolled_back(op, FailoverStep::PromoteTarget);

        self.gate.resume(shard_ids);
        self.mark_rolled_back(op, FailoverStep::QuiesceSource);
        tracing::warn!(op_id = op.op_id, "failover rolled back");
    }

    fn step_ok(&self, op: &mut FailoverOperation, step: FailoverStep) {
        let now = Utc::now();
        op.steps.push(StepRecord {
            step,
            status: StepStatus::Completed,
            started_at: now,
            finished_at: now,
            error: None,
        });
    }

    fn step_failed(&self, op: &mut FailoverOperation, step: FailoverStep, err: &FailoverError) {
        let now = Utc::now();
        op.steps.push(StepRecord {
            step,
            status: StepStatus::Failed,
            started_at: now,
            finished_at: now,
            error: Some(err.to_string()),
        });
    }

    fn mark_rolled_back(&self, op: &mut FailoverOperation, step: FailoverStep) {
        if let Some(record) = op
            .steps
            .iter_mut()
            .find(|s| s.step == step && s.status == StepStatus::Completed)
        {
            record.status = StepStatus::RolledBack;
        } else {
            let now = Utc::now();
            op.steps.push(StepRecord {
                step,
                status: StepStatus::RolledBack,
                started_at: now,
                finished_at: now,
                error: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::collections::HashSet;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::config::DataCenter;
    use crate::config::ReplicaRole;
    use crate::multidc::recovery::DcConsistency;
    use crate::topology::HashRange;
    use crate::topology::NodeHealth;
    use crate::topology::NodeStatus;
    use crate::topology::ShardState;

    struct Harness {
        states: Mutex<HashMap<DcId, DcConsistency>>,
        unhealthy: Mutex<HashSet<DcId>>,
        score: Mutex<Option<f64>>,
        quiesced: Mutex<Vec<ShardId>>,
        resumed: Mutex<Vec<ShardId>>,
    }

    impl Harness {
        fn new() -> Self {
            let mut states = HashMap::new();
            states.insert(
                DcId::new("dc1"),
                DcConsistency { last_index: 9, last_term: 1, checksum: 1 },
            );
            states.insert(
                DcId::new("dc2"),
                DcConsistency { last_index: 9, last_term: 1, checksum: 1 },
            );
            Self {
                states: Mutex::new(states),
                unhealthy: Mutex::new(HashSet::new()),
                score: Mutex::new(Some(0.9)),
                quiesced: Mutex::new(Vec::new()),
                resumed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DcStateSource for Harness {
        async fn dc_state(&self, dc: &DcId) -> Result<DcConsistency> {
            self.states
                .lock()
                .unwrap()
                .get(dc)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unknown dc"))
        }
    }

    impl HealthView for Harness {
        fn is_dc_healthy(&self, dc: &DcId) -> bool {
            !self.unhealthy.lock().unwrap().contains(dc)
        }
    }

    impl ScoreView for Harness {
        fn consistency_score(&self) -> Option<f64> {
            *self.score.lock().unwrap()
        }
    }

    impl WriteGate for Harness {
        fn quiesce(&self, shards: &[ShardId]) {
            self.quiesced.lock().unwrap().extend_from_slice(shards);
        }

        fn resume(&self, shards: &[ShardId]) {
            self.resumed.lock().unwrap().extend_from_slice(shards);
        }
    }

    fn topology() -> Arc<TopologyService> {
        let config = crate::config::Config::build("failover-test")
            .datacenter(DataCenter::new("dc1", "east").primary())
            .datacenter(DataCenter::new("dc2", "west"))
            .validate()
            .unwrap();
        let service = Arc::new(TopologyService::from_config(&config));
        for (node, dc) in [("n1", "dc1"), ("n2", "dc1"), ("n4", "dc2"), ("n5", "dc2")] {
            service.add_node(NodeStatus {
                id: node.into(),
                address: "10.0.0.1:7000".to_string(),
                dc: dc.into(),
                role: ReplicaRole::Primary,
                health: NodeHealth::Healthy,
                last_seen: Utc::now(),
            });
        }
        let ranges = HashRange::split_even(2);
        for (i, range) in ranges.into_iter().enumerate() {
            service.add_shard(ShardInfo {
                id: format!("s{}", i + 1).into(),
                range,
                primary: if i == 0 { "n1".into() } else { "n2".into() },
                replicas: vec!["n4".into(), "n5".into()],
                state: ShardState::Active,
                version: 3,
            });
        }
        service
    }

    fn coordinator(
        harness: Arc<Harness>,
        topology: Arc<TopologyService>,
        cfg: FailoverConfig,
    ) -> FailoverCoordinator<Harness, Harness, Harness, Harness> {
        FailoverCoordinator::new(
            cfg,
            topology,
            harness.clone(),
            harness.clone(),
            harness.clone(),
            harness,
        )
    }

    fn test_cfg() -> FailoverConfig {
        FailoverConfig {
            auto_failover_enabled: true,
            manual_confirmation_required: false,
            min_score_for_failover: 0.5,
            catch_up_timeout: 500,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completed_failover_bumps_versions_once() {
        let harness = Arc::new(Harness::new());
        let topology = topology();
        let coordinator = coordinator(harness.clone(), topology.clone(), test_cfg());

        let version_before = topology.version();
        let op = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap();

        assert_eq!(op.status, FailoverStatus::Completed);
        assert_eq!(op.steps.len(), 6);
        assert!(op.steps.iter().all(|s| s.status == StepStatus::Completed));

        // Each affected shard version bumped by one, global version by one.
        for shard_id in ["s1", "s2"] {
            let shard = topology.shard(&shard_id.into()).unwrap();
            assert_eq!(shard.version, 4);
            let dc = topology.node(&shard.primary).unwrap().dc;
            assert_eq!(dc, DcId::new("dc2"));
        }
        assert_eq!(topology.version(), version_before + 1);

        // Writes were quiesced then resumed for the same shards.
        let quiesced = harness.quiesced.lock().unwrap().clone();
        let resumed = harness.resumed.lock().unwrap().clone();
        assert_eq!(quiesced.len(), 2);
        assert_eq!(resumed.len(), 2);
        assert!(coordinator.in_progress().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unhealthy_target_is_refused_and_recorded() {
        let harness = Arc::new(Harness::new());
        harness.unhealthy.lock().unwrap().insert("dc2".into());
        let topology = topology();
        let coordinator = coordinator(harness, topology, test_cfg());

        let err = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::TargetUnhealthy(_)));

        let history = coordinator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, FailoverStatus::Failed);
        assert_eq!(history[0].steps[0].status, StepStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn low_score_is_refused() {
        let harness = Arc::new(Harness::new());
        *harness.score.lock().unwrap() = Some(0.2);
        let topology = topology();
        let coordinator = coordinator(harness, topology, test_cfg());

        let err = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::ScoreTooLow { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catch_up_timeout_rolls_back() {
        let harness = Arc::new(Harness::new());
        // Target is behind and never catches up.
        harness.states.lock().unwrap().insert(
            DcId::new("dc2"),
            DcConsistency { last_index: 3, last_term: 1, checksum: 1 },
        );
        let topology = topology();
        let mut cfg = test_cfg();
        cfg.catch_up_timeout = 100;
        let coordinator = coordinator(harness.clone(), topology.clone(), cfg);

        let err = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::StepFailed { .. }));

        let history = coordinator.history();
        assert_eq!(history[0].status, FailoverStatus::RolledBack);

        // Shard map reverted: primaries back in dc1, versions unchanged.
        for shard_id in ["s1", "s2"] {
            let shard = topology.shard(&shard_id.into()).unwrap();
            assert_eq!(shard.version, 3);
            let dc = topology.node(&shard.primary).unwrap().dc;
            assert_eq!(dc, DcId::new("dc1"));
        }
        // Writes resumed as part of rollback.
        assert_eq!(harness.resumed.lock().unwrap().len(), 2);
        assert!(coordinator.in_progress().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_promotion_failure_reverts_staged_shards() {
        let harness = Arc::new(Harness::new());
        let topology = topology();
        let coordinator = coordinator(harness.clone(), topology.clone(), test_cfg());

        let mut op = FailoverOperation {
            op_id: 1,
            source_dc: "dc1".into(),
            target_dc: "dc2".into(),
            reason: "drill".to_string(),
            status: FailoverStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        };

        // s1 is current; the s2 record is stale, so its staged version
        // collides with the authoritative one and promotion fails after s1
        // has already been staged.
        let s1 = topology.shard(&"s1".into()).unwrap();
        let mut stale_s2 = topology.shard(&"s2".into()).unwrap();
        stale_s2.version -= 1;
        let affected = vec![s1.clone(), stale_s2];

        let mut staged = Vec::new();
        let err = coordinator
            .promote_target(&op, &affected, &mut staged)
            .unwrap_err();
        assert!(matches!(err, FailoverError::StepFailed { .. }));
        assert_eq!(staged, vec![s1.clone()]);

        // s1 really was promoted before the failure.
        let promoted = topology.shard(&"s1".into()).unwrap();
        assert_eq!(promoted.version, s1.version + 1);
        assert_ne!(promoted.primary, s1.primary);

        // Rollback with the partial staging restores the authoritative map.
        let shard_ids = vec![ShardId::new("s1"), ShardId::new("s2")];
        coordinator.rollback(&mut op, staged, &shard_ids);
        assert_eq!(topology.shard(&"s1".into()).unwrap(), s1);
        assert_eq!(topology.shard(&"s2".into()).unwrap().version, 3);
        // Writes for the affected shards were resumed as part of rollback.
        assert_eq!(harness.resumed.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_operation_fails_fast() {
        let harness = Arc::new(Harness::new());
        let topology = topology();
        let coordinator = Arc::new(coordinator(harness, topology, test_cfg()));
        *coordinator.in_progress.lock().unwrap() = Some(77);

        let err = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::AlreadyInProgress(77)));
        // Declined attempts still leave a record.
        assert_eq!(coordinator.history().len(), 1);
        assert_eq!(coordinator.history()[0].status, FailoverStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn confirmation_gate_records_failure() {
        let harness = Arc::new(Harness::new());
        let topology = topology();
        let mut cfg = test_cfg();
        cfg.manual_confirmation_required = true;
        let coordinator = coordinator(harness, topology, cfg);

        let err = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", false)
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::ConfirmationRequired));
        assert_eq!(coordinator.history().len(), 1);

        let op = coordinator
            .trigger_manual_failover("dc1".into(), "dc2".into(), "drill", true)
            .await
            .unwrap();
        assert_eq!(op.status, FailoverStatus::Completed);
    }
}
