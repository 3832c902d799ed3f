//! Multi-DC coordination wiring for a primary-DC node.
//!
//! Assembles the failure detector, consistency recovery, failover
//! coordinator and their adapters over the node's HTTP transport, and
//! bridges replicator health events into the detector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use concordkv::client::balance::RoundRobin;
use concordkv::client::cache::TopologyCache;
use concordkv::client::router::Router;
use concordkv::config::Config;
use concordkv::metrics::NodeMetrics;
use concordkv::multidc::detector::FailureDetector;
use concordkv::multidc::failover::FailoverCoordinator;
use concordkv::multidc::recovery::CatchUpSource;
use concordkv::multidc::recovery::DcConsistency;
use concordkv::multidc::recovery::DcStateSource;
use concordkv::multidc::recovery::RecoveryManager;
use concordkv::multidc::replicator::Replicator;
use concordkv::multidc::replicator::ReplicatorEvent;
use concordkv::raft::LogEntry;
use concordkv::storage::LogStore;
use concordkv::storage::SnapshotData;
use concordkv::storage::SnapshotMeta;
use concordkv::storage::StateMachine;
use concordkv::topology::TopologyService;
use concordkv::DcId;
use concordkv::NodeId;

use crate::net::HttpNetwork;
use crate::store::MemKv;
use crate::store::MemLog;

/// Applied-state summary as served by `/api/metrics`.
#[derive(Debug, Deserialize)]
struct PeerMetrics {
    applied_index: u64,
    applied_term: u64,
    checksum: u64,
}

/// DC state source backed by peer `/api/metrics` endpoints.
pub struct HttpDcStates {
    network: Arc<HttpNetwork>,
    nodes_by_dc: HashMap<DcId, Vec<NodeId>>,
    local_dc: DcId,
    local_store: Arc<MemKv>,
}

impl HttpDcStates {
    pub fn new(
        config: &Config,
        network: Arc<HttpNetwork>,
        local_dc: DcId,
        local_store: Arc<MemKv>,
    ) -> Self {
        let nodes_by_dc = config
            .datacenters
            .iter()
            .map(|dc| {
                (
                    dc.id.clone(),
                    config.nodes_in_dc(&dc.id).iter().map(|s| s.id.clone()).collect(),
                )
            })
            .collect();
        Self {
            network,
            nodes_by_dc,
            local_dc,
            local_store,
        }
    }
}

#[async_trait]
impl DcStateSource for HttpDcStates {
    async fn dc_state(&self, dc: &DcId) -> Result<DcConsistency> {
        // The local DC answers from the local store, without a network trip.
        if dc == &self.local_dc {
            let applied = self.local_store.last_applied().await?;
            return Ok(DcConsistency {
                last_index: applied.index,
                last_term: applied.term,
                checksum: self.local_store.checksum().await?,
            });
        }

        let nodes = self
            .nodes_by_dc
            .get(dc)
            .ok_or_else(|| anyhow!("unknown dc {dc}"))?;
        let mut last_err = None;
        for node in nodes {
            match self.network.get_json::<PeerMetrics>(node, "/api/metrics").await {
                Ok(metrics) => {
                    return Ok(DcConsistency {
                        last_index: metrics.applied_index,
                        last_term: metrics.applied_term,
                        checksum: metrics.checksum,
                    })
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no nodes configured for dc {dc}")))
    }
}

/// Catch-up source over the local authoritative log and state machine.
pub struct LocalCatchUp {
    log: Arc<MemLog>,
    store: Arc<MemKv>,
    metrics: watch::Receiver<NodeMetrics>,
}

impl LocalCatchUp {
    pub fn new(log: Arc<MemLog>, store: Arc<MemKv>, metrics: watch::Receiver<NodeMetrics>) -> Self {
        Self {
            log,
            store,
            metrics,
        }
    }
}

#[async_trait]
impl CatchUpSource for LocalCatchUp {
    async fn entries(&self, _dc: &DcId, range: std::ops::Range<u64>) -> Result<Vec<LogEntry>> {
        self.log.entries(range).await
    }

    async fn snapshot(&self, _dc: &DcId) -> Result<SnapshotData> {
        let data = self.store.snapshot().await?;
        let last_included = self.store.last_applied().await?;
        let membership = self.metrics.borrow().membership.clone();
        Ok(SnapshotData {
            meta: SnapshotMeta {
                last_included,
                membership,
            },
            data,
        })
    }
}

type NodeRecovery =
    RecoveryManager<HttpDcStates, LocalCatchUp, FailureDetector<HttpNetwork>, HttpNetwork>;
type NodeCoordinator =
    FailoverCoordinator<HttpDcStates, FailureDetector<HttpNetwork>, NodeRecovery, Router>;

/// The assembled multi-DC coordination stack of one node.
pub struct CoordinationStack {
    pub detector: Arc<FailureDetector<HttpNetwork>>,
    pub recovery: Arc<NodeRecovery>,
    pub coordinator: Arc<NodeCoordinator>,
    pub router: Arc<Router>,
    /// Keeps the router's weak cache reference alive.
    pub cache: Arc<TopologyCache>,
    workers: Vec<JoinHandle<()>>,
}

impl CoordinationStack {
    /// Wire detector, recovery and coordinator around the node's transport,
    /// replicator and topology service, and start every background worker.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: &Config,
        local_dc: DcId,
        network: Arc<HttpNetwork>,
        replicator: Arc<Replicator<HttpNetwork>>,
        topology: Arc<TopologyService>,
        log: Arc<MemLog>,
        store: Arc<MemKv>,
        raft_metrics: watch::Receiver<NodeMetrics>,
    ) -> Self {
        let detector = Arc::new(FailureDetector::new(config, &local_dc, network.clone()));
        let states = Arc::new(HttpDcStates::new(
            config,
            network.clone(),
            local_dc.clone(),
            store.clone(),
        ));
        let catch_up = Arc::new(LocalCatchUp::new(log, store, raft_metrics));
        let recovery = Arc::new(RecoveryManager::new(
            config,
            states.clone(),
            catch_up,
            detector.clone(),
            replicator.clone(),
            network.clone(),
        ));

        let cache = Arc::new(TopologyCache::new(config.cache.clone()));
        let router = Arc::new(Router::new(
            config.router.clone(),
            Some(local_dc),
            Arc::downgrade(&cache),
            Arc::new(RoundRobin::new()),
        ));
        router.sync_topology(&topology.get_snapshot());

        let coordinator = Arc::new(FailoverCoordinator::new(
            config.failover.clone(),
            topology.clone(),
            states,
            detector.clone(),
            recovery.clone(),
            router.clone(),
        ));

        let mut workers = Vec::new();
        workers.push(detector.start());
        workers.extend(recovery.start(detector.subscribe()));
        workers.push(coordinator.start(detector.subscribe()));
        workers.push(topology.start_health_loop(
            network,
            Duration::from_millis(config.detector.probe_interval.max(1)),
        ));

        // Replicator health feeds the detector as an independent signal.
        {
            let detector = detector.clone();
            let mut events = replicator.subscribe();
            workers.push(tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        ReplicatorEvent::TargetUnhealthy { dc } => {
                            detector.report_replication_health(&dc, false)
                        }
                        ReplicatorEvent::TargetRecovered { dc } => {
                            detector.report_replication_health(&dc, true)
                        }
                        ReplicatorEvent::BatchDelivered { dc, .. } => detector.report_heartbeat(&dc),
                    }
                }
            }));
        }

        // The router and cache track topology changes.
        {
            let router = router.clone();
            let mut subscription = topology.subscribe("node-router", None);
            let cache = cache.clone();
            workers.push(tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    router.apply_event(&event);
                    cache.apply_event(&event);
                }
            }));
        }

        Self {
            detector,
            recovery,
            coordinator,
            router,
            cache,
            workers,
        }
    }

    pub fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}
