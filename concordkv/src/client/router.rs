//! Per-request node selection.
//!
//! The router resolves a key to its shard through the topology cache (a
//! weak, lookup-only reference), applies the requested strategy, skips
//! unhealthy nodes and open circuit breakers, and falls back to the
//! consistent hash ring when the topology is partial or unavailable.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::client::balance::HashRing;
use crate::client::balance::LoadBalancer;
use crate::client::breaker::BreakerConfig;
use crate::client::breaker::BreakerState;
use crate::client::breaker::CircuitBreaker;
use crate::client::cache::TopologyCache;
use crate::config::RouterConfig;
use crate::error::RouteError;
use crate::multidc::failover::WriteGate;
use crate::topology::ShardInfo;
use crate::topology::TopologyEvent;
use crate::topology::TopologyEventKind;
use crate::topology::TopologySnapshot;
use crate::DcId;
use crate::NodeId;
use crate::ShardId;

/// Per-request routing strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStrategy {
    /// Target the shard primary.
    WritePrimary,
    /// Prefer replicas, local DC first.
    ReadReplica,
    /// Balancer-weighted selection among primary and replicas.
    LoadBalance,
    /// Skip nodes with too many recorded failures.
    Failover,
    /// Stable mapping through the hash ring.
    ConsistentHash,
}

/// Read consistency requested by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Linearizable: must reach the primary.
    Strong,
    /// Any sufficiently fresh replica will do.
    Eventual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Read,
    Write,
}

/// One routing question.
#[derive(Clone, Debug)]
pub struct RouteRequest {
    pub key: String,
    pub request_type: RequestType,
    pub consistency: ConsistencyLevel,
    pub strategy: Option<RouteStrategy>,
}

impl RouteRequest {
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            request_type: RequestType::Read,
            consistency: ConsistencyLevel::Eventual,
            strategy: None,
        }
    }

    pub fn write(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            request_type: RequestType::Write,
            consistency: ConsistencyLevel::Strong,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: RouteStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// The answer: where to send the request and why.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_type: RequestType,
    pub target_node: NodeId,
    pub target_dc: Option<DcId>,
    pub estimated_latency_ms: f64,
    pub consistency_level: ConsistencyLevel,
    pub reason: String,
    pub cached: bool,
}

/// Health condition of a node from the router's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCondition {
    Healthy,
    Unhealthy,
    Recovering,
}

struct NodeTrack {
    condition: NodeCondition,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_failures: u64,
    latency_ewma_ms: f64,
}

impl Default for NodeTrack {
    fn default() -> Self {
        Self {
            condition: NodeCondition::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_failures: 0,
            latency_ewma_ms: 1.0,
        }
    }
}

struct CachedDecision {
    decision: RoutingDecision,
    at: Instant,
}

enum PickFailure {
    AllOpen { node: NodeId, retry_after: Duration },
    NoneHealthy,
}

/// The topology-aware smart router.
pub struct Router {
    cfg: RouterConfig,
    local_dc: Option<DcId>,
    /// Lookup only; the cache is owned elsewhere.
    cache: Weak<TopologyCache>,
    balancer: Arc<dyn LoadBalancer>,
    ring: Arc<RwLock<HashRing>>,
    breakers: Mutex<HashMap<NodeId, Arc<CircuitBreaker>>>,
    tracks: Mutex<HashMap<NodeId, NodeTrack>>,
    node_dcs: RwLock<HashMap<NodeId, DcId>>,
    quiesced: RwLock<HashSet<ShardId>>,
    route_cache: Mutex<HashMap<(String, RouteStrategy, ConsistencyLevel), CachedDecision>>,
}

impl Router {
    pub fn new(
        cfg: RouterConfig,
        local_dc: Option<DcId>,
        cache: Weak<TopologyCache>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        let ring = Arc::new(RwLock::new(HashRing::new(cfg.virtual_nodes_per_node)));
        Self {
            cfg,
            local_dc,
            cache,
            balancer,
            ring,
            breakers: Mutex::new(HashMap::new()),
            tracks: Mutex::new(HashMap::new()),
            node_dcs: RwLock::new(HashMap::new()),
            quiesced: RwLock::new(HashSet::new()),
            route_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The hash ring, shared with a `ConsistentHashBalancer` if one is used.
    pub fn ring(&self) -> Arc<RwLock<HashRing>> {
        self.ring.clone()
    }

    /// Align the ring and node directory with a topology snapshot.
    pub fn sync_topology(&self, snapshot: &TopologySnapshot) {
        {
            let mut node_dcs = self.node_dcs.write().unwrap();
            node_dcs.clear();
            for (id, node) in &snapshot.nodes {
                node_dcs.insert(id.clone(), node.dc.clone());
            }
        }
        {
            let mut ring = self.ring.write().unwrap();
            let current: Vec<NodeId> = snapshot.nodes.keys().cloned().collect();
            let stale: Vec<NodeId> = ring
                .walk("")
                .into_iter()
                .filter(|n| !current.contains(n))
                .collect();
            for node in stale {
                ring.remove_node(&node);
            }
            for node in &current {
                ring.add_node(node);
            }
        }
        self.route_cache.lock().unwrap().clear();
    }

    /// Keep the ring and routing cache current with topology events.
    pub fn apply_event(&self, event: &TopologyEvent) {
        match &event.kind {
            TopologyEventKind::NodeAdded(status) => {
                self.node_dcs
                    .write()
                    .unwrap()
                    .insert(status.id.clone(), status.dc.clone());
                self.ring.write().unwrap().add_node(&status.id);
            }
            TopologyEventKind::NodeRemoved(id) => {
                self.node_dcs.write().unwrap().remove(id);
                self.ring.write().unwrap().remove_node(id);
            }
            _ => {}
        }
        self.route_cache.lock().unwrap().clear();
    }

    /// Route one request.
    #[tracing::instrument(level = "debug", skip(self, req), fields(key = %req.key))]
    pub fn route(&self, req: &RouteRequest) -> Result<RoutingDecision, RouteError> {
        let strategy = req.strategy.unwrap_or(match req.request_type {
            RequestType::Write => RouteStrategy::WritePrimary,
            RequestType::Read => RouteStrategy::ReadReplica,
        });

        if self.cfg.route_cache_enabled {
            let cache_key = (req.key.clone(), strategy, req.consistency);
            let mut route_cache = self.route_cache.lock().unwrap();
            if let Some(cached) = route_cache.get(&cache_key) {
                if cached.at.elapsed() <= Duration::from_millis(self.cfg.route_cache_ttl) {
                    let mut decision = cached.decision.clone();
                    decision.cached = true;
                    return Ok(decision);
                }
                route_cache.remove(&cache_key);
            }
        }

        let shard = self
            .cache
            .upgrade()
            .and_then(|cache| cache.get_by_key(&req.key));

        let decision = match (&shard, strategy) {
            (Some(shard), _) => self.route_via_shard(req, strategy, shard)?,
            (None, _) => self.route_via_ring(req)?,
        };

        if self.cfg.route_cache_enabled {
            self.route_cache.lock().unwrap().insert(
                (req.key.clone(), strategy, req.consistency),
                CachedDecision {
                    decision: decision.clone(),
                    at: Instant::now(),
                },
            );
        }
        Ok(decision)
    }

    /// Route a batch; the result maps each key to its decision.
    pub fn route_batch(
        &self,
        reqs: &[RouteRequest],
    ) -> HashMap<String, Result<RoutingDecision, RouteError>> {
        reqs.iter()
            .map(|req| (req.key.clone(), self.route(req)))
            .collect()
    }

    fn route_via_shard(
        &self,
        req: &RouteRequest,
        strategy: RouteStrategy,
        shard: &ShardInfo,
    ) -> Result<RoutingDecision, RouteError> {
        if req.request_type == RequestType::Write
            && self.quiesced.read().unwrap().contains(&shard.id)
        {
            return Err(RouteError::WritesQuiesced(shard.id.clone()));
        }

        let candidates: Vec<NodeId> = match strategy {
            RouteStrategy::WritePrimary => vec![shard.primary.clone()],
            RouteStrategy::ReadReplica => {
                if req.consistency == ConsistencyLevel::Strong {
                    vec![shard.primary.clone()]
                } else {
                    let mut replicas = self.prefer_local(shard.replicas.clone());
                    if replicas.is_empty() {
                        replicas.push(shard.primary.clone());
                    }
                    replicas
                }
            }
            RouteStrategy::LoadBalance => shard.all_nodes(),
            RouteStrategy::Failover => {
                let tracks = self.tracks.lock().unwrap();
                shard
                    .all_nodes()
                    .into_iter()
                    .filter(|node| {
                        tracks
                            .get(node)
                            .map(|t| t.total_failures < self.cfg.failover_skip_threshold)
                            .unwrap_or(true)
                    })
                    .collect()
            }
            RouteStrategy::ConsistentHash => {
                let ring = self.ring.read().unwrap();
                let owned = shard.all_nodes();
                ring.walk(&req.key)
                    .into_iter()
                    .filter(|n| owned.contains(n))
                    .collect()
            }
        };

        let viable = self.admit(&candidates).map_err(|failure| match failure {
            PickFailure::AllOpen { node, retry_after } => {
                RouteError::CircuitOpen { node, retry_after }
            }
            PickFailure::NoneHealthy => RouteError::NoHealthyNode(shard.id.clone()),
        })?;

        // ConsistentHash preserves ring preference order; the other
        // strategies defer to the configured balancer.
        let target = match strategy {
            RouteStrategy::ConsistentHash => viable[0].clone(),
            _ => self
                .balancer
                .select(&viable, &req.key)
                .unwrap_or_else(|| viable[0].clone()),
        };
        Ok(self.decision_for(req, target, format!("strategy {strategy:?} on shard {}", shard.id)))
    }

    /// Topology unavailable or no owning shard cached: stable hash-ring
    /// fallback, first viable node in ring order.
    fn route_via_ring(&self, req: &RouteRequest) -> Result<RoutingDecision, RouteError> {
        let order = {
            let ring = self.ring.read().unwrap();
            ring.walk(&req.key)
        };
        if order.is_empty() {
            return Err(RouteError::TopologyUnavailable);
        }
        let viable = self.admit(&order).map_err(|failure| match failure {
            PickFailure::AllOpen { node, retry_after } => {
                RouteError::CircuitOpen { node, retry_after }
            }
            PickFailure::NoneHealthy => RouteError::TopologyUnavailable,
        })?;
        Ok(self.decision_for(req, viable[0].clone(), "consistent hash fallback".to_string()))
    }

    /// Filter candidates through breaker admission, then health. Breaker
    /// refusal takes precedence so callers see the fail-fast signal.
    fn admit(&self, candidates: &[NodeId]) -> Result<Vec<NodeId>, PickFailure> {
        let mut admitted = Vec::with_capacity(candidates.len());
        let mut last_open: Option<(NodeId, Duration)> = None;
        for node in candidates {
            match self.breaker_for(node).allow() {
                Ok(()) => admitted.push(node.clone()),
                Err(retry_after) => last_open = Some((node.clone(), retry_after)),
            }
        }
        if admitted.is_empty() {
            return match last_open {
                Some((node, retry_after)) => Err(PickFailure::AllOpen { node, retry_after }),
                None => Err(PickFailure::NoneHealthy),
            };
        }

        let tracks = self.tracks.lock().unwrap();
        let healthy: Vec<NodeId> = admitted
            .into_iter()
            .filter(|node| {
                tracks
                    .get(node)
                    .map(|t| t.condition != NodeCondition::Unhealthy)
                    .unwrap_or(true)
            })
            .collect();
        if healthy.is_empty() {
            return Err(PickFailure::NoneHealthy);
        }
        Ok(healthy)
    }

    fn decision_for(&self, req: &RouteRequest, target: NodeId, reason: String) -> RoutingDecision {
        let latency = self
            .tracks
            .lock()
            .unwrap()
            .get(&target)
            .map(|t| t.latency_ewma_ms)
            .unwrap_or(1.0);
        let dc = self.node_dcs.read().unwrap().get(&target).cloned();
        RoutingDecision {
            request_type: req.request_type,
            target_node: target,
            target_dc: dc,
            estimated_latency_ms: latency,
            consistency_level: req.consistency,
            reason,
            cached: false,
        }
    }

    /// Replicas in the local DC first, others after.
    fn prefer_local(&self, mut replicas: Vec<NodeId>) -> Vec<NodeId> {
        if let Some(local) = &self.local_dc {
            let node_dcs = self.node_dcs.read().unwrap();
            replicas.sort_by_key(|node| node_dcs.get(node) != Some(local));
        }
        replicas
    }

    fn breaker_for(&self, node: &NodeId) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .unwrap()
            .entry(node.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(BreakerConfig::from(&self.cfg))))
            .clone()
    }

    /// Feed a request outcome back into the breaker and health tracker.
    pub fn update_node_health(&self, node: &NodeId, success: bool, latency: Option<Duration>) {
        let breaker = self.breaker_for(node);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }

        let mut tracks = self.tracks.lock().unwrap();
        let track = tracks.entry(node.clone()).or_default();
        if let Some(latency) = latency {
            let ms = latency.as_secs_f64() * 1_000.0;
            track.latency_ewma_ms = 0.8 * track.latency_ewma_ms + 0.2 * ms;
        }
        if success {
            track.consecutive_failures = 0;
            track.consecutive_successes += 1;
            track.condition = match track.condition {
                NodeCondition::Healthy => NodeCondition::Healthy,
                NodeCondition::Unhealthy => NodeCondition::Recovering,
                NodeCondition::Recovering => {
                    if track.consecutive_successes >= self.cfg.recovery_threshold {
                        NodeCondition::Healthy
                    } else {
                        NodeCondition::Recovering
                    }
                }
            };
        } else {
            track.consecutive_successes = 0;
            track.consecutive_failures += 1;
            track.total_failures += 1;
            if track.condition == NodeCondition::Recovering
                || track.consecutive_failures >= self.cfg.failure_threshold
            {
                track.condition = NodeCondition::Unhealthy;
            }
        }
    }

    pub fn node_condition(&self, node: &NodeId) -> NodeCondition {
        self.tracks
            .lock()
            .unwrap()
            .get(node)
            .map(|t| t.condition)
            .unwrap_or(NodeCondition::Healthy)
    }

    pub fn breaker_state(&self, node: &NodeId) -> BreakerState {
        self.breaker_for(node).state()
    }
}

impl WriteGate for Router {
    fn quiesce(&self, shards: &[ShardId]) {
        let mut quiesced = self.quiesced.write().unwrap();
        for shard in shards {
            quiesced.insert(shard.clone());
        }
        self.route_cache.lock().unwrap().clear();
        tracing::info!(count = shards.len(), "writes quiesced");
    }

    fn resume(&self, shards: &[ShardId]) {
        let mut quiesced = self.quiesced.write().unwrap();
        for shard in shards {
            quiesced.remove(shard);
        }
        self.route_cache.lock().unwrap().clear();
        tracing::info!(count = shards.len(), "writes resumed");
    }
}
