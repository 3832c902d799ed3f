//! Datacenter-aware extensions to the consensus core.
//!
//! Three concerns live here: biasing leadership toward the primary DC by
//! gating elections on non-primary-DC nodes, sampling cross-DC round-trip
//! latency, and bridging newly committed entries into the async replicator
//! without blocking the commit path.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::ConfigError;
use crate::network::Prober;
use crate::raft::LogEntry;
use crate::DcId;
use crate::NodeId;

/// Which datacenter every node lives in, and which one is primary.
#[derive(Clone, Debug)]
pub struct DcView {
    local_node: NodeId,
    local_dc: DcId,
    primary_dc: DcId,
    node_dc: HashMap<NodeId, DcId>,
}

impl DcView {
    /// Build the view for `local` from the config's DC and server tables.
    pub fn from_config(config: &Config, local: &NodeId) -> Result<Self, ConfigError> {
        let local_dc = config
            .dc_of(local)
            .cloned()
            .ok_or_else(|| ConfigError::Invalid {
                field: "servers",
                reason: format!("local node {local} not present in server table"),
            })?;
        let primary_dc = config
            .primary_dc()
            .map(|d| d.id.clone())
            .ok_or(ConfigError::PrimaryDcCount(0))?;
        let node_dc = config
            .servers
            .iter()
            .map(|s| (s.id.clone(), s.dc.clone()))
            .collect();
        Ok(Self {
            local_node: local.clone(),
            local_dc,
            primary_dc,
            node_dc,
        })
    }

    /// A degenerate view for single-DC deployments: the local DC is primary,
    /// so election gating never engages.
    pub fn single_dc(local: NodeId) -> Self {
        let dc = DcId::new("default");
        let mut node_dc = HashMap::new();
        node_dc.insert(local.clone(), dc.clone());
        Self {
            local_node: local,
            local_dc: dc.clone(),
            primary_dc: dc,
            node_dc,
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn local_dc(&self) -> &DcId {
        &self.local_dc
    }

    pub fn primary_dc(&self) -> &DcId {
        &self.primary_dc
    }

    pub fn is_in_primary_dc(&self) -> bool {
        self.local_dc == self.primary_dc
    }

    pub fn dc_of(&self, node: &NodeId) -> Option<&DcId> {
        self.node_dc.get(node)
    }

    /// Whether `node` is known to live in the primary DC.
    pub fn is_primary_dc_node(&self, node: &NodeId) -> bool {
        self.dc_of(node) == Some(&self.primary_dc)
    }

    /// Nodes of the given DC, in stable order.
    pub fn nodes_in(&self, dc: &DcId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .node_dc
            .iter()
            .filter(|(_, d)| *d == dc)
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// All DCs other than the local one, in stable order.
    pub fn remote_dcs(&self) -> Vec<DcId> {
        let mut dcs: Vec<DcId> = self
            .node_dc
            .values()
            .filter(|d| **d != self.local_dc)
            .cloned()
            .collect();
        dcs.sort();
        dcs.dedup();
        dcs
    }
}

/// Election gating state of a node.
///
/// A node outside the primary DC holds back from campaigning until the
/// primary DC has been silent for `primary_dc_timeout`, so that primary-DC
/// nodes win contested elections. Assumes clock drift small relative to the
/// timeout.
#[derive(Debug)]
pub struct DcElectionState {
    is_in_primary_dc: bool,
    primary_dc_timeout: Duration,
    /// Initialized to the construction instant: a freshly started node
    /// yields to the primary DC for one full timeout window.
    last_primary_dc_heartbeat: Mutex<Instant>,
}

impl DcElectionState {
    pub fn new(is_in_primary_dc: bool, primary_dc_timeout: Duration) -> Self {
        Self {
            is_in_primary_dc,
            primary_dc_timeout,
            last_primary_dc_heartbeat: Mutex::new(Instant::now()),
        }
    }

    /// Record a heartbeat from a primary-DC leader.
    pub fn record_primary_heartbeat(&self) {
        let mut last = self.last_primary_dc_heartbeat.lock().unwrap();
        *last = Instant::now();
    }

    pub fn last_primary_dc_heartbeat(&self) -> Instant {
        *self.last_primary_dc_heartbeat.lock().unwrap()
    }

    /// Whether this node may start an election now.
    pub fn allow_election(&self) -> bool {
        if self.is_in_primary_dc {
            return true;
        }
        self.last_primary_dc_heartbeat().elapsed() > self.primary_dc_timeout
    }
}

/// Latency percentiles of one remote DC.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyStats {
    pub avg: Duration,
    pub p50: Duration,
    pub p99: Duration,
}

/// Sliding-window round-trip latency per remote DC.
///
/// Fed by the background sampler and by the replicator's send path; read by
/// the router and the failure detector.
#[derive(Debug)]
pub struct LatencyMonitor {
    windows: RwLock<HashMap<DcId, VecDeque<Duration>>>,
    capacity: usize,
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new(128)
    }
}

impl LatencyMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, dc: &DcId, rtt: Duration) {
        let mut windows = self.windows.write().unwrap();
        let window = windows.entry(dc.clone()).or_default();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(rtt);
    }

    pub fn stats(&self, dc: &DcId) -> Option<LatencyStats> {
        let windows = self.windows.read().unwrap();
        let window = windows.get(dc)?;
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = window.iter().copied().collect();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let pick = |q: f64| {
            let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        Some(LatencyStats {
            avg: total / sorted.len() as u32,
            p50: pick(0.50),
            p99: pick(0.99),
        })
    }

    pub fn all(&self) -> HashMap<DcId, LatencyStats> {
        let dcs: Vec<DcId> = self.windows.read().unwrap().keys().cloned().collect();
        dcs.into_iter()
            .filter_map(|dc| self.stats(&dc).map(|s| (dc, s)))
            .collect()
    }

    /// Spawn the background sampler: one probe per remote DC per tick,
    /// rotating through that DC's nodes.
    pub fn spawn_sampler<P: Prober>(
        self: Arc<Self>,
        view: Arc<DcView>,
        prober: Arc<P>,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut rotation = 0usize;
            loop {
                ticker.tick().await;
                for dc in view.remote_dcs() {
                    let nodes = view.nodes_in(&dc);
                    if nodes.is_empty() {
                        continue;
                    }
                    let target = &nodes[rotation % nodes.len()];
                    match prober.probe(target).await {
                        Ok(rtt) => self.record(&dc, rtt),
                        Err(err) => {
                            tracing::debug!(dc = %dc, node = %target, error = %err, "latency probe failed");
                        }
                    }
                }
                rotation = rotation.wrapping_add(1);
            }
        })
    }
}

/// Forwards committed entries to the async replicator.
///
/// The sender side is wired into the leader commit path; the channel is
/// unbounded so the commit path never suspends here.
#[derive(Clone, Debug)]
pub struct ReplicationBridge {
    tx: mpsc::UnboundedSender<Vec<LogEntry>>,
}

impl ReplicationBridge {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Vec<LogEntry>>) -> Self {
        Self { tx }
    }

    /// Hand newly committed entries to the replicator. Never blocks.
    pub fn offer(&self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        if self.tx.send(entries).is_err() {
            tracing::warn!("replication bridge closed, dropping committed-entry forwarding");
        }
    }
}

/// The per-node DC runtime handed to the consensus core.
pub struct DcRuntime {
    pub view: DcView,
    pub election: DcElectionState,
    pub latency: Arc<LatencyMonitor>,
    bridge: Mutex<Option<ReplicationBridge>>,
}

impl DcRuntime {
    pub fn new(view: DcView, config: &Config) -> Self {
        let election =
            DcElectionState::new(view.is_in_primary_dc(), config.primary_dc_election_timeout());
        Self {
            view,
            election,
            latency: Arc::new(LatencyMonitor::default()),
            bridge: Mutex::new(None),
        }
    }

    /// Runtime for a node which does not participate in multi-DC topology.
    pub fn single_dc(local: NodeId) -> Arc<Self> {
        let view = DcView::single_dc(local);
        let election = DcElectionState::new(true, Duration::from_secs(1));
        Arc::new(Self {
            view,
            election,
            latency: Arc::new(LatencyMonitor::default()),
            bridge: Mutex::new(None),
        })
    }

    /// Attach the replicator bridge. Called once during node assembly, after
    /// the replicator exists.
    pub fn set_bridge(&self, bridge: ReplicationBridge) {
        *self.bridge.lock().unwrap() = Some(bridge);
    }

    /// Called on every AppendEntries from a current leader.
    pub(crate) fn observe_leader(&self, leader: &NodeId) {
        if self.view.is_primary_dc_node(leader) {
            self.election.record_primary_heartbeat();
        }
    }

    pub(crate) fn allow_election(&self) -> bool {
        self.election.allow_election()
    }

    /// Forward committed entries toward remote DCs, if a replicator is
    /// attached.
    pub(crate) fn forward_committed(&self, entries: Vec<LogEntry>) {
        if let Some(bridge) = self.bridge.lock().unwrap().as_ref() {
            bridge.offer(entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_dc_node_always_allowed() {
        let state = DcElectionState::new(true, Duration::from_millis(200));
        assert!(state.allow_election());
    }

    #[test]
    fn secondary_dc_node_defers_until_timeout() {
        let state = DcElectionState::new(false, Duration::from_millis(50));
        assert!(!state.allow_election());
        std::thread::sleep(Duration::from_millis(70));
        assert!(state.allow_election());
        state.record_primary_heartbeat();
        assert!(!state.allow_election());
    }

    #[test]
    fn latency_percentiles() {
        let monitor = LatencyMonitor::new(16);
        let dc = DcId::new("dc2");
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            monitor.record(&dc, Duration::from_millis(ms));
        }
        let stats = monitor.stats(&dc).unwrap();
        assert_eq!(stats.avg, Duration::from_millis(55));
        assert_eq!(stats.p50, Duration::from_millis(60));
        assert_eq!(stats.p99, Duration::from_millis(100));
    }

    #[test]
    fn window_is_bounded() {
        let monitor = LatencyMonitor::new(4);
        let dc = DcId::new("dc2");
        for ms in 1..=100u64 {
            monitor.record(&dc, Duration::from_millis(ms));
        }
        let stats = monitor.stats(&dc).unwrap();
        assert!(stats.p50 >= Duration::from_millis(97));
    }
}
