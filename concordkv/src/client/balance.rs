//! Pluggable load balancing and the consistent hash ring.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use rand::thread_rng;
use rand::Rng;

use crate::fnv1a_64;
use crate::NodeId;

/// Node selection over a candidate set. Implementations must be thread-safe;
/// `select` is called concurrently from request paths.
pub trait LoadBalancer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Pick one of `candidates` for `key`. `None` only when the candidate
    /// set is empty.
    fn select(&self, candidates: &[NodeId], key: &str) -> Option<NodeId>;
}

/// Rotates through candidates.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[NodeId], _key: &str) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(candidates[n % candidates.len()].clone())
    }
}

/// Uniformly random selection.
#[derive(Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, candidates: &[NodeId], _key: &str) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let i = thread_rng().gen_range(0..candidates.len());
        Some(candidates[i].clone())
    }
}

/// Shared active-connection counters, fed by whoever owns the connections.
#[derive(Default)]
pub struct NodeLoads {
    counts: Mutex<HashMap<NodeId, u64>>,
}

impl NodeLoads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, node: &NodeId) {
        *self.counts.lock().unwrap().entry(node.clone()).or_insert(0) += 1;
    }

    pub fn decr(&self, node: &NodeId) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(node) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.counts.lock().unwrap().get(node).copied().unwrap_or(0)
    }
}

/// Prefers the candidate with the fewest active connections.
pub struct LeastConnections {
    loads: Arc<NodeLoads>,
}

impl LeastConnections {
    pub fn new(loads: Arc<NodeLoads>) -> Self {
        Self { loads }
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, candidates: &[NodeId], _key: &str) -> Option<NodeId> {
        candidates
            .iter()
            .min_by_key(|node| self.loads.get(node))
            .cloned()
    }
}

/// Shared smoothed per-node latency, fed by request outcomes.
#[derive(Default)]
pub struct NodeLatencies {
    ewma_ms: RwLock<HashMap<NodeId, f64>>,
}

impl NodeLatencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &NodeId, ms: f64) {
        let mut map = self.ewma_ms.write().unwrap();
        let entry = map.entry(node.clone()).or_insert(ms);
        *entry = 0.8 * *entry + 0.2 * ms;
    }

    pub fn get(&self, node: &NodeId) -> Option<f64> {
        self.ewma_ms.read().unwrap().get(node).copied()
    }
}

/// Weights selection toward low-latency candidates.
pub struct LatencyWeighted {
    latencies: Arc<NodeLatencies>,
}

impl LatencyWeighted {
    pub fn new(latencies: Arc<NodeLatencies>) -> Self {
        Self { latencies }
    }
}

impl LoadBalancer for LatencyWeighted {
    fn name(&self) -> &'static str {
        "latency_weighted"
    }

    fn select(&self, candidates: &[NodeId], _key: &str) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        // Inverse-latency weights; nodes without samples get the average
        // weight so they are neither starved nor flooded.
        let weights: Vec<f64> = candidates
            .iter()
            .map(|node| 1.0 / self.latencies.get(node).unwrap_or(10.0).max(0.1))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut pick = thread_rng().gen_range(0.0..total);
        for (node, weight) in candidates.iter().zip(&weights) {
            if pick < *weight {
                return Some(node.clone());
            }
            pick -= weight;
        }
        candidates.last().cloned()
    }
}

/// A consistent hash ring with virtual nodes.
///
/// Keys map to the first token clockwise from their hash. Removing a node
/// only remaps the keys that node owned.
#[derive(Clone, Debug, Default)]
pub struct HashRing {
    virtual_nodes: u32,
    ring: BTreeMap<u64, NodeId>,
    nodes: std::collections::HashSet<NodeId>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
            nodes: std::collections::HashSet::new(),
        }
    }

    fn token(node: &NodeId, index: u32) -> u64 {
        fnv1a_64(format!("{node}#{index}").as_bytes())
    }

    /// Insert `virtual_nodes` tokens for the node.
    pub fn add_node(&mut self, node: &NodeId) {
        if !self.nodes.insert(node.clone()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            self.ring.insert(Self::token(node, i), node.clone());
        }
    }

    /// Remove the node's tokens.
    pub fn remove_node(&mut self, node: &NodeId) {
        if !self.nodes.remove(node) {
            return;
        }
        for i in 0..self.virtual_nodes {
            self.ring.remove(&Self::token(node, i));
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node owning `key`: first token at or clockwise of the key hash.
    pub fn get_node(&self, key: &str) -> Option<&NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = fnv1a_64(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node)
    }

    /// Distinct nodes in clockwise preference order from the key's hash.
    pub fn walk(&self, key: &str) -> Vec<NodeId> {
        let hash = fnv1a_64(key.as_bytes());
        let mut seen: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        for node in self.ring.range(hash..).map(|(_, n)| n).chain(self.ring.values()) {
            if seen.len() == self.nodes.len() {
                break;
            }
            if !seen.contains(node) {
                seen.push(node.clone());
            }
        }
        seen
    }
}

/// Stable key-to-node mapping backed by a shared hash ring.
pub struct ConsistentHashBalancer {
    ring: Arc<RwLock<HashRing>>,
}

impl ConsistentHashBalancer {
    pub fn new(ring: Arc<RwLock<HashRing>>) -> Self {
        Self { ring }
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn select(&self, candidates: &[NodeId], key: &str) -> Option<NodeId> {
        if candidates.is_empty() {
            return None;
        }
        let ring = self.ring.read().unwrap();
        ring.walk(key)
            .into_iter()
            .find(|node| candidates.contains(node))
            .or_else(|| candidates.first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    #[test]
    fn round_robin_cycles() {
        let balancer = RoundRobin::new();
        let candidates = nodes(&["n1", "n2", "n3"]);
        let picks: Vec<NodeId> = (0..6)
            .map(|_| balancer.select(&candidates, "k").unwrap())
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn least_connections_prefers_idle_node() {
        let loads = Arc::new(NodeLoads::new());
        let balancer = LeastConnections::new(loads.clone());
        let candidates = nodes(&["n1", "n2"]);
        loads.incr(&candidates[0]);
        loads.incr(&candidates[0]);
        loads.incr(&candidates[1]);
        assert_eq!(balancer.select(&candidates, "k").unwrap(), candidates[1]);
    }

    #[test]
    fn empty_candidates_select_none() {
        assert!(RoundRobin::new().select(&[], "k").is_none());
        assert!(Random.select(&[], "k").is_none());
    }

    #[test]
    fn ring_is_stable_under_removal() {
        // Remove one node: only its keys remap.
        let mut ring = HashRing::new(100);
        for node in nodes(&["n1", "n2", "n3", "n4"]) {
            ring.add_node(&node);
        }

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        let before: HashMap<&String, NodeId> =
            keys.iter().map(|k| (k, ring.get_node(k).unwrap().clone())).collect();

        ring.remove_node(&NodeId::new("n1"));
        let mut remapped = 0;
        for key in &keys {
            let now = ring.get_node(key).unwrap();
            let was = &before[key];
            if was == &NodeId::new("n1") {
                assert_ne!(now, was);
                remapped += 1;
            } else {
                assert_eq!(now, was, "key {key} moved although its owner stayed");
            }
        }
        assert!(remapped > 0);
    }

    #[test]
    fn ring_add_remove_is_identity_for_other_keys() {
        let mut ring = HashRing::new(100);
        for node in nodes(&["n1", "n2", "n3"]) {
            ring.add_node(&node);
        }
        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let before: Vec<NodeId> = keys.iter().map(|k| ring.get_node(k).unwrap().clone()).collect();

        ring.add_node(&NodeId::new("nx"));
        ring.remove_node(&NodeId::new("nx"));

        let after: Vec<NodeId> = keys.iter().map(|k| ring.get_node(k).unwrap().clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn consistent_hash_balancer_is_deterministic() {
        let mut ring = HashRing::new(100);
        let candidates = nodes(&["n1", "n2", "n3"]);
        for node in &candidates {
            ring.add_node(node);
        }
        let balancer = ConsistentHashBalancer::new(Arc::new(RwLock::new(ring)));
        let a = balancer.select(&candidates, "stable-key").unwrap();
        let b = balancer.select(&candidates, "stable-key").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn latency_weighted_never_picks_outside_candidates() {
        let latencies = Arc::new(NodeLatencies::new());
        latencies.record(&NodeId::new("n1"), 5.0);
        latencies.record(&NodeId::new("n2"), 500.0);
        let balancer = LatencyWeighted::new(latencies);
        let candidates = nodes(&["n1", "n2"]);
        for _ in 0..50 {
            let pick = balancer.select(&candidates, "k").unwrap();
            assert!(candidates.contains(&pick));
        }
    }
}
