//! Runtime configuration.
//!
//! Built through [`Config::build`] and frozen by [`ConfigBuilder::validate`],
//! which refuses to produce a config that would fail at runtime (bad
//! addresses, duplicate ids, inverted ranges).

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

use crate::error::ConfigError;
use crate::DcId;
use crate::NodeId;

/// The policy governing when to take a snapshot of the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// Snapshot once this many entries have been applied since the last one.
    LogsSinceLast(u64),
}

/// The replica role a server plays for its shards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Primary,
    AsyncReplica,
}

/// A member server of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    pub address: String,
    pub dc: DcId,
    pub replica_role: ReplicaRole,
}

/// A datacenter participating in cross-DC replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: DcId,
    pub region: String,
    pub is_primary: bool,
    /// Upper bound on entries per async replication batch shipped to this DC.
    pub max_async_batch_size: usize,
    /// Extra delay before dispatching batches to this DC, in milliseconds.
    /// Zero for the primary DC keeps it ahead when dispatch capacity is
    /// contested.
    pub async_replication_delay: u64,
    pub enable_compression: bool,
}

impl DataCenter {
    pub fn new(id: impl Into<DcId>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            is_primary: false,
            max_async_batch_size: 256,
            async_replication_delay: 0,
            enable_compression: true,
        }
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

/// Cross-DC async replicator tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Capacity of each per-DC outbound entry queue.
    pub queue_capacity: usize,
    /// Age at which a partially filled batch is flushed, in milliseconds.
    pub flush_interval: u64,
    /// Minimum encoded payload size, in bytes, before compression is applied.
    pub compression_threshold: usize,
    /// Send attempts per batch before the target is marked unhealthy.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds; doubles per attempt with jitter.
    pub retry_backoff: u64,
    /// Backoff ceiling in milliseconds.
    pub retry_backoff_max: u64,
    /// Concurrent in-flight sends across all targets.
    pub in_flight_permits: usize,
    /// Drain budget for `stop`, in milliseconds.
    pub shutdown_deadline: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            flush_interval: 50,
            compression_threshold: 1024,
            max_retries: 5,
            retry_backoff: 100,
            retry_backoff_max: 5_000,
            in_flight_permits: 4,
            shutdown_deadline: 5_000,
        }
    }
}

/// DC failure detector tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Expected heartbeat interval per DC, in milliseconds.
    pub heartbeat_interval: u64,
    /// A DC becomes Suspect once silent for `heartbeat_interval * suspect_factor`.
    pub suspect_factor: f64,
    /// Independent signals required to confirm a failure.
    pub min_confirmations: u32,
    /// Window within which confirmations must accumulate, in milliseconds.
    pub confirmation_window: u64,
    /// Consecutive successful probes required for Recovering -> Healthy.
    pub recovery_streak: u32,
    /// Probe cadence, in milliseconds.
    pub probe_interval: u64,
    /// Latency multiple over the DC average that classifies as resource
    /// exhaustion rather than network failure.
    pub latency_spike_factor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 500,
            suspect_factor: 3.0,
            min_confirmations: 3,
            confirmation_window: 10_000,
            recovery_streak: 3,
            probe_interval: 1_000,
            latency_spike_factor: 5.0,
        }
    }
}

/// Consistency recovery tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Cadence of cross-DC consistency snapshots, in milliseconds.
    pub snapshot_interval: u64,
    /// Maximum index lag still considered globally consistent.
    pub max_lag_tolerance: u64,
    /// Entries per catch-up chunk.
    pub catch_up_chunk: usize,
    /// Catch-up bandwidth budget, in entries per second.
    pub rate_limit_entries_per_sec: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 5_000,
            max_lag_tolerance: 100,
            catch_up_chunk: 256,
            rate_limit_entries_per_sec: 10_000,
        }
    }
}

/// Failover coordinator tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Execute failovers automatically on confirmed DC failures.
    pub auto_failover_enabled: bool,
    /// Require operator confirmation for manual failovers. Disabled in tests
    /// for deterministic flows.
    pub manual_confirmation_required: bool,
    /// Minimum consistency score for a failover to proceed.
    pub min_score_for_failover: f64,
    /// Budget for the catch-up verification step, in milliseconds.
    pub catch_up_timeout: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            auto_failover_enabled: true,
            manual_confirmation_required: true,
            min_score_for_failover: 0.5,
            catch_up_timeout: 10_000,
        }
    }
}

/// Client topology cache tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_cache_size: usize,
    /// Entry time-to-live, in milliseconds.
    pub ttl: u64,
    pub version_check_enabled: bool,
    /// Maximum allowed distance between the global topology version and a
    /// cached entry's version.
    pub version_tolerance: i64,
    /// Cadence of the bulk expiry sweep, in milliseconds.
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1_024,
            ttl: 30_000,
            version_check_enabled: true,
            version_tolerance: 2,
            sweep_interval: 5_000,
        }
    }
}

/// Smart router, circuit breaker and node health tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Sliding window length for breaker statistics, in milliseconds.
    pub breaker_window: u64,
    /// Minimum requests in the window before the breaker may trip.
    pub min_request_threshold: u64,
    /// Failure rate at or above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Time an open breaker waits before probing, in milliseconds.
    pub open_timeout: u64,
    /// Consecutive half-open successes required to close the breaker.
    pub breaker_recovery_threshold: u32,
    /// Consecutive failures marking a node Unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes completing a node's recovery.
    pub recovery_threshold: u32,
    /// Failure count at which the Failover strategy skips a node.
    pub failover_skip_threshold: u64,
    /// Virtual nodes per physical node on the consistent hash ring.
    pub virtual_nodes_per_node: u32,
    /// Enable the per-(key, strategy, consistency) routing cache.
    pub route_cache_enabled: bool,
    /// Routing cache TTL, in milliseconds.
    pub route_cache_ttl: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            breaker_window: 60_000,
            min_request_threshold: 5,
            failure_rate_threshold: 0.5,
            open_timeout: 30_000,
            breaker_recovery_threshold: 3,
            failure_threshold: 5,
            recovery_threshold: 3,
            failover_skip_threshold: 3,
            virtual_nodes_per_node: 150,
            route_cache_enabled: true,
            route_cache_ttl: 1_000,
        }
    }
}

/// Shard-aware connection pool tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub pre_warm_enabled: bool,
    pub pre_warm_size: usize,
    pub pre_warm_concurrency: usize,
    /// Idle eviction age, in milliseconds.
    pub idle_timeout: u64,
    /// Absolute connection lifetime, in milliseconds.
    pub max_lifetime: u64,
    /// Health check cadence, in milliseconds.
    pub health_check_interval: u64,
    /// Recorded errors at which a connection is destroyed.
    pub max_errors: u32,
    /// Auto-scale cadence, in milliseconds.
    pub scale_interval: u64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    /// Bound on parked `get` waiters per pool.
    pub wait_queue_limit: usize,
    /// Default deadline for `get`, in milliseconds.
    pub acquire_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 16,
            pre_warm_enabled: true,
            pre_warm_size: 4,
            pre_warm_concurrency: 4,
            idle_timeout: 60_000,
            max_lifetime: 600_000,
            health_check_interval: 5_000,
            max_errors: 3,
            scale_interval: 10_000,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_step: 2,
            scale_down_step: 2,
            wait_queue_limit: 64,
            acquire_timeout: 5_000,
        }
    }
}

/// The validated runtime config of a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub cluster_name: String,
    /// Election timeout lower bound, in milliseconds.
    pub election_timeout_min: u64,
    /// Election timeout upper bound, in milliseconds.
    pub election_timeout_max: u64,
    /// Leader heartbeat cadence, in milliseconds.
    pub heartbeat_interval: u64,
    /// Timeout for a single InstallSnapshot RPC, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// Maximum entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// Match-index lag at which a follower stream is considered lagging.
    pub replication_lag_threshold: u64,
    pub snapshot_policy: SnapshotPolicy,
    /// A non-primary-DC node defers elections for this multiple of
    /// `election_timeout_max` after the last primary-DC heartbeat.
    pub primary_dc_timeout_factor: u64,
    pub replicator: ReplicatorConfig,
    pub detector: DetectorConfig,
    pub recovery: RecoveryConfig,
    pub failover: FailoverConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub pool: PoolConfig,
    pub datacenters: Vec<DataCenter>,
    pub servers: Vec<Server>,
}

impl Config {
    /// Start building a config for the named cluster.
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                cluster_name: cluster_name.into(),
                election_timeout_min: 150,
                election_timeout_max: 300,
                heartbeat_interval: 50,
                install_snapshot_timeout: 200,
                max_payload_entries: 300,
                replication_lag_threshold: 1_000,
                snapshot_policy: SnapshotPolicy::LogsSinceLast(5_000),
                primary_dc_timeout_factor: 3,
                replicator: ReplicatorConfig::default(),
                detector: DetectorConfig::default(),
                recovery: RecoveryConfig::default(),
                failover: FailoverConfig::default(),
                cache: CacheConfig::default(),
                router: RouterConfig::default(),
                pool: PoolConfig::default(),
                datacenters: Vec::new(),
                servers: Vec::new(),
            },
        }
    }

    /// Generate a fresh randomized election timeout in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max)
    }

    /// How long a non-primary-DC node must go without a primary-DC heartbeat
    /// before it may start an election.
    pub fn primary_dc_election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max * self.primary_dc_timeout_factor)
    }

    pub fn server(&self, id: &NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    pub fn dc(&self, id: &DcId) -> Option<&DataCenter> {
        self.datacenters.iter().find(|d| &d.id == id)
    }

    pub fn dc_of(&self, node: &NodeId) -> Option<&DcId> {
        self.server(node).map(|s| &s.dc)
    }

    pub fn primary_dc(&self) -> Option<&DataCenter> {
        self.datacenters.iter().find(|d| d.is_primary)
    }

    /// All datacenters other than `local`.
    pub fn remote_dcs(&self, local: &DcId) -> Vec<&DataCenter> {
        self.datacenters.iter().filter(|d| &d.id != local).collect()
    }

    pub fn nodes_in_dc(&self, dc: &DcId) -> Vec<&Server> {
        self.servers.iter().filter(|s| &s.dc == dc).collect()
    }
}

/// Incremental builder for [`Config`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, ms: u64) -> Self {
        self.config.election_timeout_min = ms;
        self
    }

    pub fn election_timeout_max(mut self, ms: u64) -> Self {
        self.config.election_timeout_max = ms;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval = ms;
        self
    }

    pub fn max_payload_entries(mut self, n: u64) -> Self {
        self.config.max_payload_entries = n;
        self
    }

    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.config.snapshot_policy = policy;
        self
    }

    pub fn primary_dc_timeout_factor(mut self, factor: u64) -> Self {
        self.config.primary_dc_timeout_factor = factor;
        self
    }

    pub fn datacenter(mut self, dc: DataCenter) -> Self {
        self.config.datacenters.push(dc);
        self
    }

    pub fn server(mut self, server: Server) -> Self {
        self.config.servers.push(server);
        self
    }

    pub fn replicator(mut self, c: ReplicatorConfig) -> Self {
        self.config.replicator = c;
        self
    }

    pub fn detector(mut self, c: DetectorConfig) -> Self {
        self.config.detector = c;
        self
    }

    pub fn recovery(mut self, c: RecoveryConfig) -> Self {
        self.config.recovery = c;
        self
    }

    pub fn failover(mut self, c: FailoverConfig) -> Self {
        self.config.failover = c;
        self
    }

    pub fn cache(mut self, c: CacheConfig) -> Self {
        self.config.cache = c;
        self
    }

    pub fn router(mut self, c: RouterConfig) -> Self {
        self.config.router = c;
        self
    }

    pub fn pool(mut self, c: PoolConfig) -> Self {
        self.config.pool = c;
        self
    }

    /// Validate and freeze the config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let c = self.config;

        if c.election_timeout_min > c.election_timeout_max {
            return Err(ConfigError::InvertedRange {
                field: "election_timeout",
                min: c.election_timeout_min,
                max: c.election_timeout_max,
            });
        }
        for (field, value) in [
            ("election_timeout_min", c.election_timeout_min),
            ("heartbeat_interval", c.heartbeat_interval),
            ("max_payload_entries", c.max_payload_entries),
            ("primary_dc_timeout_factor", c.primary_dc_timeout_factor),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if c.heartbeat_interval >= c.election_timeout_min {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: format!(
                    "{}ms must be below election_timeout_min {}ms",
                    c.heartbeat_interval, c.election_timeout_min
                ),
            });
        }

        let mut seen_dcs = std::collections::HashSet::new();
        for dc in &c.datacenters {
            if !seen_dcs.insert(dc.id.clone()) {
                return Err(ConfigError::DuplicateDc(dc.id.clone()));
            }
            if dc.max_async_batch_size == 0 {
                return Err(ConfigError::Zero {
                    field: "max_async_batch_size",
                });
            }
        }
        if !c.datacenters.is_empty() {
            let primaries = c.datacenters.iter().filter(|d| d.is_primary).count();
            if primaries != 1 {
                return Err(ConfigError::PrimaryDcCount(primaries));
            }
        }

        let mut seen_nodes = std::collections::HashSet::new();
        for server in &c.servers {
            if !seen_nodes.insert(server.id.clone()) {
                return Err(ConfigError::DuplicateNode(server.id.clone()));
            }
            if !c.datacenters.is_empty() && c.dc(&server.dc).is_none() {
                return Err(ConfigError::UnknownDc {
                    node: server.id.clone(),
                    dc: server.dc.clone(),
                });
            }
            if !valid_address(&server.address) {
                return Err(ConfigError::InvalidAddress {
                    node: server.id.clone(),
                    address: server.address.clone(),
                });
            }
        }

        if !(0.0..=1.0).contains(&c.failover.min_score_for_failover) {
            return Err(ConfigError::Invalid {
                field: "min_score_for_failover",
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&c.router.failure_rate_threshold)
            || c.router.failure_rate_threshold == 0.0
        {
            return Err(ConfigError::Invalid {
                field: "failure_rate_threshold",
                reason: "must be within (0, 1]".to_string(),
            });
        }
        if c.pool.min_connections > c.pool.max_connections {
            return Err(ConfigError::InvertedRange {
                field: "pool connections",
                min: c.pool.min_connections as u64,
                max: c.pool.max_connections as u64,
            });
        }
        if c.pool.scale_down_threshold >= c.pool.scale_up_threshold {
            return Err(ConfigError::Invalid {
                field: "pool scale thresholds",
                reason: "scale_down_threshold must be below scale_up_threshold".to_string(),
            });
        }
        if c.cache.version_tolerance < 0 {
            return Err(ConfigError::Invalid {
                field: "version_tolerance",
                reason: "must be non-negative".to_string(),
            });
        }

        Ok(c)
    }
}

/// `host:port` with a non-zero port.
fn valid_address(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            matches!(port.parse::<u16>(), Ok(p) if p != 0)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dc(id: &str, primary: bool) -> DataCenter {
        let d = DataCenter::new(id, "region-1");
        if primary {
            d.primary()
        } else {
            d
        }
    }

    fn server(id: &str, dc: &str, addr: &str) -> Server {
        Server {
            id: id.into(),
            address: addr.to_string(),
            dc: dc.into(),
            replica_role: ReplicaRole::Primary,
        }
    }

    #[test]
    fn default_config_validates() {
        let config = Config::build("test").validate().unwrap();
        assert_eq!(config.cluster_name, "test");
        let t = config.new_rand_election_timeout();
        assert!((config.election_timeout_min..=config.election_timeout_max).contains(&t));
    }

    #[test]
    fn rejects_duplicate_node() {
        let err = Config::build("test")
            .datacenter(dc("dc1", true))
            .server(server("n1", "dc1", "10.0.0.1:7000"))
            .server(server("n1", "dc1", "10.0.0.2:7000"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateNode(_)));
    }

    #[test]
    fn rejects_bad_address() {
        let err = Config::build("test")
            .datacenter(dc("dc1", true))
            .server(server("n1", "dc1", "not-an-address"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn requires_exactly_one_primary_dc() {
        let err = Config::build("test")
            .datacenter(dc("dc1", false))
            .datacenter(dc("dc2", false))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::PrimaryDcCount(0)));
    }

    #[test]
    fn rejects_unknown_dc_reference() {
        let err = Config::build("test")
            .datacenter(dc("dc1", true))
            .server(server("n1", "dc9", "10.0.0.1:7000"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDc { .. }));
    }

    #[test]
    fn primary_dc_election_timeout_scales() {
        let config = Config::build("test")
            .election_timeout_max(300)
            .primary_dc_timeout_factor(3)
            .validate()
            .unwrap();
        assert_eq!(
            config.primary_dc_election_timeout(),
            Duration::from_millis(900)
        );
    }
}
