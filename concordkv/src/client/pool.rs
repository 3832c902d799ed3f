//! Shard-aware connection pooling.
//!
//! Connections are grouped per `(shard, node)`. Each group enforces strict
//! capacity: an idle connection is reused, a new one is created below the
//! cap, and past the cap callers park on a bounded wait queue until a
//! connection is returned or their deadline expires. Background workers
//! pre-warm, health-check, auto-scale and age out connections. Callers hold
//! a guard whose drop returns the connection to its pool.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::NodeId;
use crate::ShardId;

/// Lifecycle state of a pooled connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    Idle,
    Active,
    Connecting,
    Closing,
    Closed,
    Error,
}

/// The transport owned by one connection.
#[async_trait]
pub trait ConnTransport: Send + 'static {
    /// Liveness check. `false` marks the connection unhealthy.
    async fn ping(&mut self) -> bool;
}

/// Creates transports for `(node, shard, address)` targets.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(
        &self,
        node: &NodeId,
        shard: &ShardId,
        address: &str,
    ) -> anyhow::Result<Box<dyn ConnTransport>>;
}

const ERROR_HISTORY_LIMIT: usize = 8;

/// A pooled connection. Owns its transport; ownership returns to the pool
/// through the guard's drop.
pub struct Connection {
    pub id: u64,
    pub node_id: NodeId,
    pub shard_id: ShardId,
    pub address: String,
    pub state: ConnState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub usage_count: u64,
    pub pre_warmed: bool,
    error_count: u32,
    error_history: VecDeque<String>,
    transport: Box<dyn ConnTransport>,
}

impl Connection {
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        if self.error_history.len() == ERROR_HISTORY_LIMIT {
            self.error_history.pop_front();
        }
        self.error_history.push_back(message.into());
        self.state = ConnState::Error;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.error_history.iter().cloned().collect()
    }

    pub async fn ping(&mut self) -> bool {
        self.transport.ping().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node_id)
            .field("shard", &self.shard_id)
            .field("state", &self.state)
            .field("usage_count", &self.usage_count)
            .field("errors", &self.error_count)
            .finish()
    }
}

struct PoolInner {
    idle: VecDeque<Connection>,
    waiters: VecDeque<oneshot::Sender<Connection>>,
    closed: bool,
}

/// Counters of one `(shard, node)` pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub shard: ShardId,
    pub node: NodeId,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
}

/// The pool of one `(shard, node)` target.
pub struct ShardPool {
    shard: ShardId,
    node: NodeId,
    address: String,
    cfg: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    active: AtomicUsize,
    total: AtomicUsize,
    next_id: AtomicU64,
    workers_started: std::sync::atomic::AtomicBool,
}

impl ShardPool {
    fn new(
        shard: ShardId,
        node: NodeId,
        address: String,
        cfg: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            shard,
            node,
            address,
            cfg,
            factory,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
            active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            workers_started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            shard: self.shard.clone(),
            node: self.node.clone(),
            total: self.total_count(),
            active: self.active_count(),
            idle: inner.idle.len(),
            waiters: inner.waiters.len(),
        }
    }

    fn expired(&self, conn: &Connection) -> bool {
        conn.error_count >= self.cfg.max_errors
            || conn.created_at.elapsed() > Duration::from_millis(self.cfg.max_lifetime)
    }

    /// Pop a healthy idle connection, destroying expired ones on the way.
    fn take_idle(&self, inner: &mut PoolInner) -> Option<Connection> {
        while let Some(mut conn) = inner.idle.pop_front() {
            if self.expired(&conn) {
                self.total.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            conn.state = ConnState::Active;
            conn.last_used_at = Instant::now();
            conn.usage_count += 1;
            return Some(conn);
        }
        None
    }

    /// Acquire a connection within `deadline`.
    pub async fn get(self: &Arc<Self>, deadline: Duration) -> Result<PoolGuard, PoolError> {
        // Fast path: a healthy idle connection.
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = self.take_idle(&mut inner) {
                self.active.fetch_add(1, Ordering::AcqRel);
                return Ok(PoolGuard {
                    pool: self.clone(),
                    conn: Some(conn),
                });
            }
        }

        // Below capacity: create.
        if self.try_reserve() {
            match self.open_connection(false).await {
                Ok(mut conn) => {
                    conn.state = ConnState::Active;
                    conn.usage_count = 1;
                    self.active.fetch_add(1, Ordering::AcqRel);
                    return Ok(PoolGuard {
                        pool: self.clone(),
                        conn: Some(conn),
                    });
                }
                Err(err) => {
                    self.total.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }

        // At capacity: park on the bounded wait queue. A connection may have
        // been returned since the fast path, so re-check under the same
        // lock that registers the waiter.
        let mut rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = self.take_idle(&mut inner) {
                self.active.fetch_add(1, Ordering::AcqRel);
                return Ok(PoolGuard {
                    pool: self.clone(),
                    conn: Some(conn),
                });
            }
            if inner.waiters.len() >= self.cfg.wait_queue_limit {
                return Err(PoolError::Exhausted {
                    shard: self.shard.clone(),
                    node: self.node.clone(),
                });
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        match timeout(deadline, &mut rx).await {
            Ok(Ok(mut conn)) => {
                conn.state = ConnState::Active;
                conn.last_used_at = Instant::now();
                conn.usage_count += 1;
                self.active.fetch_add(1, Ordering::AcqRel);
                Ok(PoolGuard {
                    pool: self.clone(),
                    conn: Some(conn),
                })
            }
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                // Rescue a connection handed over in the race with expiry.
                rx.close();
                if let Ok(mut conn) = rx.try_recv() {
                    conn.state = ConnState::Active;
                    conn.last_used_at = Instant::now();
                    conn.usage_count += 1;
                    self.active.fetch_add(1, Ordering::AcqRel);
                    return Ok(PoolGuard {
                        pool: self.clone(),
                        conn: Some(conn),
                    });
                }
                Err(PoolError::AcquireTimeout {
                    node: self.node.clone(),
                    waited: deadline,
                })
            }
        }
    }

    /// Reserve a slot below `max_connections`.
    fn try_reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                if total < self.cfg.max_connections {
                    Some(total + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Dial a new connection for an already reserved slot.
    async fn open_connection(&self, pre_warmed: bool) -> Result<Connection, PoolError> {
        let transport = self
            .factory
            .connect(&self.node, &self.shard, &self.address)
            .await
            .map_err(PoolError::ConnectFailed)?;
        let now = Instant::now();
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            node_id: self.node.clone(),
            shard_id: self.shard.clone(),
            address: self.address.clone(),
            state: ConnState::Idle,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            pre_warmed,
            error_count: 0,
            error_history: VecDeque::new(),
            transport,
        })
    }

    /// Return a connection: destroy if unhealthy, else hand to a waiter or
    /// park it idle.
    fn release(&self, mut conn: Connection) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        conn.last_used_at = Instant::now();

        let mut inner = self.inner.lock().unwrap();
        if inner.closed || self.expired(&conn) {
            self.total.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        conn.state = ConnState::Idle;

        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return,
                // Waiter gave up; try the next one.
                Err(returned) => conn = returned,
            }
        }
        inner.idle.push_back(conn);
    }

    /// Create `count` idle connections, bounded by `concurrency`.
    async fn add_idle(self: &Arc<Self>, count: usize, concurrency: usize, pre_warmed: bool) {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            if !self.try_reserve() {
                break;
            }
            let this = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                match this.open_connection(pre_warmed).await {
                    Ok(conn) => {
                        let mut inner = this.inner.lock().unwrap();
                        if inner.closed {
                            drop(inner);
                            this.total.fetch_sub(1, Ordering::AcqRel);
                            return;
                        }
                        inner.idle.push_back(conn);
                    }
                    Err(err) => {
                        this.total.fetch_sub(1, Ordering::AcqRel);
                        tracing::warn!(node = %this.node, error = %err, "connection creation failed");
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Drop up to `count` oldest idle connections, never going below
    /// `floor`.
    fn drop_idle(&self, count: usize, floor: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0;
        while dropped < count
            && self.total.load(Ordering::Acquire) > floor
            && inner.idle.pop_front().is_some()
        {
            self.total.fetch_sub(1, Ordering::AcqRel);
            dropped += 1;
        }
        dropped
    }

    /// One health pass: ping every idle connection, destroying the sick.
    async fn health_pass(&self) {
        let drained: Vec<Connection> = {
            let mut inner = self.inner.lock().unwrap();
            inner.idle.drain(..).collect()
        };
        let mut keep = Vec::with_capacity(drained.len());
        for mut conn in drained {
            if self.expired(&conn) {
                self.total.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            if conn.ping().await {
                keep.push(conn);
            } else {
                tracing::debug!(id = conn.id, node = %self.node, "idle connection failed ping");
                self.total.fetch_sub(1, Ordering::AcqRel);
            }
        }
        let mut inner = self.inner.lock().unwrap();
        for conn in keep {
            // A waiter may have arrived while we were pinging.
            let mut conn = conn;
            loop {
                match inner.waiters.pop_front() {
                    Some(waiter) => match waiter.send(conn) {
                        Ok(()) => {
                            break;
                        }
                        Err(returned) => conn = returned,
                    },
                    None => {
                        inner.idle.push_back(conn);
                        break;
                    }
                }
            }
        }
    }

    /// One auto-scale decision from the current usage ratio.
    async fn scale_pass(self: &Arc<Self>) {
        let total = self.total_count();
        if total == 0 {
            return;
        }
        let usage = self.active_count() as f64 / total as f64;
        if usage > self.cfg.scale_up_threshold && total < self.cfg.max_connections {
            let step = self
                .cfg
                .scale_up_step
                .min(self.cfg.max_connections - total);
            tracing::debug!(node = %self.node, usage, step, "scaling pool up");
            self.add_idle(step, self.cfg.pre_warm_concurrency, false).await;
        } else if usage < self.cfg.scale_down_threshold && total > self.cfg.min_connections {
            let step = self
                .cfg
                .scale_down_step
                .min(total - self.cfg.min_connections);
            let dropped = self.drop_idle(step, self.cfg.min_connections);
            if dropped > 0 {
                tracing::debug!(node = %self.node, usage, dropped, "scaled pool down");
            }
        }
    }

    /// One cleanup pass: age out idle and over-lifetime connections,
    /// respecting the configured minimum.
    fn cleanup_pass(&self) {
        let idle_timeout = Duration::from_millis(self.cfg.idle_timeout);
        let max_lifetime = Duration::from_millis(self.cfg.max_lifetime);
        let mut inner = self.inner.lock().unwrap();
        let mut kept = VecDeque::with_capacity(inner.idle.len());
        while let Some(conn) = inner.idle.pop_front() {
            let over_age = conn.last_used_at.elapsed() > idle_timeout
                || conn.created_at.elapsed() > max_lifetime;
            if over_age && self.total.load(Ordering::Acquire) > self.cfg.min_connections {
                self.total.fetch_sub(1, Ordering::AcqRel);
            } else {
                kept.push_back(conn);
            }
        }
        inner.idle = kept;
    }

    /// Explicitly resize toward `n`, clamped to `[min, max]`.
    pub async fn resize(self: &Arc<Self>, n: usize) {
        let n = n.clamp(self.cfg.min_connections, self.cfg.max_connections);
        let total = self.total_count();
        if n > total {
            self.add_idle(n - total, self.cfg.pre_warm_concurrency, false).await;
        } else if n < total {
            self.drop_idle(total - n, n);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let dropped = inner.idle.len();
        inner.idle.clear();
        self.total.fetch_sub(dropped, Ordering::AcqRel);
        inner.waiters.clear();
    }
}

/// RAII handle to a checked-out connection. Drop returns it to the pool.
pub struct PoolGuard {
    pool: Arc<ShardPool>,
    conn: Option<Connection>,
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("conn", &self.conn).finish()
    }
}

impl std::ops::Deref for PoolGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// The shard-aware connection pool: one [`ShardPool`] per `(shard, node)`.
pub struct ConnectionPool {
    cfg: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pools: RwLock<HashMap<(ShardId, NodeId), Arc<ShardPool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(cfg: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            cfg,
            factory,
            pools: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a connection with the configured default deadline.
    pub async fn get(
        &self,
        shard: &ShardId,
        node: &NodeId,
        address: &str,
    ) -> Result<PoolGuard, PoolError> {
        self.get_with_deadline(
            shard,
            node,
            address,
            Duration::from_millis(self.cfg.acquire_timeout),
        )
        .await
    }

    /// Acquire a connection within an explicit deadline.
    pub async fn get_with_deadline(
        &self,
        shard: &ShardId,
        node: &NodeId,
        address: &str,
        deadline: Duration,
    ) -> Result<PoolGuard, PoolError> {
        let pool = self.pool_for(shard, node, address).await;
        pool.get(deadline).await
    }

    /// Explicit resize of one target pool.
    pub async fn resize(&self, shard: &ShardId, node: &NodeId, n: usize) {
        let pool = {
            let pools = self.pools.read().unwrap();
            pools.get(&(shard.clone(), node.clone())).cloned()
        };
        if let Some(pool) = pool {
            pool.resize(n).await;
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().unwrap();
        pools.values().map(|p| p.stats()).collect()
    }

    /// Close every pool and stop the background workers.
    pub fn shutdown(&self) {
        for pool in self.pools.read().unwrap().values() {
            pool.close();
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }

    /// Get or lazily create the pool for a target, starting its pre-warm
    /// and maintenance workers on creation.
    async fn pool_for(&self, shard: &ShardId, node: &NodeId, address: &str) -> Arc<ShardPool> {
        let key = (shard.clone(), node.clone());
        if let Some(pool) = self.pools.read().unwrap().get(&key) {
            return pool.clone();
        }

        let created = {
            let mut pools = self.pools.write().unwrap();
            pools
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(ShardPool::new(
                        shard.clone(),
                        node.clone(),
                        address.to_string(),
                        self.cfg.clone(),
                        self.factory.clone(),
                    ))
                })
                .clone()
        };

        self.start_workers(&created).await;
        created
    }

    async fn start_workers(&self, pool: &Arc<ShardPool>) {
        if pool.workers_started.swap(true, Ordering::AcqRel) {
            return;
        }

        // Pre-warm synchronously so the first requests find warm
        // connections.
        if self.cfg.pre_warm_enabled && pool.total_count() == 0 {
            pool.add_idle(
                self.cfg.pre_warm_size.min(self.cfg.max_connections),
                self.cfg.pre_warm_concurrency,
                true,
            )
            .await;
        }

        let mut workers = self.workers.lock().unwrap();

        let health = {
            let pool = pool.clone();
            let period = Duration::from_millis(self.cfg.health_check_interval.max(1));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    pool.health_pass().await;
                }
            })
        };
        workers.push(health);

        let scale = {
            let pool = pool.clone();
            let period = Duration::from_millis(self.cfg.scale_interval.max(1));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    pool.scale_pass().await;
                }
            })
        };
        workers.push(scale);

        let cleanup = {
            let pool = pool.clone();
            let period = Duration::from_millis(self.cfg.idle_timeout.max(1));
            tokio::spawn(async move {
                let mut ticker = interval(period);
                loop {
                    ticker.tick().await;
                    pool.cleanup_pass();
                }
            })
        };
        workers.push(cleanup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    struct TestTransport {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnTransport for TestTransport {
        async fn ping(&mut self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }
    }

    struct TestFactory {
        created: AtomicUsize,
        healthy: Arc<AtomicBool>,
        fail_connect: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                healthy: Arc::new(AtomicBool::new(true)),
                fail_connect: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        async fn connect(
            &self,
            _node: &NodeId,
            _shard: &ShardId,
            _address: &str,
        ) -> anyhow::Result<Box<dyn ConnTransport>> {
            if self.fail_connect.load(Ordering::Acquire) {
                anyhow::bail!("injected connect failure");
            }
            self.created.fetch_add(1, Ordering::AcqRel);
            Ok(Box::new(TestTransport {
                healthy: self.healthy.clone(),
            }))
        }
    }

    fn cfg() -> PoolConfig {
        PoolConfig {
            min_connections: 0,
            max_connections: 2,
            pre_warm_enabled: false,
            pre_warm_size: 0,
            pre_warm_concurrency: 2,
            idle_timeout: 60_000,
            max_lifetime: 600_000,
            health_check_interval: 60_000,
            max_errors: 2,
            scale_interval: 60_000,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_step: 1,
            scale_down_step: 1,
            wait_queue_limit: 4,
            acquire_timeout: 200,
        }
    }

    fn target() -> (ShardId, NodeId) {
        (ShardId::new("s1"), NodeId::new("n1"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_is_enforced_and_waiters_wake_on_put() {
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(cfg(), factory.clone()));
        let (shard, node) = target();

        let a = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        let b = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        assert_eq!(pool.stats()[0].total, 2);

        // Third caller times out while both are held.
        let err = pool
            .get_with_deadline(&shard, &node, "10.0.0.1:7000", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));

        // A parked caller completes once a connection is returned.
        let waiter = {
            let pool = pool.clone();
            let shard = shard.clone();
            let node = node.clone();
            tokio::spawn(async move {
                pool.get_with_deadline(&shard, &node, "10.0.0.1:7000", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(a);
        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.state, ConnState::Active);
        assert_eq!(pool.stats()[0].total, 2);

        drop(b);
        drop(guard);
        // Still within [min, max].
        assert!(pool.stats()[0].total <= 2);
        assert_eq!(factory.created.load(Ordering::Acquire), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unhealthy_connections_are_destroyed_on_put() {
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(cfg(), factory));
        let (shard, node) = target();

        let mut guard = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        guard.record_error("reset by peer");
        guard.record_error("reset by peer");
        drop(guard);

        let stats = pool.stats();
        assert_eq!(stats[0].total, 0);
        assert_eq!(stats[0].idle, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_failure_releases_reservation() {
        let factory = TestFactory::new();
        factory.fail_connect.store(true, Ordering::Release);
        let pool = Arc::new(ConnectionPool::new(cfg(), factory.clone()));
        let (shard, node) = target();

        let err = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap_err();
        assert!(matches!(err, PoolError::ConnectFailed(_)));
        assert_eq!(pool.stats()[0].total, 0);

        factory.fail_connect.store(false, Ordering::Release);
        assert!(pool.get(&shard, &node, "10.0.0.1:7000").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pre_warm_fills_the_pool() {
        let mut pool_cfg = cfg();
        pool_cfg.pre_warm_enabled = true;
        pool_cfg.pre_warm_size = 2;
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(pool_cfg, factory.clone()));
        let (shard, node) = target();

        let guard = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        assert!(guard.pre_warmed);
        let stats = pool.stats();
        assert_eq!(stats[0].total, 2);
        assert_eq!(factory.created.load(Ordering::Acquire), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_pass_destroys_failed_pingers() {
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(cfg(), factory.clone()));
        let (shard, node) = target();

        let guard = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        drop(guard);
        assert_eq!(pool.stats()[0].idle, 1);

        factory.healthy.store(false, Ordering::Release);
        let inner_pool = {
            let pools = pool.pools.read().unwrap();
            pools.values().next().unwrap().clone()
        };
        inner_pool.health_pass().await;
        assert_eq!(pool.stats()[0].total, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resize_clamps_to_bounds() {
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(cfg(), factory));
        let (shard, node) = target();

        // Materialize the pool.
        drop(pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap());
        pool.resize(&shard, &node, 100).await;
        assert_eq!(pool.stats()[0].total, 2); // clamped to max

        pool.resize(&shard, &node, 0).await;
        assert_eq!(pool.stats()[0].total, 0); // clamped to min (0 here)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_respects_min_connections() {
        let mut pool_cfg = cfg();
        pool_cfg.min_connections = 1;
        pool_cfg.idle_timeout = 1;
        let factory = TestFactory::new();
        let pool = Arc::new(ConnectionPool::new(pool_cfg, factory));
        let (shard, node) = target();

        let a = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        let b = pool.get(&shard, &node, "10.0.0.1:7000").await.unwrap();
        drop(a);
        drop(b);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let inner_pool = {
            let pools = pool.pools.read().unwrap();
            pools.values().next().unwrap().clone()
        };
        inner_pool.cleanup_pass();
        assert_eq!(pool.stats()[0].total, 1);
    }
}
