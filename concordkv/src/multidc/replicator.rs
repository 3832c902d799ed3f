//! Cross-DC asynchronous replication.
//!
//! One dispatcher task per remote DC ships committed entries in batches,
//! strictly in order per target. Local commit never waits on remote
//! delivery: entries enter a bounded per-target queue and the dispatcher
//! takes it from there. Batches that exhaust their retries are held at the
//! queue head, never dropped; dispatch resumes from the held batch once the
//! target recovers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use flate2::write::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;

use crate::config::Config;
use crate::config::DataCenter;
use crate::dc::ReplicationBridge;
use crate::error::ReplicationError;
use crate::network::BatchEnvelope;
use crate::network::BatchTransport;
use crate::raft::LogEntry;
use crate::DcId;
use crate::NodeId;

/// Dispatch priority of replicated entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl BatchPriority {
    /// All levels, highest first: the dispatch drain order.
    pub const LEVELS: [BatchPriority; 4] = [
        BatchPriority::Critical,
        BatchPriority::High,
        BatchPriority::Normal,
        BatchPriority::Low,
    ];

    /// Lower rank dispatches first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// A batch of entries bound for one remote DC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub batch_id: u64,
    pub target_dc: DcId,
    pub entries: Vec<LogEntry>,
    pub priority: BatchPriority,
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Point-in-time view of one replication target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetStatus {
    pub dc_id: DcId,
    pub nodes: Vec<NodeId>,
    pub last_replicated_index: u64,
    pub last_replicated_term: u64,
    pub pending_batches: usize,
    /// Smoothed delivery latency in milliseconds.
    pub replication_latency_ms: f64,
    pub is_healthy: bool,
    pub last_health_check: DateTime<Utc>,
    /// Smoothed transport round-trip in milliseconds.
    pub network_latency_ms: f64,
    /// Smoothed delivery throughput in entries per second.
    pub throughput: f64,
}

/// Events emitted on target health transitions and deliveries.
#[derive(Clone, Debug)]
pub enum ReplicatorEvent {
    TargetUnhealthy { dc: DcId },
    TargetRecovered { dc: DcId },
    BatchDelivered { dc: DcId, last_index: u64 },
}

/// Aggregated replicator counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplicatorMetrics {
    pub batches_sent: u64,
    pub entries_replicated: u64,
    /// Bytes of payload actually sent: compressed size when compression ran.
    pub bytes_transferred: u64,
    pub bytes_uncompressed: u64,
    pub compressed_batches: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub success_rate: f64,
    pub error_count: u64,
    pub retry_count: u64,
    pub per_dc: HashMap<DcId, DcReplicationMetrics>,
}

/// Per-DC slice of the replicator counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DcReplicationMetrics {
    pub batches_sent: u64,
    pub entries_replicated: u64,
    pub bytes_transferred: u64,
    pub error_count: u64,
}

#[derive(Default)]
struct MetricsInner {
    batches_sent: u64,
    entries_replicated: u64,
    bytes_transferred: u64,
    bytes_uncompressed: u64,
    compressed_batches: u64,
    error_count: u64,
    retry_count: u64,
    attempts: u64,
    total_latency_ms: f64,
    min_latency_ms: f64,
    max_latency_ms: f64,
    per_dc: HashMap<DcId, DcReplicationMetrics>,
}

impl MetricsInner {
    fn snapshot(&self) -> ReplicatorMetrics {
        ReplicatorMetrics {
            batches_sent: self.batches_sent,
            entries_replicated: self.entries_replicated,
            bytes_transferred: self.bytes_transferred,
            bytes_uncompressed: self.bytes_uncompressed,
            compressed_batches: self.compressed_batches,
            avg_latency_ms: if self.batches_sent == 0 {
                0.0
            } else {
                self.total_latency_ms / self.batches_sent as f64
            },
            min_latency_ms: if self.batches_sent == 0 {
                0.0
            } else {
                self.min_latency_ms
            },
            max_latency_ms: self.max_latency_ms,
            success_rate: if self.attempts == 0 {
                1.0
            } else {
                self.batches_sent as f64 / self.attempts as f64
            },
            error_count: self.error_count,
            retry_count: self.retry_count,
            per_dc: self.per_dc.clone(),
        }
    }
}

struct TargetState {
    last_replicated_index: u64,
    last_replicated_term: u64,
    pending_batches: usize,
    latency_ewma_ms: f64,
    network_latency_ms: f64,
    throughput: f64,
    is_healthy: bool,
    last_health_check: DateTime<Utc>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            last_replicated_index: 0,
            last_replicated_term: 0,
            pending_batches: 0,
            latency_ewma_ms: 0.0,
            network_latency_ms: 0.0,
            throughput: 0.0,
            is_healthy: true,
            last_health_check: Utc::now(),
        }
    }
}

struct QueueItem {
    entries: Vec<LogEntry>,
    priority: BatchPriority,
}

struct Target {
    dc: DataCenter,
    nodes: Vec<NodeId>,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    // One lock per target; the dispatcher is the only writer.
    state: Mutex<TargetState>,
}

/// The cross-DC async replication manager.
pub struct Replicator<T: BatchTransport> {
    config: Arc<Config>,
    local_dc: DcId,
    transport: Arc<T>,
    targets: HashMap<DcId, Arc<Target>>,
    events: broadcast::Sender<ReplicatorEvent>,
    metrics: Arc<Mutex<MetricsInner>>,
    permits: Arc<Semaphore>,
    batch_seq: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: BatchTransport> Replicator<T> {
    /// Build a replicator with one target per remote DC in the config.
    pub fn new(config: Arc<Config>, local_dc: DcId, transport: Arc<T>) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let mut targets = HashMap::new();
        for dc in config.remote_dcs(&local_dc) {
            let nodes: Vec<NodeId> = config.nodes_in_dc(&dc.id).iter().map(|s| s.id.clone()).collect();
            let (tx, rx) = mpsc::channel(config.replicator.queue_capacity);
            targets.insert(
                dc.id.clone(),
                Arc::new(Target {
                    dc: dc.clone(),
                    nodes,
                    tx,
                    rx: Mutex::new(Some(rx)),
                    state: Mutex::new(TargetState::new()),
                }),
            );
        }
        Self {
            permits: Arc::new(Semaphore::new(config.replicator.in_flight_permits.max(1))),
            config,
            local_dc,
            transport,
            targets,
            events,
            metrics: Arc::new(Mutex::new(MetricsInner {
                min_latency_ms: f64::MAX,
                ..MetricsInner::default()
            })),
            batch_seq: Arc::new(AtomicU64::new(1)),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Begin background dispatch, one worker per target DC.
    #[tracing::instrument(level = "debug", skip(self), fields(local_dc = %self.local_dc))]
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        for target in self.targets.values() {
            let rx = match target.rx.lock().unwrap().take() {
                Some(rx) => rx,
                None => continue, // already started
            };
            let dispatcher = Dispatcher {
                replicator_cfg: self.config.replicator.clone(),
                dc: target.dc.clone(),
                nodes: target.nodes.clone(),
                node_cursor: 0,
                transport: self.transport.clone(),
                target: target.clone(),
                events: self.events.clone(),
                metrics: self.metrics.clone(),
                permits: self.permits.clone(),
                batch_seq: self.batch_seq.clone(),
                rx,
                shutdown: self.shutdown.subscribe(),
                buffer: Default::default(),
                buffer_since: None,
                outbound: VecDeque::new(),
            };
            workers.push(tokio::spawn(dispatcher.run()));
        }
        tracing::info!(targets = self.targets.len(), "async replicator started");
    }

    /// Drain in-flight work up to the configured deadline, then terminate.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let deadline = Duration::from_millis(self.config.replicator.shutdown_deadline);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if timeout(deadline, worker).await.is_err() {
                tracing::warn!("replication dispatcher did not drain before shutdown deadline");
            }
        }
    }

    /// Enqueue committed entries for every remote DC. Returns as soon as the
    /// entries are queued; never waits for delivery.
    pub async fn replicate_async(&self, entries: Vec<LogEntry>) -> Result<(), ReplicationError> {
        self.replicate_with_priority(entries, BatchPriority::Normal).await
    }

    /// Enqueue with an explicit priority. `Critical` forces an immediate
    /// flush at each target.
    pub async fn replicate_with_priority(
        &self,
        entries: Vec<LogEntry>,
        priority: BatchPriority,
    ) -> Result<(), ReplicationError> {
        if entries.is_empty() {
            return Ok(());
        }
        for target in self.targets.values() {
            target
                .tx
                .send(QueueItem {
                    entries: entries.clone(),
                    priority,
                })
                .await
                .map_err(|_| ReplicationError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Enqueue entries for a single DC, used by consistency recovery.
    pub async fn replicate_to(
        &self,
        dc: &DcId,
        entries: Vec<LogEntry>,
        priority: BatchPriority,
    ) -> Result<(), ReplicationError> {
        let target = self
            .targets
            .get(dc)
            .ok_or_else(|| ReplicationError::UnknownTarget(dc.clone()))?;
        target
            .tx
            .send(QueueItem { entries, priority })
            .await
            .map_err(|_| ReplicationError::ShuttingDown)
    }

    /// Build the bridge fed by the Raft commit path. The returned task
    /// forwards bridged entries into the bounded queues.
    pub fn bridge(self: &Arc<Self>) -> (ReplicationBridge, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<LogEntry>>();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(entries) = rx.recv().await {
                if let Err(err) = this.replicate_async(entries).await {
                    tracing::warn!(error = %err, "replication bridge could not enqueue entries");
                }
            }
        });
        (ReplicationBridge::new(tx), handle)
    }

    /// Snapshot of every target's replication state.
    pub fn get_status(&self) -> HashMap<DcId, TargetStatus> {
        self.targets
            .iter()
            .map(|(dc, target)| {
                let state = target.state.lock().unwrap();
                (
                    dc.clone(),
                    TargetStatus {
                        dc_id: dc.clone(),
                        nodes: target.nodes.clone(),
                        last_replicated_index: state.last_replicated_index,
                        last_replicated_term: state.last_replicated_term,
                        pending_batches: state.pending_batches,
                        replication_latency_ms: state.latency_ewma_ms,
                        is_healthy: state.is_healthy,
                        last_health_check: state.last_health_check,
                        network_latency_ms: state.network_latency_ms,
                        throughput: state.throughput,
                    },
                )
            })
            .collect()
    }

    pub fn get_metrics(&self) -> ReplicatorMetrics {
        self.metrics.lock().unwrap().snapshot()
    }

    pub fn is_healthy(&self, dc: &DcId) -> bool {
        self.targets
            .get(dc)
            .map(|t| t.state.lock().unwrap().is_healthy)
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.events.subscribe()
    }
}

struct Dispatcher<T: BatchTransport> {
    replicator_cfg: crate::config::ReplicatorConfig,
    dc: DataCenter,
    nodes: Vec<NodeId>,
    node_cursor: usize,
    transport: Arc<T>,
    target: Arc<Target>,
    events: broadcast::Sender<ReplicatorEvent>,
    metrics: Arc<Mutex<MetricsInner>>,
    permits: Arc<Semaphore>,
    batch_seq: Arc<AtomicU64>,
    rx: mpsc::Receiver<QueueItem>,
    shutdown: watch::Receiver<bool>,
    /// Pending entries, one FIFO sub-queue per priority level, indexed by
    /// [`BatchPriority::rank`].
    buffer: [VecDeque<LogEntry>; 4],
    buffer_since: Option<Instant>,
    outbound: VecDeque<ReplicationBatch>,
}

impl<T: BatchTransport> Dispatcher<T> {
    #[tracing::instrument(level = "debug", skip(self), fields(dc = %self.dc.id))]
    async fn run(mut self) {
        let mut flush_tick = interval(Duration::from_millis(
            self.replicator_cfg.flush_interval.max(1),
        ));
        loop {
            // Pull everything already queued before deciding to flush.
            loop {
                match self.rx.try_recv() {
                    Ok(item) => self.absorb(item),
                    Err(_) => break,
                }
            }
            self.roll_batches(false);
            self.dispatch_outbound().await;

            if *self.shutdown.borrow() {
                self.drain_for_shutdown().await;
                return;
            }

            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => self.absorb(item),
                    None => {
                        self.drain_for_shutdown().await;
                        return;
                    }
                },
                _ = flush_tick.tick() => {}
                _ = self.shutdown.changed() => {}
            }
        }
    }

    fn absorb(&mut self, item: QueueItem) {
        if self.buffered_len() == 0 {
            self.buffer_since = Some(Instant::now());
        }
        self.buffer[item.priority.rank() as usize].extend(item.entries);
    }

    fn buffered_len(&self) -> usize {
        self.buffer.iter().map(|queue| queue.len()).sum()
    }

    /// Move buffered entries into outbound batches when a flush condition
    /// holds: the batch is full, the buffer is old enough, or a critical
    /// entry arrived.
    ///
    /// Within a flush window, priority is the primary order: Critical, then
    /// High, Normal, Low, each level FIFO internally. A batch takes the
    /// priority of the highest level it drains from. Built batches still
    /// dispatch strictly FIFO per target, which keeps acknowledged indexes
    /// monotonic.
    fn roll_batches(&mut self, force: bool) {
        let max = self.dc.max_async_batch_size.max(1);
        loop {
            let total = self.buffered_len();
            if total == 0 {
                self.buffer_since = None;
                return;
            }
            let aged = self
                .buffer_since
                .map(|since| since.elapsed() >= Duration::from_millis(self.replicator_cfg.flush_interval))
                .unwrap_or(false);
            let critical =
                !self.buffer[BatchPriority::Critical.rank() as usize].is_empty();
            if !(force || critical || aged || total >= max) {
                return;
            }

            let mut entries: Vec<LogEntry> = Vec::with_capacity(total.min(max));
            let mut priority = BatchPriority::Low;
            for level in BatchPriority::LEVELS {
                let queue = &mut self.buffer[level.rank() as usize];
                if entries.is_empty() && !queue.is_empty() {
                    priority = level;
                }
                while entries.len() < max {
                    match queue.pop_front() {
                        Some(entry) => entries.push(entry),
                        None => break,
                    }
                }
                if entries.len() == max {
                    break;
                }
            }

            let batch = ReplicationBatch {
                batch_id: self.batch_seq.fetch_add(1, Ordering::Relaxed),
                target_dc: self.dc.id.clone(),
                entries,
                priority,
                compressed: false,
                created_at: Utc::now(),
                attempts: 0,
                max_attempts: self.replicator_cfg.max_retries,
            };
            self.outbound.push_back(batch);
            if self.buffered_len() == 0 {
                self.buffer_since = None;
            } else {
                self.buffer_since = Some(Instant::now());
            }
        }
    }

    fn set_pending(&self) {
        let mut state = self.target.state.lock().unwrap();
        state.pending_batches = self.outbound.len();
    }

    /// Deliver outbound batches head-first. On retry exhaustion the head is
    /// held, the target marked unhealthy, and delivery keeps retrying at the
    /// backoff ceiling until the target recovers.
    async fn dispatch_outbound(&mut self) {
        self.set_pending();
        while let Some(batch) = self.outbound.front().cloned() {
            // Configured dispatch delay: secondary DCs yield capacity to the
            // primary DC.
            if self.dc.async_replication_delay > 0 {
                sleep(Duration::from_millis(self.dc.async_replication_delay)).await;
            }

            match self.deliver_with_retries(batch).await {
                Ok(()) => {
                    self.outbound.pop_front();
                    self.set_pending();
                }
                Err(()) => {
                    // Held at queue head. Mark unhealthy and keep probing.
                    self.mark_unhealthy();
                    if !self.retry_until_recovered().await {
                        return; // shutting down
                    }
                }
            }
        }
    }

    /// One delivery cycle: up to `max_retries` attempts with exponential
    /// backoff and jitter.
    async fn deliver_with_retries(&mut self, mut batch: ReplicationBatch) -> Result<(), ()> {
        let mut backoff = self.replicator_cfg.retry_backoff.max(1);
        while batch.attempts < batch.max_attempts {
            batch.attempts += 1;
            if batch.attempts > 1 {
                self.metrics.lock().unwrap().retry_count += 1;
                let jitter = thread_rng().gen_range(0..=backoff / 2);
                sleep(Duration::from_millis(backoff + jitter)).await;
                backoff = (backoff * 2).min(self.replicator_cfg.retry_backoff_max);
            }
            if self.send_once(&batch).await {
                return Ok(());
            }
            if *self.shutdown.borrow() {
                return Err(());
            }
        }
        Err(())
    }

    /// A single send attempt against the next node of the target DC.
    async fn send_once(&mut self, batch: &ReplicationBatch) -> bool {
        if self.nodes.is_empty() {
            tracing::error!(dc = %self.dc.id, "no nodes configured for replication target");
            return false;
        }
        let node = self.nodes[self.node_cursor % self.nodes.len()].clone();

        let (payload, compressed, raw_len) = match encode_payload(
            &batch.entries,
            self.dc.enable_compression,
            self.replicator_cfg.compression_threshold,
        ) {
            Ok(done) => done,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode replication batch");
                return false;
            }
        };
        let envelope = BatchEnvelope {
            batch_id: batch.batch_id,
            target_dc: batch.target_dc.clone(),
            compressed,
            payload,
        };
        let sent_bytes = envelope.payload.len() as u64;

        {
            let mut m = self.metrics.lock().unwrap();
            m.attempts += 1;
        }

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let started = Instant::now();
        let res = self.transport.send_batch(&node, envelope).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;

        match res {
            Ok(ack) => {
                let last = batch.entries.last().expect("batches are never empty");
                {
                    let mut state = self.target.state.lock().unwrap();
                    // Monotonic per the delivery-order invariant.
                    state.last_replicated_index =
                        state.last_replicated_index.max(ack.last_applied_index);
                    state.last_replicated_term = state.last_replicated_term.max(last.term);
                    state.latency_ewma_ms = ewma(state.latency_ewma_ms, elapsed_ms);
                    state.network_latency_ms = ewma(state.network_latency_ms, elapsed_ms);
                    if elapsed_ms > 0.0 {
                        state.throughput = ewma(
                            state.throughput,
                            batch.entries.len() as f64 / (elapsed_ms / 1_000.0),
                        );
                    }
                    state.last_health_check = Utc::now();
                }
                {
                    let mut m = self.metrics.lock().unwrap();
                    m.batches_sent += 1;
                    m.entries_replicated += batch.entries.len() as u64;
                    m.bytes_transferred += sent_bytes;
                    m.bytes_uncompressed += raw_len as u64;
                    if compressed {
                        m.compressed_batches += 1;
                    }
                    m.total_latency_ms += elapsed_ms;
                    m.min_latency_ms = m.min_latency_ms.min(elapsed_ms);
                    m.max_latency_ms = m.max_latency_ms.max(elapsed_ms);
                    let per = m.per_dc.entry(self.dc.id.clone()).or_default();
                    per.batches_sent += 1;
                    per.entries_replicated += batch.entries.len() as u64;
                    per.bytes_transferred += sent_bytes;
                }
                self.mark_healthy();
                let _ = self.events.send(ReplicatorEvent::BatchDelivered {
                    dc: self.dc.id.clone(),
                    last_index: last.index,
                });
                true
            }
            Err(err) => {
                tracing::warn!(dc = %self.dc.id, node = %node, error = %err, "batch send failed");
                self.node_cursor = self.node_cursor.wrapping_add(1);
                let mut m = self.metrics.lock().unwrap();
                m.error_count += 1;
                m.per_dc.entry(self.dc.id.clone()).or_default().error_count += 1;
                false
            }
        }
    }

    /// After retry exhaustion: keep probing with the head batch at the
    /// backoff ceiling. Returns false when shutting down.
    async fn retry_until_recovered(&mut self) -> bool {
        let ceiling = Duration::from_millis(self.replicator_cfg.retry_backoff_max.max(1));
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            tokio::select! {
                _ = sleep(ceiling) => {}
                _ = self.shutdown.changed() => continue,
            }
            let head = match self.outbound.front().cloned() {
                Some(batch) => batch,
                None => return true,
            };
            if self.send_once(&head).await {
                self.outbound.pop_front();
                self.set_pending();
                self.mark_recovered();
                return true;
            }
        }
    }

    fn mark_unhealthy(&self) {
        let mut state = self.target.state.lock().unwrap();
        if state.is_healthy {
            state.is_healthy = false;
            state.last_health_check = Utc::now();
            drop(state);
            tracing::warn!(dc = %self.dc.id, "replication target unhealthy, holding batches");
            let _ = self
                .events
                .send(ReplicatorEvent::TargetUnhealthy { dc: self.dc.id.clone() });
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.target.state.lock().unwrap();
        state.is_healthy = true;
        state.last_health_check = Utc::now();
    }

    fn mark_recovered(&self) {
        tracing::info!(dc = %self.dc.id, "replication target recovered, resuming dispatch");
        let _ = self
            .events
            .send(ReplicatorEvent::TargetRecovered { dc: self.dc.id.clone() });
    }

    /// Best-effort final flush within the shutdown deadline: one delivery
    /// cycle per remaining batch, no recovery loop.
    async fn drain_for_shutdown(&mut self) {
        self.roll_batches(true);
        while let Some(batch) = self.outbound.front().cloned() {
            match self.deliver_with_retries(batch).await {
                Ok(()) => {
                    self.outbound.pop_front();
                }
                Err(()) => break,
            }
        }
        self.set_pending();
        tracing::debug!(dc = %self.dc.id, remaining = self.outbound.len(), "dispatcher drained");
    }
}

fn ewma(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        0.8 * current + 0.2 * sample
    }
}

/// Encode a batch payload, compressing above the threshold when the target
/// DC has compression enabled. Returns `(payload, compressed, raw_len)`.
pub fn encode_payload(
    entries: &[LogEntry],
    enable_compression: bool,
    threshold: usize,
) -> Result<(Vec<u8>, bool, usize), ReplicationError> {
    let raw = serde_json::to_vec(entries).map_err(ReplicationError::Encode)?;
    let raw_len = raw.len();
    if enable_compression && raw_len >= threshold {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map_err(|err| ReplicationError::Transport(err.into()))?;
        if compressed.len() < raw_len {
            return Ok((compressed, true, raw_len));
        }
    }
    Ok((raw, false, raw_len))
}

/// Decode a batch payload produced by [`encode_payload`].
pub fn decode_payload(payload: &[u8], compressed: bool) -> anyhow::Result<Vec<LogEntry>> {
    if compressed {
        let mut decoder = GzDecoder::new(Vec::new());
        decoder.write_all(payload)?;
        let raw = decoder.finish()?;
        Ok(serde_json::from_slice(&raw)?)
    } else {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::config::ReplicaRole;
    use crate::config::Server;
    use crate::network::BatchAck;
    use crate::storage::SnapshotData;

    /// Transport that records envelopes and can fail the first N sends.
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, BatchEnvelope)>>,
        fail_first: AtomicU32,
    }

    impl RecordingTransport {
        fn new(fail_first: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(fail_first),
            }
        }

        fn delivered(&self) -> Vec<(NodeId, BatchEnvelope)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchTransport for RecordingTransport {
        async fn send_batch(&self, target: &NodeId, batch: BatchEnvelope) -> anyhow::Result<BatchAck> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("injected send failure"));
            }
            let entries = decode_payload(&batch.payload, batch.compressed)?;
            let last = entries.last().map(|e| e.index).unwrap_or(0);
            let batch_id = batch.batch_id;
            self.sent.lock().unwrap().push((target.clone(), batch));
            Ok(BatchAck {
                batch_id,
                last_applied_index: last,
            })
        }

        async fn send_snapshot(&self, _target: &NodeId, _snapshot: SnapshotData) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn two_dc_config() -> Arc<Config> {
        let mut replicator = crate::config::ReplicatorConfig::default();
        replicator.flush_interval = 10;
        replicator.retry_backoff = 1;
        replicator.retry_backoff_max = 5;
        replicator.compression_threshold = 512;
        Arc::new(
            Config::build("repl-test")
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
                .replicator(replicator)
                .validate()
                .unwrap(),
        )
    }

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::normal(i, 1, format!("payload-{i}").into_bytes()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delivers_in_order_and_tracks_index() {
        let config = two_dc_config();
        let transport = Arc::new(RecordingTransport::new(0));
        let replicator = Arc::new(Replicator::new(config, "dc1".into(), transport.clone()));
        replicator.start();

        replicator.replicate_async(entries(1..=3)).await.unwrap();
        replicator.replicate_async(entries(4..=6)).await.unwrap();
        replicator.stop().await;

        let delivered = transport.delivered();
        assert!(!delivered.is_empty());
        let mut last_first_index = 0;
        for (node, envelope) in &delivered {
            assert_eq!(node, &NodeId::new("n4"));
            let entries = decode_payload(&envelope.payload, envelope.compressed).unwrap();
            assert!(entries[0].index > last_first_index);
            last_first_index = entries[0].index;
        }

        let status = replicator.get_status();
        let dc2 = status.get(&DcId::new("dc2")).unwrap();
        assert_eq!(dc2.last_replicated_index, 6);
        assert!(dc2.is_healthy);

        let metrics = replicator.get_metrics();
        assert_eq!(metrics.entries_replicated, 6);
        assert!(metrics.bytes_transferred > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_then_recovers_without_dropping() {
        let config = two_dc_config();
        // More failures than max_retries: the batch must be held, not lost.
        let transport = Arc::new(RecordingTransport::new(7));
        let replicator = Arc::new(Replicator::new(config, "dc1".into(), transport.clone()));
        let mut events = replicator.subscribe();
        replicator.start();

        replicator
            .replicate_with_priority(entries(1..=2), BatchPriority::Critical)
            .await
            .unwrap();

        // Expect an unhealthy transition, then delivery and recovery.
        let mut saw_unhealthy = false;
        let mut saw_recovered = false;
        let mut saw_delivered = false;
        for _ in 0..8 {
            if saw_unhealthy && saw_recovered && saw_delivered {
                break;
            }
            match timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Ok(ReplicatorEvent::TargetUnhealthy { .. })) => saw_unhealthy = true,
                Ok(Ok(ReplicatorEvent::TargetRecovered { .. })) => saw_recovered = true,
                Ok(Ok(ReplicatorEvent::BatchDelivered { last_index, .. })) => {
                    assert_eq!(last_index, 2);
                    saw_delivered = true;
                }
                _ => break,
            }
        }
        assert!(saw_unhealthy);
        assert!(saw_recovered);
        assert!(saw_delivered);

        replicator.stop().await;
        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        let metrics = replicator.get_metrics();
        assert!(metrics.retry_count >= 4);
        assert!(metrics.error_count >= 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn compresses_large_batches() {
        let config = two_dc_config();
        let transport = Arc::new(RecordingTransport::new(0));
        let replicator = Arc::new(Replicator::new(config, "dc1".into(), transport.clone()));
        replicator.start();

        // Highly compressible payload well over the threshold.
        let big = vec![LogEntry::normal(1, 1, vec![b'a'; 4096])];
        replicator.replicate_async(big).await.unwrap();
        replicator.stop().await;

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        let envelope = &delivered[0].1;
        assert!(envelope.compressed);
        assert!(envelope.payload.len() < 4096);

        let metrics = replicator.get_metrics();
        assert_eq!(metrics.compressed_batches, 1);
        assert_eq!(metrics.bytes_transferred, envelope.payload.len() as u64);
        assert!(metrics.bytes_uncompressed > metrics.bytes_transferred);
    }

    #[test]
    fn payload_round_trip() {
        let entries = entries(1..=4);
        let (payload, compressed, raw_len) = encode_payload(&entries, true, 0).unwrap();
        assert!(compressed);
        assert!(raw_len > payload.len());
        let decoded = decode_payload(&payload, true).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn priority_ranks() {
        assert!(BatchPriority::Critical.rank() < BatchPriority::High.rank());
        assert!(BatchPriority::High.rank() < BatchPriority::Normal.rank());
        assert!(BatchPriority::Normal.rank() < BatchPriority::Low.rank());
        assert_eq!(BatchPriority::LEVELS[0], BatchPriority::Critical);
        assert_eq!(BatchPriority::LEVELS[3], BatchPriority::Low);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_entries_dispatch_before_buffered_lower_ones() {
        // dc2 with a batch size of 2, so the flush window splits into
        // several batches and the drain order is observable on the wire.
        let mut replicator_cfg = crate::config::ReplicatorConfig::default();
        replicator_cfg.flush_interval = 10;
        let mut dc2 = DataCenter::new("dc2", "west");
        dc2.max_async_batch_size = 2;
        let config = Arc::new(
            Config::build("repl-priority-test")
                .datacenter(DataCenter::new("dc1", "east").primary())
                .datacenter(dc2)
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
                .replicator(replicator_cfg)
                .validate()
                .unwrap(),
        );
        let transport = Arc::new(RecordingTransport::new(0));
        let replicator = Arc::new(Replicator::new(config, "dc1".into(), transport.clone()));

        // Queue everything before the dispatcher starts, so one flush
        // window covers all three priority levels.
        replicator
            .replicate_with_priority(entries(1..=2), BatchPriority::Normal)
            .await
            .unwrap();
        replicator
            .replicate_with_priority(entries(3..=4), BatchPriority::High)
            .await
            .unwrap();
        replicator
            .replicate_with_priority(entries(5..=5), BatchPriority::Critical)
            .await
            .unwrap();

        replicator.start();
        replicator.stop().await;

        let delivered: Vec<u64> = transport
            .delivered()
            .iter()
            .flat_map(|(_, envelope)| {
                decode_payload(&envelope.payload, envelope.compressed).unwrap()
            })
            .map(|entry| entry.index)
            .collect();
        // Critical first, then High, then the already-buffered Normal
        // entries, FIFO within each level.
        assert_eq!(delivered, vec![5, 3, 4, 1, 2]);
    }
}
