//! Dispatch engine: the central orchestrator.
//!
//! Owns the pool registry, the queue consumers and their polling tasks,
//! the in-flight set, and the shutdown protocol. Polling is gated on
//! the election role: unless this instance is PRIMARY, no message
//! moves.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionVerdict, InFlightSet};
use crate::breaker::BreakerRegistry;
use crate::mediator::Mediator;
use crate::pool::{PoolContext, WorkerPool};
use crate::telemetry;
use crate::warning::WarningStore;
use crate::Result;
use relay_common::{
    InFlightEntry, MessagePointer, PoolConfig, PoolStats, QueueConfig, QueueStats,
    RouterTopology, WarningCategory, WarningSeverity,
};
use relay_queue::{QueueConsumer, QueueError};
use relay_standby::Role;

/// Pause after a poll error before polling the same queue again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// How often the drain loop re-checks progress.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How often finished draining pools are reaped.
const DRAIN_REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Creates queue consumers from their configuration. Implemented by
/// the binary so the engine stays broker-agnostic.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(&self, config: &QueueConfig) -> Result<Arc<dyn QueueConsumer>>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DispatchEngine {
    pools: Arc<DashMap<String, Arc<WorkerPool>>>,
    draining_pools: DashMap<String, Arc<WorkerPool>>,
    pool_configs: RwLock<HashMap<String, PoolConfig>>,
    consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,
    queue_configs: RwLock<HashMap<String, QueueConfig>>,
    /// Queues whose polling task has been spawned.
    polling: Mutex<HashSet<String>>,
    consumer_factory: Option<Arc<dyn ConsumerFactory>>,
    in_flight: Arc<InFlightSet>,
    admission: Admission,
    warnings: Arc<WarningStore>,
    role_rx: watch::Receiver<Role>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    config: EngineConfig,
    running: AtomicBool,
    ctx: Arc<PoolContext>,
}

impl DispatchEngine {
    pub fn new(
        mediator: Arc<dyn Mediator>,
        breakers: Arc<BreakerRegistry>,
        warnings: Arc<WarningStore>,
        role_rx: watch::Receiver<Role>,
        config: EngineConfig,
    ) -> Self {
        let in_flight = Arc::new(InFlightSet::new());
        let pools: Arc<DashMap<String, Arc<WorkerPool>>> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(PoolContext {
            mediator,
            breakers,
            in_flight: Arc::clone(&in_flight),
            warnings: Arc::clone(&warnings),
        });

        Self {
            admission: Admission::new(Arc::clone(&in_flight), Arc::clone(&pools)),
            pools,
            draining_pools: DashMap::new(),
            pool_configs: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            queue_configs: RwLock::new(HashMap::new()),
            polling: Mutex::new(HashSet::new()),
            consumer_factory: None,
            in_flight,
            warnings,
            role_rx,
            shutdown_tx,
            shutdown_rx,
            config,
            running: AtomicBool::new(true),
            ctx,
        }
    }

    pub fn with_consumer_factory(mut self, factory: Arc<dyn ConsumerFactory>) -> Self {
        self.consumer_factory = Some(factory);
        self
    }

    pub fn warnings(&self) -> &Arc<WarningStore> {
        &self.warnings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shutdown signal shared with auxiliary background tasks.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Register a consumer directly (tests, embedded mode). Must be
    /// called before [`DispatchEngine::start`].
    pub async fn add_consumer(&self, consumer: Arc<dyn QueueConsumer>) {
        let id = consumer.identifier().to_string();
        self.consumers.write().await.insert(id.clone(), consumer);

        let mut queue_configs = self.queue_configs.write().await;
        queue_configs.entry(id.clone()).or_insert_with(|| QueueConfig {
            name: id,
            uri: String::new(),
            kind: Default::default(),
            visibility_timeout: 120,
            wait_time_seconds: 5,
            max_messages: 10,
        });
    }

    /// Apply a topology: create/update/remove pools, then reconcile the
    /// queue consumers. Safe to call repeatedly for refreshes.
    pub async fn apply_topology(self: Arc<Self>, topology: RouterTopology) -> Result<bool> {
        if !self.is_running() {
            warn!("Ignoring topology update during shutdown");
            return Ok(false);
        }

        let new_pool_configs: HashMap<String, PoolConfig> = topology
            .pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut pool_configs = self.pool_configs.write().await;
        let mut pools_updated = 0;
        let mut pools_created = 0;
        let mut pools_removed = 0;

        // Existing pools: update in place, replace, or drain out.
        let existing: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for code in existing {
            match new_pool_configs.get(&code) {
                Some(new_config) => {
                    let Some(old_config) = pool_configs.get(&code).cloned() else {
                        continue;
                    };
                    if old_config == *new_config {
                        continue;
                    }

                    if old_config.queue_capacity != new_config.queue_capacity {
                        // The channel bound is fixed at creation, so a
                        // capacity change swaps in a fresh runtime.
                        if let Some((_, old_pool)) = self.pools.remove(&code) {
                            old_pool.drain();
                            self.draining_pools
                                .insert(format!("{}@replaced", code), old_pool);
                        }
                        self.create_pool(new_config.clone());
                    } else {
                        let pool = self.pools.get(&code).map(|p| Arc::clone(&p));
                        if let Some(pool) = pool {
                            if old_config.concurrency != new_config.concurrency {
                                pool.update_concurrency(new_config.concurrency).await;
                            }
                            if old_config.rate_limit_per_minute
                                != new_config.rate_limit_per_minute
                            {
                                pool.update_rate_limit(new_config.rate_limit_per_minute);
                            }
                        }
                    }

                    pool_configs.insert(code, new_config.clone());
                    pools_updated += 1;
                }
                None => {
                    if let Some((code, pool)) = self.pools.remove(&code) {
                        info!(
                            pool_code = %code,
                            queue_size = pool.queue_size(),
                            active_workers = pool.active_workers(),
                            "Pool removed from topology, draining"
                        );
                        pool.drain();
                        self.draining_pools.insert(code.clone(), pool);
                        pool_configs.remove(&code);
                        pools_removed += 1;
                    }
                }
            }
        }

        // New pools.
        for pool_config in &topology.pools {
            if !self.pools.contains_key(&pool_config.code) {
                self.create_pool(pool_config.clone());
                pool_configs.insert(pool_config.code.clone(), pool_config.clone());
                pools_created += 1;
            }
        }
        drop(pool_configs);

        let (queues_created, queues_removed) = Self::sync_consumers(&self, &topology).await;

        info!(
            pools_updated = pools_updated,
            pools_created = pools_created,
            pools_removed = pools_removed,
            queues_created = queues_created,
            queues_removed = queues_removed,
            total_pools = self.pools.len(),
            "Topology applied"
        );

        Ok(true)
    }

    fn create_pool(&self, config: PoolConfig) {
        let code = config.code.clone();
        let pool = Arc::new(WorkerPool::new(
            config,
            Arc::clone(&self.ctx),
            self.shutdown_rx.clone(),
        ));
        pool.start();
        self.pools.insert(code, pool);
    }

    /// Reconcile consumers against the topology's queue list.
    async fn sync_consumers(engine: &Arc<Self>, topology: &RouterTopology) -> (usize, usize) {
        let mut created = 0;
        let mut removed = 0;

        let new_queues: HashMap<String, QueueConfig> = topology
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.clone()))
            .collect();

        let mut consumers = engine.consumers.write().await;
        let mut queue_configs = engine.queue_configs.write().await;

        // Stop consumers whose queue disappeared.
        let existing: Vec<String> = consumers.keys().cloned().collect();
        for queue_id in existing {
            if !new_queues.contains_key(&queue_id) {
                if let Some(consumer) = consumers.remove(&queue_id) {
                    info!(queue = %queue_id, "Queue removed from topology, stopping consumer");
                    consumer.stop().await;
                    queue_configs.remove(&queue_id);
                    removed += 1;
                }
            }
        }

        // Create consumers for new queues.
        for (queue_id, queue_config) in &new_queues {
            if consumers.contains_key(queue_id) {
                continue;
            }

            let Some(ref factory) = engine.consumer_factory else {
                warn!(
                    queue = %queue_id,
                    "New queue in topology but no consumer factory configured"
                );
                continue;
            };

            match factory.create_consumer(queue_config).await {
                Ok(consumer) => {
                    consumers.insert(queue_id.clone(), Arc::clone(&consumer));
                    queue_configs.insert(queue_id.clone(), queue_config.clone());
                    created += 1;
                    info!(queue = %queue_id, "Queue consumer created");

                    Self::spawn_poll_loop(engine, consumer, queue_config.clone()).await;
                }
                Err(e) => {
                    error!(queue = %queue_id, error = %e, "Failed to create queue consumer");
                    engine.warnings.add(
                        WarningCategory::QueueConnectivity,
                        WarningSeverity::Critical,
                        format!("Failed to create consumer for queue [{}]: {}", queue_id, e),
                        "DispatchEngine".to_string(),
                    );
                }
            }
        }

        (created, removed)
    }

    /// Start polling every registered consumer and the drain reaper.
    pub async fn start(self: Arc<Self>) {
        let consumers: Vec<(Arc<dyn QueueConsumer>, QueueConfig)> = {
            let consumers = self.consumers.read().await;
            let queue_configs = self.queue_configs.read().await;
            consumers
                .iter()
                .filter_map(|(id, c)| {
                    queue_configs
                        .get(id)
                        .map(|cfg| (Arc::clone(c), cfg.clone()))
                })
                .collect()
        };

        info!(consumers = consumers.len(), "Starting dispatch engine");

        for (consumer, config) in consumers {
            Self::spawn_poll_loop(&self, consumer, config).await;
        }

        Self::spawn_drain_reaper(&self);
    }

    /// One polling task per queue, gated on the election role.
    async fn spawn_poll_loop(
        engine: &Arc<Self>,
        consumer: Arc<dyn QueueConsumer>,
        queue_config: QueueConfig,
    ) {
        {
            let mut polling = engine.polling.lock().await;
            if !polling.insert(consumer.identifier().to_string()) {
                return; // already polling this queue
            }
        }

        let engine = Arc::clone(engine);
        let mut role_rx = engine.role_rx.clone();
        let mut shutdown_rx = engine.shutdown_rx.clone();
        let wait = Duration::from_secs(queue_config.wait_time_seconds as u64);
        let max_messages = queue_config.max_messages;

        tokio::spawn(async move {
            let queue_id = consumer.identifier().to_string();
            info!(queue = %queue_id, "Consumer poll loop started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                // Standby gate: no admission, no polls, no message moves
                // unless this instance is PRIMARY.
                if *role_rx.borrow() != Role::Primary {
                    tokio::select! {
                        _ = role_rx.changed() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                    continue;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => continue,
                    _ = role_rx.changed() => continue,
                    result = consumer.poll(max_messages, wait) => {
                        match result {
                            Ok(pointers) => {
                                telemetry::record_consumer_poll(&queue_id, pointers.len());
                                for pointer in pointers {
                                    engine.admit(pointer, Arc::clone(&consumer)).await;
                                }
                            }
                            Err(QueueError::Stopped) => {
                                info!(queue = %queue_id, "Consumer stopped, ending poll loop");
                                break;
                            }
                            Err(e) => {
                                error!(queue = %queue_id, error = %e, "Poll failed");
                                telemetry::record_consumer_error(&queue_id);
                                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                            }
                        }
                    }
                }
            }

            engine.polling.lock().await.remove(&queue_id);
            info!(queue = %queue_id, "Consumer poll loop exited");
        });
    }

    /// Route one polled message and handle the rejection paths.
    async fn admit(&self, pointer: MessagePointer, consumer: Arc<dyn QueueConsumer>) {
        let message_id = pointer.message.id.clone();
        let pool_code = pointer.message.pool_code.clone();
        let receipt = pointer.receipt.clone();

        match self.admission.route(pointer, Arc::clone(&consumer)) {
            AdmissionVerdict::Admitted => {
                telemetry::set_in_flight_count(self.in_flight.len());
            }
            AdmissionVerdict::Duplicate => {
                // Redelivery while the original is still processing:
                // leave unacked, the broker retries after its
                // visibility timeout.
                debug!(message_id = %message_id, "Deferred duplicate delivery");
            }
            AdmissionVerdict::PoolFull => {
                warn!(
                    message_id = %message_id,
                    pool_code = %pool_code,
                    "Pool at capacity, leaving message for redelivery"
                );
                self.warnings.add(
                    WarningCategory::PoolCapacity,
                    WarningSeverity::Warn,
                    format!(
                        "Pool [{}] channel full, message {} deferred",
                        pool_code, message_id
                    ),
                    "DispatchEngine".to_string(),
                );
            }
            AdmissionVerdict::UnknownPool => {
                warn!(
                    message_id = %message_id,
                    pool_code = %pool_code,
                    "No such pool, nacking toward the DLQ"
                );
                self.warnings.add(
                    WarningCategory::Routing,
                    WarningSeverity::Warn,
                    format!("Message {} names unknown pool [{}]", message_id, pool_code),
                    "DispatchEngine".to_string(),
                );
                if let Err(e) = consumer.nack(&receipt, None).await {
                    warn!(message_id = %message_id, error = %e, "Nack failed for unknown-pool message");
                }
            }
        }
    }

    /// Reap draining pools once they empty out.
    fn spawn_drain_reaper(engine: &Arc<Self>) {
        let engine = Arc::clone(engine);
        let mut shutdown_rx = engine.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let finished: Vec<String> = engine
                            .draining_pools
                            .iter()
                            .filter(|e| e.value().is_fully_drained())
                            .map(|e| e.key().clone())
                            .collect();
                        for code in finished {
                            info!(pool_code = %code, "Draining pool finished");
                            engine.draining_pools.remove(&code);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Graceful shutdown: stop polling, let in-hand messages finish,
    /// abandon the rest to broker redelivery after the drain deadline.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Dispatch engine shutting down");

        {
            let consumers = self.consumers.read().await;
            for consumer in consumers.values() {
                consumer.stop().await;
            }
        }

        let _ = self.shutdown_tx.send(true);

        // Pending channel entries are not processed on shutdown; they
        // reappear on the queue after the visibility timeout.
        for entry in self.pools.iter() {
            entry.value().discard_pending().await;
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        let mut drained = false;

        while Instant::now() < deadline {
            if self.total_active_workers() == 0 && self.in_flight.is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if drained {
            info!("Drain complete");
        } else {
            warn!(
                active_workers = self.total_active_workers(),
                in_flight = self.in_flight.len(),
                "Drain deadline exceeded, abandoning in-flight work"
            );
        }

        for entry in self.pools.iter() {
            entry.value().drain();
        }
    }

    fn total_active_workers(&self) -> u32 {
        self.pools.iter().map(|e| e.value().active_workers()).sum()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        let consumers = self.consumers.read().await;
        let mut stats = Vec::with_capacity(consumers.len());

        for (id, consumer) in consumers.iter() {
            match consumer.stats().await {
                Ok(Some(s)) => stats.push(s),
                Ok(None) => {
                    debug!(queue = %id, "Consumer does not report stats");
                }
                Err(e) => {
                    warn!(queue = %id, error = %e, "Failed to fetch queue stats");
                }
            }
        }

        stats
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_snapshot(&self, limit: usize) -> Vec<InFlightEntry> {
        self.in_flight.snapshot(limit)
    }
}
