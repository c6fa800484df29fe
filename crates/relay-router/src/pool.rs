//! Worker pools.
//!
//! One pool per `PoolConfig`: a bounded admission channel and exactly
//! `concurrency` worker tasks sharing its receiver. Each worker pulls a
//! pointer, runs the per-message lifecycle, and loops. Concurrency is
//! resizable at runtime: growing spawns workers, shrinking lets excess
//! workers exit after the message they are holding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::admission::InFlightSet;
use crate::breaker::BreakerRegistry;
use crate::counters::PoolCounters;
use crate::lifecycle;
use crate::limiter::PoolRateLimiter;
use crate::mediator::Mediator;
use crate::telemetry;
use crate::warning::WarningStore;
use relay_common::{MessagePointer, PoolConfig, PoolStats};
use relay_queue::QueueConsumer;

/// Work item on a pool's channel: the admitted pointer plus the
/// consumer that must finalise it.
pub struct DispatchJob {
    pub pointer: MessagePointer,
    pub consumer: Arc<dyn QueueConsumer>,
}

/// Collaborators shared by every pool's lifecycle runs.
pub struct PoolContext {
    pub mediator: Arc<dyn Mediator>,
    pub breakers: Arc<BreakerRegistry>,
    pub in_flight: Arc<InFlightSet>,
    pub warnings: Arc<WarningStore>,
}

pub struct WorkerPool {
    code: String,
    queue_capacity: u32,
    tx: parking_lot::RwLock<Option<mpsc::Sender<DispatchJob>>>,
    rx: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
    target_workers: Arc<AtomicU32>,
    live_workers: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    queue_size: Arc<AtomicU32>,
    limiter: Arc<PoolRateLimiter>,
    counters: Arc<PoolCounters>,
    ctx: Arc<PoolContext>,
    shutdown: watch::Receiver<bool>,
    resize_lock: Mutex<()>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, ctx: Arc<PoolContext>, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1) as usize);

        Self {
            code: config.code,
            queue_capacity: config.queue_capacity,
            tx: parking_lot::RwLock::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            target_workers: Arc::new(AtomicU32::new(config.concurrency)),
            live_workers: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            queue_size: Arc::new(AtomicU32::new(0)),
            limiter: Arc::new(PoolRateLimiter::new(config.rate_limit_per_minute)),
            counters: Arc::new(PoolCounters::new()),
            ctx,
            shutdown,
            resize_lock: Mutex::new(()),
        }
    }

    /// Spawn the worker set.
    pub fn start(&self) {
        let target = self.target_workers.load(Ordering::SeqCst);
        for _ in 0..target {
            self.spawn_worker();
        }

        info!(
            pool_code = %self.code,
            concurrency = target,
            queue_capacity = self.queue_capacity,
            rate_limit = ?self.limiter.rate_per_minute(),
            "Worker pool started"
        );
    }

    fn spawn_worker(&self) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);

        let code = self.code.clone();
        let rx = Arc::clone(&self.rx);
        let target_workers = Arc::clone(&self.target_workers);
        let live_workers = Arc::clone(&self.live_workers);
        let active_workers = Arc::clone(&self.active_workers);
        let queue_size = Arc::clone(&self.queue_size);
        let limiter = Arc::clone(&self.limiter);
        let counters = Arc::clone(&self.counters);
        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            Self::worker_loop(
                code,
                rx,
                target_workers,
                live_workers,
                active_workers,
                queue_size,
                limiter,
                counters,
                ctx,
                shutdown,
            )
            .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker_loop(
        code: String,
        rx: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
        target_workers: Arc<AtomicU32>,
        live_workers: Arc<AtomicU32>,
        active_workers: Arc<AtomicU32>,
        queue_size: Arc<AtomicU32>,
        limiter: Arc<PoolRateLimiter>,
        counters: Arc<PoolCounters>,
        ctx: Arc<PoolContext>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut retired = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Retire when the pool shrank below the live worker count.
            let target = target_workers.load(Ordering::SeqCst);
            if live_workers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                    if live > target {
                        Some(live - 1)
                    } else {
                        None
                    }
                })
                .is_ok()
            {
                debug!(pool_code = %code, "Worker retiring after concurrency decrease");
                retired = true;
                break;
            }

            let job = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    job = guard.recv() => job,
                    _ = shutdown.changed() => continue,
                }
            };

            let Some(job) = job else {
                // Channel closed: pool drained, exit once empty.
                break;
            };

            queue_size.fetch_sub(1, Ordering::SeqCst);

            if *shutdown.borrow() {
                // Shutdown while the job sat on the channel: leave it
                // unacked so the broker redelivers it.
                ctx.in_flight.remove(&job.pointer.message.id);
                continue;
            }

            active_workers.fetch_add(1, Ordering::SeqCst);
            telemetry::set_pool_active_workers(&code, active_workers.load(Ordering::SeqCst));
            telemetry::set_pool_queue_size(&code, queue_size.load(Ordering::SeqCst));

            lifecycle::process(&ctx, &limiter, &counters, &code, job, &shutdown).await;

            active_workers.fetch_sub(1, Ordering::SeqCst);
            telemetry::set_pool_active_workers(&code, active_workers.load(Ordering::SeqCst));
        }

        if !retired {
            live_workers.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(pool_code = %code, "Worker exited");
    }

    /// Non-blocking submit. Returns the job on a full or closed channel
    /// so the caller can undo its in-flight bookkeeping.
    pub fn try_submit(&self, job: DispatchJob) -> Result<(), DispatchJob> {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            return Err(job);
        };

        match tx.try_send(job) {
            Ok(()) => {
                let size = self.queue_size.fetch_add(1, Ordering::SeqCst) + 1;
                telemetry::set_pool_queue_size(&self.code, size);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => Err(job),
        }
    }

    /// Stop accepting work and let the workers finish what is queued.
    /// Used when a pool is removed by a config refresh.
    pub fn drain(&self) {
        info!(pool_code = %self.code, queue_size = self.queue_size(), "Draining pool");
        *self.tx.write() = None;
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Drop everything still queued, clearing the in-flight entries so
    /// the broker redelivers the messages. Used at shutdown, where
    /// pending entries are deliberately not processed.
    pub async fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        let mut guard = self.rx.lock().await;

        while let Ok(job) = guard.try_recv() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            self.ctx.in_flight.remove(&job.pointer.message.id);
            discarded += 1;
        }

        if discarded > 0 {
            debug!(pool_code = %self.code, discarded = discarded, "Discarded pending jobs");
        }
        discarded
    }

    /// Resize the worker set. Growth spawns workers immediately;
    /// shrinking lets excess workers exit after their current message.
    pub async fn update_concurrency(&self, new_concurrency: u32) -> bool {
        if new_concurrency == 0 {
            warn!(pool_code = %self.code, "Rejecting invalid concurrency: 0");
            return false;
        }

        let _guard = self.resize_lock.lock().await;
        let old = self.target_workers.swap(new_concurrency, Ordering::SeqCst);
        if old == new_concurrency {
            return true;
        }

        if new_concurrency > old {
            // Workers pending retirement from an earlier shrink still
            // count; only top up the difference.
            let live = self.live_workers.load(Ordering::SeqCst);
            let baseline = live.max(old);
            for _ in baseline..new_concurrency {
                self.spawn_worker();
            }
        }

        info!(
            pool_code = %self.code,
            old = old,
            new = new_concurrency,
            "Pool concurrency updated"
        );
        true
    }

    pub fn update_rate_limit(&self, rate_limit_per_minute: Option<u32>) {
        let old = self.limiter.rate_per_minute();
        self.limiter.update(rate_limit_per_minute);
        if old != self.limiter.rate_per_minute() {
            info!(
                pool_code = %self.code,
                old = ?old,
                new = ?self.limiter.rate_per_minute(),
                "Pool rate limit updated"
            );
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn concurrency(&self) -> u32 {
        self.target_workers.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> u32 {
        self.queue_capacity
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.code.clone(),
            concurrency: self.concurrency(),
            active_workers: self.active_workers(),
            queue_size: self.queue_size(),
            queue_capacity: self.queue_capacity,
            rate_limit_per_minute: self.limiter.rate_per_minute(),
            processed: self.counters.processed(),
            succeeded: self.counters.succeeded(),
            failed: self.counters.failed(),
            rate_limited: self.counters.rate_limited(),
            avg_processing_ms: self.counters.avg_processing_ms(),
        }
    }
}
