//! Admission tests: duplicate rejection, unknown pools, and channel
//! overflow, with the in-flight set as the single source of ownership.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use relay_common::{MediationOutcome, Message, MessagePointer, PoolConfig, QueueStats};
use relay_queue::QueueConsumer;
use relay_router::{
    Admission, AdmissionVerdict, BreakerRegistry, InFlightSet, Mediator, PoolContext,
    WarningStore, WorkerPool,
};

/// Mediator double that holds messages for a configurable time.
struct SlowMediator {
    delay: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl Mediator for SlowMediator {
    async fn mediate(&self, _message: &Message) -> MediationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        MediationOutcome::success(200)
    }
}

struct NullConsumer {
    running: AtomicBool,
}

#[async_trait]
impl QueueConsumer for NullConsumer {
    fn identifier(&self) -> &str {
        "test-queue"
    }

    async fn poll(
        &self,
        _max_messages: u32,
        _wait: Duration,
    ) -> relay_queue::Result<Vec<MessagePointer>> {
        Ok(vec![])
    }

    async fn ack(&self, _receipt: &str) -> relay_queue::Result<()> {
        Ok(())
    }

    async fn nack(&self, _receipt: &str, _delay_seconds: Option<u32>) -> relay_queue::Result<()> {
        Ok(())
    }

    async fn extend_visibility(&self, _receipt: &str, _seconds: u32) -> relay_queue::Result<()> {
        Ok(())
    }

    async fn stats(&self) -> relay_queue::Result<Option<QueueStats>> {
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct Fixture {
    admission: Admission,
    in_flight: Arc<InFlightSet>,
    mediator: Arc<SlowMediator>,
    consumer: Arc<NullConsumer>,
    _shutdown_tx: watch::Sender<bool>,
}

fn fixture(pool: Option<PoolConfig>, mediation_delay: Duration) -> Fixture {
    let mediator = Arc::new(SlowMediator {
        delay: mediation_delay,
        calls: AtomicU32::new(0),
    });
    let in_flight = Arc::new(InFlightSet::new());
    let ctx = Arc::new(PoolContext {
        mediator: mediator.clone(),
        breakers: Arc::new(BreakerRegistry::default()),
        in_flight: Arc::clone(&in_flight),
        warnings: Arc::new(WarningStore::default()),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pools: Arc<DashMap<String, Arc<WorkerPool>>> = Arc::new(DashMap::new());

    if let Some(config) = pool {
        let code = config.code.clone();
        let worker_pool = Arc::new(WorkerPool::new(config, Arc::clone(&ctx), shutdown_rx));
        worker_pool.start();
        pools.insert(code, worker_pool);
    }

    Fixture {
        admission: Admission::new(Arc::clone(&in_flight), pools),
        in_flight,
        mediator,
        consumer: Arc::new(NullConsumer {
            running: AtomicBool::new(true),
        }),
        _shutdown_tx: shutdown_tx,
    }
}

fn pointer(id: &str, pool_code: &str) -> MessagePointer {
    MessagePointer::new(
        Message {
            id: id.to_string(),
            pool_code: pool_code.to_string(),
            mediation_target: "https://t.example/hook".to_string(),
            auth_token: None,
            timeout_seconds: None,
        },
        format!("receipt-{}", id),
        "test-queue".to_string(),
    )
}

fn default_pool() -> PoolConfig {
    PoolConfig {
        code: "P1".to_string(),
        concurrency: 2,
        rate_limit_per_minute: None,
        queue_capacity: 10,
    }
}

#[tokio::test]
async fn admits_and_clears_after_processing() {
    let fx = fixture(Some(default_pool()), Duration::from_millis(20));

    let verdict = fx.admission.route(pointer("m1", "P1"), fx.consumer.clone());
    assert_eq!(verdict, AdmissionVerdict::Admitted);
    assert!(fx.in_flight.contains("m1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.in_flight.is_empty());
    assert_eq!(fx.mediator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_is_rejected_while_first_is_in_flight() {
    // Slow mediation keeps the first delivery in flight.
    let fx = fixture(Some(default_pool()), Duration::from_millis(500));

    let first = fx.admission.route(pointer("m1", "P1"), fx.consumer.clone());
    assert_eq!(first, AdmissionVerdict::Admitted);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = fx.admission.route(pointer("m1", "P1"), fx.consumer.clone());
    assert_eq!(second, AdmissionVerdict::Duplicate);

    // Only one mediation despite two deliveries.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(fx.mediator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn redelivery_after_completion_is_admitted_again() {
    let fx = fixture(Some(default_pool()), Duration::from_millis(10));

    assert_eq!(
        fx.admission.route(pointer("m1", "P1"), fx.consumer.clone()),
        AdmissionVerdict::Admitted
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.in_flight.is_empty());

    // Finalised messages are no longer duplicates.
    assert_eq!(
        fx.admission.route(pointer("m1", "P1"), fx.consumer.clone()),
        AdmissionVerdict::Admitted
    );
}

#[tokio::test]
async fn unknown_pool_is_rejected_without_tracking() {
    let fx = fixture(Some(default_pool()), Duration::from_millis(10));

    let verdict = fx
        .admission
        .route(pointer("m1", "NO-SUCH-POOL"), fx.consumer.clone());

    assert_eq!(verdict, AdmissionVerdict::UnknownPool);
    assert!(fx.in_flight.is_empty());
}

#[tokio::test]
async fn full_pool_rejects_and_rolls_back_in_flight() {
    let config = PoolConfig {
        code: "P1".to_string(),
        concurrency: 1,
        rate_limit_per_minute: None,
        queue_capacity: 1,
    };
    let fx = fixture(Some(config), Duration::from_millis(500));

    // First goes to the worker, second fills the channel.
    assert_eq!(
        fx.admission.route(pointer("m1", "P1"), fx.consumer.clone()),
        AdmissionVerdict::Admitted
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fx.admission.route(pointer("m2", "P1"), fx.consumer.clone()),
        AdmissionVerdict::Admitted
    );

    let verdict = fx.admission.route(pointer("m3", "P1"), fx.consumer.clone());
    assert_eq!(verdict, AdmissionVerdict::PoolFull);

    // The rejected message owns no in-flight slot, so a later
    // redelivery can be admitted.
    assert!(!fx.in_flight.contains("m3"));
}

#[tokio::test]
async fn no_pools_at_all_rejects_everything() {
    let fx = fixture(None, Duration::from_millis(10));

    assert_eq!(
        fx.admission.route(pointer("m1", "P1"), fx.consumer.clone()),
        AdmissionVerdict::UnknownPool
    );
}
