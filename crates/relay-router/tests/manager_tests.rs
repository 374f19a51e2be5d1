//! QueueManager admission and reconcile tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_common::{
    MediationOutcome, MediationType, MessageCallback, MessagePointer, PoolConfig, RouterTopology,
    WarningKind,
};
use relay_router::{Mediator, MessageRouter, QueueManager, WarningService};

struct MockMediator {
    call_count: AtomicU32,
    delay_ms: u64,
}

impl MockMediator {
    fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            call_count: AtomicU32::new(0),
            delay_ms,
        })
    }
}

#[async_trait]
impl Mediator for MockMediator {
    async fn process(&self, _pointer: &MessagePointer) -> MediationOutcome {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        MediationOutcome::success(200)
    }
}

#[derive(Default)]
struct TestCallback {
    acks: AtomicU32,
    nacks: AtomicU32,
}

#[async_trait]
impl MessageCallback for TestCallback {
    async fn ack(&self, _pointer: &MessagePointer) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(&self, _pointer: &MessagePointer) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

fn pointer(id: &str, pool_code: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool_code.to_string(),
        auth_token: Some("t".to_string()),
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:8080/hook".to_string(),
        message_group_id: None,
        batch_id: None,
    }
}

fn pool_config(code: &str, concurrency: u32, queue_capacity: u32) -> PoolConfig {
    PoolConfig {
        code: code.to_string(),
        concurrency,
        queue_capacity,
        rate_limit_per_minute: None,
    }
}

async fn build_manager(
    mediator: Arc<dyn Mediator>,
    pools: Vec<PoolConfig>,
) -> (Arc<QueueManager>, Arc<WarningService>) {
    let warnings = Arc::new(WarningService::default());
    let manager = Arc::new(QueueManager::new(mediator, warnings.clone()));
    manager.resume().await;
    manager
        .reconcile(&RouterTopology {
            pools,
            queues: vec![],
        })
        .await
        .unwrap();
    (manager, warnings)
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn happy_path_routes_and_acks() {
    let mediator = MockMediator::new(0);
    let (manager, _) = build_manager(mediator.clone(), vec![pool_config("P", 5, 100)]).await;

    let callback = Arc::new(TestCallback::default());
    assert!(manager.route(pointer("m1", "P"), callback.clone()).await);

    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );
    assert_eq!(mediator.call_count.load(Ordering::SeqCst), 1);
    assert_eq!(manager.in_flight_count(), 0);

    let stats = manager.get_pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].counters.succeeded, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn unknown_pool_is_refused_with_warning() {
    let mediator = MockMediator::new(0);
    let (manager, warnings) = build_manager(mediator, vec![pool_config("P", 5, 100)]).await;

    let callback = Arc::new(TestCallback::default());
    assert!(!manager.route(pointer("m1", "NOPE"), callback.clone()).await);

    // No callback fired, nothing tracked
    assert_eq!(callback.acks.load(Ordering::SeqCst), 0);
    assert_eq!(callback.nacks.load(Ordering::SeqCst), 0);
    assert_eq!(manager.in_flight_count(), 0);
    assert_eq!(warnings.get_warnings_by_kind(WarningKind::UnknownPool).len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_admission_is_refused() {
    // Mediator slow enough that the first copy is still in flight
    let mediator = MockMediator::new(300);
    let (manager, _) = build_manager(mediator.clone(), vec![pool_config("P", 5, 100)]).await;

    let callback = Arc::new(TestCallback::default());
    assert!(manager.route(pointer("m1", "P"), callback.clone()).await);
    assert!(!manager.route(pointer("m1", "P"), callback.clone()).await);

    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );
    assert_eq!(mediator.call_count.load(Ordering::SeqCst), 1);

    // Once the original completed, the redelivered copy is admitted anew
    assert!(manager.route(pointer("m1", "P"), callback.clone()).await);
    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 2, Duration::from_secs(5)).await
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn full_buffer_is_refused_with_warning() {
    let mediator = MockMediator::new(500);
    let (manager, warnings) = build_manager(mediator, vec![pool_config("P", 1, 1)]).await;

    let callback = Arc::new(TestCallback::default());

    assert!(manager.route(pointer("m1", "P"), callback.clone()).await);
    // Let the single worker take m1 so the buffer frees one slot
    let pool = manager.pool("P").unwrap();
    assert!(wait_until(|| pool.buffer_size() == 0, Duration::from_secs(1)).await);

    assert!(manager.route(pointer("m2", "P"), callback.clone()).await);
    assert!(!manager.route(pointer("m3", "P"), callback.clone()).await);

    assert_eq!(warnings.get_warnings_by_kind(WarningKind::QueueFull).len(), 1);
    // The refused pointer is not tracked; redelivery can admit it later
    assert_eq!(manager.in_flight_count(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn reconcile_adds_and_removes_pools() {
    let mediator = MockMediator::new(0);
    let (manager, _) = build_manager(
        mediator,
        vec![pool_config("A", 2, 10), pool_config("B", 2, 10)],
    )
    .await;

    assert_eq!(manager.pool_codes().len(), 2);

    // Remove B, add C
    manager
        .reconcile(&RouterTopology {
            pools: vec![pool_config("A", 2, 10), pool_config("C", 2, 10)],
            queues: vec![],
        })
        .await
        .unwrap();

    let mut codes = manager.pool_codes();
    codes.sort();
    assert_eq!(codes, vec!["A", "C"]);

    // Routing to the removed pool is refused
    let callback = Arc::new(TestCallback::default());
    assert!(!manager.route(pointer("m1", "B"), callback).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn reconcile_recreates_pool_on_size_change() {
    let mediator = MockMediator::new(0);
    let (manager, _) = build_manager(mediator, vec![pool_config("A", 2, 10)]).await;

    manager
        .reconcile(&RouterTopology {
            pools: vec![pool_config("A", 8, 10)],
            queues: vec![],
        })
        .await
        .unwrap();

    let pool = manager.pool("A").unwrap();
    assert_eq!(pool.concurrency(), 8);

    // The replacement accepts work straight away
    let callback = Arc::new(TestCallback::default());
    assert!(manager.route(pointer("m1", "A"), callback.clone()).await);
    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn reconcile_updates_rate_limit_in_place() {
    let mediator = MockMediator::new(0);
    let (manager, _) = build_manager(mediator, vec![pool_config("A", 2, 10)]).await;

    let mut updated = pool_config("A", 2, 10);
    updated.rate_limit_per_minute = Some(120);

    manager
        .reconcile(&RouterTopology {
            pools: vec![updated],
            queues: vec![],
        })
        .await
        .unwrap();

    let pool = manager.pool("A").unwrap();
    assert_eq!(pool.rate_limit_per_minute(), Some(120));

    manager.shutdown().await;
}

#[tokio::test]
async fn pool_limit_is_enforced_with_critical_warning() {
    let warnings = Arc::new(WarningService::default());
    let manager = Arc::new(QueueManager::with_limits(
        MockMediator::new(0),
        warnings.clone(),
        2, // max_pools
        1, // warning threshold
    ));
    manager.resume().await;

    manager
        .reconcile(&RouterTopology {
            pools: vec![
                pool_config("A", 1, 10),
                pool_config("B", 1, 10),
                pool_config("C", 1, 10),
            ],
            queues: vec![],
        })
        .await
        .unwrap();

    // Third pool refused at the cap
    assert_eq!(manager.pool_codes().len(), 2);
    assert!(!warnings.get_warnings_by_kind(WarningKind::PoolLimit).is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn suspend_quiesces_and_resume_recovers() {
    let mediator = MockMediator::new(0);
    let (manager, _) = build_manager(mediator.clone(), vec![pool_config("P", 2, 10)]).await;

    manager.suspend().await;
    assert!(!manager.is_active());

    // Standby: nothing is admitted
    let callback = Arc::new(TestCallback::default());
    assert!(!manager.route(pointer("m1", "P"), callback.clone()).await);
    assert_eq!(manager.in_flight_count(), 0);

    manager.resume().await;
    assert!(manager.is_active());

    assert!(manager.route(pointer("m2", "P"), callback.clone()).await);
    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );

    manager.shutdown().await;
}
