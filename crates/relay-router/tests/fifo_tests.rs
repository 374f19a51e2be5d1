//! Per-group FIFO and batch-atomicity tests
//!
//! A message group is a strictly ordered sub-stream within a pool: at most
//! one of its pointers is in the mediator at a time, in submission order.
//! When a pointer in a (batch, group) fails, the still-queued rest of that
//! (batch, group) is nacked without reaching the mediator.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_common::{
    MediationOutcome, MediationType, MessageCallback, MessagePointer, PoolConfig,
};
use relay_router::{Mediator, PipelineRegistry, ProcessPool, RateLimiterRegistry};

/// Records processing intervals per message and can fail selected ids.
struct TracingMediator {
    delay_ms: u64,
    fail_ids: Vec<String>,
    spans: Mutex<Vec<(String, Instant, Instant)>>,
}

impl TracingMediator {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            fail_ids: Vec::new(),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(delay_ms: u64, fail_ids: &[&str]) -> Self {
        Self {
            delay_ms,
            fail_ids: fail_ids.iter().map(|s| s.to_string()).collect(),
            spans: Mutex::new(Vec::new()),
        }
    }

    fn processed_ids(&self) -> Vec<String> {
        self.spans.lock().iter().map(|(id, _, _)| id.clone()).collect()
    }

    fn span(&self, id: &str) -> Option<(Instant, Instant)> {
        self.spans
            .lock()
            .iter()
            .find(|(span_id, _, _)| span_id == id)
            .map(|(_, start, end)| (*start, *end))
    }

    fn call_count(&self) -> usize {
        self.spans.lock().len()
    }
}

#[async_trait]
impl Mediator for TracingMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        let start = Instant::now();
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let end = Instant::now();
        self.spans.lock().push((pointer.id.clone(), start, end));

        if self.fail_ids.contains(&pointer.id) {
            MediationOutcome::error_server(Some(500), "induced failure")
        } else {
            MediationOutcome::success(200)
        }
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

fn pointer(id: &str, group: Option<&str>, batch: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "FIFO".to_string(),
        auth_token: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:8080/test".to_string(),
        message_group_id: group.map(str::to_string),
        batch_id: batch.map(str::to_string),
    }
}

fn build_pool(
    concurrency: u32,
    mediator: Arc<dyn Mediator>,
) -> (Arc<ProcessPool>, Arc<PipelineRegistry>) {
    let pipeline = Arc::new(PipelineRegistry::new());
    let pool = Arc::new(ProcessPool::new(
        PoolConfig {
            code: "FIFO".to_string(),
            concurrency,
            queue_capacity: 100,
            rate_limit_per_minute: None,
        },
        mediator,
        pipeline.clone(),
        Arc::new(RateLimiterRegistry::new()),
    ));
    pool.start();
    (pool, pipeline)
}

fn submit(
    pool: &ProcessPool,
    pipeline: &PipelineRegistry,
    ptr: MessagePointer,
    callback: Arc<TestCallback>,
) {
    assert!(pipeline.admit(&ptr, callback));
    assert!(pool.submit(ptr));
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
async fn same_group_is_strictly_ordered() {
    let mediator = Arc::new(TracingMediator::new(20));
    let (pool, pipeline) = build_pool(10, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    for i in 0..5 {
        submit(&pool, &pipeline, pointer(&format!("m{}", i), Some("group-1"), None), callback.clone());
    }

    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 5, Duration::from_secs(10)).await
    );

    let processed = mediator.processed_ids();
    assert_eq!(processed, vec!["m0", "m1", "m2", "m3", "m4"]);

    pool.stop(false).await;
}

#[tokio::test]
async fn other_groups_run_concurrently_with_a_busy_group() {
    // m1(g=A), m2(g=A), m3(g=B): m3 may overlap m1; m2 starts only after m1
    let mediator = Arc::new(TracingMediator::new(200));
    let (pool, pipeline) = build_pool(10, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    submit(&pool, &pipeline, pointer("m1", Some("A"), None), callback.clone());
    submit(&pool, &pipeline, pointer("m2", Some("A"), None), callback.clone());
    submit(&pool, &pipeline, pointer("m3", Some("B"), None), callback.clone());

    let started = Instant::now();
    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 3, Duration::from_secs(10)).await
    );
    let elapsed = started.elapsed();

    let (m1_start, m1_end) = mediator.span("m1").unwrap();
    let (m2_start, _) = mediator.span("m2").unwrap();
    let (m3_start, _) = mediator.span("m3").unwrap();

    // Group ordering: m2 waits for m1
    assert!(m2_start >= m1_end, "m2 must not start before m1 completes");
    // Cross-group concurrency: m3 overlaps m1
    assert!(m3_start < m1_end, "m3 should run while m1 is in flight");
    // Serial execution of all three would need >= 600ms
    assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);

    pool.stop(false).await;
}

#[tokio::test]
async fn ungrouped_messages_have_no_ordering() {
    let mediator = Arc::new(TracingMediator::new(100));
    let (pool, pipeline) = build_pool(5, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    let started = Instant::now();
    for i in 0..5 {
        submit(&pool, &pipeline, pointer(&format!("m{}", i), None, None), callback.clone());
    }

    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 5, Duration::from_secs(5)).await
    );

    // All five ran in parallel, far under the 500ms serial floor
    assert!(started.elapsed() < Duration::from_millis(400));

    pool.stop(false).await;
}

#[tokio::test]
async fn batch_failure_cascades_to_queued_group_members() {
    // m1 fails; m2 and m3 share its (batch, group) and must be nacked
    // without reaching the mediator
    let mediator = Arc::new(TracingMediator::failing_on(20, &["m1"]));
    let (pool, pipeline) = build_pool(10, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    submit(&pool, &pipeline, pointer("m1", Some("A"), Some("b1")), callback.clone());
    submit(&pool, &pipeline, pointer("m2", Some("A"), Some("b1")), callback.clone());
    submit(&pool, &pipeline, pointer("m3", Some("A"), Some("b1")), callback.clone());

    assert!(
        wait_until(|| callback.nacks.load(Ordering::SeqCst) == 3, Duration::from_secs(5)).await
    );

    assert_eq!(callback.acks.load(Ordering::SeqCst), 0);
    assert_eq!(mediator.call_count(), 1, "only m1 reaches the mediator");
    assert!(pipeline.is_empty());

    pool.stop(false).await;
}

#[tokio::test]
async fn cascade_is_scoped_to_the_failed_batch_and_group() {
    let mediator = Arc::new(TracingMediator::failing_on(20, &["m1"]));
    let (pool, pipeline) = build_pool(10, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    // Failing batch+group
    submit(&pool, &pipeline, pointer("m1", Some("A"), Some("b1")), callback.clone());
    submit(&pool, &pipeline, pointer("m2", Some("A"), Some("b1")), callback.clone());
    // Different group in the same batch: unaffected
    submit(&pool, &pipeline, pointer("m4", Some("B"), Some("b1")), callback.clone());
    // Different batch entirely: unaffected
    submit(&pool, &pipeline, pointer("m5", Some("C"), Some("b2")), callback.clone());

    assert!(
        wait_until(
            || callback.acks.load(Ordering::SeqCst) + callback.nacks.load(Ordering::SeqCst) == 4,
            Duration::from_secs(5),
        )
        .await
    );

    assert_eq!(callback.nacks.load(Ordering::SeqCst), 2, "m1 and m2 nacked");
    assert_eq!(callback.acks.load(Ordering::SeqCst), 2, "m4 and m5 acked");

    pool.stop(false).await;
}

#[tokio::test]
async fn batch_state_is_cleaned_up_after_completion() {
    let mediator = Arc::new(TracingMediator::failing_on(10, &["m1"]));
    let (pool, pipeline) = build_pool(5, mediator.clone());

    let callback = Arc::new(TestCallback::default());
    submit(&pool, &pipeline, pointer("m1", Some("A"), Some("b1")), callback.clone());
    submit(&pool, &pipeline, pointer("m2", Some("A"), Some("b1")), callback.clone());

    assert!(
        wait_until(|| callback.nacks.load(Ordering::SeqCst) == 2, Duration::from_secs(5)).await
    );

    // A later batch reusing the same group id is not poisoned by the old
    // failure marker
    submit(&pool, &pipeline, pointer("m6", Some("A"), Some("b9")), callback.clone());
    assert!(
        wait_until(|| callback.acks.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await
    );

    // Idle groups are deleted from the map
    assert!(wait_until(|| pool.active_groups() == 0, Duration::from_secs(2)).await);

    pool.stop(false).await;
}
