//! Integration tests for the fan-out router.
//!
//! Exercises delivery, retry, dead-lettering, isolation between sinks,
//! backpressure, and drain behavior against scripted in-memory sinks.

use async_trait::async_trait;
use pushbridge::{
    BridgeMetrics, CanonicalEvent, CompletionHandle, DispatchRouter, Position, PublishOutcome,
    RetryConfig, RetryStrategy, SinkAdapter, SinkDescriptor, SinkStatus,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Sink that replays a script of outcomes, then acks everything
struct ScriptedSink {
    outcomes: Mutex<VecDeque<PublishOutcome>>,
    published: Mutex<Vec<String>>,
}

impl ScriptedSink {
    fn acking() -> Arc<Self> {
        Self::scripted(vec![])
    }

    fn scripted(outcomes: Vec<PublishOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            published: Mutex::new(Vec::new()),
        })
    }

    fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SinkAdapter for ScriptedSink {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn publish(&self, event: &CanonicalEvent) -> PublishOutcome {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PublishOutcome::Acked);
        if outcome.is_acked() {
            self.published
                .lock()
                .unwrap()
                .push(event.position.token.clone());
        }
        outcome
    }
}

/// Sink that blocks in publish until a permit is released
struct GatedSink {
    gate: Arc<Semaphore>,
    published: Mutex<Vec<String>>,
}

impl GatedSink {
    fn new(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate,
            published: Mutex::new(Vec::new()),
        })
    }

    fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SinkAdapter for GatedSink {
    fn kind(&self) -> &'static str {
        "gated"
    }

    async fn publish(&self, event: &CanonicalEvent) -> PublishOutcome {
        self.gate.acquire().await.unwrap().forget();
        self.published
            .lock()
            .unwrap()
            .push(event.position.token.clone());
        PublishOutcome::Acked
    }
}

fn descriptor(id: &str, adapter: Arc<dyn SinkAdapter>, queue_depth: usize) -> SinkDescriptor {
    SinkDescriptor {
        id: id.to_string(),
        adapter,
        queue_depth,
        retry: RetryStrategy::new(RetryConfig::new(5, 10, 50).without_jitter()),
    }
}

fn router(descriptors: Vec<SinkDescriptor>) -> DispatchRouter {
    DispatchRouter::new(
        "/topic/orders",
        descriptors,
        Duration::from_secs(5),
        BridgeMetrics::new("/topic/orders"),
    )
}

fn event(token: &str, seq: u64) -> Arc<CanonicalEvent> {
    let mut fields = serde_json::Map::new();
    fields.insert("id".to_string(), json!(token));
    Arc::new(CanonicalEvent::new(
        "/topic/orders",
        "order-v1",
        fields,
        Position::new(token, seq),
    ))
}

#[tokio::test]
async fn fan_out_reaches_every_sink() {
    let first = ScriptedSink::acking();
    let second = ScriptedSink::acking();
    let router = router(vec![
        descriptor("first", first.clone(), 8),
        descriptor("second", second.clone(), 8),
    ]);

    let handle = router.submit(event("00000001", 1)).await.unwrap();
    let outcome = handle.wait().await;

    assert!(outcome.fully_acked());
    assert_eq!(outcome.statuses.len(), 2);
    assert_eq!(first.published(), vec!["00000001"]);
    assert_eq!(second.published(), vec!["00000001"]);

    assert_eq!(router.shutdown(Duration::from_secs(1)).await, 0);
}

#[tokio::test]
async fn transient_failures_are_retried_until_acked() {
    // Unreachable for 3 attempts, then recovers
    let flaky = ScriptedSink::scripted(vec![
        PublishOutcome::Transient("refused".to_string()),
        PublishOutcome::Transient("refused".to_string()),
        PublishOutcome::Transient("refused".to_string()),
    ]);
    let steady = ScriptedSink::acking();
    let router = router(vec![
        descriptor("flaky", flaky.clone(), 8),
        descriptor("steady", steady.clone(), 8),
    ]);

    let handle = router.submit(event("00000001", 1)).await.unwrap();
    let outcome = handle.wait().await;

    assert!(outcome.fully_acked());
    assert_eq!(flaky.published(), vec!["00000001"]);
    // The steady sink was never disturbed by the flaky one's retries
    assert_eq!(steady.published(), vec!["00000001"]);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn permanent_failure_dead_letters_without_blocking_other_sinks() {
    let broken = ScriptedSink::scripted(vec![PublishOutcome::Permanent(
        "unroutable".to_string(),
    )]);
    let steady = ScriptedSink::acking();
    let router = router(vec![
        descriptor("broken", broken.clone(), 8),
        descriptor("steady", steady.clone(), 8),
    ]);

    let handle = router.submit(event("00000001", 1)).await.unwrap();
    let outcome = handle.wait().await;

    // The completion handle resolves despite the dead-lettered sink
    assert!(!outcome.fully_acked());
    assert_eq!(outcome.dead_letters(), vec!["broken"]);
    assert_eq!(outcome.statuses["steady"], SinkStatus::Acked);
    assert_eq!(steady.published(), vec!["00000001"]);
    assert!(broken.published().is_empty());

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn attempt_exhaustion_dead_letters() {
    let down = ScriptedSink::scripted(vec![
        PublishOutcome::Transient("down".to_string());
        10
    ]);
    let descriptors = vec![SinkDescriptor {
        id: "down".to_string(),
        adapter: down.clone(),
        queue_depth: 8,
        retry: RetryStrategy::new(RetryConfig::new(2, 5, 10).without_jitter()),
    }];
    let router = router(descriptors);

    let handle = router.submit(event("00000001", 1)).await.unwrap();
    let outcome = handle.wait().await;

    assert_eq!(outcome.statuses["down"], SinkStatus::DeadLettered);
    assert!(down.published().is_empty());

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn full_sink_queue_suspends_submit() {
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedSink::new(gate.clone());
    let router = Arc::new(router(vec![descriptor("gated", gated.clone(), 2)]));

    // First event is picked up by the worker and blocks in publish;
    // the next two fill the bounded queue
    let mut handles: Vec<CompletionHandle> = Vec::new();
    for seq in 1..=3 {
        let handle = router
            .submit(event(&format!("0000000{}", seq), seq))
            .await
            .unwrap();
        handles.push(handle);
    }
    // Give the worker a beat to pull the first item off the queue
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The queue is saturated now: a further submit must suspend
    let blocked = {
        let router = router.clone();
        tokio::spawn(async move { router.submit(event("00000004", 4)).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    // Releasing the sink drains the queue and unblocks the submitter
    gate.add_permits(16);
    handles.push(blocked.await.unwrap());
    for handle in handles {
        assert!(handle.wait().await.fully_acked());
    }
    assert_eq!(gated.published().len(), 4);
}

#[tokio::test]
async fn delivery_deadline_reports_pending_sinks() {
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedSink::new(gate.clone());
    let router = DispatchRouter::new(
        "/topic/orders",
        vec![descriptor("stuck", gated, 4)],
        Duration::from_millis(100),
        BridgeMetrics::new("/topic/orders"),
    );

    let handle = router.submit(event("00000001", 1)).await.unwrap();
    let outcome = handle.wait().await;

    // Deadline elapsed: the sink is reported, not silently dropped
    assert!(!outcome.fully_acked());
    assert_eq!(outcome.undelivered(), vec!["stuck"]);
}

#[tokio::test]
async fn shutdown_drains_queued_deliveries() {
    let steady = ScriptedSink::acking();
    let router = router(vec![descriptor("steady", steady.clone(), 8)]);

    for seq in 1..=5 {
        router
            .submit(event(&format!("0000000{}", seq), seq))
            .await
            .unwrap();
    }

    let undelivered = router.shutdown(Duration::from_secs(1)).await;
    assert_eq!(undelivered, 0);
    assert_eq!(steady.published().len(), 5);
}

#[tokio::test]
async fn shutdown_reports_undelivered_events() {
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedSink::new(gate);
    let router = router(vec![descriptor("stuck", gated.clone(), 8)]);

    router.submit(event("00000001", 1)).await.unwrap();
    router.submit(event("00000002", 2)).await.unwrap();

    let undelivered = router.shutdown(Duration::from_millis(100)).await;
    assert_eq!(undelivered, 2);
    assert!(gated.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn queue_depth_snapshot_tracks_backlog() {
    let gate = Arc::new(Semaphore::new(0));
    let gated = GatedSink::new(gate.clone());
    let router = router(vec![descriptor("gated", gated, 4)]);
    let depths = router.queue_depths();

    for seq in 1..=3 {
        router
            .submit(event(&format!("0000000{}", seq), seq))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One event is in flight at the sink, two are queued
    let snapshot = depths.snapshot();
    assert_eq!(snapshot, vec![("gated".to_string(), 2)]);

    gate.add_permits(16);
}
