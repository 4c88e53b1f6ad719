//! Integration tests for the connector state machine.
//!
//! Exercises replay resumption across reconnects, poison-event handling,
//! auth failure escalation, and reconnect exhaustion against a scripted
//! transport and in-memory stores.

use async_trait::async_trait;
use pushbridge::bayeux::{EventFrame, ReplayPosition, StreamTransport};
use pushbridge::{
    BridgeError, BridgeMetrics, BridgeResult, CanonicalEvent, ChannelConnector, ChannelSettings,
    ChannelSchema, ChannelStatus, CursorStore, DispatchRouter, FieldKind, FieldSchema,
    MemoryCursorStore, PublishOutcome, ReconnectSettings, ReplayPolicy, RetryConfig, RetryStrategy,
    SinkAdapter, SinkDescriptor,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport that replays a script of connect results
///
/// When the script runs dry it requests shutdown, so the connector drains
/// and `run` returns cleanly.
struct ScriptedTransport {
    script: Mutex<VecDeque<BridgeResult<Vec<EventFrame>>>>,
    reject_handshake: bool,
    handshakes: Arc<Mutex<u32>>,
    subscriptions: Arc<Mutex<Vec<ReplayPosition>>>,
    shutdown: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn new(
        script: Vec<BridgeResult<Vec<EventFrame>>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            reject_handshake: false,
            handshakes: Arc::new(Mutex::new(0)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            shutdown,
        }
    }

    fn rejecting_handshake(shutdown: Arc<AtomicBool>) -> Self {
        let mut transport = Self::new(vec![], shutdown);
        transport.reject_handshake = true;
        transport
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn handshake(&mut self) -> BridgeResult<String> {
        if self.reject_handshake {
            return Err(BridgeError::auth("invalid credentials"));
        }
        *self.handshakes.lock().unwrap() += 1;
        Ok("client-1".to_string())
    }

    async fn subscribe(&mut self, _channel: &str, replay: ReplayPosition) -> BridgeResult<()> {
        self.subscriptions.lock().unwrap().push(replay);
        Ok(())
    }

    async fn connect(&mut self) -> BridgeResult<Vec<EventFrame>> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => {
                if result.is_err() {
                    // A dropped connection surfaces after quiet time, long
                    // enough for in-flight completions to reach the cursor
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                result
            }
            None => {
                self.shutdown.store(true, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(vec![])
            }
        }
    }

    async fn disconnect(&mut self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Sink that records published position tokens
struct RecordingSink {
    outcomes: Mutex<VecDeque<PublishOutcome>>,
    published: Mutex<Vec<String>>,
}

impl RecordingSink {
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
impl SinkAdapter for RecordingSink {
    fn kind(&self) -> &'static str {
        "recording"
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

fn frame(token: &str, id: Value) -> EventFrame {
    EventFrame {
        channel: "/topic/orders".to_string(),
        payload: json!({"event": {"replayId": token}, "sobject": {"Id": id}}),
        token: Some(token.to_string()),
    }
}

fn channel_settings() -> ChannelSettings {
    ChannelSettings {
        name: "/topic/orders".to_string(),
        schema: ChannelSchema {
            id: "order-v1".to_string(),
            fields: vec![FieldSchema {
                name: "order_id".to_string(),
                path: "sobject.Id".to_string(),
                kind: FieldKind::String,
                required: true,
            }],
        },
        initial_replay: ReplayPolicy::NewOnly,
    }
}

fn reconnect_settings() -> ReconnectSettings {
    ReconnectSettings {
        base_backoff_ms: 5,
        max_backoff_ms: 20,
        max_attempts: 3,
        reset_after_secs: 60,
    }
}

fn router_with(sinks: Vec<(&str, Arc<dyn SinkAdapter>)>) -> DispatchRouter {
    let descriptors = sinks
        .into_iter()
        .map(|(id, adapter)| SinkDescriptor {
            id: id.to_string(),
            adapter,
            queue_depth: 8,
            retry: RetryStrategy::new(RetryConfig::new(5, 5, 20).without_jitter()),
        })
        .collect();
    DispatchRouter::new(
        "/topic/orders",
        descriptors,
        Duration::from_secs(5),
        BridgeMetrics::new("/topic/orders"),
    )
}

struct Harness {
    transport: ScriptedTransport,
    cursor: Arc<MemoryCursorStore>,
    shutdown: Arc<AtomicBool>,
    status: Arc<ChannelStatus>,
    handshakes: Arc<Mutex<u32>>,
    subscriptions: Arc<Mutex<Vec<ReplayPosition>>>,
}

impl Harness {
    fn new(script: Vec<BridgeResult<Vec<EventFrame>>>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let transport = ScriptedTransport::new(script, shutdown.clone());
        Self {
            handshakes: transport.handshakes.clone(),
            subscriptions: transport.subscriptions.clone(),
            transport,
            cursor: Arc::new(MemoryCursorStore::new()),
            shutdown,
            status: Arc::new(ChannelStatus::default()),
        }
    }

    async fn run(self, sinks: Vec<(&str, Arc<dyn SinkAdapter>)>) -> BridgeResult<()> {
        let connector = ChannelConnector::new(
            channel_settings(),
            self.transport,
            router_with(sinks),
            self.cursor.clone(),
            reconnect_settings(),
            self.shutdown,
            self.status,
            Duration::from_secs(2),
        );
        connector.run().await
    }
}

#[tokio::test]
async fn resumes_from_cursor_after_reconnect() {
    // One event, a dropped connection, then one more event
    let harness = Harness::new(vec![
        Ok(vec![frame("00000001", json!("ORD-1"))]),
        Err(BridgeError::transient("connection reset")),
        Ok(vec![frame("00000002", json!("ORD-2"))]),
    ]);
    let cursor = harness.cursor.clone();
    let subscriptions = harness.subscriptions.clone();
    let handshakes = harness.handshakes.clone();

    let sink = RecordingSink::acking();
    harness.run(vec![("sink", sink.clone())]).await.unwrap();

    assert_eq!(*handshakes.lock().unwrap(), 1);

    // First subscribe had no cursor and used the initial replay policy;
    // the resubscribe resumed from the acknowledged position, not the head
    let subscriptions = subscriptions.lock().unwrap();
    assert_eq!(subscriptions[0], ReplayPosition::NewOnly);
    assert_eq!(
        subscriptions[1],
        ReplayPosition::Token("00000001".to_string())
    );

    let record = cursor.get("/topic/orders").await.unwrap().unwrap();
    assert_eq!(record.token, "00000002");
    assert_eq!(record.seq, 2);

    assert_eq!(sink.published(), vec!["00000001", "00000002"]);
}

#[tokio::test]
async fn poison_event_does_not_stall_the_channel() {
    // The first frame is missing its required field
    let harness = Harness::new(vec![Ok(vec![
        frame("00000001", Value::Null),
        frame("00000002", json!("ORD-2")),
    ])]);
    let cursor = harness.cursor.clone();

    let sink = RecordingSink::acking();
    harness.run(vec![("sink", sink.clone())]).await.unwrap();

    // The malformed event was skipped for delivery but the cursor moved past it
    assert_eq!(sink.published(), vec!["00000002"]);
    let record = cursor.get("/topic/orders").await.unwrap().unwrap();
    assert_eq!(record.token, "00000002");
    assert_eq!(record.seq, 2);
}

#[tokio::test]
async fn auth_failure_is_terminal() {
    let shutdown = Arc::new(AtomicBool::new(false));
    let transport = ScriptedTransport::rejecting_handshake(shutdown.clone());

    let sink = RecordingSink::acking();
    let connector = ChannelConnector::new(
        channel_settings(),
        transport,
        router_with(vec![("sink", sink)]),
        Arc::new(MemoryCursorStore::new()),
        reconnect_settings(),
        shutdown,
        Arc::new(ChannelStatus::default()),
        Duration::from_secs(1),
    );

    let err = connector.run().await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn reconnect_exhaustion_is_reported() {
    let harness = Harness::new(vec![
        Err(BridgeError::transient("reset")),
        Err(BridgeError::transient("reset")),
        Err(BridgeError::transient("reset")),
        Err(BridgeError::transient("reset")),
    ]);

    let sink = RecordingSink::acking();
    let err = harness.run(vec![("sink", sink)]).await.unwrap_err();

    assert!(err.is_transient());
    assert!(err.to_string().contains("exhausted"));
}

#[tokio::test]
async fn sink_outage_recovery_leaves_other_sink_unaffected() {
    // The queue sink is unreachable for 3 attempts, then recovers;
    // the pub/sub sink keeps acknowledging throughout
    let harness = Harness::new(vec![Ok(vec![frame("00000001", json!("ORD-1"))])]);
    let cursor = harness.cursor.clone();

    let flaky = RecordingSink::scripted(vec![
        PublishOutcome::Transient("unreachable".to_string()),
        PublishOutcome::Transient("unreachable".to_string()),
        PublishOutcome::Transient("unreachable".to_string()),
    ]);
    let steady = RecordingSink::acking();

    harness
        .run(vec![("flaky", flaky.clone()), ("steady", steady.clone())])
        .await
        .unwrap();

    assert_eq!(flaky.published(), vec!["00000001"]);
    assert_eq!(steady.published(), vec!["00000001"]);

    let record = cursor.get("/topic/orders").await.unwrap().unwrap();
    assert_eq!(record.token, "00000001");
}

#[tokio::test]
async fn frames_without_tokens_are_skipped() {
    let harness = Harness::new(vec![Ok(vec![
        EventFrame {
            channel: "/topic/orders".to_string(),
            payload: json!({"sobject": {"Id": "ORD-1"}}),
            token: None,
        },
        frame("00000001", json!("ORD-2")),
    ])]);
    let cursor = harness.cursor.clone();

    let sink = RecordingSink::acking();
    harness.run(vec![("sink", sink.clone())]).await.unwrap();

    // The tokenless frame was dropped; the sequence was not consumed by it
    assert_eq!(sink.published(), vec!["00000001"]);
    let record = cursor.get("/topic/orders").await.unwrap().unwrap();
    assert_eq!(record.seq, 1);
}
