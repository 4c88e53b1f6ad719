//! Fan-out dispatch router.
//!
//! One router per channel. `submit` enqueues an event onto every sink's
//! bounded queue and returns a completion handle that resolves once every
//! sink reached a terminal status (acked or dead-lettered) or the delivery
//! deadline elapsed. A full sink queue suspends `submit`, which is how a slow
//! sink's pressure reaches the upstream read loop without touching the other
//! sinks' queues.

use crate::message::{CanonicalEvent, Position};
use crate::metrics::BridgeMetrics;
use crate::retry::RetryStrategy;
use crate::sink::{PublishOutcome, SinkAdapter};
use crate::{BridgeError, BridgeResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Per-sink delivery status of one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Pending,
    InFlight,
    Acked,
    /// Transient failure recorded, retry scheduled
    Failed,
    DeadLettered,
}

impl SinkStatus {
    /// Terminal statuses end a sink's participation in a delivery task
    pub fn is_terminal(&self) -> bool {
        matches!(self, SinkStatus::Acked | SinkStatus::DeadLettered)
    }
}

/// Static description of one configured sink
pub struct SinkDescriptor {
    /// Unique sink id, used in logs, metrics, and health output
    pub id: String,
    /// The adapter handling publishes for this sink
    pub adapter: Arc<dyn SinkAdapter>,
    /// Bound of the sink's delivery queue
    pub queue_depth: usize,
    /// Per-sink retry policy for transient failures
    pub retry: RetryStrategy,
}

/// Final per-sink statuses of one event's fan-out
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub position: Position,
    pub statuses: HashMap<String, SinkStatus>,
}

impl DeliveryOutcome {
    /// True when every sink acknowledged the event
    pub fn fully_acked(&self) -> bool {
        self.statuses.values().all(|s| *s == SinkStatus::Acked)
    }

    /// Sinks that dead-lettered the event
    pub fn dead_letters(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == SinkStatus::DeadLettered)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Sinks that never reached a terminal status (deadline or shutdown)
    pub fn undelivered(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// In-flight delivery state of one event, shared with every sink worker
#[derive(Debug)]
struct DeliveryTask {
    position: Position,
    created: Instant,
    statuses: Mutex<HashMap<String, SinkStatus>>,
    remaining: AtomicUsize,
    done: Mutex<Option<oneshot::Sender<DeliveryOutcome>>>,
}

impl DeliveryTask {
    fn new(position: Position, sink_ids: &[String], done: oneshot::Sender<DeliveryOutcome>) -> Self {
        let statuses = sink_ids
            .iter()
            .map(|id| (id.clone(), SinkStatus::Pending))
            .collect();
        Self {
            position,
            created: Instant::now(),
            statuses: Mutex::new(statuses),
            remaining: AtomicUsize::new(sink_ids.len()),
            done: Mutex::new(Some(done)),
        }
    }

    fn set_status(&self, sink: &str, status: SinkStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(sink.to_string(), status);
    }

    /// Record a terminal status; the last sink to finish resolves the handle
    fn mark_terminal(&self, sink: &str, status: SinkStatus) {
        self.set_status(sink, status);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(done) = self.done.lock().unwrap().take() {
                let _ = done.send(self.outcome());
            }
        }
    }

    fn outcome(&self) -> DeliveryOutcome {
        DeliveryOutcome {
            position: self.position.clone(),
            statuses: self.statuses.lock().unwrap().clone(),
        }
    }
}

/// Handle resolving once an event's fan-out completed or timed out
pub struct CompletionHandle {
    rx: oneshot::Receiver<DeliveryOutcome>,
    deadline: Duration,
    task: Arc<DeliveryTask>,
}

impl CompletionHandle {
    /// Wait for every sink to reach a terminal status
    ///
    /// The deadline counts from submission. On expiry (or shutdown racing
    /// the workers) the outcome reports the still-pending sinks as
    /// undelivered rather than blocking forever.
    pub async fn wait(self) -> DeliveryOutcome {
        let remaining = self
            .deadline
            .saturating_sub(self.task.created.elapsed());

        match tokio::time::timeout(remaining, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => self.task.outcome(),
            Err(_) => {
                warn!(
                    position = %self.task.position,
                    "Delivery deadline elapsed with sinks still pending"
                );
                self.task.outcome()
            }
        }
    }
}

/// Live queue depths per sink, shared with the health surface
#[derive(Debug, Default)]
pub struct QueueDepths {
    depths: HashMap<String, AtomicUsize>,
}

impl QueueDepths {
    fn new(sink_ids: &[String]) -> Self {
        Self {
            depths: sink_ids
                .iter()
                .map(|id| (id.clone(), AtomicUsize::new(0)))
                .collect(),
        }
    }

    fn increment(&self, sink: &str) -> usize {
        match self.depths.get(sink) {
            Some(depth) => depth.fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        }
    }

    fn decrement(&self, sink: &str) -> usize {
        match self.depths.get(sink) {
            Some(depth) => depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1),
            None => 0,
        }
    }

    /// Snapshot of every sink's current queue depth
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut depths: Vec<_> = self
            .depths
            .iter()
            .map(|(id, depth)| (id.clone(), depth.load(Ordering::Acquire)))
            .collect();
        depths.sort();
        depths
    }
}

struct SinkQueue {
    id: String,
    tx: mpsc::Sender<DeliveryItem>,
}

struct DeliveryItem {
    event: Arc<CanonicalEvent>,
    task: Arc<DeliveryTask>,
}

/// Fan-out router for one channel
pub struct DispatchRouter {
    channel: String,
    sink_ids: Vec<String>,
    queues: Vec<SinkQueue>,
    workers: Vec<(String, JoinHandle<()>)>,
    deadline: Duration,
    depths: Arc<QueueDepths>,
    /// Per-sink deliveries submitted but not yet terminal
    pending: Arc<AtomicUsize>,
}

impl DispatchRouter {
    /// Create a router and spawn one delivery worker per sink
    pub fn new(
        channel: impl Into<String>,
        descriptors: Vec<SinkDescriptor>,
        deadline: Duration,
        metrics: BridgeMetrics,
    ) -> Self {
        let channel = channel.into();
        let sink_ids: Vec<String> = descriptors.iter().map(|d| d.id.clone()).collect();
        let depths = Arc::new(QueueDepths::new(&sink_ids));
        let pending = Arc::new(AtomicUsize::new(0));

        let mut queues = Vec::new();
        let mut workers = Vec::new();

        for descriptor in descriptors {
            let (tx, rx) = mpsc::channel(descriptor.queue_depth.max(1));
            let worker = tokio::spawn(sink_worker(
                channel.clone(),
                descriptor.id.clone(),
                descriptor.adapter,
                rx,
                descriptor.retry,
                metrics.clone(),
                depths.clone(),
                pending.clone(),
            ));
            queues.push(SinkQueue {
                id: descriptor.id.clone(),
                tx,
            });
            workers.push((descriptor.id, worker));
        }

        Self {
            channel,
            sink_ids,
            queues,
            workers,
            deadline,
            depths,
            pending,
        }
    }

    /// Live queue depth handle for the health surface
    pub fn queue_depths(&self) -> Arc<QueueDepths> {
        self.depths.clone()
    }

    /// Fan an event out to every sink queue
    ///
    /// Suspends while any sink queue is full. Enqueue order follows call
    /// order, so per-channel FIFO holds on every sink queue as long as a
    /// single connector submits.
    pub async fn submit(&self, event: Arc<CanonicalEvent>) -> BridgeResult<CompletionHandle> {
        let (done_tx, done_rx) = oneshot::channel();
        let task = Arc::new(DeliveryTask::new(
            event.position.clone(),
            &self.sink_ids,
            done_tx,
        ));

        for queue in &self.queues {
            let item = DeliveryItem {
                event: event.clone(),
                task: task.clone(),
            };
            // Counted before the send: the worker decrements on dequeue
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.depths.increment(&queue.id);
            if queue.tx.send(item).await.is_err() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.depths.decrement(&queue.id);
                return Err(BridgeError::transient(format!(
                    "Sink queue {} closed",
                    queue.id
                )));
            }
        }

        debug!(
            channel = %self.channel,
            position = %event.position,
            "Event fanned out to {} sink(s)",
            self.queues.len()
        );

        Ok(CompletionHandle {
            rx: done_rx,
            deadline: self.deadline,
            task,
        })
    }

    /// Stop accepting submissions and drain the sink queues
    ///
    /// Workers finish their queued deliveries within the grace period; after
    /// it they are aborted. Returns the number of per-sink deliveries that
    /// never reached a terminal status, which are reported, not silently
    /// dropped.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        // Dropping the senders closes the queues; workers exit after draining
        self.queues.clear();

        let deadline = Instant::now() + grace;
        for (id, worker) in self.workers.drain(..) {
            let abort = worker.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, worker).await.is_err() {
                warn!(channel = %self.channel, sink = %id, "Drain grace elapsed, aborting sink worker");
                abort.abort();
            }
        }

        let undelivered = self.pending.load(Ordering::Acquire);
        if undelivered > 0 {
            error!(
                channel = %self.channel,
                undelivered,
                "Shutdown left deliveries unfinished"
            );
        }
        undelivered
    }
}

/// Delivery worker loop for one sink
#[allow(clippy::too_many_arguments)]
async fn sink_worker(
    channel: String,
    sink_id: String,
    adapter: Arc<dyn SinkAdapter>,
    mut rx: mpsc::Receiver<DeliveryItem>,
    retry: RetryStrategy,
    metrics: BridgeMetrics,
    depths: Arc<QueueDepths>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(item) = rx.recv().await {
        let depth = depths.decrement(&sink_id);
        metrics.set_queue_depth(&sink_id, depth);

        deliver(&channel, &sink_id, &*adapter, &item, &retry, &metrics).await;
        pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(channel = %channel, sink = %sink_id, "Sink worker drained and stopped");
}

/// Publish one event to one sink, retrying transient failures
async fn deliver(
    channel: &str,
    sink_id: &str,
    adapter: &dyn SinkAdapter,
    item: &DeliveryItem,
    retry: &RetryStrategy,
    metrics: &BridgeMetrics,
) {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        item.task.set_status(sink_id, SinkStatus::InFlight);

        let start = Instant::now();
        let outcome = adapter.publish(&item.event).await;
        metrics.record_publish_time(sink_id, start.elapsed());

        match outcome {
            PublishOutcome::Acked => {
                metrics.record_delivered(sink_id);
                item.task.mark_terminal(sink_id, SinkStatus::Acked);
                return;
            }
            PublishOutcome::Transient(reason) => {
                if retry.should_retry(attempt) {
                    item.task.set_status(sink_id, SinkStatus::Failed);
                    metrics.record_retry(sink_id);
                    let backoff = retry.calculate_backoff(attempt);
                    warn!(
                        channel,
                        sink = sink_id,
                        position = %item.event.position,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason,
                        "Transient sink failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                } else {
                    error!(
                        channel,
                        sink = sink_id,
                        position = %item.event.position,
                        attempts = attempt,
                        reason,
                        "Retry attempts exhausted, dead-lettering"
                    );
                    metrics.record_dead_letter(sink_id);
                    item.task.mark_terminal(sink_id, SinkStatus::DeadLettered);
                    return;
                }
            }
            PublishOutcome::Permanent(reason) => {
                error!(
                    channel,
                    sink = sink_id,
                    position = %item.event.position,
                    reason,
                    "Permanent sink failure, dead-lettering"
                );
                metrics.record_dead_letter(sink_id);
                item.task.mark_terminal(sink_id, SinkStatus::DeadLettered);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_status_terminal() {
        assert!(SinkStatus::Acked.is_terminal());
        assert!(SinkStatus::DeadLettered.is_terminal());
        assert!(!SinkStatus::Pending.is_terminal());
        assert!(!SinkStatus::InFlight.is_terminal());
        assert!(!SinkStatus::Failed.is_terminal());
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = DeliveryOutcome {
            position: Position::new("00000001", 1),
            statuses: [
                ("rabbit".to_string(), SinkStatus::Acked),
                ("redis".to_string(), SinkStatus::DeadLettered),
                ("stuck".to_string(), SinkStatus::InFlight),
            ]
            .into_iter()
            .collect(),
        };

        assert!(!outcome.fully_acked());
        assert_eq!(outcome.dead_letters(), vec!["redis"]);
        assert_eq!(outcome.undelivered(), vec!["stuck"]);
    }

    #[test]
    fn test_queue_depth_tracking() {
        let depths = QueueDepths::new(&["rabbit".to_string(), "redis".to_string()]);

        depths.increment("rabbit");
        depths.increment("rabbit");
        depths.increment("redis");
        depths.decrement("rabbit");

        assert_eq!(
            depths.snapshot(),
            vec![("rabbit".to_string(), 1), ("redis".to_string(), 1)]
        );
    }
}
