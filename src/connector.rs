//! Per-channel streaming connector.
//!
//! Owns the long-poll session lifecycle for one channel and drives events
//! through transform and fan-out. The cursor only advances after the router
//! confirms durable hand-off, and resubscription always resumes from the
//! durable cursor, never from an in-memory position - the at-least-once
//! guarantee across reconnects hinges on exactly that.

use crate::bayeux::{EventFrame, ReplayPosition, StreamTransport};
use crate::config::{ChannelSettings, ReconnectSettings};
use crate::cursor::CursorStore;
use crate::message::Position;
use crate::metrics::BridgeMetrics;
use crate::retry::{RetryConfig, RetryStrategy};
use crate::router::{CompletionHandle, DispatchRouter};
use crate::transform;
use crate::{BridgeError, BridgeResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Events whose completion handles are in flight at once per channel
const ACK_PIPELINE_DEPTH: usize = 1024;

/// Interval at which backoff sleeps re-check the shutdown flag
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorState {
    #[default]
    Disconnected,
    Handshaking,
    Subscribing,
    Streaming,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectorState::Disconnected => "disconnected",
            ConnectorState::Handshaking => "handshaking",
            ConnectorState::Subscribing => "subscribing",
            ConnectorState::Streaming => "streaming",
            ConnectorState::Reconnecting => "reconnecting",
            ConnectorState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Shared status cell read by the health surface
#[derive(Debug, Default)]
pub struct ChannelStatus {
    state: Mutex<ConnectorState>,
    last_position: Mutex<Option<String>>,
}

impl ChannelStatus {
    /// Current lifecycle state
    pub fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap()
    }

    /// Token of the last position the cursor advanced to
    pub fn last_position(&self) -> Option<String> {
        self.last_position.lock().unwrap().clone()
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state.lock().unwrap() = state;
    }

    fn set_last_position(&self, token: String) {
        *self.last_position.lock().unwrap() = Some(token);
    }
}

/// Hand-off from the streaming loop to the cursor advancement loop
enum AckItem {
    /// Event fanned out; advance once its completion handle resolves
    Delivered(CompletionHandle),
    /// Validation failure; advance directly, nothing was delivered
    Skipped(Position),
}

/// Streaming connector for one channel
pub struct ChannelConnector<T: StreamTransport> {
    settings: ChannelSettings,
    transport: T,
    router: DispatchRouter,
    cursor: Arc<dyn CursorStore>,
    reconnect: ReconnectSettings,
    shutdown: Arc<AtomicBool>,
    status: Arc<ChannelStatus>,
    metrics: BridgeMetrics,
    drain_grace: Duration,
}

impl<T: StreamTransport> ChannelConnector<T> {
    /// Create a connector; `run` does the work
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ChannelSettings,
        transport: T,
        router: DispatchRouter,
        cursor: Arc<dyn CursorStore>,
        reconnect: ReconnectSettings,
        shutdown: Arc<AtomicBool>,
        status: Arc<ChannelStatus>,
        drain_grace: Duration,
    ) -> Self {
        let metrics = BridgeMetrics::new(&settings.name);
        Self {
            settings,
            transport,
            router,
            cursor,
            reconnect,
            shutdown,
            status,
            metrics,
            drain_grace,
        }
    }

    /// Run the connector until shutdown or terminal failure
    ///
    /// Returns `Ok(())` on a clean shutdown; an `Err` reports a terminal
    /// failure (auth rejection or reconnect exhaustion) to the supervisor.
    pub async fn run(mut self) -> BridgeResult<()> {
        let channel = self.settings.name.clone();
        info!(channel = %channel, "Starting connector");

        let (ack_tx, ack_rx) = mpsc::channel(ACK_PIPELINE_DEPTH);
        let acker = tokio::spawn(ack_loop(
            channel.clone(),
            ack_rx,
            self.cursor.clone(),
            self.status.clone(),
        ));
        let acker_abort = acker.abort_handle();

        let backoff = RetryStrategy::new(RetryConfig::new(
            self.reconnect.max_attempts,
            self.reconnect.base_backoff_ms,
            self.reconnect.max_backoff_ms,
        ));
        let reset_after = Duration::from_secs(self.reconnect.reset_after_secs);

        let mut state = ConnectorState::Disconnected;
        let mut seq: u64 = 0;
        let mut attempts: u32 = 0;
        let mut streaming_since: Option<Instant> = None;
        let mut outcome: BridgeResult<()> = Ok(());

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(channel = %channel, "Shutdown requested, stopping receive loop");
                break;
            }
            self.status.set_state(state);

            match state {
                ConnectorState::Disconnected => {
                    state = ConnectorState::Handshaking;
                }

                ConnectorState::Handshaking => match self.transport.handshake().await {
                    Ok(client_id) => {
                        debug!(channel = %channel, client_id, "Session opened");
                        state = ConnectorState::Subscribing;
                    }
                    Err(e) if e.is_auth() => {
                        outcome = Err(e);
                        state = ConnectorState::Failed;
                        break;
                    }
                    Err(e) => {
                        warn!(channel = %channel, "Handshake failed: {}", e);
                        state = ConnectorState::Reconnecting;
                    }
                },

                ConnectorState::Subscribing => {
                    // Resume strictly from the durable cursor. An in-memory
                    // position could include events no sink has confirmed yet.
                    let replay = match self.cursor.get(&channel).await {
                        Ok(Some(record)) => {
                            seq = seq.max(record.seq);
                            ReplayPosition::Token(record.token)
                        }
                        Ok(None) => self.settings.initial_replay.into(),
                        Err(e) => {
                            warn!(channel = %channel, "Cursor read failed: {}", e);
                            state = ConnectorState::Reconnecting;
                            continue;
                        }
                    };

                    match self.transport.subscribe(&channel, replay).await {
                        Ok(()) => {
                            info!(channel = %channel, "Subscribed, streaming");
                            streaming_since = Some(Instant::now());
                            self.metrics.set_streaming(true);
                            state = ConnectorState::Streaming;
                        }
                        Err(e) if e.is_auth() => {
                            outcome = Err(e);
                            state = ConnectorState::Failed;
                            break;
                        }
                        Err(e) => {
                            warn!(channel = %channel, "Subscribe failed: {}", e);
                            state = ConnectorState::Reconnecting;
                        }
                    }
                }

                ConnectorState::Streaming => {
                    // Race the blocking poll against shutdown so a drain
                    // does not wait out a full long-poll interval
                    let poll = {
                        let transport = &mut self.transport;
                        let flag = self.shutdown.clone();
                        tokio::select! {
                            result = transport.connect() => Some(result),
                            _ = wait_for_shutdown(flag) => None,
                        }
                    };

                    match poll {
                        None => continue,
                        Some(Ok(frames)) => {
                            for frame in frames {
                                if let Err(e) = self.ingest(frame, &mut seq, &ack_tx).await {
                                    error!(channel = %channel, "Ingestion stopped: {}", e);
                                    self.shutdown.store(true, Ordering::Relaxed);
                                    break;
                                }
                            }

                            // A full quiet streaming interval earns a fresh schedule
                            if attempts > 0 {
                                if let Some(since) = streaming_since {
                                    if since.elapsed() >= reset_after {
                                        debug!(channel = %channel, "Reconnect backoff reset");
                                        attempts = 0;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) if e.is_auth() => {
                            outcome = Err(e);
                            state = ConnectorState::Failed;
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(channel = %channel, "Streaming interrupted: {}", e);
                            self.metrics.set_streaming(false);
                            state = ConnectorState::Reconnecting;
                        }
                    }
                }

                ConnectorState::Reconnecting => {
                    attempts += 1;
                    self.metrics.record_reconnect();

                    if attempts > self.reconnect.max_attempts {
                        outcome = Err(BridgeError::transient(format!(
                            "Reconnect attempts exhausted after {} tries",
                            self.reconnect.max_attempts
                        )));
                        state = ConnectorState::Failed;
                        break;
                    }

                    let delay = backoff.calculate_backoff(attempts);
                    warn!(
                        channel = %channel,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after backoff"
                    );
                    self.interruptible_sleep(delay).await;
                    state = ConnectorState::Subscribing;
                }

                ConnectorState::Failed => break,
            }
        }

        // Drain: no new receives; in-flight deliveries finish within grace
        self.metrics.set_streaming(false);
        let _ = self.transport.disconnect().await;
        drop(ack_tx);

        let drain_deadline = Instant::now() + self.drain_grace;
        if tokio::time::timeout(self.drain_grace, acker).await.is_err() {
            warn!(channel = %channel, "Cursor advancement did not drain in time");
            acker_abort.abort();
        }

        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        let undelivered = self.router.shutdown(remaining).await;
        if undelivered > 0 {
            error!(
                channel = %channel,
                undelivered,
                "Connector stopped with undelivered events"
            );
        }

        match &outcome {
            Ok(()) => {
                self.status.set_state(ConnectorState::Disconnected);
                info!(channel = %channel, "Connector stopped");
            }
            Err(e) => {
                self.status.set_state(ConnectorState::Failed);
                error!(channel = %channel, "Connector failed: {}", e);
            }
        }
        outcome
    }

    /// Transform one frame and hand it to the router
    ///
    /// Backpressure acts here: `submit` suspends while any sink queue is
    /// full, which in turn suspends the receive loop.
    async fn ingest(
        &self,
        frame: EventFrame,
        seq: &mut u64,
        ack_tx: &mpsc::Sender<AckItem>,
    ) -> BridgeResult<()> {
        let channel = &self.settings.name;

        let raw = match frame.into_raw_event(*seq + 1) {
            Some(raw) => {
                *seq += 1;
                raw
            }
            None => {
                warn!(channel = %channel, "Frame without replay token skipped");
                return Ok(());
            }
        };
        self.metrics.record_received();

        let item = match transform::transform(&raw, &self.settings.schema) {
            Ok(canonical) => {
                debug!(
                    channel = %channel,
                    position = %canonical.position,
                    "Event transformed"
                );
                let handle = self.router.submit(Arc::new(canonical)).await?;
                AckItem::Delivered(handle)
            }
            Err(e) => {
                // Poison event: reported, skipped for delivery, cursor moves on
                warn!(channel = %channel, "Event dropped: {}", e);
                self.metrics.record_invalid();
                AckItem::Skipped(raw.position)
            }
        };

        ack_tx
            .send(item)
            .await
            .map_err(|_| BridgeError::transient("Cursor advancement pipeline closed"))
    }

    /// Sleep that wakes early when shutdown is requested
    async fn interruptible_sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(SHUTDOWN_POLL_INTERVAL)).await;
        }
    }
}

/// Resolve once the shutdown flag is set
async fn wait_for_shutdown(flag: Arc<AtomicBool>) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}

/// Cursor advancement loop
///
/// Consumes completion hand-offs in submission order, so the cursor never
/// advances past an event still pending on any sink and retires delivery
/// tasks in upstream position order.
async fn ack_loop(
    channel: String,
    mut rx: mpsc::Receiver<AckItem>,
    cursor: Arc<dyn CursorStore>,
    status: Arc<ChannelStatus>,
) {
    while let Some(item) = rx.recv().await {
        let position = match item {
            AckItem::Delivered(handle) => {
                let outcome = handle.wait().await;

                let undelivered = outcome.undelivered();
                if !undelivered.is_empty() {
                    error!(
                        channel = %channel,
                        position = %outcome.position,
                        sinks = ?undelivered,
                        "Event left undelivered on some sinks"
                    );
                }
                let dead_letters = outcome.dead_letters();
                if !dead_letters.is_empty() {
                    // Context for manual replay: channel, position, sinks
                    error!(
                        channel = %channel,
                        position = %outcome.position,
                        sinks = ?dead_letters,
                        "Event dead-lettered"
                    );
                } else if outcome.fully_acked() {
                    debug!(
                        channel = %channel,
                        position = %outcome.position,
                        "Event acknowledged by all sinks"
                    );
                }
                outcome.position
            }
            AckItem::Skipped(position) => position,
        };

        match cursor.advance(&channel, &position).await {
            Ok(()) => status.set_last_position(position.token),
            Err(e) => {
                error!(
                    channel = %channel,
                    position = %position,
                    "Cursor advance failed: {}",
                    e
                );
            }
        }
    }
    debug!(channel = %channel, "Cursor advancement loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_state_display() {
        assert_eq!(ConnectorState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectorState::Streaming.to_string(), "streaming");
        assert_eq!(ConnectorState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_channel_status_cell() {
        let status = ChannelStatus::default();
        assert_eq!(status.state(), ConnectorState::Disconnected);
        assert!(status.last_position().is_none());

        status.set_state(ConnectorState::Streaming);
        status.set_last_position("00000003".to_string());

        assert_eq!(status.state(), ConnectorState::Streaming);
        assert_eq!(status.last_position(), Some("00000003".to_string()));
    }
}
