//! Process-wide lifecycle supervision.
//!
//! The supervisor starts one connector per configured channel, restarts a
//! connector with backoff when it reports a terminal failure, and coordinates
//! graceful shutdown. It also exposes the narrow health/shutdown surface the
//! external control plane calls through.

use crate::config::{BridgeConfig, ChannelSettings, CursorSettings, SinkBackend, SinkSettings, UpstreamSettings};
use crate::bayeux::BayeuxClient;
use crate::connector::{ChannelConnector, ChannelStatus};
use crate::cursor::{CursorStore, FileCursorStore, MemoryCursorStore, RedisCursorStore};
use crate::metrics::BridgeMetrics;
use crate::retry::{RetryConfig, RetryStrategy};
use crate::router::{DispatchRouter, QueueDepths, SinkDescriptor};
use crate::sink::{ExchangeSpec, PubSubSink, QueueSink, SinkAdapter};
use crate::{BridgeError, BridgeResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Health snapshot of one channel, as exposed to the control plane
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub channel: String,
    pub state: String,
    pub last_position: Option<String>,
    pub queue_depths: Vec<(String, usize)>,
}

/// Live per-channel registrations backing the health surface
#[derive(Default)]
struct ChannelRegistry {
    entries: Mutex<HashMap<String, ChannelEntry>>,
}

struct ChannelEntry {
    status: Arc<ChannelStatus>,
    depths: Arc<QueueDepths>,
}

impl ChannelRegistry {
    fn register(&self, channel: &str, status: Arc<ChannelStatus>, depths: Arc<QueueDepths>) {
        self.entries
            .lock()
            .unwrap()
            .insert(channel.to_string(), ChannelEntry { status, depths });
    }

    fn health(&self, channel: &str) -> Option<ChannelHealth> {
        let entries = self.entries.lock().unwrap();
        entries.get(channel).map(|entry| ChannelHealth {
            channel: channel.to_string(),
            state: entry.status.state().to_string(),
            last_position: entry.status.last_position(),
            queue_depths: entry.depths.snapshot(),
        })
    }
}

/// Shared state one channel supervision loop needs
struct ChannelContext {
    settings: ChannelSettings,
    upstream: UpstreamSettings,
    sinks: Vec<(SinkSettings, Arc<dyn SinkAdapter>)>,
    cursor: Arc<dyn CursorStore>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<ChannelRegistry>,
    delivery_deadline: Duration,
    drain_grace: Duration,
    restart_backoff: RetryStrategy,
}

/// Process-wide lifecycle owner
pub struct Supervisor {
    config: BridgeConfig,
    cursor: Arc<dyn CursorStore>,
    shutdown: Arc<AtomicBool>,
    registry: Arc<ChannelRegistry>,
}

impl Supervisor {
    /// Create a supervisor from a validated configuration
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let cursor = build_cursor_store(&config.cursor)?;

        Ok(Self {
            config,
            cursor,
            shutdown: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(ChannelRegistry::default()),
        })
    }

    /// Run the bridge until shutdown
    pub async fn run(&mut self) -> BridgeResult<()> {
        Self::init_tracing(&self.config);

        info!("Starting bridge");
        info!("Upstream: {}", self.config.upstream.endpoint);
        info!(
            "{} channel(s), {} sink(s)",
            self.config.channels.len(),
            self.config.sinks.len()
        );

        self.setup_shutdown_handler();

        let sinks = build_sink_adapters(&self.config.sinks)?;

        let mut tasks = Vec::new();
        for channel in &self.config.channels {
            let context = ChannelContext {
                settings: channel.clone(),
                upstream: self.config.upstream.clone(),
                sinks: sinks.clone(),
                cursor: self.cursor.clone(),
                shutdown: self.shutdown.clone(),
                registry: self.registry.clone(),
                delivery_deadline: Duration::from_millis(self.config.delivery.deadline_ms),
                drain_grace: Duration::from_millis(self.config.shutdown.grace_ms),
                restart_backoff: RetryStrategy::new(RetryConfig::new(
                    u32::MAX,
                    self.config.upstream.reconnect.base_backoff_ms,
                    self.config.upstream.reconnect.max_backoff_ms,
                )),
            };
            tasks.push(tokio::spawn(supervise_channel(context)));
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!("Channel supervision task panicked: {}", e);
            }
        }

        info!("Bridge stopped");
        Ok(())
    }

    /// Control-plane surface: health snapshot for one channel
    pub fn health(&self, channel: &str) -> Option<ChannelHealth> {
        self.registry.health(channel)
    }

    /// Control-plane surface: trigger a graceful drain and stop
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Setup shutdown signal handler for SIGTERM/SIGINT
    fn setup_shutdown_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl-c");
            info!("Received shutdown signal");
            shutdown.store(true, Ordering::Relaxed);
        });
    }

    /// Initialize tracing/logging
    fn init_tracing(config: &BridgeConfig) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok(); // Ignore if already initialized
    }
}

/// Run one channel's connector, restarting on terminal failure
async fn supervise_channel(context: ChannelContext) {
    let channel = context.settings.name.clone();
    let mut restarts: u32 = 0;

    loop {
        if context.shutdown.load(Ordering::Relaxed) {
            break;
        }

        let router = build_router(&context);
        let status = Arc::new(ChannelStatus::default());
        context
            .registry
            .register(&channel, status.clone(), router.queue_depths());

        let transport = match BayeuxClient::new(context.upstream.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                error!(channel = %channel, "Cannot build upstream client: {}", e);
                return;
            }
        };

        let connector = ChannelConnector::new(
            context.settings.clone(),
            transport,
            router,
            context.cursor.clone(),
            context.upstream.reconnect.clone(),
            context.shutdown.clone(),
            status,
            context.drain_grace,
        );

        match connector.run().await {
            Ok(()) => break,
            Err(e) if e.is_auth() => {
                // Credential problems do not fix themselves; leave the
                // channel down for an operator
                error!(channel = %channel, "Connector failed on auth, not restarted: {}", e);
                break;
            }
            Err(e) => {
                restarts += 1;
                let delay = context.restart_backoff.calculate_backoff(restarts);
                warn!(
                    channel = %channel,
                    restart = restarts,
                    delay_ms = delay.as_millis() as u64,
                    "Connector failed ({}), restarting",
                    e
                );
                interruptible_sleep(&context.shutdown, delay).await;
            }
        }
    }
}

async fn interruptible_sleep(shutdown: &AtomicBool, duration: Duration) {
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        tokio::time::sleep(remaining.min(Duration::from_millis(250))).await;
    }
}

/// Build the fan-out router for one channel
fn build_router(context: &ChannelContext) -> DispatchRouter {
    let descriptors = context
        .sinks
        .iter()
        .map(|(settings, adapter)| SinkDescriptor {
            id: settings.id.clone(),
            adapter: adapter.clone(),
            queue_depth: settings.queue_depth,
            retry: RetryStrategy::new(RetryConfig::new(
                settings.retry.max_attempts,
                settings.retry.backoff_ms,
                settings.retry.max_backoff_ms,
            )),
        })
        .collect();

    DispatchRouter::new(
        context.settings.name.clone(),
        descriptors,
        context.delivery_deadline,
        BridgeMetrics::new(&context.settings.name),
    )
}

/// Build one shared adapter per configured sink
fn build_sink_adapters(
    sinks: &[SinkSettings],
) -> BridgeResult<Vec<(SinkSettings, Arc<dyn SinkAdapter>)>> {
    let mut adapters: Vec<(SinkSettings, Arc<dyn SinkAdapter>)> = Vec::new();

    for settings in sinks {
        let adapter: Arc<dyn SinkAdapter> = match &settings.backend {
            SinkBackend::PubSub {
                url,
                channel_prefix,
            } => Arc::new(PubSubSink::new(url, channel_prefix.clone())?),
            SinkBackend::Queue {
                url,
                exchange,
                exchange_kind,
                durable_exchange,
                routing_key,
            } => Arc::new(QueueSink::new(
                url.clone(),
                ExchangeSpec {
                    name: exchange.clone(),
                    kind: exchange_kind.clone(),
                    durable: *durable_exchange,
                },
                routing_key.clone(),
            )),
        };
        info!(sink = %settings.id, kind = adapter.kind(), "Sink configured");
        adapters.push((settings.clone(), adapter));
    }

    Ok(adapters)
}

/// Build the configured cursor store
fn build_cursor_store(settings: &CursorSettings) -> BridgeResult<Arc<dyn CursorStore>> {
    match settings.store.as_str() {
        "memory" => Ok(Arc::new(MemoryCursorStore::new())),
        "file" => Ok(Arc::new(FileCursorStore::open(&settings.path)?)),
        "redis" => Ok(Arc::new(RedisCursorStore::new(
            &settings.url,
            settings.key_prefix.clone(),
        )?)),
        other => Err(BridgeError::config(format!(
            "unknown cursor store: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorState;

    #[test]
    fn test_registry_health_snapshot() {
        let registry = ChannelRegistry::default();
        assert!(registry.health("/topic/orders").is_none());

        let status = Arc::new(ChannelStatus::default());
        let depths = Arc::new(QueueDepths::default());
        registry.register("/topic/orders", status.clone(), depths);

        let health = registry.health("/topic/orders").unwrap();
        assert_eq!(health.channel, "/topic/orders");
        assert_eq!(health.state, ConnectorState::Disconnected.to_string());
        assert!(health.last_position.is_none());
        assert!(health.queue_depths.is_empty());
    }

    #[test]
    fn test_build_cursor_store_variants() {
        let memory = CursorSettings {
            store: "memory".to_string(),
            ..Default::default()
        };
        assert!(build_cursor_store(&memory).is_ok());

        let unknown = CursorSettings {
            store: "postgres".to_string(),
            ..Default::default()
        };
        assert!(build_cursor_store(&unknown).is_err());
    }
}
