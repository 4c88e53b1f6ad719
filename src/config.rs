//! Configuration management for the bridge.

use crate::bayeux::ReplayPosition;
use crate::transform::ChannelSchema;
use crate::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;

/// Main configuration for the bridge process
///
/// # Structure
/// - **Mandatory sections**: `upstream`, at least one `[[channels]]` and one
///   `[[sinks]]` entry
/// - **Optional sections** (defaults apply): `cursor`, `delivery`, `shutdown`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream long-poll endpoint and session settings
    pub upstream: UpstreamSettings,

    /// Channel subscriptions, immutable for the process lifetime
    #[serde(default)]
    pub channels: Vec<ChannelSettings>,

    /// Downstream sink descriptors
    #[serde(default)]
    pub sinks: Vec<SinkSettings>,

    /// Cursor persistence settings
    #[serde(default)]
    pub cursor: CursorSettings,

    /// Fan-out delivery settings
    #[serde(default)]
    pub delivery: DeliverySettings,

    /// Graceful shutdown settings
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            BridgeError::config(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Apply environment variable overrides
    ///
    /// Only the endpoint and credentials are overridable from the
    /// environment; everything else comes from the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("PUSHBRIDGE_ENDPOINT") {
            self.upstream.endpoint = val;
        }
        if let Some(auth) = self.upstream.auth.as_mut() {
            if let Ok(val) = env::var("PUSHBRIDGE_USERNAME") {
                auth.username = val;
            }
            if let Ok(val) = env::var("PUSHBRIDGE_PASSWORD") {
                auth.password = val;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.upstream.endpoint.is_empty() {
            return Err(BridgeError::config("upstream.endpoint cannot be empty"));
        }

        if self.channels.is_empty() {
            return Err(BridgeError::config("at least one channel is required"));
        }

        if self.sinks.is_empty() {
            return Err(BridgeError::config("at least one sink is required"));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(BridgeError::config("channel name cannot be empty"));
            }
            if !names.insert(&channel.name) {
                return Err(BridgeError::config(format!(
                    "duplicate channel name: {}",
                    channel.name
                )));
            }
            if channel.schema.id.is_empty() {
                return Err(BridgeError::config(format!(
                    "channel {} has an empty schema id",
                    channel.name
                )));
            }
        }

        let mut ids = HashSet::new();
        for sink in &self.sinks {
            if sink.id.is_empty() {
                return Err(BridgeError::config("sink id cannot be empty"));
            }
            if !ids.insert(&sink.id) {
                return Err(BridgeError::config(format!("duplicate sink id: {}", sink.id)));
            }
            if sink.queue_depth == 0 {
                return Err(BridgeError::config(format!(
                    "sink {} queue_depth must be > 0",
                    sink.id
                )));
            }
        }

        match self.cursor.store.as_str() {
            "memory" | "file" => {}
            "redis" => {
                if self.cursor.url.is_empty() {
                    return Err(BridgeError::config(
                        "cursor.url is required for the redis cursor store",
                    ));
                }
            }
            other => {
                return Err(BridgeError::config(format!(
                    "unknown cursor store: {} (expected memory, file, or redis)",
                    other
                )));
            }
        }

        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            upstream: UpstreamSettings::default(),
            channels: Vec::new(),
            sinks: Vec::new(),
            cursor: CursorSettings::default(),
            delivery: DeliverySettings::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Upstream long-poll endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Bayeux endpoint URL
    pub endpoint: String,

    /// Credentials exchanged for a bearer token before the handshake
    #[serde(default)]
    pub auth: Option<AuthSettings>,

    /// Timeout of the blocking connect poll; elapsing it counts as a
    /// missed heartbeat
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout of handshake/subscribe/token requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Reconnect backoff schedule
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    120_000
}
fn default_request_timeout_ms() -> u64 {
    15_000
}

/// Credentials for the upstream token endpoint (password grant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

/// Reconnect backoff schedule for a connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Base backoff duration in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Consecutive failed attempts before the connector is reported failed
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,

    /// Uninterrupted streaming seconds after which the schedule resets
    #[serde(default = "default_backoff_reset_secs")]
    pub reset_after_secs: u64,
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}
fn default_reconnect_max_backoff_ms() -> u64 {
    60_000
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_backoff_reset_secs() -> u64 {
    60
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_reconnect_backoff_ms(),
            max_backoff_ms: default_reconnect_max_backoff_ms(),
            max_attempts: default_reconnect_max_attempts(),
            reset_after_secs: default_backoff_reset_secs(),
        }
    }
}

/// Where a channel starts when no cursor is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Only events published after the subscription
    #[default]
    NewOnly,
    /// Everything the upstream still retains
    AllAvailable,
}

impl From<ReplayPolicy> for ReplayPosition {
    fn from(policy: ReplayPolicy) -> Self {
        match policy {
            ReplayPolicy::NewOnly => ReplayPosition::NewOnly,
            ReplayPolicy::AllAvailable => ReplayPosition::AllAvailable,
        }
    }
}

/// One channel subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Upstream channel name, unique
    pub name: String,

    /// Extraction paths and validation schema for the channel's events
    pub schema: ChannelSchema,

    /// Replay policy applied when no cursor is stored
    #[serde(default)]
    pub initial_replay: ReplayPolicy,
}

/// One downstream sink descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Unique sink id
    pub id: String,

    /// Broker connection parameters, tagged by sink type
    #[serde(flatten)]
    pub backend: SinkBackend,

    /// Bound of the sink's delivery queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Retry policy for transient publish failures
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_queue_depth() -> usize {
    64
}

/// Sink backend variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkBackend {
    /// Pub/sub broker (redis PUBLISH)
    PubSub {
        url: String,
        /// Prefix prepended to the upstream channel name
        #[serde(default)]
        channel_prefix: String,
    },
    /// AMQP broker-queue
    Queue {
        url: String,
        exchange: String,
        #[serde(default = "default_exchange_kind")]
        exchange_kind: String,
        #[serde(default = "default_durable")]
        durable_exchange: bool,
        routing_key: String,
    },
}

fn default_exchange_kind() -> String {
    "topic".to_string()
}
fn default_durable() -> bool {
    true
}

/// Retry settings for one sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum publish attempts before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_retry_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_retry_max_backoff_ms(),
        }
    }
}

/// Cursor persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorSettings {
    /// Store type: memory, file, or redis
    #[serde(default = "default_cursor_store")]
    pub store: String,

    /// Path of the cursor file (file store)
    #[serde(default = "default_cursor_path")]
    pub path: String,

    /// Redis URL (redis store)
    #[serde(default)]
    pub url: String,

    /// Key prefix (redis store)
    #[serde(default = "default_cursor_prefix")]
    pub key_prefix: String,
}

fn default_cursor_store() -> String {
    "file".to_string()
}
fn default_cursor_path() -> String {
    "cursors.json".to_string()
}
fn default_cursor_prefix() -> String {
    "pushbridge:cursor".to_string()
}

impl Default for CursorSettings {
    fn default() -> Self {
        Self {
            store: default_cursor_store(),
            path: default_cursor_path(),
            url: String::new(),
            key_prefix: default_cursor_prefix(),
        }
    }
}

/// Fan-out delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Upper bound on one event's fan-out, pending sinks reported after it
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_deadline_ms() -> u64 {
    120_000
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
        }
    }
}

/// Graceful shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    /// Grace period for draining sink queues, milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    10_000
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
        }
    }
}
