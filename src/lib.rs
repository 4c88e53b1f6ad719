//! # pushbridge
//!
//! Bridge between a Bayeux/CometD-style long-poll event source and
//! message-bus sinks.
//!
//! The bridge subscribes to upstream channels over HTTP long-polling,
//! extracts and validates each JSON event against a per-channel schema, and
//! fans the canonical event out to every configured sink - a pub/sub broker
//! (redis) and/or an AMQP broker-queue. A durable replay cursor per channel
//! lets a connector resume after reconnects and restarts without losing
//! events; delivery is at-least-once and consumers are expected to dedupe on
//! (channel, position).
//!
//! ## Overview
//!
//! ```text
//! upstream --long-poll--> Connector --> Transformer --> Router --> N x Sink
//!                             ^                            |
//!                             |                            v
//!                        Cursor Store  <---- completion signal
//! ```
//!
//! - One connector per channel owns the handshake / subscribe / connect-loop
//!   lifecycle and reconnects with capped exponential backoff.
//! - The router gives every sink its own bounded queue and delivery worker:
//!   a slow sink suspends the upstream read loop (backpressure) but never
//!   stalls the other sinks, and a dead sink is dead-lettered per event
//!   rather than blocking cursor progress.
//! - The cursor only advances once every sink reached a terminal status for
//!   the event, in upstream position order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pushbridge::{BridgeConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> pushbridge::BridgeResult<()> {
//!     let mut config = BridgeConfig::from_file("pushbridge.toml")?;
//!     config.apply_env_overrides();
//!
//!     let mut supervisor = Supervisor::new(config)?;
//!     supervisor.run().await
//! }
//! ```

pub mod bayeux;
mod config;
pub mod connector;
pub mod cursor;
mod error;
mod message;
mod metrics;
mod retry;
pub mod router;
pub mod sink;
mod supervisor;
pub mod transform;

// Re-export public API
pub use config::{
    AuthSettings, BridgeConfig, ChannelSettings, CursorSettings, DeliverySettings,
    ReconnectSettings, ReplayPolicy, RetrySettings, ShutdownSettings, SinkBackend, SinkSettings,
    UpstreamSettings,
};
pub use connector::{ChannelConnector, ChannelStatus, ConnectorState};
pub use cursor::{CursorRecord, CursorStore, FileCursorStore, MemoryCursorStore, RedisCursorStore};
pub use error::{BridgeError, BridgeResult};
pub use message::{CanonicalEvent, Position, RawEvent};
pub use metrics::BridgeMetrics;
pub use retry::{RetryConfig, RetryStrategy};
pub use router::{
    CompletionHandle, DeliveryOutcome, DispatchRouter, QueueDepths, SinkDescriptor, SinkStatus,
};
pub use sink::{ExchangeSpec, PubSubSink, PublishOutcome, QueueSink, SinkAdapter};
pub use supervisor::{ChannelHealth, Supervisor};
pub use transform::{transform, ChannelSchema, FieldKind, FieldSchema};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
