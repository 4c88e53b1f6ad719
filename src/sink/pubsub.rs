//! Pub/sub sink adapter backed by redis PUBLISH.

use crate::message::CanonicalEvent;
use crate::sink::{PublishOutcome, SinkAdapter};
use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Publishes canonical events to a redis pub/sub channel
///
/// The target channel is the upstream channel name with an optional prefix.
/// Redis pub/sub has no cross-process acknowledgment, so an accepted PUBLISH
/// is reported as acked; the subscriber count is ignored.
#[derive(Debug)]
pub struct PubSubSink {
    client: redis::Client,
    channel_prefix: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl PubSubSink {
    /// Create a sink for the given redis URL
    pub fn new(url: &str, channel_prefix: impl Into<String>) -> BridgeResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::config(format!("Invalid redis URL: {}", e)))?;
        Ok(Self {
            client,
            channel_prefix: channel_prefix.into(),
            connection: Mutex::new(None),
        })
    }

    /// Target pub/sub channel for an upstream channel name
    fn target_channel(&self, upstream_channel: &str) -> String {
        format!("{}{}", self.channel_prefix, upstream_channel)
    }
}

#[async_trait]
impl SinkAdapter for PubSubSink {
    fn kind(&self) -> &'static str {
        "pubsub"
    }

    async fn publish(&self, event: &CanonicalEvent) -> PublishOutcome {
        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => return PublishOutcome::Permanent(format!("serialization failed: {}", e)),
        };

        let mut guard = self.connection.lock().await;

        let mut conn = match guard.as_ref() {
            Some(conn) => conn.clone(),
            None => match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    debug!("Pub/sub connection established");
                    *guard = Some(conn.clone());
                    conn
                }
                Err(e) => return PublishOutcome::Transient(format!("connection failed: {}", e)),
            },
        };

        let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(self.target_channel(&event.channel))
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_receivers) => PublishOutcome::Acked,
            Err(e) => {
                // Drop the connection so the next attempt reconnects
                *guard = None;
                PublishOutcome::Transient(format!("publish failed: {}", e))
            }
        }
    }
}
