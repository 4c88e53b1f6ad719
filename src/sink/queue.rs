//! Broker-queue sink adapter backed by AMQP.

use crate::message::CanonicalEvent;
use crate::sink::{PublishOutcome, SinkAdapter};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Declared exchange topology for a queue sink
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: String,
    pub durable: bool,
}

/// Publishes canonical events to an AMQP exchange
///
/// Messages are marked persistent and published with confirms enabled: an
/// event is acked only after the broker confirms receipt. The exchange is
/// declared on every (re)connection so a restarted broker regains its
/// topology before publishing resumes. The event's channel and position
/// token travel as headers for consumer-side deduplication.
pub struct QueueSink {
    url: String,
    exchange: ExchangeSpec,
    routing_key: String,
    state: Mutex<Option<(Connection, Channel)>>,
}

impl QueueSink {
    /// Create a sink for the given AMQP URL and exchange
    pub fn new(url: impl Into<String>, exchange: ExchangeSpec, routing_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange,
            routing_key: routing_key.into(),
            state: Mutex::new(None),
        }
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange.kind.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }

    /// Get an open confirmed channel, connecting and declaring topology if needed
    async fn channel(
        &self,
        guard: &mut Option<(Connection, Channel)>,
    ) -> Result<Channel, lapin::Error> {
        if let Some((_, channel)) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            *guard = None;
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .exchange_declare(
                &self.exchange.name,
                self.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: self.exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(exchange = %self.exchange.name, "Queue sink connected, exchange declared");
        *guard = Some((connection, channel.clone()));
        Ok(channel)
    }

    fn classify(error: lapin::Error) -> PublishOutcome {
        match error {
            // Broker-side refusal (access, unknown exchange) cannot be retried away
            lapin::Error::ProtocolError(e) => PublishOutcome::Permanent(e.to_string()),
            other => PublishOutcome::Transient(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl SinkAdapter for QueueSink {
    fn kind(&self) -> &'static str {
        "queue"
    }

    async fn publish(&self, event: &CanonicalEvent) -> PublishOutcome {
        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(e) => return PublishOutcome::Permanent(format!("serialization failed: {}", e)),
        };

        let mut guard = self.state.lock().await;
        let channel = match self.channel(&mut guard).await {
            Ok(channel) => channel,
            Err(e) => {
                *guard = None;
                return Self::classify(e);
            }
        };

        let mut headers = FieldTable::default();
        headers.insert(
            "channel".into(),
            AMQPValue::LongString(event.channel.clone().into()),
        );
        headers.insert(
            "position".into(),
            AMQPValue::LongString(event.position.token.clone().into()),
        );

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);

        let publish = channel
            .basic_publish(
                &self.exchange.name,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await;

        let confirm = match publish {
            Ok(confirm) => confirm,
            Err(e) => {
                *guard = None;
                return Self::classify(e);
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                PublishOutcome::Permanent("broker nacked publish".to_string())
            }
            Ok(_) => {
                debug!(
                    channel = %event.channel,
                    position = %event.position,
                    "Broker confirmed publish"
                );
                PublishOutcome::Acked
            }
            Err(e) => {
                *guard = None;
                Self::classify(e)
            }
        }
    }
}
