//! Metrics and observability for the bridge.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metrics collector, labeled per channel
#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    /// Channel name for labeling
    channel: String,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new(channel: impl Into<String>) -> Self {
        Self::register_metrics();
        Self {
            channel: channel.into(),
        }
    }

    /// Register metric descriptions
    fn register_metrics() {
        // Counters
        describe_counter!(
            "pushbridge_events_received_total",
            "Total number of raw events received from the upstream"
        );
        describe_counter!(
            "pushbridge_events_delivered_total",
            "Total number of events acknowledged by a sink"
        );
        describe_counter!(
            "pushbridge_events_invalid_total",
            "Total number of events that failed extraction or validation"
        );
        describe_counter!(
            "pushbridge_publish_retries_total",
            "Total number of sink publish retries"
        );
        describe_counter!(
            "pushbridge_events_dead_lettered_total",
            "Total number of per-sink dead-lettered events"
        );
        describe_counter!(
            "pushbridge_reconnects_total",
            "Total number of upstream reconnect attempts"
        );

        // Histograms
        describe_histogram!(
            "pushbridge_publish_duration_seconds",
            "Time spent per sink publish attempt"
        );

        // Gauges
        describe_gauge!(
            "pushbridge_sink_queue_depth",
            "Current depth of a sink's delivery queue"
        );
        describe_gauge!(
            "pushbridge_connector_up",
            "Connector streaming state (1 = streaming, 0 = not)"
        );
    }

    /// Record a raw event received
    pub fn record_received(&self) {
        counter!(
            "pushbridge_events_received_total",
            "channel" => self.channel.clone(),
        )
        .increment(1);
    }

    /// Record a sink acknowledgment
    pub fn record_delivered(&self, sink: &str) {
        counter!(
            "pushbridge_events_delivered_total",
            "channel" => self.channel.clone(),
            "sink" => sink.to_string(),
        )
        .increment(1);
    }

    /// Record a validation failure
    pub fn record_invalid(&self) {
        counter!(
            "pushbridge_events_invalid_total",
            "channel" => self.channel.clone(),
        )
        .increment(1);
    }

    /// Record a publish retry
    pub fn record_retry(&self, sink: &str) {
        counter!(
            "pushbridge_publish_retries_total",
            "channel" => self.channel.clone(),
            "sink" => sink.to_string(),
        )
        .increment(1);
    }

    /// Record a dead-lettered event
    pub fn record_dead_letter(&self, sink: &str) {
        counter!(
            "pushbridge_events_dead_lettered_total",
            "channel" => self.channel.clone(),
            "sink" => sink.to_string(),
        )
        .increment(1);
    }

    /// Record an upstream reconnect attempt
    pub fn record_reconnect(&self) {
        counter!(
            "pushbridge_reconnects_total",
            "channel" => self.channel.clone(),
        )
        .increment(1);
    }

    /// Record the duration of a publish attempt
    pub fn record_publish_time(&self, sink: &str, duration: Duration) {
        histogram!(
            "pushbridge_publish_duration_seconds",
            "channel" => self.channel.clone(),
            "sink" => sink.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Set a sink's current queue depth
    pub fn set_queue_depth(&self, sink: &str, depth: usize) {
        gauge!(
            "pushbridge_sink_queue_depth",
            "channel" => self.channel.clone(),
            "sink" => sink.to_string(),
        )
        .set(depth as f64);
    }

    /// Set whether the connector is streaming
    pub fn set_streaming(&self, streaming: bool) {
        gauge!(
            "pushbridge_connector_up",
            "channel" => self.channel.clone(),
        )
        .set(if streaming { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = BridgeMetrics::new("/topic/orders");
        assert_eq!(metrics.channel, "/topic/orders");

        // Recording against an unset recorder is a no-op, not a panic
        metrics.record_received();
        metrics.record_delivered("rabbit");
        metrics.set_queue_depth("rabbit", 3);
    }
}
