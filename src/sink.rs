//! Downstream sink adapters.
//!
//! A sink adapter wraps one broker connection behind the closed `publish`
//! capability. Adapters own their connections and re-establish them lazily;
//! a connection loss in one adapter never propagates to another.

mod pubsub;
mod queue;

pub use pubsub::PubSubSink;
pub use queue::{ExchangeSpec, QueueSink};

use crate::message::CanonicalEvent;
use async_trait::async_trait;

/// Result of a single publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The sink accepted the event
    Acked,
    /// The attempt failed but may succeed if retried
    Transient(String),
    /// The sink rejected the event; retrying cannot help
    Permanent(String),
}

impl PublishOutcome {
    /// Check if this outcome is an acknowledgment
    pub fn is_acked(&self) -> bool {
        matches!(self, PublishOutcome::Acked)
    }

    /// Check if this outcome is retryable
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishOutcome::Transient(_))
    }
}

/// Capability interface for downstream sinks
///
/// Adapters are shared across channels (`Arc<dyn SinkAdapter>`); `publish`
/// takes `&self` and must be safe for concurrent calls from the per-channel
/// delivery workers.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// The adapter variant, for logs and metrics
    fn kind(&self) -> &'static str;

    /// Publish one canonical event
    async fn publish(&self, event: &CanonicalEvent) -> PublishOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(PublishOutcome::Acked.is_acked());
        assert!(!PublishOutcome::Acked.is_transient());

        let transient = PublishOutcome::Transient("connection reset".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_acked());

        let permanent = PublishOutcome::Permanent("unroutable".to_string());
        assert!(!permanent.is_transient());
        assert!(!permanent.is_acked());
    }
}
