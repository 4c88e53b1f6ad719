//! RawEvent - events as received from the upstream session

use serde_json::Value;

/// Replay position of an event within its channel
///
/// The `token` is the upstream broker's opaque replay identifier; the `seq`
/// is a per-channel ingestion sequence assigned by the connector. Tokens are
/// never ordered or compared by the bridge, only handed back verbatim on
/// resubscribe; monotonicity checks in the cursor store use `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Opaque upstream position token
    pub token: String,
    /// Per-channel ingestion sequence, strictly increasing
    pub seq: u64,
}

impl Position {
    /// Create a new position
    pub fn new(token: impl Into<String>, seq: u64) -> Self {
        Self {
            token: token.into(),
            seq,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Event frame as received from the upstream, before extraction
///
/// Owned by the connector until handed to the transformer.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// The upstream channel the event arrived on
    pub channel: String,
    /// The untouched structured payload
    pub payload: Value,
    /// Replay position within the channel
    pub position: Position,
}

impl RawEvent {
    /// Create a new raw event
    pub fn new(channel: impl Into<String>, payload: Value, position: Position) -> Self {
        Self {
            channel: channel.into(),
            payload,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_display() {
        let position = Position::new("00000042", 7);
        assert_eq!(position.to_string(), "00000042");
        assert_eq!(position.seq, 7);
    }

    #[test]
    fn test_raw_event_creation() {
        let event = RawEvent::new(
            "/topic/orders",
            json!({"data": {"event": {"replayId": 42}}}),
            Position::new("42", 1),
        );

        assert_eq!(event.channel, "/topic/orders");
        assert_eq!(event.position.token, "42");
        assert!(event.payload["data"]["event"]["replayId"].is_number());
    }
}
