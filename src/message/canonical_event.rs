//! CanonicalEvent - extracted and validated events ready for fan-out

use crate::message::Position;
use crate::BridgeResult;
use serde_json::{json, Map, Value};

/// The extracted, validated form of an event
///
/// Immutable once produced by the transformer; shared by reference
/// (`Arc<CanonicalEvent>`) across all sink workers during fan-out. No sink
/// may mutate it.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    /// The upstream channel the event arrived on
    pub channel: String,
    /// Identifier of the schema the event was validated against
    pub schema: String,
    /// Extracted field mapping, keys unique
    pub fields: Map<String, Value>,
    /// Replay position within the channel
    pub position: Position,
}

impl CanonicalEvent {
    /// Create a new canonical event
    pub fn new(
        channel: impl Into<String>,
        schema: impl Into<String>,
        fields: Map<String, Value>,
        position: Position,
    ) -> Self {
        Self {
            channel: channel.into(),
            schema: schema.into(),
            fields,
            position,
        }
    }

    /// Get an extracted field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Serialize to the wire representation published to sinks
    ///
    /// The position is carried as the upstream token only; the ingestion
    /// sequence is bridge-internal.
    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        let wire = json!({
            "channel": self.channel,
            "schema": self.schema,
            "position": self.position.token,
            "fields": Value::Object(self.fields.clone()),
        });
        Ok(serde_json::to_vec(&wire)?)
    }
}
