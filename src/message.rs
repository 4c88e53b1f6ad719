//! Event types flowing through the pipeline.
//!
//! A `RawEvent` is what the connector receives from the upstream long-poll
//! session; a `CanonicalEvent` is the extracted, validated form that is
//! fanned out to the sinks.

mod canonical_event;
mod raw_event;

pub use canonical_event::CanonicalEvent;
pub use raw_event::{Position, RawEvent};
