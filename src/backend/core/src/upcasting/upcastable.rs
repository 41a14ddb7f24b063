//! Mutable views of recorded events, used only while upcasting.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::events::{
    EventDescriptor, EventId, EventMetadata, EventPayload, RecordedEventDescriptor, SequenceNumber, StreamId,
    StreamVersion,
};

// =============================================================================
// Field Maps
// =============================================================================

/// Editable payload.
///
/// Field edits apply to object payloads. Adding to a `null` payload turns it
/// into an object; other non-object payloads are left alone.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcastableEventPayload(Value);

impl UpcastableEventPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// Move `from` to `to`. Returns `false` if `from` was absent.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.0.as_object_mut() {
            Some(map) => rename_in(map, from, to.into()),
            None => false,
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.as_object_mut().and_then(|map| map.remove(field))
    }

    /// Set a field, replacing any previous value.
    pub fn add(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        if self.0.is_null() {
            self.0 = Value::Object(Map::new());
        }
        if let Some(map) = self.0.as_object_mut() {
            map.insert(field.into(), value.into());
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_payload(self) -> EventPayload {
        EventPayload::new(self.0)
    }
}

/// Editable metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpcastableEventMetadata(Map<String, Value>);

impl UpcastableEventMetadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        rename_in(&mut self.0, from, to.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn into_metadata(self) -> EventMetadata {
        EventMetadata::from(self.0)
    }
}

fn rename_in(map: &mut Map<String, Value>, from: &str, to: String) -> bool {
    match map.remove(from) {
        Some(value) => {
            map.insert(to, value);
            true
        }
        None => false,
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// A recorded event opened up for editing.
///
/// Position fields are fixed: every output of an upcast keeps the stream,
/// version, sequence number and timestamp of the record it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcastableEventDescriptor {
    id: EventId,
    type_name: String,
    payload: UpcastableEventPayload,
    metadata: UpcastableEventMetadata,
    stream_id: StreamId,
    version: StreamVersion,
    sequence_number: SequenceNumber,
    recorded_at: DateTime<Utc>,
}

impl UpcastableEventDescriptor {
    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set_type_name(&mut self, type_name: impl Into<String>) {
        self.type_name = type_name.into();
    }

    pub fn payload(&self) -> &UpcastableEventPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut UpcastableEventPayload {
        &mut self.payload
    }

    pub fn metadata(&self) -> &UpcastableEventMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut UpcastableEventMetadata {
        &mut self.metadata
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn version(&self) -> StreamVersion {
        self.version
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// The `index`-th event split out of this one.
    ///
    /// It gets the id `<id>-<index>`, the given type and payload, a copy of
    /// the metadata and this record's position.
    pub fn split(&self, index: usize, type_name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: self.id.derived(index),
            type_name: type_name.into(),
            payload: UpcastableEventPayload::new(payload),
            metadata: self.metadata.clone(),
            stream_id: self.stream_id.clone(),
            version: self.version,
            sequence_number: self.sequence_number,
            recorded_at: self.recorded_at,
        }
    }

    pub fn into_recorded(self) -> RecordedEventDescriptor {
        let descriptor = EventDescriptor {
            id: self.id,
            type_name: self.type_name,
            payload: self.payload.into_payload(),
            metadata: self.metadata.into_metadata(),
        };
        RecordedEventDescriptor::new(
            descriptor,
            self.stream_id,
            self.version,
            self.sequence_number,
            self.recorded_at,
        )
    }
}

impl From<RecordedEventDescriptor> for UpcastableEventDescriptor {
    fn from(recorded: RecordedEventDescriptor) -> Self {
        let stream_id = recorded.stream_id().clone();
        let version = recorded.version();
        let sequence_number = recorded.sequence_number();
        let recorded_at = recorded.recorded_at();
        let EventDescriptor {
            id,
            type_name,
            payload,
            metadata,
        } = recorded.to_descriptor();

        Self {
            id,
            type_name,
            payload: UpcastableEventPayload::new(payload.into_value()),
            metadata: UpcastableEventMetadata(metadata.into_map()),
            stream_id,
            version,
            sequence_number,
            recorded_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upcastable(payload: Value) -> UpcastableEventDescriptor {
        RecordedEventDescriptor::new(
            EventDescriptor::new("evt-1", "user_registered", payload)
                .with_metadata(EventMetadata::new().with_correlation_id("c-1")),
            StreamId::new("user-1"),
            StreamVersion::new(3),
            SequenceNumber::new(10),
            Utc::now(),
        )
        .into()
    }

    #[test]
    fn test_payload_edits() {
        let mut descriptor = upcastable(json!({ "name": "Jane", "age": 30 }));
        let payload = descriptor.payload_mut();

        assert!(payload.rename("name", "fullName"));
        assert!(!payload.rename("missing", "other"));
        assert_eq!(payload.remove("age"), Some(json!(30)));
        payload.add("active", true);

        assert_eq!(payload.as_value(), &json!({ "fullName": "Jane", "active": true }));
        assert_eq!(payload.get_str("fullName"), Some("Jane"));
    }

    #[test]
    fn test_add_to_null_payload() {
        let mut payload = UpcastableEventPayload::new(Value::Null);
        payload.add("a", 1);
        assert_eq!(payload.as_value(), &json!({ "a": 1 }));
    }

    #[test]
    fn test_metadata_edits() {
        let mut descriptor = upcastable(json!({}));
        let metadata = descriptor.metadata_mut();
        assert!(metadata.rename("correlation_id", "trace_id"));
        assert_eq!(metadata.get_str("trace_id"), Some("c-1"));
        assert!(metadata.get("correlation_id").is_none());
    }

    #[test]
    fn test_split_keeps_position_and_derives_id() {
        let descriptor = upcastable(json!({ "fullName": "Jane Doe" }));
        let part = descriptor.split(1, "last_name_changed", json!({ "lastName": "Doe" }));

        assert_eq!(part.id().as_str(), "evt-1-1");
        assert_eq!(part.version(), StreamVersion::new(3));
        assert_eq!(part.sequence_number(), SequenceNumber::new(10));
        assert_eq!(part.metadata().get_str("correlation_id"), Some("c-1"));

        let recorded = part.into_recorded();
        assert_eq!(recorded.type_name(), "last_name_changed");
        assert_eq!(recorded.stream_id().as_str(), "user-1");
    }
}
