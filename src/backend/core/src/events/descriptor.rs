//! Event descriptors: what writers hand to a store and what readers get back.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::{EventId, Position, SequenceNumber, StreamId, StreamVersion};
use super::registry::DomainEvent;

// =============================================================================
// Payload and Metadata
// =============================================================================

/// Opaque structured payload of an event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(Value);

impl EventPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Serialize a value into a payload.
    pub fn from_serializable<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Deserialize the payload into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.0)
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// String-keyed metadata attached to an event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(Map<String, Value>);

impl EventMetadata {
    const CORRELATION_ID: &'static str = "correlation_id";
    const CAUSATION_ID: &'static str = "causation_id";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with(Self::CORRELATION_ID, id.into())
    }

    /// Set the causation ID (the event that caused this one).
    pub fn with_causation_id(self, id: &EventId) -> Self {
        self.with(Self::CAUSATION_ID, id.as_str())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.0.get(Self::CORRELATION_ID).and_then(Value::as_str)
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.0.get(Self::CAUSATION_ID).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EventMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub id: EventId,
    pub type_name: String,
    pub payload: EventPayload,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl EventDescriptor {
    pub fn new(id: impl Into<EventId>, type_name: impl Into<String>, payload: impl Into<EventPayload>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            payload: payload.into(),
            metadata: EventMetadata::default(),
        }
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An event as persisted by a store.
///
/// Produced exactly once, by a successful append, and never modified after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEventDescriptor {
    id: EventId,
    type_name: String,
    payload: EventPayload,
    metadata: EventMetadata,
    stream_id: StreamId,
    version: StreamVersion,
    sequence_number: SequenceNumber,
    recorded_at: DateTime<Utc>,
}

impl RecordedEventDescriptor {
    pub fn new(
        descriptor: EventDescriptor,
        stream_id: StreamId,
        version: StreamVersion,
        sequence_number: SequenceNumber,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: descriptor.id,
            type_name: descriptor.type_name,
            payload: descriptor.payload,
            metadata: descriptor.metadata,
            stream_id,
            version,
            sequence_number,
            recorded_at,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
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

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Position of this record when read through `stream_id`: the sequence
    /// number on the global stream, the version otherwise.
    pub fn position_in(&self, stream_id: &StreamId) -> Position {
        if stream_id.is_global() {
            self.sequence_number.into()
        } else {
            self.version.into()
        }
    }

    /// The unrecorded descriptor this record was produced from.
    pub fn to_descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            id: self.id.clone(),
            type_name: self.type_name.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

// =============================================================================
// Stream Slices and Summaries
// =============================================================================

/// An ordered run of records read from one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSlice {
    stream_id: StreamId,
    descriptors: Vec<RecordedEventDescriptor>,
}

impl StreamSlice {
    pub fn new(stream_id: StreamId, descriptors: Vec<RecordedEventDescriptor>) -> Self {
        Self {
            stream_id,
            descriptors,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn descriptors(&self) -> &[RecordedEventDescriptor] {
        &self.descriptors
    }

    pub fn into_descriptors(self) -> Vec<RecordedEventDescriptor> {
        self.descriptors
    }

    pub fn first(&self) -> Option<&RecordedEventDescriptor> {
        self.descriptors.first()
    }

    pub fn last(&self) -> Option<&RecordedEventDescriptor> {
        self.descriptors.last()
    }

    /// Records matching a predicate, order preserved.
    pub fn select<F>(&self, predicate: F) -> StreamSlice
    where
        F: Fn(&RecordedEventDescriptor) -> bool,
    {
        Self {
            stream_id: self.stream_id.clone(),
            descriptors: self.descriptors.iter().filter(|d| predicate(d)).cloned().collect(),
        }
    }

    /// The same records in reverse order.
    pub fn reversed(&self) -> StreamSlice {
        Self {
            stream_id: self.stream_id.clone(),
            descriptors: self.descriptors.iter().rev().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RecordedEventDescriptor> {
        self.descriptors.iter()
    }
}

impl IntoIterator for StreamSlice {
    type Item = RecordedEventDescriptor;
    type IntoIter = std::vec::IntoIter<RecordedEventDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

impl<'a> IntoIterator for &'a StreamSlice {
    type Item = &'a RecordedEventDescriptor;
    type IntoIter = std::slice::Iter<'a, RecordedEventDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

/// High-water mark of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    /// Version of the last event.
    pub version: StreamVersion,
    /// Version of the first event still recorded.
    pub initial_version: StreamVersion,
}

// =============================================================================
// Technical Events
// =============================================================================

/// Marker recorded when the head of a stream is truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTruncatedEvent {
    pub stream_id: StreamId,
    pub before_position: Position,
}

impl DomainEvent for StreamTruncatedEvent {
    const TYPE_NAME: &'static str = "es.stream.truncated";
}

/// Marker recorded when a stream is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDeletedEvent {
    pub stream_id: StreamId,
}

impl DomainEvent for StreamDeletedEvent {
    const TYPE_NAME: &'static str = "es.stream.deleted";
}

/// Build the descriptor for a technical marker event with a fresh id.
pub(crate) fn technical_descriptor<E: DomainEvent>(event: &E) -> serde_json::Result<EventDescriptor> {
    Ok(EventDescriptor::new(
        EventId::generate(),
        E::TYPE_NAME,
        EventPayload::from_serializable(event)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorded(stream: &str, version: i64, sequence: i64) -> RecordedEventDescriptor {
        RecordedEventDescriptor::new(
            EventDescriptor::new(format!("evt-{sequence}"), "item_added", json!({ "n": version })),
            StreamId::new(stream),
            StreamVersion::new(version),
            SequenceNumber::new(sequence),
            Utc::now(),
        )
    }

    #[test]
    fn test_metadata_builders() {
        let cause = EventId::new("evt-1");
        let metadata = EventMetadata::new()
            .with_correlation_id("corr-123")
            .with_causation_id(&cause)
            .with("tenant", "acme");

        assert_eq!(metadata.correlation_id(), Some("corr-123"));
        assert_eq!(metadata.causation_id(), Some("evt-1"));
        assert_eq!(metadata.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn test_payload_deserialize() {
        #[derive(Deserialize)]
        struct ItemAdded {
            n: i64,
        }

        let payload = EventPayload::new(json!({ "n": 3 }));
        let item: ItemAdded = payload.deserialize().unwrap();
        assert_eq!(item.n, 3);
    }

    #[test]
    fn test_position_in_global_and_regular_streams() {
        let record = recorded("s1", 2, 9);
        assert_eq!(record.position_in(&StreamId::new("s1")), Position::new(2));
        assert_eq!(record.position_in(&StreamId::global()), Position::new(9));
    }

    #[test]
    fn test_slice_views() {
        let slice = StreamSlice::new(
            StreamId::new("s1"),
            vec![recorded("s1", 0, 1), recorded("s1", 1, 2), recorded("s1", 2, 3)],
        );

        assert_eq!(slice.len(), 3);
        assert_eq!(slice.first().unwrap().version(), StreamVersion::new(0));
        assert_eq!(slice.last().unwrap().version(), StreamVersion::new(2));

        let reversed = slice.reversed();
        assert_eq!(reversed.first().unwrap().version(), StreamVersion::new(2));
        assert_eq!(reversed.reversed(), slice);

        let odd = slice.select(|d| d.version().value() % 2 == 1);
        assert_eq!(odd.len(), 1);
        assert_eq!(odd.first().unwrap().id().as_str(), "evt-2");
    }

    #[test]
    fn test_technical_descriptor() {
        let marker = StreamTruncatedEvent {
            stream_id: StreamId::new("s1"),
            before_position: Position::new(1),
        };
        let descriptor = technical_descriptor(&marker).unwrap();
        assert_eq!(descriptor.type_name, "es.stream.truncated");
        assert_eq!(descriptor.payload.get("before_position"), Some(&json!(1)));
    }
}
