//! Identifiers and positions: the addressing scheme of the log.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the virtual stream containing every event in sequence order.
pub const GLOBAL_STREAM_ID: &str = "$all";

/// Technical stream receiving the markers written by truncation and deletion.
pub const INTERNAL_STREAM_ID: &str = "$eventstore";

// =============================================================================
// Stream IDs
// =============================================================================

/// Opaque name of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The global stream, `$all`.
    pub fn global() -> Self {
        Self(GLOBAL_STREAM_ID.to_string())
    }

    /// The technical stream, `$eventstore`.
    pub fn internal() -> Self {
        Self(INTERNAL_STREAM_ID.to_string())
    }

    /// Whether this names the global stream.
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_STREAM_ID
    }

    /// Whether this names the technical stream.
    pub fn is_internal(&self) -> bool {
        self.0 == INTERNAL_STREAM_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Event IDs
// =============================================================================

/// Caller-supplied identifier of an event, unique across the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier of the `index`-th event derived from this one.
    pub fn derived(&self, index: usize) -> Self {
        Self(format!("{}-{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Versions and Sequence Numbers
// =============================================================================

/// Version of a stream: the version of its last event.
///
/// Versions are dense and start at 0; [`StreamVersion::INITIAL`] means the
/// stream has no events yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamVersion(i64);

impl StreamVersion {
    /// The version of a stream that does not exist yet.
    pub const INITIAL: StreamVersion = StreamVersion(-1);

    pub const fn new(version: i64) -> Self {
        Self(version)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    /// The version following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn is_initial(self) -> bool {
        self.0 == Self::INITIAL.0
    }
}

impl Default for StreamVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl std::fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-wide counter assigned at append time; defines the global order.
///
/// Sequence numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(1);

    pub const fn new(sequence: i64) -> Self {
        Self(sequence)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Positions
// =============================================================================

/// A cursor into a stream.
///
/// On a regular stream a position is a stream version; on the global stream
/// it is a sequence number. Reads exclude the event at the position itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(i64);

impl Position {
    /// Before the first event.
    pub const START: Position = Position(-1);

    /// After the last event.
    pub const END: Position = Position(i64::MAX);

    pub const fn new(position: i64) -> Self {
        Self(position)
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn is_start(self) -> bool {
        self.0 == Self::START.0
    }

    pub const fn is_end(self) -> bool {
        self.0 == Self::END.0
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::START
    }
}

impl From<StreamVersion> for Position {
    fn from(version: StreamVersion) -> Self {
        Self(version.value())
    }
}

impl From<SequenceNumber> for Position {
    fn from(sequence: SequenceNumber) -> Self {
        Self(sequence.value())
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_start() {
            write!(f, "start")
        } else if self.is_end() {
            write!(f, "end")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_stream_id() {
        assert!(StreamId::global().is_global());
        assert!(!StreamId::new("orders-1").is_global());
        assert_eq!(StreamId::global().as_str(), "$all");
    }

    #[test]
    fn test_generated_event_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn test_derived_event_id() {
        let id = EventId::new("evt-7");
        assert_eq!(id.derived(0).as_str(), "evt-7-0");
        assert_eq!(id.derived(1).as_str(), "evt-7-1");
    }

    #[test]
    fn test_stream_version_progression() {
        let v = StreamVersion::INITIAL;
        assert!(v.is_initial());
        assert_eq!(v.next(), StreamVersion::new(0));
        assert_eq!(StreamVersion::default(), StreamVersion::INITIAL);
    }

    #[test]
    fn test_position_sentinels() {
        assert!(Position::START < Position::new(0));
        assert!(Position::new(i64::MAX - 1) < Position::END);
        assert_eq!(Position::START.to_string(), "start");
        assert_eq!(Position::END.to_string(), "end");
        assert_eq!(Position::from(StreamVersion::new(3)).to_string(), "3");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&StreamId::new("s1")).unwrap();
        assert_eq!(json, "\"s1\"");
        let json = serde_json::to_string(&StreamVersion::new(4)).unwrap();
        assert_eq!(json, "4");
    }
}
