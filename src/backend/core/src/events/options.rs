//! Options accepted by store operations.

use serde::{Deserialize, Serialize};

use super::id::{Position, StreamVersion};

/// Options for appending to a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// When set, the append only succeeds if the stream is at this version.
    pub expected_version: Option<StreamVersion>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the stream to be at `version`.
    pub fn expected_version(mut self, version: StreamVersion) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Read direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// Filter on event type names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFilter {
    /// Only the listed types.
    Select(Vec<String>),
    /// Everything but the listed types.
    Exclude(Vec<String>),
}

impl TypeFilter {
    pub fn select<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Select(types.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exclude(types.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Self::Select(types) => types.iter().any(|t| t == type_name),
            Self::Exclude(types) => !types.iter().any(|t| t == type_name),
        }
    }
}

/// Options for reading a stream.
///
/// The record at `position` itself is never returned: forward reads yield
/// strictly greater positions, backward reads strictly lesser ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    pub position: Position,
    pub direction: Direction,
    pub max_count: Option<usize>,
    pub type_filter: Option<TypeFilter>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::forward()
    }
}

impl ReadOptions {
    /// Forward from the start of the stream.
    pub fn forward() -> Self {
        Self {
            position: Position::START,
            direction: Direction::Forward,
            max_count: None,
            type_filter: None,
        }
    }

    /// Backward from the end of the stream.
    pub fn backward() -> Self {
        Self {
            position: Position::END,
            direction: Direction::Backward,
            max_count: None,
            type_filter: None,
        }
    }

    pub fn from_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    pub fn type_filter(mut self, filter: TypeFilter) -> Self {
        self.type_filter = Some(filter);
        self
    }

    /// Whether a record at `position` lies strictly beyond the read cursor.
    pub fn admits_position(&self, position: Position) -> bool {
        match self.direction {
            Direction::Forward => position > self.position,
            Direction::Backward => position < self.position,
        }
    }

    /// Whether a record type passes the type filter, if any.
    pub fn admits_type(&self, type_name: &str) -> bool {
        self.type_filter.as_ref().map_or(true, |f| f.matches(type_name))
    }
}

/// Options for subscribing to a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Backlog starts strictly after this position. `Position::END` gives a
    /// live-only subscription.
    pub from_position: Position,
    pub type_filter: Option<TypeFilter>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(mut self, position: Position) -> Self {
        self.from_position = position;
        self
    }

    pub fn type_filter(mut self, filter: TypeFilter) -> Self {
        self.type_filter = Some(filter);
        self
    }

    pub fn admits_type(&self, type_name: &str) -> bool {
        self.type_filter.as_ref().map_or(true, |f| f.matches(type_name))
    }
}
