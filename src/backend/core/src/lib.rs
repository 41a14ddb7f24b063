#![allow(clippy::result_large_err)]
//! # Eventlog Core
//!
//! An append-only event log with per-stream versions and a global order.
//!
//! ## Architecture
//!
//! - **Events**: identifiers, positions, descriptors and the explicit event type registry
//! - **Store**: the `EventStore` contract with in-memory, PostgreSQL and log-server backends
//! - **Subscriptions**: push-based delivery of existing and new records
//! - **Upcasting**: read-time schema evolution over any backend
//! - **Processing**: checkpointed catch-up and live processors
//! - **Telemetry**: structured logging, Prometheus metrics and optional OTLP export

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod processing;
pub mod store;
pub mod telemetry;
pub mod upcasting;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, EventStoreError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BackendKind, Config};
    pub use crate::error::{ErrorCode, ErrorContext, EventStoreError, Result};
    pub use crate::events::{
        AppendOptions, Direction, DomainEvent, EventConverter, EventDescriptor, EventId, EventMetadata,
        EventPayload, EventTypeRegistry, Position, ReadOptions, RecordedEventDescriptor, SequenceNumber, Stream,
        StreamId, StreamSlice, StreamVersion, SubscribeOptions, TypeFilter,
    };
    pub use crate::processing::{
        Checkpoint, CheckpointStore, CommitStrategy, InMemoryCheckpointStore, PostgresCheckpointStore,
        ProcessingHandler, Processor, ProcessorConfig,
    };
    pub use crate::store::{
        EventStore, InMemoryEventStore, LogServerEventStore, PostgresEventStore, Subscription, GLOBAL_STREAM_ID,
    };
    pub use crate::upcasting::{Upcaster, UpcasterChain, UpcastingEventStore};
}
