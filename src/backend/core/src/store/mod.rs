//! Event store backends.
//!
//! Every backend implements [`EventStore`] with the same semantics:
//! - **InMemoryEventStore**: reference implementation behind a single lock
//! - **PostgresEventStore**: transactional SQL storage with trigger-based change notification
//! - **LogServerEventStore**: adapter over a remote append-only log server
//!
//! Backends are shared behind `Arc<dyn EventStore>` and called concurrently.

pub mod log_server;
pub mod memory;
pub mod postgres;
pub mod subscription;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{BackendKind, Config};
use crate::db::Database;
use crate::error::{EventStoreError, Result};
use crate::events::{
    AppendOptions, Direction, EventDescriptor, Position, ReadOptions, RecordedEventDescriptor, Stream,
    StreamId, StreamSlice, StreamVersion, SubscribeOptions,
};

pub use crate::events::{GLOBAL_STREAM_ID, INTERNAL_STREAM_ID};
pub use log_server::{HttpLogServerClient, LogServerClient, LogServerEventStore};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use subscription::{Subscription, SubscriptionSink};

// ═══════════════════════════════════════════════════════════════════════════════
// Event Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The contract every backend implements.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to a stream as one atomic unit.
    ///
    /// Versions and sequence numbers are assigned consecutively in input
    /// order. Fails with `Concurrency` when `options.expected_version` does
    /// not match and with `DuplicateEventId` when any id already exists in
    /// the store; nothing is written in either case.
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        options: AppendOptions,
    ) -> Result<Vec<RecordedEventDescriptor>>;

    /// Read a stream, or the global stream in sequence order.
    async fn read_from_stream(&self, stream_id: &StreamId, options: ReadOptions) -> Result<StreamSlice>;

    /// Remove the events of a stream whose version is below `before`.
    ///
    /// The global and technical streams cannot be truncated or deleted.
    async fn truncate_stream(&self, stream_id: &StreamId, before: Position) -> Result<()>;

    /// Remove a stream and its version. Deleting a missing stream succeeds.
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()>;

    /// Subscribe to existing and future records of a stream.
    async fn subscribe_to_stream(&self, stream_id: &StreamId, options: SubscribeOptions) -> Result<Subscription>;

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool>;

    /// Version bounds of a stream; not found when it holds no events.
    async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;

    /// Backend name, used in logs and errors.
    fn name(&self) -> &'static str;
}

/// Build the backend selected by `config`.
pub async fn connect(config: &Config) -> Result<Arc<dyn EventStore>> {
    config.validate()?;

    let store: Arc<dyn EventStore> = match (config.store.backend, &config.database, &config.log_server) {
        (BackendKind::Memory, _, _) => Arc::new(InMemoryEventStore::new()),
        (BackendKind::Postgres, Some(database), _) => {
            let database = Database::connect(database).await?;
            Arc::new(PostgresEventStore::new(database.pool().clone()))
        }
        (BackendKind::LogServer, _, Some(log_server)) => Arc::new(LogServerEventStore::connect(log_server)?),
        (backend, _, _) => {
            return Err(EventStoreError::configuration(format!(
                "missing configuration section for the {backend} backend"
            )))
        }
    };

    info!(backend = store.name(), "Event store ready");
    Ok(store)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared Validation
// ═══════════════════════════════════════════════════════════════════════════════

/// Reject writes addressed to the global stream.
pub(crate) fn ensure_writable(stream_id: &StreamId, operation: &'static str) -> Result<()> {
    if stream_id.is_global() {
        return Err(EventStoreError::GlobalStreamNotWritable { operation });
    }
    Ok(())
}

/// Reject truncation and deletion of the global and technical streams.
pub(crate) fn ensure_removable(stream_id: &StreamId, operation: &'static str) -> Result<()> {
    ensure_writable(stream_id, operation)?;
    if stream_id.is_internal() {
        return Err(EventStoreError::InternalStreamProtected {
            operation,
            stream_id: stream_id.clone(),
        });
    }
    Ok(())
}

/// Compare the caller's expected version against the stream's current one.
pub(crate) fn check_expected_version(
    stream_id: &StreamId,
    expected: Option<StreamVersion>,
    actual: StreamVersion,
) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(EventStoreError::concurrency(stream_id, expected, actual)),
        _ => Ok(()),
    }
}

/// Reject batches that reuse an id internally.
pub(crate) fn check_unique_within_batch(events: &[EventDescriptor]) -> Result<()> {
    let mut seen = HashSet::with_capacity(events.len());
    for event in events {
        if !seen.insert(&event.id) {
            return Err(EventStoreError::DuplicateEventId {
                event_id: event.id.clone(),
            });
        }
    }
    Ok(())
}

/// Apply position, type filter, direction and count to records in sequence order.
pub(crate) fn select_records<'a, I>(stream_id: &StreamId, records: I, options: &ReadOptions) -> Vec<RecordedEventDescriptor>
where
    I: DoubleEndedIterator<Item = &'a RecordedEventDescriptor>,
{
    let admitted = |record: &&RecordedEventDescriptor| {
        options.admits_position(record.position_in(stream_id)) && options.admits_type(record.type_name())
    };
    let limit = options.max_count.unwrap_or(usize::MAX);

    match options.direction {
        Direction::Forward => records.filter(admitted).take(limit).cloned().collect(),
        Direction::Backward => records.rev().filter(admitted).take(limit).cloned().collect(),
    }
}
