//! In-memory reference backend.
//!
//! All state sits behind one `parking_lot::RwLock`. Appends hold the write
//! lock across "read version, compare, append, update index, dispatch", which
//! makes each batch atomic and keeps fan-out in sequence order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, instrument};

use super::subscription::{self, backlog_start, spawn_pump, SubscriberRegistry, Subscription};
use super::{
    check_expected_version, check_unique_within_batch, ensure_removable, ensure_writable, select_records, EventStore,
};
use crate::error::{EventStoreError, Result};
use crate::events::{
    technical_descriptor, AppendOptions, EventDescriptor, EventId, Position, ReadOptions,
    RecordedEventDescriptor, SequenceNumber, Stream, StreamDeletedEvent, StreamId, StreamSlice,
    StreamTruncatedEvent, StreamVersion, SubscribeOptions,
};

const BACKEND: &str = "memory";

struct MemoryState {
    /// Every record, in sequence order.
    records: Vec<RecordedEventDescriptor>,
    versions: HashMap<StreamId, StreamVersion>,
    event_ids: HashSet<EventId>,
    next_sequence: SequenceNumber,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            versions: HashMap::new(),
            event_ids: HashSet::new(),
            next_sequence: SequenceNumber::FIRST,
        }
    }
}

impl MemoryState {
    fn version_of(&self, stream_id: &StreamId) -> StreamVersion {
        self.versions.get(stream_id).copied().unwrap_or(StreamVersion::INITIAL)
    }

    fn append(
        &mut self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        expected: Option<StreamVersion>,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        check_unique_within_batch(&events)?;

        let current = self.version_of(stream_id);
        if let Err(err) = check_expected_version(stream_id, expected, current) {
            counter!("eventlog_append_conflicts_total", "backend" => BACKEND).increment(1);
            return Err(err);
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(duplicate) = events.iter().find(|e| self.event_ids.contains(&e.id)) {
            return Err(EventStoreError::DuplicateEventId {
                event_id: duplicate.id.clone(),
            });
        }

        let recorded_at = Utc::now();
        let mut version = current;
        let mut recorded = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let record = RecordedEventDescriptor::new(
                event,
                stream_id.clone(),
                version,
                self.next_sequence,
                recorded_at,
            );
            self.next_sequence = self.next_sequence.next();
            recorded.push(record);
        }

        for record in &recorded {
            self.event_ids.insert(record.id().clone());
        }
        self.records.extend(recorded.iter().cloned());
        self.versions.insert(stream_id.clone(), version);

        counter!("eventlog_events_appended_total", "backend" => BACKEND).increment(recorded.len() as u64);
        Ok(recorded)
    }

    fn remove_where<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&RecordedEventDescriptor) -> bool,
    {
        let before = self.records.len();
        let event_ids = &mut self.event_ids;
        self.records.retain(|record| {
            if predicate(record) {
                event_ids.remove(record.id());
                false
            } else {
                true
            }
        });
        before - self.records.len()
    }
}

/// In-memory event store.
///
/// Used by tests and as the executable reference for the other backends.
pub struct InMemoryEventStore {
    state: RwLock<MemoryState>,
    subscribers: Arc<SubscriberRegistry>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            subscribers: Arc::new(SubscriberRegistry::new()),
        }
    }

    /// Number of records currently held, across all streams.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_marker<E: crate::events::DomainEvent>(&self, state: &mut MemoryState, marker: &E) -> Result<()> {
        let descriptor = technical_descriptor(marker)?;
        let recorded = state.append(&StreamId::internal(), vec![descriptor], None)?;
        self.subscribers.dispatch(&recorded);
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events, options), fields(backend = BACKEND, stream_id = %stream_id, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        options: AppendOptions,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        ensure_writable(stream_id, "append to")?;

        let mut state = self.state.write();
        let recorded = state.append(stream_id, events, options.expected_version)?;
        self.subscribers.dispatch(&recorded);

        debug!(appended = recorded.len(), "Events appended");
        Ok(recorded)
    }

    #[instrument(skip(self, options), fields(backend = BACKEND, stream_id = %stream_id))]
    async fn read_from_stream(&self, stream_id: &StreamId, options: ReadOptions) -> Result<StreamSlice> {
        let state = self.state.read();

        let records = if stream_id.is_global() {
            select_records(stream_id, state.records.iter(), &options)
        } else {
            if !state.versions.contains_key(stream_id) {
                return Err(EventStoreError::stream_not_found(stream_id));
            }
            let in_stream = state.records.iter().filter(|r| r.stream_id() == stream_id);
            select_records(stream_id, in_stream, &options)
        };

        Ok(StreamSlice::new(stream_id.clone(), records))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn truncate_stream(&self, stream_id: &StreamId, before: Position) -> Result<()> {
        ensure_removable(stream_id, "truncate")?;

        let mut state = self.state.write();
        if !state.versions.contains_key(stream_id) {
            return Err(EventStoreError::stream_not_found(stream_id));
        }

        let removed = state.remove_where(|r| r.stream_id() == stream_id && r.version().value() < before.value());
        self.append_marker(
            &mut state,
            &StreamTruncatedEvent {
                stream_id: stream_id.clone(),
                before_position: before,
            },
        )?;

        debug!(removed, "Stream truncated");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        ensure_removable(stream_id, "delete")?;

        let mut state = self.state.write();
        if state.versions.remove(stream_id).is_none() {
            return Ok(());
        }

        let removed = state.remove_where(|r| r.stream_id() == stream_id);
        self.append_marker(
            &mut state,
            &StreamDeletedEvent {
                stream_id: stream_id.clone(),
            },
        )?;

        debug!(removed, "Stream deleted");
        Ok(())
    }

    #[instrument(skip(self, options), fields(backend = BACKEND))]
    async fn subscribe_to_stream(&self, stream_id: &StreamId, options: SubscribeOptions) -> Result<Subscription> {
        // Registration and the backlog snapshot share the read lock, so no
        // append can fall between them.
        let (registration, live, backlog) = {
            let state = self.state.read();
            let (registration, live) = self.subscribers.register(stream_id);
            let backlog = match backlog_start(&options) {
                Some(from) => select_records(
                    stream_id,
                    state
                        .records
                        .iter()
                        .filter(|r| stream_id.is_global() || r.stream_id() == stream_id),
                    &ReadOptions::forward().from_position(from),
                ),
                None => Vec::new(),
            };
            (registration, live, backlog)
        };

        let (subscription, sink) = subscription::channel(stream_id.clone(), options);
        spawn_pump(sink, backlog, live, self.subscribers.clone(), registration);
        Ok(subscription)
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        let state = self.state.read();
        Ok(if stream_id.is_global() {
            !state.records.is_empty()
        } else {
            state.versions.contains_key(stream_id)
        })
    }

    async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream> {
        let state = self.state.read();

        if stream_id.is_global() {
            return match (state.records.first(), state.records.last()) {
                (Some(first), Some(last)) => Ok(Stream {
                    id: stream_id.clone(),
                    version: StreamVersion::new(last.sequence_number().value()),
                    initial_version: StreamVersion::new(first.sequence_number().value()),
                }),
                _ => Err(EventStoreError::stream_not_found(stream_id)),
            };
        }

        let mut versions = state
            .records
            .iter()
            .filter(|r| r.stream_id() == stream_id)
            .map(|r| r.version());
        let initial_version = versions.next().ok_or_else(|| EventStoreError::stream_not_found(stream_id))?;

        Ok(Stream {
            id: stream_id.clone(),
            version: state.version_of(stream_id),
            initial_version,
        })
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        *state = MemoryState::default();
        self.subscribers.reset_all();
        debug!("Store cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
