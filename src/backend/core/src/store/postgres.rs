//! PostgreSQL backend.
//!
//! Events live in the `events` table and per-stream high-water marks in
//! `streams`. Every append runs in one transaction that takes a
//! transaction-scoped advisory lock first, so sequence numbers commit in
//! order and a global reader never sees a later number before an earlier one.
//! Truncation, deletion and clearing take the same lock before anything else.
//!
//! An insert trigger publishes a notification on [`NOTIFICATION_CHANNEL`]. A
//! background listener, started with the first subscription, re-reads every
//! row past the last one it dispatched and fans the records out to
//! subscribers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::subscription::{self, backlog_start, spawn_pump, SubscriberRegistry, Subscription};
use super::{check_expected_version, check_unique_within_batch, ensure_removable, ensure_writable, EventStore};
use crate::db::Database;
use crate::error::{ErrorContext, EventStoreError, Result};
use crate::events::{
    technical_descriptor, AppendOptions, DomainEvent, Direction, EventDescriptor, EventId, EventMetadata,
    EventPayload, Position, ReadOptions, RecordedEventDescriptor, SequenceNumber, Stream, StreamDeletedEvent,
    StreamId, StreamSlice, StreamTruncatedEvent, StreamVersion, SubscribeOptions, TypeFilter,
};

const BACKEND: &str = "postgres";

/// Channel the insert trigger publishes on.
pub const NOTIFICATION_CHANNEL: &str = "eventlog_events";

/// Advisory lock key serializing appends ("evtlog" in ASCII).
const APPEND_LOCK_KEY: i64 = 0x6576_746c_6f67;

const UNIQUE_VIOLATION: &str = "23505";
const EVENT_ID_CONSTRAINTS: [&str; 2] = ["events_id_idx", "events_id_stream_id_idx"];

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

const EVENT_COLUMNS: &str =
    "sequence_number, id, stream_id, stream_version, type, metadata, data, recorded_at";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence_number: i64,
    id: String,
    stream_id: String,
    stream_version: i64,
    #[sqlx(rename = "type")]
    type_name: String,
    metadata: serde_json::Value,
    data: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RecordedEventDescriptor {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        let metadata: EventMetadata = serde_json::from_value(row.metadata)?;
        let descriptor = EventDescriptor {
            id: EventId::new(row.id),
            type_name: row.type_name,
            payload: EventPayload::new(row.data),
            metadata,
        };
        Ok(RecordedEventDescriptor::new(
            descriptor,
            StreamId::new(row.stream_id),
            StreamVersion::new(row.stream_version),
            SequenceNumber::new(row.sequence_number),
            row.recorded_at,
        ))
    }
}

fn into_records(rows: Vec<EventRow>) -> Result<Vec<RecordedEventDescriptor>> {
    rows.into_iter().map(RecordedEventDescriptor::try_from).collect()
}

/// Map a unique violation on insert to a duplicate-id error.
fn map_insert_error(error: sqlx::Error, event_id: &EventId) -> EventStoreError {
    match &error {
        sqlx::Error::Database(db)
            if db.code().as_deref() == Some(UNIQUE_VIOLATION)
                && db.constraint().is_some_and(|c| EVENT_ID_CONSTRAINTS.contains(&c)) =>
        {
            EventStoreError::DuplicateEventId {
                event_id: event_id.clone(),
            }
        }
        _ => EventStoreError::Database(error),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Event store backed by PostgreSQL.
pub struct PostgresEventStore {
    pool: PgPool,
    subscribers: Arc<SubscriberRegistry>,
    listener: OnceCell<()>,
    /// Highest sequence number the listener has dispatched.
    last_dispatched: Arc<AtomicI64>,
    shutdown: CancellationToken,
}

impl PostgresEventStore {
    /// Create a store over an existing pool. The schema must already exist.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            subscribers: Arc::new(SubscriberRegistry::new()),
            listener: OnceCell::new(),
            last_dispatched: Arc::new(AtomicI64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a store over a [`Database`], applying migrations first.
    pub async fn with_migrations(database: &Database) -> Result<Self> {
        database.migrate().await?;
        Ok(Self::new(database.pool().clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Take the append lock for the rest of `tx`.
    ///
    /// Every writer takes it before touching `streams` or `events`, so row
    /// locks are always acquired in the same order.
    async fn lock_appends(tx: &mut Transaction<'static, Postgres>) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Insert a batch inside `tx` after checking the expected version.
    async fn insert_batch(
        tx: &mut Transaction<'static, Postgres>,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        expected: Option<StreamVersion>,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        check_unique_within_batch(&events)?;
        Self::lock_appends(tx).await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM streams WHERE id = $1 FOR UPDATE")
            .bind(stream_id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        let current = current.map(StreamVersion::new).unwrap_or(StreamVersion::INITIAL);

        if let Err(err) = check_expected_version(stream_id, expected, current) {
            counter!("eventlog_append_conflicts_total", "backend" => BACKEND).increment(1);
            return Err(err);
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut version = current;
        let mut recorded = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let metadata = serde_json::to_value(&event.metadata)?;
            let (sequence_number, recorded_at): (i64, DateTime<Utc>) = sqlx::query_as(
                r#"
                INSERT INTO events (id, stream_id, stream_version, type, metadata, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING sequence_number, recorded_at
                "#,
            )
            .bind(event.id.as_str())
            .bind(stream_id.as_str())
            .bind(version.value())
            .bind(&event.type_name)
            .bind(&metadata)
            .bind(event.payload.as_value())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_insert_error(e, &event.id))?;

            recorded.push(RecordedEventDescriptor::new(
                event,
                stream_id.clone(),
                version,
                SequenceNumber::new(sequence_number),
                recorded_at,
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO streams (id, version) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version
            "#,
        )
        .bind(stream_id.as_str())
        .bind(version.value())
        .execute(&mut **tx)
        .await?;

        Ok(recorded)
    }

    async fn insert_marker<E: DomainEvent>(tx: &mut Transaction<'static, Postgres>, marker: &E) -> Result<()> {
        let descriptor = technical_descriptor(marker)?;
        Self::insert_batch(tx, &StreamId::internal(), vec![descriptor], None).await?;
        Ok(())
    }

    async fn stream_row_exists(&self, stream_id: &StreamId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM streams WHERE id = $1)")
            .bind(stream_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn select(&self, stream_id: &StreamId, options: &ReadOptions) -> Result<Vec<RecordedEventDescriptor>> {
        let position_column = if stream_id.is_global() {
            "sequence_number"
        } else {
            "stream_version"
        };

        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query.push(EVENT_COLUMNS).push(" FROM events WHERE TRUE");

        if !stream_id.is_global() {
            query.push(" AND stream_id = ").push_bind(stream_id.as_str().to_string());
        }

        let (comparison, order) = match options.direction {
            Direction::Forward => (" > ", " ASC"),
            Direction::Backward => (" < ", " DESC"),
        };
        query
            .push(" AND ")
            .push(position_column)
            .push(comparison)
            .push_bind(options.position.value());

        match &options.type_filter {
            Some(TypeFilter::Select(types)) => {
                query.push(" AND type = ANY(").push_bind(types.clone()).push(")");
            }
            Some(TypeFilter::Exclude(types)) => {
                query.push(" AND type <> ALL(").push_bind(types.clone()).push(")");
            }
            None => {}
        }

        query.push(" ORDER BY ").push(position_column).push(order);
        if let Some(limit) = options.max_count {
            query.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<EventRow> = query.build_query_as().fetch_all(&self.pool).await?;
        into_records(rows)
    }

    /// Start the notification listener once.
    async fn ensure_listener(&self) -> Result<()> {
        self.listener
            .get_or_try_init(|| async {
                let mut listener = PgListener::connect_with(&self.pool).await?;
                listener.listen(NOTIFICATION_CHANNEL).await?;

                let high_water: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence_number), 0) FROM events")
                    .fetch_one(&self.pool)
                    .await?;
                self.last_dispatched.store(high_water, Ordering::SeqCst);

                tokio::spawn(run_listener(
                    listener,
                    self.pool.clone(),
                    self.subscribers.clone(),
                    self.last_dispatched.clone(),
                    self.shutdown.clone(),
                ));

                info!(channel = NOTIFICATION_CHANNEL, "Notification listener started");
                Ok::<(), EventStoreError>(())
            })
            .await?;
        Ok(())
    }
}

impl Drop for PostgresEventStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Turn notifications into dispatched records until shutdown.
async fn run_listener(
    mut listener: PgListener,
    pool: PgPool,
    subscribers: Arc<SubscriberRegistry>,
    last_dispatched: Arc<AtomicI64>,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            notification = listener.recv() => notification,
        };

        if let Err(err) = notification {
            // The listener reconnects on the next recv; rows missed meanwhile
            // are picked up by the next re-read.
            warn!(error = %err, "Notification listener error");
            subscribers.fail_all(&err.to_string());
            continue;
        }

        let after = last_dispatched.load(Ordering::SeqCst);
        let rows: std::result::Result<Vec<EventRow>, sqlx::Error> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE sequence_number > $1 ORDER BY sequence_number ASC"
        ))
        .bind(after)
        .fetch_all(&pool)
        .await;

        match rows.map_err(EventStoreError::from).and_then(into_records) {
            Ok(records) => {
                let Some(last) = records.last() else {
                    continue;
                };
                // A clear in the meantime restarted numbering; these rows are gone.
                if last_dispatched
                    .compare_exchange(after, last.sequence_number().value(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }
                subscribers.dispatch(&records);
            }
            Err(err) => {
                warn!(error = %err, "Failed to read notified events");
                subscribers.fail_all(&err.to_string());
            }
        }
    }

    debug!("Notification listener stopped");
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, events, options), fields(backend = BACKEND, stream_id = %stream_id, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        options: AppendOptions,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        ensure_writable(stream_id, "append to")?;

        let mut tx = self.pool.begin().await.context("append_to_stream", stream_id)?;
        let recorded = Self::insert_batch(&mut tx, stream_id, events, options.expected_version)
            .await
            .context("append_to_stream", stream_id)?;
        if recorded.is_empty() {
            tx.rollback().await.context("append_to_stream", stream_id)?;
            return Ok(recorded);
        }
        tx.commit().await.context("append_to_stream", stream_id)?;

        counter!("eventlog_events_appended_total", "backend" => BACKEND).increment(recorded.len() as u64);
        debug!(appended = recorded.len(), "Events appended");
        Ok(recorded)
    }

    #[instrument(skip(self, options), fields(backend = BACKEND, stream_id = %stream_id))]
    async fn read_from_stream(&self, stream_id: &StreamId, options: ReadOptions) -> Result<StreamSlice> {
        if !stream_id.is_global() && !self.stream_row_exists(stream_id).await.context("read_from_stream", stream_id)? {
            return Err(EventStoreError::stream_not_found(stream_id));
        }

        let records = self.select(stream_id, &options).await.context("read_from_stream", stream_id)?;
        Ok(StreamSlice::new(stream_id.clone(), records))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn truncate_stream(&self, stream_id: &StreamId, before: Position) -> Result<()> {
        ensure_removable(stream_id, "truncate")?;

        let mut tx = self.pool.begin().await.context("truncate_stream", stream_id)?;
        Self::lock_appends(&mut tx).await.context("truncate_stream", stream_id)?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM streams WHERE id = $1)")
            .bind(stream_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context("truncate_stream", stream_id)?;
        if !exists {
            return Err(EventStoreError::stream_not_found(stream_id));
        }

        let removed = sqlx::query("DELETE FROM events WHERE stream_id = $1 AND stream_version < $2")
            .bind(stream_id.as_str())
            .bind(before.value())
            .execute(&mut *tx)
            .await
            .context("truncate_stream", stream_id)?
            .rows_affected();

        let marker = StreamTruncatedEvent {
            stream_id: stream_id.clone(),
            before_position: before,
        };
        Self::insert_marker(&mut tx, &marker).await.context("truncate_stream", stream_id)?;
        tx.commit().await.context("truncate_stream", stream_id)?;

        debug!(removed, "Stream truncated");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        ensure_removable(stream_id, "delete")?;

        let mut tx = self.pool.begin().await.context("delete_stream", stream_id)?;
        Self::lock_appends(&mut tx).await.context("delete_stream", stream_id)?;
        let deleted = sqlx::query("DELETE FROM streams WHERE id = $1")
            .bind(stream_id.as_str())
            .execute(&mut *tx)
            .await
            .context("delete_stream", stream_id)?
            .rows_affected();
        if deleted == 0 {
            return Ok(());
        }

        let removed = sqlx::query("DELETE FROM events WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .execute(&mut *tx)
            .await
            .context("delete_stream", stream_id)?
            .rows_affected();

        let marker = StreamDeletedEvent {
            stream_id: stream_id.clone(),
        };
        Self::insert_marker(&mut tx, &marker).await.context("delete_stream", stream_id)?;
        tx.commit().await.context("delete_stream", stream_id)?;

        debug!(removed, "Stream deleted");
        Ok(())
    }

    #[instrument(skip(self, options), fields(backend = BACKEND))]
    async fn subscribe_to_stream(&self, stream_id: &StreamId, options: SubscribeOptions) -> Result<Subscription> {
        self.ensure_listener().await.context("subscribe_to_stream", stream_id)?;

        // Register before reading the backlog; the pump drops the overlap.
        let (registration, live) = self.subscribers.register(stream_id);
        let backlog = match backlog_start(&options) {
            Some(from) => match self
                .read_from_stream(stream_id, ReadOptions::forward().from_position(from))
                .await
            {
                Ok(slice) => slice.into_descriptors(),
                Err(err) if err.is_stream_not_found() => Vec::new(),
                Err(err) => {
                    self.subscribers.unregister(registration);
                    return Err(err);
                }
            },
            None => Vec::new(),
        };

        let (subscription, sink) = subscription::channel(stream_id.clone(), options);
        spawn_pump(sink, backlog, live, self.subscribers.clone(), registration);
        Ok(subscription)
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        if stream_id.is_global() {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events)")
                .fetch_one(&self.pool)
                .await
                .context("stream_exists", stream_id)?;
            return Ok(exists);
        }
        self.stream_row_exists(stream_id).await.context("stream_exists", stream_id)
    }

    async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream> {
        let bounds: (Option<i64>, Option<i64>) = if stream_id.is_global() {
            sqlx::query_as::<_, (Option<i64>, Option<i64>)>("SELECT MIN(sequence_number), MAX(sequence_number) FROM events")
                .fetch_one(&self.pool)
                .await
        } else {
            sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
                "SELECT MIN(stream_version), MAX(stream_version) FROM events WHERE stream_id = $1",
            )
                .bind(stream_id.as_str())
                .fetch_one(&self.pool)
                .await
        }
        .context("get_stream", stream_id)?;

        match bounds {
            (Some(min), Some(max)) => Ok(Stream {
                id: stream_id.clone(),
                version: StreamVersion::new(max),
                initial_version: StreamVersion::new(min),
            }),
            _ => Err(EventStoreError::stream_not_found(stream_id)),
        }
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn clear(&self) -> Result<()> {
        let global = StreamId::global();
        let mut tx = self.pool.begin().await.context("clear", &global)?;
        Self::lock_appends(&mut tx).await.context("clear", &global)?;
        sqlx::query("TRUNCATE events, streams RESTART IDENTITY")
            .execute(&mut *tx)
            .await
            .context("clear", &global)?;
        tx.commit().await.context("clear", &global)?;

        self.last_dispatched.store(0, Ordering::SeqCst);
        self.subscribers.reset_all();
        debug!("Store cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
