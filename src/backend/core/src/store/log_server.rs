//! Adapter over an external append-only log server.
//!
//! The server speaks in stream revisions (0-based, per stream) and commit
//! positions (store-wide, starting at 1). Revisions map onto stream versions
//! and commit positions onto sequence numbers. The server is reached through
//! the [`LogServerClient`] trait; [`HttpLogServerClient`] implements it over
//! HTTP with JSON bodies:
//!
//! | request | success | failure |
//! |---|---|---|
//! | `POST /streams/{id}` `{expectedRevision, events}` | `200 {records}` | `409 {error: "wrong_expected_version", actualRevision}` or `409 {error: "duplicate_event", eventId}` |
//! | `GET /streams/{id}?direction&from&limit` | `200 {records}` | `404` when the stream does not exist |
//! | `GET /all?direction&from&limit` | `200 {records}` | |
//! | `POST /streams/{id}/truncate` `{before}` | `204` | `404`, or `501` when unsupported |
//! | `DELETE /streams/{id}` | `204` | `404` when the stream does not exist, `501` when unsupported |
//!
//! `from` is exclusive; `-1` means before the first record and the maximum
//! `i64` after the last one. The server has no type filter, so filtering
//! happens here. Subscriptions poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::subscription::{self, Subscription, SubscriptionSink};
use super::{check_unique_within_batch, ensure_removable, ensure_writable, EventStore};
use crate::config::LogServerConfig;
use crate::error::{ErrorContext, EventStoreError, Result};
use crate::events::{
    technical_descriptor, AppendOptions, Direction, DomainEvent, EventDescriptor, EventId, EventMetadata,
    EventPayload, Position, ReadOptions, RecordedEventDescriptor, SequenceNumber, Stream, StreamDeletedEvent,
    StreamId, StreamSlice, StreamTruncatedEvent, StreamVersion, SubscribeOptions,
};

const BACKEND: &str = "log_server";

// ═══════════════════════════════════════════════════════════════════════════════
// Wire Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Expected state of a stream for an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "revision")]
pub enum ExpectedRevision {
    Any,
    NoStream,
    Exact(u64),
}

impl From<Option<StreamVersion>> for ExpectedRevision {
    fn from(expected: Option<StreamVersion>) -> Self {
        match expected {
            None => Self::Any,
            Some(version) if version.is_initial() => Self::NoStream,
            Some(version) => Self::Exact(version.value() as u64),
        }
    }
}

/// An event proposed for appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEvent {
    pub event_id: String,
    pub event_type: String,
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<EventDescriptor> for ProposedEvent {
    fn from(descriptor: EventDescriptor) -> Self {
        Self {
            event_id: descriptor.id.as_str().to_string(),
            event_type: descriptor.type_name,
            data: descriptor.payload.into_value(),
            metadata: descriptor.metadata.into_map(),
        }
    }
}

/// A record as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub event_id: String,
    pub event_type: String,
    pub stream: String,
    pub revision: u64,
    pub commit_position: u64,
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created: DateTime<Utc>,
}

impl From<ServerRecord> for RecordedEventDescriptor {
    fn from(record: ServerRecord) -> Self {
        let descriptor = EventDescriptor {
            id: EventId::new(record.event_id),
            type_name: record.event_type,
            payload: EventPayload::new(record.data),
            metadata: EventMetadata::from(record.metadata),
        };
        RecordedEventDescriptor::new(
            descriptor,
            StreamId::new(record.stream),
            StreamVersion::new(record.revision as i64),
            SequenceNumber::new(record.commit_position as i64),
            record.created,
        )
    }
}

/// Result of an append the server accepted or refused.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Success(Vec<ServerRecord>),
    WrongExpectedVersion { actual: Option<u64> },
    DuplicateEvent { event_id: String },
}

/// A read against a stream or the global log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadRequest {
    pub direction: Direction,
    /// Exclusive start: a revision, or a commit position for the global log.
    pub from: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ReadRequest {
    pub fn forward(from: Position) -> Self {
        Self {
            direction: Direction::Forward,
            from: from.value(),
            limit: None,
        }
    }

    pub fn backward(from: Position) -> Self {
        Self {
            direction: Direction::Backward,
            from: from.value(),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Operations the adapter needs from a log server.
#[async_trait]
pub trait LogServerClient: Send + Sync {
    async fn append(&self, stream: &str, expected: ExpectedRevision, events: Vec<ProposedEvent>) -> Result<AppendOutcome>;

    /// Read a stream; `None` when the stream does not exist.
    async fn read_stream(&self, stream: &str, request: ReadRequest) -> Result<Option<Vec<ServerRecord>>>;

    /// Read the global log by commit position.
    async fn read_all(&self, request: ReadRequest) -> Result<Vec<ServerRecord>>;

    /// Drop records below `before`. Servers may answer `NotImplemented`.
    async fn truncate(&self, stream: &str, before: u64) -> Result<()>;

    /// Delete a stream; `false` when it did not exist.
    async fn delete(&self, stream: &str) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Client
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendBody {
    expected_revision: ExpectedRevision,
    events: Vec<ProposedEvent>,
}

#[derive(Debug, Deserialize)]
struct RecordsBody {
    records: Vec<ServerRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    error: String,
    actual_revision: Option<u64>,
    event_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TruncateBody {
    before: u64,
}

/// [`LogServerClient`] over HTTP+JSON.
#[derive(Debug, Clone)]
pub struct HttpLogServerClient {
    http: reqwest::Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl HttpLogServerClient {
    pub fn new(config: &LogServerConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| EventStoreError::configuration(format!("invalid log server url {}: {e}", config.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(EventStoreError::configuration(format!(
                "log server url {} cannot be a base",
                config.url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_ref()),
            None => builder,
        }
    }

    async fn unexpected(response: reqwest::Response) -> EventStoreError {
        let status = response.status();
        if status == StatusCode::NOT_IMPLEMENTED {
            return EventStoreError::not_implemented(BACKEND, "requested operation");
        }
        let message = response.text().await.unwrap_or_default();
        EventStoreError::LogServer {
            status: status.as_u16(),
            message,
        }
    }

    async fn fetch_records(&self, url: Url, request: ReadRequest) -> Result<Option<Vec<ServerRecord>>> {
        let response = self.request(Method::GET, url).query(&request).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<RecordsBody>().await?.records)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

#[async_trait]
impl LogServerClient for HttpLogServerClient {
    async fn append(&self, stream: &str, expected: ExpectedRevision, events: Vec<ProposedEvent>) -> Result<AppendOutcome> {
        let body = AppendBody {
            expected_revision: expected,
            events,
        };
        let response = self
            .request(Method::POST, self.url(&["streams", stream]))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(AppendOutcome::Success(response.json::<RecordsBody>().await?.records)),
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = response.json().await?;
                match (conflict.error.as_str(), conflict.event_id) {
                    ("duplicate_event", Some(event_id)) => Ok(AppendOutcome::DuplicateEvent { event_id }),
                    ("wrong_expected_version", _) => Ok(AppendOutcome::WrongExpectedVersion {
                        actual: conflict.actual_revision,
                    }),
                    (other, _) => Err(EventStoreError::LogServer {
                        status: StatusCode::CONFLICT.as_u16(),
                        message: other.to_string(),
                    }),
                }
            }
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn read_stream(&self, stream: &str, request: ReadRequest) -> Result<Option<Vec<ServerRecord>>> {
        self.fetch_records(self.url(&["streams", stream]), request).await
    }

    async fn read_all(&self, request: ReadRequest) -> Result<Vec<ServerRecord>> {
        Ok(self
            .fetch_records(self.url(&["all"]), request)
            .await?
            .unwrap_or_default())
    }

    async fn truncate(&self, stream: &str, before: u64) -> Result<()> {
        let response = self
            .request(Method::POST, self.url(&["streams", stream, "truncate"]))
            .json(&TruncateBody { before })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(EventStoreError::stream_not_found(&StreamId::new(stream))),
            StatusCode::NOT_IMPLEMENTED => Err(EventStoreError::not_implemented(BACKEND, "truncate_stream")),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn delete(&self, stream: &str) -> Result<bool> {
        let response = self
            .request(Method::DELETE, self.url(&["streams", stream]))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::NOT_IMPLEMENTED => Err(EventStoreError::not_implemented(BACKEND, "delete_stream")),
            _ => Err(Self::unexpected(response).await),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Adapter
// ═══════════════════════════════════════════════════════════════════════════════

/// [`EventStore`] over a [`LogServerClient`].
pub struct LogServerEventStore {
    client: Arc<dyn LogServerClient>,
    poll_interval: Duration,
}

impl LogServerEventStore {
    pub fn new(client: Arc<dyn LogServerClient>, poll_interval: Duration) -> Self {
        Self { client, poll_interval }
    }

    /// Connect over HTTP using `config`.
    pub fn connect(config: &LogServerConfig) -> Result<Self> {
        let client = HttpLogServerClient::new(config)?;
        Ok(Self::new(Arc::new(client), config.poll_interval))
    }

    async fn append_marker<E: DomainEvent>(&self, marker: &E) -> Result<()> {
        let descriptor = technical_descriptor(marker)?;
        self.append_to_stream(&StreamId::internal(), vec![descriptor], AppendOptions::new())
            .await?;
        Ok(())
    }
}

/// Read raw records for a stream; `None` when it does not exist.
async fn read_records(
    client: &dyn LogServerClient,
    stream_id: &StreamId,
    request: ReadRequest,
) -> Result<Option<Vec<RecordedEventDescriptor>>> {
    let records = if stream_id.is_global() {
        Some(client.read_all(request).await?)
    } else {
        client.read_stream(stream_id.as_str(), request).await?
    };
    Ok(records.map(|records| records.into_iter().map(RecordedEventDescriptor::from).collect()))
}

/// Position of the last record of a stream, or `START` if it has none.
async fn head_position(client: &dyn LogServerClient, stream_id: &StreamId) -> Result<Position> {
    let last = read_records(client, stream_id, ReadRequest::backward(Position::END).limit(1)).await?;
    Ok(last
        .and_then(|records| records.into_iter().next())
        .map(|record| record.position_in(stream_id))
        .unwrap_or(Position::START))
}

/// Poll the server and feed new records to `sink` until it closes.
async fn poll_subscription(client: Arc<dyn LogServerClient>, sink: SubscriptionSink, interval: Duration) {
    let stream_id = sink.stream_id().clone();

    let mut cursor = if sink.options().from_position.is_end() {
        match head_position(client.as_ref(), &stream_id).await {
            Ok(position) => position,
            Err(err) => {
                sink.fail(err).await;
                return;
            }
        }
    } else {
        sink.options().from_position
    };

    loop {
        match read_records(client.as_ref(), &stream_id, ReadRequest::forward(cursor)).await {
            Ok(records) => {
                for record in records.unwrap_or_default() {
                    cursor = record.position_in(&stream_id);
                    if !sink.emit(record).await {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "Subscription poll failed");
                if !sink.fail(err).await {
                    return;
                }
            }
        }

        tokio::select! {
            _ = sink.closed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(stream_id = %stream_id, "Subscription poller stopped");
}

#[async_trait]
impl EventStore for LogServerEventStore {
    #[instrument(skip(self, events, options), fields(backend = BACKEND, stream_id = %stream_id, count = events.len()))]
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        options: AppendOptions,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        ensure_writable(stream_id, "append to")?;
        check_unique_within_batch(&events)?;

        if events.is_empty() {
            // Nothing to send; only the expectation needs checking.
            if let Some(expected) = options.expected_version {
                let actual = match self.get_stream(stream_id).await {
                    Ok(stream) => stream.version,
                    Err(err) if err.is_stream_not_found() => StreamVersion::INITIAL,
                    Err(err) => return Err(err),
                };
                super::check_expected_version(stream_id, Some(expected), actual)?;
            }
            return Ok(Vec::new());
        }

        let proposed = events.into_iter().map(ProposedEvent::from).collect();
        let outcome = self
            .client
            .append(stream_id.as_str(), options.expected_version.into(), proposed)
            .await
            .context("append_to_stream", stream_id)?;

        match outcome {
            AppendOutcome::Success(records) => {
                let recorded: Vec<RecordedEventDescriptor> =
                    records.into_iter().map(RecordedEventDescriptor::from).collect();
                counter!("eventlog_events_appended_total", "backend" => BACKEND).increment(recorded.len() as u64);
                Ok(recorded)
            }
            AppendOutcome::WrongExpectedVersion { actual } => {
                counter!("eventlog_append_conflicts_total", "backend" => BACKEND).increment(1);
                let actual = actual.map(|r| StreamVersion::new(r as i64)).unwrap_or(StreamVersion::INITIAL);
                let expected = options.expected_version.unwrap_or(StreamVersion::INITIAL);
                Err(EventStoreError::concurrency(stream_id, expected, actual))
            }
            AppendOutcome::DuplicateEvent { event_id } => Err(EventStoreError::DuplicateEventId {
                event_id: EventId::new(event_id),
            }),
        }
    }

    #[instrument(skip(self, options), fields(backend = BACKEND, stream_id = %stream_id))]
    async fn read_from_stream(&self, stream_id: &StreamId, options: ReadOptions) -> Result<StreamSlice> {
        let mut request = ReadRequest {
            direction: options.direction,
            from: options.position.value(),
            limit: None,
        };
        // The server cannot filter by type, so a limit only goes over the
        // wire when no filter applies.
        if options.type_filter.is_none() {
            request.limit = options.max_count;
        }

        let records = read_records(self.client.as_ref(), stream_id, request)
            .await
            .context("read_from_stream", stream_id)?
            .ok_or_else(|| EventStoreError::stream_not_found(stream_id))?;

        let records = records
            .into_iter()
            .filter(|r| options.admits_type(r.type_name()))
            .take(options.max_count.unwrap_or(usize::MAX))
            .collect();
        Ok(StreamSlice::new(stream_id.clone(), records))
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn truncate_stream(&self, stream_id: &StreamId, before: Position) -> Result<()> {
        ensure_removable(stream_id, "truncate")?;

        let before_revision = before.value().max(0) as u64;
        self.client
            .truncate(stream_id.as_str(), before_revision)
            .await
            .context("truncate_stream", stream_id)?;

        self.append_marker(&StreamTruncatedEvent {
            stream_id: stream_id.clone(),
            before_position: before,
        })
        .await
    }

    #[instrument(skip(self), fields(backend = BACKEND))]
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        ensure_removable(stream_id, "delete")?;

        let existed = self
            .client
            .delete(stream_id.as_str())
            .await
            .context("delete_stream", stream_id)?;
        if !existed {
            return Ok(());
        }

        self.append_marker(&StreamDeletedEvent {
            stream_id: stream_id.clone(),
        })
        .await
    }

    #[instrument(skip(self, options), fields(backend = BACKEND))]
    async fn subscribe_to_stream(&self, stream_id: &StreamId, options: SubscribeOptions) -> Result<Subscription> {
        let (subscription, sink) = subscription::channel(stream_id.clone(), options);
        tokio::spawn(poll_subscription(self.client.clone(), sink, self.poll_interval));
        Ok(subscription)
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        let records = read_records(
            self.client.as_ref(),
            stream_id,
            ReadRequest::forward(Position::START).limit(1),
        )
        .await
        .context("stream_exists", stream_id)?;

        Ok(match records {
            Some(records) if stream_id.is_global() => !records.is_empty(),
            Some(_) => true,
            None => false,
        })
    }

    async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream> {
        let first = read_records(
            self.client.as_ref(),
            stream_id,
            ReadRequest::forward(Position::START).limit(1),
        )
        .await
        .context("get_stream", stream_id)?
        .and_then(|records| records.into_iter().next());
        let last = read_records(
            self.client.as_ref(),
            stream_id,
            ReadRequest::backward(Position::END).limit(1),
        )
        .await
        .context("get_stream", stream_id)?
        .and_then(|records| records.into_iter().next());

        match (first, last) {
            (Some(first), Some(last)) => Ok(Stream {
                id: stream_id.clone(),
                version: StreamVersion::new(last.position_in(stream_id).value()),
                initial_version: StreamVersion::new(first.position_in(stream_id).value()),
            }),
            _ => Err(EventStoreError::stream_not_found(stream_id)),
        }
    }

    async fn clear(&self) -> Result<()> {
        Err(EventStoreError::not_implemented(BACKEND, "clear"))
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expected_revision_mapping() {
        assert_eq!(ExpectedRevision::from(None), ExpectedRevision::Any);
        assert_eq!(
            ExpectedRevision::from(Some(StreamVersion::INITIAL)),
            ExpectedRevision::NoStream
        );
        assert_eq!(
            ExpectedRevision::from(Some(StreamVersion::new(3))),
            ExpectedRevision::Exact(3)
        );
    }

    #[test]
    fn test_expected_revision_wire_format() {
        let json = serde_json::to_value(ExpectedRevision::Exact(2)).unwrap();
        assert_eq!(json, json!({ "kind": "exact", "revision": 2 }));
        let json = serde_json::to_value(ExpectedRevision::NoStream).unwrap();
        assert_eq!(json, json!({ "kind": "noStream" }));
    }

    #[test]
    fn test_server_record_maps_positions() {
        let record: ServerRecord = serde_json::from_value(json!({
            "eventId": "evt-1",
            "eventType": "order_placed",
            "stream": "orders-1",
            "revision": 4,
            "commitPosition": 12,
            "data": { "total": 3 },
            "created": "2024-06-01T12:00:00Z"
        }))
        .unwrap();

        let recorded = RecordedEventDescriptor::from(record);
        assert_eq!(recorded.version(), StreamVersion::new(4));
        assert_eq!(recorded.sequence_number(), SequenceNumber::new(12));
        assert!(recorded.metadata().is_empty());
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let client = HttpLogServerClient::new(&LogServerConfig::new("http://localhost:2113/api/")).unwrap();
        let url = client.url(&["streams", "orders/1 x"]);
        assert_eq!(url.as_str(), "http://localhost:2113/api/streams/orders%2F1%20x");
    }

    #[test]
    fn test_invalid_url_is_a_configuration_error() {
        let err = HttpLogServerClient::new(&LogServerConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, EventStoreError::Configuration(_)));
    }
}
