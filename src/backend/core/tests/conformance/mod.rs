//! Behaviour every `EventStore` backend must share.
//!
//! Each backend's test file builds a store and expands [`conformance_suite!`].

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use eventlog_core::error::{ErrorCode, EventStoreError};
use eventlog_core::events::{
    AppendOptions, EventDescriptor, Position, ReadOptions, RecordedEventDescriptor, StreamId, StreamVersion,
    SubscribeOptions, TypeFilter,
};
use eventlog_core::store::{EventStore, Subscription, INTERNAL_STREAM_ID};
use serde_json::json;
use tokio::sync::MutexGuard;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A store under test, optionally holding a lock that serializes tests
/// sharing one database.
pub struct Fixture {
    pub store: Arc<dyn EventStore>,
    _guard: Option<MutexGuard<'static, ()>>,
}

impl Fixture {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store, _guard: None }
    }

    pub fn exclusive(store: Arc<dyn EventStore>, guard: MutexGuard<'static, ()>) -> Self {
        Self {
            store,
            _guard: Some(guard),
        }
    }
}

/// Generate one `#[tokio::test]` per conformance case.
///
/// `$fixture` is an async fn returning `Option<Fixture>`; `None` skips.
#[macro_export]
macro_rules! conformance_suite {
    ($fixture:path) => {
        $crate::conformance_suite!(@cases $fixture;
            append_assigns_dense_versions,
            expected_version_conflict,
            empty_append_checks_expected_version,
            duplicate_event_id_rejected_store_wide,
            read_missing_stream_is_not_found,
            backward_read_reverses_forward_read,
            read_excludes_position_and_honours_limits,
            type_filter_select_and_exclude,
            global_stream_orders_by_sequence,
            global_stream_is_not_writable,
            internal_stream_cannot_be_removed,
            truncate_removes_head_and_records_marker,
            truncate_missing_stream_is_not_found,
            delete_stream_is_idempotent_and_records_marker,
            get_stream_reports_bounds,
            subscription_delivers_backlog_then_live,
            subscription_to_global_stream,
            subscription_applies_type_filter,
            live_only_subscription_skips_backlog,
            clear_removes_everything,
            subscription_survives_clear,
        );
    };
    (@cases $fixture:path; $($case:ident),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $case() {
                let Some(fixture) = $fixture().await else {
                    return;
                };
                $crate::conformance::$case(fixture.store.as_ref()).await;
            }
        )*
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn event(id: &str, type_name: &str) -> EventDescriptor {
    EventDescriptor::new(id, type_name, json!({ "id": id }))
}

fn events(ids: &[&str]) -> Vec<EventDescriptor> {
    ids.iter().map(|id| event(id, "test_event")).collect()
}

fn ids(records: &[RecordedEventDescriptor]) -> Vec<String> {
    records.iter().map(|r| r.id().as_str().to_string()).collect()
}

fn versions(records: &[RecordedEventDescriptor]) -> Vec<i64> {
    records.iter().map(|r| r.version().value()).collect()
}

async fn append(store: &dyn EventStore, stream: &str, ids: &[&str]) -> Vec<RecordedEventDescriptor> {
    store
        .append_to_stream(&StreamId::new(stream), events(ids), AppendOptions::new())
        .await
        .expect("append failed")
}

async fn read_all_of(store: &dyn EventStore, stream: &StreamId) -> Vec<RecordedEventDescriptor> {
    store
        .read_from_stream(stream, ReadOptions::forward())
        .await
        .expect("read failed")
        .into_descriptors()
}

async fn next_record(subscription: &mut Subscription) -> RecordedEventDescriptor {
    tokio::time::timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("subscription closed")
        .expect("subscription error")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Append
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn append_assigns_dense_versions(store: &dyn EventStore) {
    let recorded = append(store, "s1", &["A", "B", "C"]).await;
    assert_eq!(versions(&recorded), vec![0, 1, 2]);

    let read = read_all_of(store, &StreamId::new("s1")).await;
    assert_eq!(ids(&read), vec!["A", "B", "C"]);
    assert_eq!(versions(&read), vec![0, 1, 2]);

    let more = append(store, "s1", &["D"]).await;
    assert_eq!(versions(&more), vec![3]);

    let sequences: Vec<i64> = read.iter().map(|r| r.sequence_number().value()).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(sequences[0] >= 1);
}

pub async fn expected_version_conflict(store: &dyn EventStore) {
    let stream = StreamId::new("s2");
    let options = AppendOptions::new().expected_version(StreamVersion::INITIAL);

    store
        .append_to_stream(&stream, events(&["A"]), options)
        .await
        .expect("first append");

    let err = store
        .append_to_stream(&stream, events(&["B"]), options)
        .await
        .unwrap_err();
    assert!(err.is_concurrency_error());
    match err.root() {
        EventStoreError::Concurrency {
            stream_id,
            expected,
            actual,
        } => {
            assert_eq!(stream_id, &stream);
            assert_eq!(*expected, StreamVersion::INITIAL);
            assert_eq!(*actual, StreamVersion::new(0));
        }
        other => panic!("expected a concurrency error, got {other:?}"),
    }

    // Nothing from the failed batch was written.
    assert_eq!(ids(&read_all_of(store, &stream).await), vec!["A"]);

    store
        .append_to_stream(&stream, events(&["B"]), AppendOptions::new().expected_version(StreamVersion::new(0)))
        .await
        .expect("append with matching expectation");
}

pub async fn empty_append_checks_expected_version(store: &dyn EventStore) {
    append(store, "s1", &["A"]).await;

    let recorded = store
        .append_to_stream(
            &StreamId::new("s1"),
            Vec::new(),
            AppendOptions::new().expected_version(StreamVersion::new(0)),
        )
        .await
        .expect("empty append");
    assert!(recorded.is_empty());

    let err = store
        .append_to_stream(
            &StreamId::new("s1"),
            Vec::new(),
            AppendOptions::new().expected_version(StreamVersion::new(5)),
        )
        .await
        .unwrap_err();
    assert!(err.is_concurrency_error());
}

pub async fn duplicate_event_id_rejected_store_wide(store: &dyn EventStore) {
    append(store, "s1", &["A"]).await;

    let err = store
        .append_to_stream(&StreamId::new("s2"), events(&["B", "A"]), AppendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateEventId);

    // The whole batch was rejected.
    assert!(!store.stream_exists(&StreamId::new("s2")).await.unwrap());

    let err = store
        .append_to_stream(&StreamId::new("s3"), events(&["X", "X"]), AppendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateEventId);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Read
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn read_missing_stream_is_not_found(store: &dyn EventStore) {
    let err = store
        .read_from_stream(&StreamId::new("missing"), ReadOptions::forward())
        .await
        .unwrap_err();
    assert!(err.is_stream_not_found());
    assert!(!store.stream_exists(&StreamId::new("missing")).await.unwrap());
}

pub async fn backward_read_reverses_forward_read(store: &dyn EventStore) {
    append(store, "s1", &["A", "B", "C", "D"]).await;
    let stream = StreamId::new("s1");

    let forward = store.read_from_stream(&stream, ReadOptions::forward()).await.unwrap();
    let backward = store.read_from_stream(&stream, ReadOptions::backward()).await.unwrap();
    assert_eq!(forward.reversed(), backward);
}

pub async fn read_excludes_position_and_honours_limits(store: &dyn EventStore) {
    append(store, "s1", &["A", "B", "C", "D"]).await;
    let stream = StreamId::new("s1");

    let forward = store
        .read_from_stream(&stream, ReadOptions::forward().from_position(Position::new(1)))
        .await
        .unwrap();
    assert_eq!(ids(forward.descriptors()), vec!["C", "D"]);

    let backward = store
        .read_from_stream(
            &stream,
            ReadOptions::backward().from_position(Position::new(2)).max_count(1),
        )
        .await
        .unwrap();
    assert_eq!(ids(backward.descriptors()), vec!["B"]);

    let limited = store
        .read_from_stream(&stream, ReadOptions::forward().max_count(2))
        .await
        .unwrap();
    assert_eq!(ids(limited.descriptors()), vec!["A", "B"]);

    let past_end = store
        .read_from_stream(&stream, ReadOptions::forward().from_position(Position::new(3)))
        .await
        .unwrap();
    assert!(past_end.is_empty());
}

pub async fn type_filter_select_and_exclude(store: &dyn EventStore) {
    let stream = StreamId::new("orders-1");
    store
        .append_to_stream(
            &stream,
            vec![
                event("A", "order_placed"),
                event("B", "item_added"),
                event("C", "item_added"),
                event("D", "order_shipped"),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let selected = store
        .read_from_stream(&stream, ReadOptions::forward().type_filter(TypeFilter::select(["item_added"])))
        .await
        .unwrap();
    assert_eq!(ids(selected.descriptors()), vec!["B", "C"]);

    let excluded = store
        .read_from_stream(
            &stream,
            ReadOptions::forward()
                .type_filter(TypeFilter::exclude(["item_added"]))
                .max_count(1),
        )
        .await
        .unwrap();
    assert_eq!(ids(excluded.descriptors()), vec!["A"]);
}

pub async fn global_stream_orders_by_sequence(store: &dyn EventStore) {
    append(store, "s1", &["A"]).await;
    append(store, "s2", &["B"]).await;
    append(store, "s1", &["C"]).await;

    let global = read_all_of(store, &StreamId::global()).await;
    assert_eq!(ids(&global), vec!["A", "B", "C"]);
    let sequences: Vec<i64> = global.iter().map(|r| r.sequence_number().value()).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    // Positions on the global stream are sequence numbers.
    let after_first = store
        .read_from_stream(
            &StreamId::global(),
            ReadOptions::forward().from_position(global[0].sequence_number().into()),
        )
        .await
        .unwrap();
    assert_eq!(ids(after_first.descriptors()), vec!["B", "C"]);
}

pub async fn global_stream_is_not_writable(store: &dyn EventStore) {
    let err = store
        .append_to_stream(&StreamId::global(), events(&["A"]), AppendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::GlobalStreamNotWritable);

    let err = store.delete_stream(&StreamId::global()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::GlobalStreamNotWritable);
}

pub async fn internal_stream_cannot_be_removed(store: &dyn EventStore) {
    append(store, "s1", &["A"]).await;
    store.delete_stream(&StreamId::new("s1")).await.unwrap();
    let internal = StreamId::new(INTERNAL_STREAM_ID);

    let err = store.delete_stream(&internal).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalStreamProtected);
    let err = store.truncate_stream(&internal, Position::new(5)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalStreamProtected);

    assert_eq!(markers(store, "es.stream.deleted").await.len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Truncate and Delete
// ═══════════════════════════════════════════════════════════════════════════════

async fn markers(store: &dyn EventStore, type_name: &str) -> Vec<RecordedEventDescriptor> {
    store
        .read_from_stream(
            &StreamId::new(INTERNAL_STREAM_ID),
            ReadOptions::forward().type_filter(TypeFilter::select([type_name])),
        )
        .await
        .map(|slice| slice.into_descriptors())
        .unwrap_or_default()
}

pub async fn truncate_removes_head_and_records_marker(store: &dyn EventStore) {
    append(store, "s1", &["A", "B", "C"]).await;
    let stream = StreamId::new("s1");

    store.truncate_stream(&stream, Position::new(1)).await.unwrap();

    let remaining = read_all_of(store, &stream).await;
    assert_eq!(ids(&remaining), vec!["B", "C"]);
    assert_eq!(versions(&remaining), vec![1, 2]);

    let summary = store.get_stream(&stream).await.unwrap();
    assert_eq!(summary.initial_version, StreamVersion::new(1));
    assert_eq!(summary.version, StreamVersion::new(2));

    let markers = markers(store, "es.stream.truncated").await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].payload().get("stream_id"), Some(&json!("s1")));
    assert_eq!(markers[0].payload().get("before_position"), Some(&json!(1)));

    // Versions keep counting after a truncation.
    let next = append(store, "s1", &["D"]).await;
    assert_eq!(versions(&next), vec![3]);
}

pub async fn truncate_missing_stream_is_not_found(store: &dyn EventStore) {
    let err = store
        .truncate_stream(&StreamId::new("missing"), Position::new(1))
        .await
        .unwrap_err();
    assert!(err.is_stream_not_found());
}

pub async fn delete_stream_is_idempotent_and_records_marker(store: &dyn EventStore) {
    append(store, "s1", &["A", "B"]).await;
    append(store, "s2", &["C"]).await;
    let stream = StreamId::new("s1");

    store.delete_stream(&stream).await.unwrap();
    assert!(!store.stream_exists(&stream).await.unwrap());
    assert!(store
        .read_from_stream(&stream, ReadOptions::forward())
        .await
        .unwrap_err()
        .is_stream_not_found());

    // Other streams are untouched.
    assert_eq!(ids(&read_all_of(store, &StreamId::new("s2")).await), vec!["C"]);

    store.delete_stream(&stream).await.unwrap();
    store.delete_stream(&StreamId::new("never-existed")).await.unwrap();

    let markers = markers(store, "es.stream.deleted").await;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].payload().get("stream_id"), Some(&json!("s1")));

    // A deleted stream starts over.
    let recreated = append(store, "s1", &["E"]).await;
    assert_eq!(versions(&recreated), vec![0]);
}

pub async fn get_stream_reports_bounds(store: &dyn EventStore) {
    let err = store.get_stream(&StreamId::new("missing")).await.unwrap_err();
    assert!(err.is_stream_not_found());

    append(store, "s1", &["A", "B", "C"]).await;
    let summary = store.get_stream(&StreamId::new("s1")).await.unwrap();
    assert_eq!(summary.id, StreamId::new("s1"));
    assert_eq!(summary.initial_version, StreamVersion::new(0));
    assert_eq!(summary.version, StreamVersion::new(2));
    assert!(store.stream_exists(&StreamId::new("s1")).await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn subscription_delivers_backlog_then_live(store: &dyn EventStore) {
    append(store, "s1", &["A", "B", "C"]).await;
    let stream = StreamId::new("s1");

    let mut subscription = store
        .subscribe_to_stream(&stream, SubscribeOptions::new())
        .await
        .unwrap();
    append(store, "s1", &["D"]).await;
    append(store, "other", &["X"]).await;

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_record(&mut subscription).await);
    }
    assert_eq!(ids(&received), vec!["A", "B", "C", "D"]);
    assert_eq!(versions(&received), vec![0, 1, 2, 3]);

    subscription.close();
    subscription.close();
    assert!(subscription.is_closed());
    assert!(subscription.recv().await.is_none());
}

pub async fn subscription_to_global_stream(store: &dyn EventStore) {
    let mut subscription = store
        .subscribe_to_stream(&StreamId::global(), SubscribeOptions::new())
        .await
        .unwrap();

    append(store, "s1", &["A"]).await;
    append(store, "s2", &["B"]).await;

    let first = next_record(&mut subscription).await;
    let second = next_record(&mut subscription).await;
    assert_eq!(ids(&[first.clone(), second.clone()]), vec!["A", "B"]);
    assert!(first.sequence_number() < second.sequence_number());
}

pub async fn subscription_applies_type_filter(store: &dyn EventStore) {
    let stream = StreamId::new("s1");
    let mut subscription = store
        .subscribe_to_stream(&stream, SubscribeOptions::new().type_filter(TypeFilter::select(["wanted"])))
        .await
        .unwrap();

    store
        .append_to_stream(
            &stream,
            vec![event("A", "ignored"), event("B", "wanted"), event("C", "ignored"), event("D", "wanted")],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let first = next_record(&mut subscription).await;
    let second = next_record(&mut subscription).await;
    assert_eq!(ids(&[first, second]), vec!["B", "D"]);
}

pub async fn live_only_subscription_skips_backlog(store: &dyn EventStore) {
    append(store, "s1", &["A", "B"]).await;
    let stream = StreamId::new("s1");

    let mut subscription = store
        .subscribe_to_stream(&stream, SubscribeOptions::new().from_position(Position::END))
        .await
        .unwrap();
    // Give polling backends a chance to observe the current head first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    append(store, "s1", &["C"]).await;

    let record = next_record(&mut subscription).await;
    assert_eq!(record.id().as_str(), "C");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Clear
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn clear_removes_everything(store: &dyn EventStore) {
    append(store, "s1", &["A", "B"]).await;

    match store.clear().await {
        Ok(()) => {}
        Err(err) if err.code() == ErrorCode::NotImplemented => return,
        Err(err) => panic!("clear failed: {err}"),
    }

    assert!(!store.stream_exists(&StreamId::new("s1")).await.unwrap());
    assert!(store.get_stream(&StreamId::global()).await.unwrap_err().is_stream_not_found());

    // Ids and versions are free again.
    let recorded = append(store, "s1", &["A"]).await;
    assert_eq!(versions(&recorded), vec![0]);
}

pub async fn subscription_survives_clear(store: &dyn EventStore) {
    append(store, "s1", &["A", "B"]).await;
    let stream = StreamId::new("s1");
    let mut subscription = store
        .subscribe_to_stream(&stream, SubscribeOptions::new())
        .await
        .unwrap();
    assert_eq!(ids(&[next_record(&mut subscription).await]), vec!["A"]);
    assert_eq!(ids(&[next_record(&mut subscription).await]), vec!["B"]);

    match store.clear().await {
        Ok(()) => {}
        Err(err) if err.code() == ErrorCode::NotImplemented => return,
        Err(err) => panic!("clear failed: {err}"),
    }

    append(store, "s1", &["C"]).await;
    let record = next_record(&mut subscription).await;
    assert_eq!(record.id().as_str(), "C");
    assert_eq!(record.version(), StreamVersion::new(0));
}
