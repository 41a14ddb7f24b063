//! Processor behaviour against the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventlog_core::error::EventStoreError;
use eventlog_core::events::{
    AppendOptions, EventDescriptor, Position, RecordedEventDescriptor, StreamId, TypeFilter,
};
use eventlog_core::processing::{
    CheckpointStore, CommitStrategy, FnProcessingHandler, InMemoryCheckpointStore, Processor, ProcessorConfig,
    Projector, SendToProjectorProcessingHandler,
};
use eventlog_core::store::{EventStore, InMemoryEventStore};
use eventlog_core::upcasting::{FnUpcaster, UpcastableEventDescriptor, UpcasterChain, UpcastingEventStore};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn append(store: &InMemoryEventStore, stream: &str, ids: &[&str]) {
    let events = ids
        .iter()
        .map(|id| EventDescriptor::new(*id, "tick", json!({ "id": id })))
        .collect();
    store
        .append_to_stream(&StreamId::new(stream), events, AppendOptions::new())
        .await
        .unwrap();
}

#[derive(Default)]
struct RecordingProjector {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Projector for RecordingProjector {
    async fn project(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()> {
        self.seen.lock().push(record.id().as_str().to_string());
        Ok(())
    }
}

impl RecordingProjector {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

async fn wait_for(projector: &RecordingProjector, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while projector.seen().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("processor did not catch up");
}

#[tokio::test]
async fn test_commit_after_failure_reprocesses_failed_event() {
    let store = Arc::new(InMemoryEventStore::new());
    append(&store, "ticks", &["a", "b", "c"]).await;
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());

    let fail_on_b = Arc::new(AtomicBool::new(true));
    let handled = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let fail_on_b = fail_on_b.clone();
        let handled = handled.clone();
        FnProcessingHandler::new(move |record: &RecordedEventDescriptor| {
            if record.id().as_str() == "b" && fail_on_b.load(Ordering::SeqCst) {
                anyhow::bail!("projection unavailable");
            }
            handled.lock().push(record.id().as_str().to_string());
            Ok(())
        })
    };

    let processor = Processor::new(
        ProcessorConfig::new("ticker", StreamId::new("ticks")).commit_strategy(CommitStrategy::AfterHandling),
        store.clone(),
        checkpoints.clone(),
        Arc::new(handler),
    );

    let err = processor.catch_up().await.unwrap_err();
    assert!(matches!(err, EventStoreError::Handler { .. }));

    let checkpoint = checkpoints.load("ticker").await.unwrap().unwrap();
    assert_eq!(checkpoint.position, Position::new(0));

    fail_on_b.store(false, Ordering::SeqCst);
    let checkpoint = processor.catch_up().await.unwrap();
    assert_eq!(checkpoint.position, Position::new(2));
    assert_eq!(*handled.lock(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_commit_after_retries_every_part_of_a_split_event() {
    let store = Arc::new(InMemoryEventStore::new());
    store
        .append_to_stream(
            &StreamId::new("person-1"),
            vec![EventDescriptor::new("n1", "full_name_changed", json!({ "name": "Ada Lovelace" }))],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let split_name = FnUpcaster::new("full_name_changed", |d: UpcastableEventDescriptor| {
        let name = d.payload().get_str("name").unwrap_or_default().to_string();
        let (first, last) = name.split_once(' ').unwrap_or((name.as_str(), ""));
        Ok(vec![
            d.split(0, "first_name_changed", json!({ "first_name": first })),
            d.split(1, "last_name_changed", json!({ "last_name": last })),
        ])
    });
    let upcasting = Arc::new(UpcastingEventStore::new(store, UpcasterChain::new().with(split_name)));

    let fail_on_last = Arc::new(AtomicBool::new(true));
    let handled = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let fail_on_last = fail_on_last.clone();
        let handled = handled.clone();
        FnProcessingHandler::new(move |record: &RecordedEventDescriptor| {
            if record.type_name() == "last_name_changed" && fail_on_last.swap(false, Ordering::SeqCst) {
                anyhow::bail!("read model unavailable");
            }
            handled.lock().push(record.type_name().to_string());
            Ok(())
        })
    };

    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let processor = Processor::new(
        ProcessorConfig::new("names", StreamId::new("person-1")).commit_strategy(CommitStrategy::AfterHandling),
        upcasting,
        checkpoints.clone(),
        Arc::new(handler),
    );

    processor.catch_up().await.unwrap_err();
    assert!(checkpoints.load("names").await.unwrap().is_none());

    let checkpoint = processor.catch_up().await.unwrap();
    assert_eq!(checkpoint.position, Position::new(0));
    assert_eq!(
        *handled.lock(),
        vec!["first_name_changed", "first_name_changed", "last_name_changed"]
    );
}

#[tokio::test]
async fn test_run_catches_up_then_follows_live_appends() {
    let store = Arc::new(InMemoryEventStore::new());
    append(&store, "s1", &["a", "b"]).await;
    append(&store, "s2", &["x"]).await;

    let projector = Arc::new(RecordingProjector::default());
    let processor = Arc::new(Processor::new(
        ProcessorConfig::new("global-projection", StreamId::global())
            .type_filter(TypeFilter::select(["tick"])),
        store.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SendToProjectorProcessingHandler::new(projector.clone())),
    ));

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let processor = processor.clone();
        let cancel = cancel.clone();
        async move { processor.run(cancel).await }
    });

    wait_for(&projector, 3).await;

    append(&store, "s1", &["c"]).await;
    store.delete_stream(&StreamId::new("s2")).await.unwrap();
    append(&store, "s3", &["d"]).await;

    wait_for(&projector, 5).await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    // The deletion marker is filtered out by type.
    assert_eq!(projector.seen(), vec!["a", "b", "x", "c", "d"]);
    let checkpoint = processor.checkpoint().await.unwrap();
    assert_eq!(checkpoint.stream_id, StreamId::global());
    assert_eq!(processor.stats().processed(), 5);
}

#[tokio::test]
async fn test_run_restarts_from_persisted_checkpoint() {
    let store = Arc::new(InMemoryEventStore::new());
    append(&store, "s1", &["a", "b"]).await;
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());

    let first = Arc::new(RecordingProjector::default());
    Processor::new(
        ProcessorConfig::new("p", StreamId::new("s1")),
        store.clone(),
        checkpoints.clone(),
        Arc::new(SendToProjectorProcessingHandler::new(first.clone())),
    )
    .catch_up()
    .await
    .unwrap();

    append(&store, "s1", &["c"]).await;

    let second = Arc::new(RecordingProjector::default());
    Processor::new(
        ProcessorConfig::new("p", StreamId::new("s1")),
        store,
        checkpoints,
        Arc::new(SendToProjectorProcessingHandler::new(second.clone())),
    )
    .catch_up()
    .await
    .unwrap();

    assert_eq!(first.seen(), vec!["a", "b"]);
    assert_eq!(second.seen(), vec!["c"]);
}

#[tokio::test]
async fn test_cancelled_run_returns_ok() {
    let processor = Processor::new(
        ProcessorConfig::new("idle", StreamId::new("quiet")),
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(FnProcessingHandler::new(|_: &RecordedEventDescriptor| Ok(()))),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    processor.run(cancel).await.unwrap();
}
