//! Push-based subscriptions and the fan-out plumbing behind them.
//!
//! A [`Subscription`] is the consumer half: an event queue, an error queue and
//! a close signal. Backends own the producer half, a [`SubscriptionSink`],
//! usually driven by [`spawn_pump`], which emits the backlog and then forwards
//! live records from a [`SubscriberRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EventStoreError, Result};
use crate::events::{
    Position, RecordedEventDescriptor, SequenceNumber, StreamId, SubscribeOptions,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Subscription
// ═══════════════════════════════════════════════════════════════════════════════

/// Receiving end of a subscription to a stream or to the global stream.
///
/// Dropping the subscription closes it.
pub struct Subscription {
    stream_id: StreamId,
    events: mpsc::Receiver<RecordedEventDescriptor>,
    errors: mpsc::Receiver<EventStoreError>,
    closed: CancellationToken,
}

impl Subscription {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Wait for the next record or error.
    ///
    /// Returns `None` once the subscription has been closed locally. If the
    /// producer goes away first, a single `SubscriptionClosed` error is
    /// yielded and the subscription closes itself.
    pub async fn recv(&mut self) -> Option<Result<RecordedEventDescriptor>> {
        if self.closed.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            Some(err) = self.errors.recv() => Some(Err(err)),
            event = self.events.recv() => match event {
                Some(record) => Some(Ok(record)),
                None => {
                    self.closed.cancel();
                    Some(Err(EventStoreError::SubscriptionClosed {
                        stream_id: self.stream_id.clone(),
                    }))
                }
            },
        }
    }

    /// Take a record or error that is already queued, without waiting.
    ///
    /// Returns `None` when nothing is queued or the subscription is closed.
    pub fn try_recv(&mut self) -> Option<Result<RecordedEventDescriptor>> {
        if self.closed.is_cancelled() {
            return None;
        }
        if let Ok(err) = self.errors.try_recv() {
            return Some(Err(err));
        }
        match self.events.try_recv() {
            Ok(record) => Some(Ok(record)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed.cancel();
                Some(Err(EventStoreError::SubscriptionClosed {
                    stream_id: self.stream_id.clone(),
                }))
            }
        }
    }

    /// Close the subscription. Calling this more than once is harmless.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(stream_id = %self.stream_id, "Closing subscription");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A token cancelled when this subscription closes.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Producing end of a subscription.
pub struct SubscriptionSink {
    stream_id: StreamId,
    options: SubscribeOptions,
    events: mpsc::Sender<RecordedEventDescriptor>,
    errors: mpsc::Sender<EventStoreError>,
    closed: CancellationToken,
}

impl SubscriptionSink {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// Deliver a record, waiting until the consumer takes it.
    ///
    /// Records rejected by the type filter are skipped. Returns `false` once
    /// the subscription is closed.
    pub async fn emit(&self, record: RecordedEventDescriptor) -> bool {
        if !self.options.admits_type(record.type_name()) {
            return !self.is_closed();
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.events.send(record) => sent.is_ok(),
        }
    }

    /// Deliver an error. Returns `false` once the subscription is closed.
    pub async fn fail(&self, error: EventStoreError) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.errors.send(error) => sent.is_ok(),
        }
    }

    /// Resolves when the consumer closes or drops the subscription.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.events.closed() => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.events.is_closed()
    }
}

/// Create a connected subscription and sink.
pub fn channel(stream_id: StreamId, options: SubscribeOptions) -> (Subscription, SubscriptionSink) {
    let (events_tx, events_rx) = mpsc::channel(1);
    let (errors_tx, errors_rx) = mpsc::channel(1);
    let closed = CancellationToken::new();

    counter!("eventlog_subscriptions_opened_total").increment(1);

    let subscription = Subscription {
        stream_id: stream_id.clone(),
        events: events_rx,
        errors: errors_rx,
        closed: closed.clone(),
    };
    let sink = SubscriptionSink {
        stream_id,
        options,
        events: events_tx,
        errors: errors_tx,
        closed,
    };
    (subscription, sink)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriber Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Message forwarded from a backend's change feed to a subscription pump.
#[derive(Debug, Clone)]
pub enum LiveMessage {
    Record(RecordedEventDescriptor),
    /// The change feed failed; subscribers are told and the feed carries on.
    Failed(String),
    /// The store was cleared and numbering restarts; forget what was emitted.
    Reset,
}

struct Subscriber {
    stream_id: StreamId,
    sender: mpsc::UnboundedSender<LiveMessage>,
}

/// Live subscribers of one store, keyed by registration id.
///
/// Dispatch never blocks: each subscriber has its own unbounded queue that its
/// pump drains at the consumer's pace.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: DashMap<u64, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `stream_id` (or every stream, for `$all`).
    pub fn register(&self, stream_id: &StreamId) -> (u64, mpsc::UnboundedReceiver<LiveMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                stream_id: stream_id.clone(),
                sender,
            },
        );
        gauge!("eventlog_active_subscriptions").set(self.subscribers.len() as f64);
        (id, receiver)
    }

    pub fn unregister(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            gauge!("eventlog_active_subscriptions").set(self.subscribers.len() as f64);
        }
    }

    /// Forward freshly appended records to every interested subscriber, in order.
    pub fn dispatch(&self, records: &[RecordedEventDescriptor]) {
        if records.is_empty() || self.subscribers.is_empty() {
            return;
        }

        let mut gone = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            for record in records {
                if !subscriber.stream_id.is_global() && &subscriber.stream_id != record.stream_id() {
                    continue;
                }
                if subscriber.sender.send(LiveMessage::Record(record.clone())).is_err() {
                    gone.push(*entry.key());
                    break;
                }
            }
        }

        for id in gone {
            self.unregister(id);
        }
    }

    /// Tell every subscriber that the change feed failed.
    pub fn fail_all(&self, message: &str) {
        for entry in self.subscribers.iter() {
            let _ = entry.value().sender.send(LiveMessage::Failed(message.to_string()));
        }
    }

    /// Tell every subscriber that the store was cleared.
    ///
    /// Must be called before any record appended after the clear is
    /// dispatched, so pumps stop comparing against old sequence numbers.
    pub fn reset_all(&self) {
        for entry in self.subscribers.iter() {
            let _ = entry.value().sender.send(LiveMessage::Reset);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pump
// ═══════════════════════════════════════════════════════════════════════════════

/// Drive a sink: emit `backlog`, then forward `live` until either side closes.
///
/// Live records already covered by the backlog, or at or before the
/// subscription's starting position, are skipped until a
/// [`LiveMessage::Reset`] arrives; after it every record is new.
/// `registration` is removed from `registry` when the pump ends.
pub fn spawn_pump(
    sink: SubscriptionSink,
    backlog: Vec<RecordedEventDescriptor>,
    mut live: mpsc::UnboundedReceiver<LiveMessage>,
    registry: Arc<SubscriberRegistry>,
    registration: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let stream_id = sink.stream_id().clone();
        let mut from = sink.options().from_position;
        let mut last_emitted: Option<SequenceNumber> = None;

        'pump: {
            for record in backlog {
                last_emitted = Some(record.sequence_number());
                if !sink.emit(record).await {
                    break 'pump;
                }
            }

            loop {
                let message = tokio::select! {
                    biased;
                    _ = sink.closed() => break 'pump,
                    message = live.recv() => message,
                };

                match message {
                    Some(LiveMessage::Record(record)) => {
                        if last_emitted.is_some_and(|last| record.sequence_number() <= last) {
                            continue;
                        }
                        if !from.is_end() && record.position_in(&stream_id) <= from {
                            continue;
                        }
                        last_emitted = Some(record.sequence_number());
                        if !sink.emit(record).await {
                            break 'pump;
                        }
                    }
                    Some(LiveMessage::Failed(message)) => {
                        warn!(stream_id = %stream_id, error = %message, "Change feed failed");
                        if !sink.fail(EventStoreError::Notification(message)).await {
                            break 'pump;
                        }
                    }
                    Some(LiveMessage::Reset) => {
                        debug!(stream_id = %stream_id, "Store cleared, subscription position reset");
                        last_emitted = None;
                        from = Position::START;
                    }
                    None => break 'pump,
                }
            }
        }

        registry.unregister(registration);
        debug!(stream_id = %stream_id, "Subscription pump stopped");
    })
}

/// The position a backlog read for a subscription should start from, or
/// `None` for a live-only subscription.
pub fn backlog_start(options: &SubscribeOptions) -> Option<Position> {
    if options.from_position.is_end() {
        None
    } else {
        Some(options.from_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDescriptor, StreamVersion, TypeFilter};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn record(stream: &str, version: i64, sequence: i64, type_name: &str) -> RecordedEventDescriptor {
        RecordedEventDescriptor::new(
            EventDescriptor::new(format!("evt-{sequence}"), type_name, json!({})),
            StreamId::new(stream),
            StreamVersion::new(version),
            SequenceNumber::new(sequence),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unblocks_recv() {
        let (mut subscription, _sink) = channel(StreamId::new("s1"), SubscribeOptions::new());
        let token = subscription.close_token();

        let waiter = tokio::spawn(async move { subscription.recv().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        token.cancel();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_try_recv_takes_only_queued_records() {
        let (mut subscription, sink) = channel(StreamId::new("s1"), SubscribeOptions::new());
        assert!(subscription.try_recv().is_none());

        assert!(sink.emit(record("s1", 0, 1, "t")).await);
        let queued = subscription.try_recv().unwrap().unwrap();
        assert_eq!(queued.version().value(), 0);
        assert!(subscription.try_recv().is_none());

        drop(sink);
        let err = subscription.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, EventStoreError::SubscriptionClosed { .. }));
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_sink_respects_type_filter() {
        let options = SubscribeOptions::new().type_filter(TypeFilter::select(["wanted"]));
        let (mut subscription, sink) = channel(StreamId::new("s1"), options);

        tokio::spawn(async move {
            sink.emit(record("s1", 0, 1, "ignored")).await;
            sink.emit(record("s1", 1, 2, "wanted")).await;
        });

        let received = subscription.recv().await.unwrap().unwrap();
        assert_eq!(received.type_name(), "wanted");
        assert_eq!(received.version(), StreamVersion::new(1));
    }

    #[tokio::test]
    async fn test_dropped_producer_reports_closed_once() {
        let (mut subscription, sink) = channel(StreamId::new("s1"), SubscribeOptions::new());
        drop(sink);

        let err = subscription.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, EventStoreError::SubscriptionClosed { .. }));
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_emits_backlog_then_live_without_duplicates() {
        let registry = Arc::new(SubscriberRegistry::new());
        let stream = StreamId::new("s1");
        let (id, live) = registry.register(&stream);
        let (mut subscription, sink) = channel(stream.clone(), SubscribeOptions::new());

        registry.dispatch(&[record("s1", 1, 2, "t")]);
        registry.dispatch(&[record("other", 0, 3, "t"), record("s1", 2, 4, "t")]);

        spawn_pump(
            sink,
            vec![record("s1", 0, 1, "t"), record("s1", 1, 2, "t")],
            live,
            registry.clone(),
            id,
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(subscription.recv().await.unwrap().unwrap().version().value());
        }
        assert_eq!(seen, vec![0, 1, 2]);

        subscription.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_feed_failure_surfaces_as_error() {
        let registry = Arc::new(SubscriberRegistry::new());
        let stream = StreamId::global();
        let (id, live) = registry.register(&stream);
        let (mut subscription, sink) = channel(stream, SubscribeOptions::new());
        spawn_pump(sink, Vec::new(), live, registry.clone(), id);

        registry.fail_all("connection reset");
        let err = subscription.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, EventStoreError::Notification(ref m) if m == "connection reset"));

        registry.dispatch(&[record("any", 0, 1, "t")]);
        assert_eq!(subscription.recv().await.unwrap().unwrap().sequence_number(), SequenceNumber::new(1));
    }

    #[tokio::test]
    async fn test_reset_restarts_numbering_after_clear() {
        let registry = Arc::new(SubscriberRegistry::new());
        let stream = StreamId::new("s1");
        let (id, live) = registry.register(&stream);
        let options = SubscribeOptions::new().from_position(Position::new(0));
        let (mut subscription, sink) = channel(stream, options);
        spawn_pump(sink, vec![record("s1", 1, 2, "t")], live, registry.clone(), id);
        assert_eq!(subscription.recv().await.unwrap().unwrap().version().value(), 1);

        registry.reset_all();
        registry.dispatch(&[record("s1", 0, 1, "t")]);

        let received = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.sequence_number(), SequenceNumber::new(1));
        assert_eq!(received.version().value(), 0);
    }
}
