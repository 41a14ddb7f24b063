//! Store decorator that upcasts every read.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::UpcasterChain;
use crate::error::{ErrorContext, Result};
use crate::events::{
    AppendOptions, EventDescriptor, Position, ReadOptions, RecordedEventDescriptor, Stream, StreamId, StreamSlice,
    SubscribeOptions,
};
use crate::store::{EventStore, Subscription};

/// Wraps a store so `read_from_stream` returns current-schema records.
///
/// The read's type filter is applied after upcasting, so it names current
/// types; `max_count` bounds the stored records read. Writes, subscriptions
/// and metadata queries go straight to the inner store.
pub struct UpcastingEventStore {
    inner: Arc<dyn EventStore>,
    chain: Arc<UpcasterChain>,
}

impl UpcastingEventStore {
    pub fn new(inner: Arc<dyn EventStore>, chain: UpcasterChain) -> Self {
        Self {
            inner,
            chain: Arc::new(chain),
        }
    }

    pub fn inner(&self) -> &Arc<dyn EventStore> {
        &self.inner
    }

    pub fn chain(&self) -> &UpcasterChain {
        &self.chain
    }
}

#[async_trait]
impl EventStore for UpcastingEventStore {
    async fn append_to_stream(
        &self,
        stream_id: &StreamId,
        events: Vec<EventDescriptor>,
        options: AppendOptions,
    ) -> Result<Vec<RecordedEventDescriptor>> {
        self.inner.append_to_stream(stream_id, events, options).await
    }

    #[instrument(skip(self, options), fields(stream_id = %stream_id))]
    async fn read_from_stream(&self, stream_id: &StreamId, mut options: ReadOptions) -> Result<StreamSlice> {
        let type_filter = options.type_filter.take();

        let slice = self.inner.read_from_stream(stream_id, options).await?;
        let mut records = self
            .chain
            .upcast_records(slice.into_descriptors())
            .context("upcast", stream_id)?;

        if let Some(filter) = type_filter {
            records.retain(|r| filter.matches(r.type_name()));
        }
        Ok(StreamSlice::new(stream_id.clone(), records))
    }

    async fn truncate_stream(&self, stream_id: &StreamId, before: Position) -> Result<()> {
        self.inner.truncate_stream(stream_id, before).await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        self.inner.delete_stream(stream_id).await
    }

    async fn subscribe_to_stream(&self, stream_id: &StreamId, options: SubscribeOptions) -> Result<Subscription> {
        self.inner.subscribe_to_stream(stream_id, options).await
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool> {
        self.inner.stream_exists(stream_id).await
    }

    async fn get_stream(&self, stream_id: &StreamId) -> Result<Stream> {
        self.inner.get_stream(stream_id).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
