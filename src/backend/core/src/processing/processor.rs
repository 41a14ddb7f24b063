//! Checkpointed catch-up and live processing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::handlers::ProcessingHandler;
use crate::error::{EventStoreError, Result};
use crate::events::{Position, ReadOptions, RecordedEventDescriptor, StreamId, SubscribeOptions, TypeFilter};
use crate::store::{EventStore, Subscription};

/// When the checkpoint is persisted relative to the handler call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    /// Persist, then handle. A failed handler's record is not retried.
    BeforeHandling,
    /// Handle, then persist. A failed handler's record is handled again on
    /// the next run, so handlers must be idempotent.
    #[default]
    AfterHandling,
}

/// Configuration for one named processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Processor name, also the checkpoint id
    pub name: String,
    /// Stream to process, possibly the global stream
    pub stream_id: StreamId,
    pub type_filter: Option<TypeFilter>,
    pub commit_strategy: CommitStrategy,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>, stream_id: StreamId) -> Self {
        Self {
            name: name.into(),
            stream_id,
            type_filter: None,
            commit_strategy: CommitStrategy::default(),
        }
    }

    pub fn type_filter(mut self, filter: TypeFilter) -> Self {
        self.type_filter = Some(filter);
        self
    }

    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.commit_strategy = strategy;
        self
    }
}

/// Counters for a processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    /// Records handled successfully
    pub processed: Arc<AtomicU64>,
    /// Handler failures
    pub failed: Arc<AtomicU64>,
}

impl ProcessorStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Drives a handler over a stream, resuming from a persisted checkpoint.
///
/// A run catches up from the checkpoint, then waits on a live subscription.
/// Each notification is only a wake-up: the next pass reads from the
/// checkpoint again, so records written between passes are never missed.
///
/// Records sharing a position, such as the outputs of one upcaster split,
/// are committed as a unit: `AfterHandling` commits once the last of them is
/// handled, `BeforeHandling` before the first.
pub struct Processor {
    config: ProcessorConfig,
    store: Arc<dyn EventStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: Arc<dyn ProcessingHandler>,
    stats: ProcessorStats,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn EventStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        handler: Arc<dyn ProcessingHandler>,
    ) -> Self {
        Self {
            config,
            store,
            checkpoints,
            handler,
            stats: ProcessorStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// The persisted checkpoint, or an initial one if none was saved.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let loaded = self
            .checkpoints
            .load(&self.config.name)
            .await
            .map_err(|e| self.checkpoint_error(e))?;

        match loaded {
            Some(checkpoint) if checkpoint.stream_id != self.config.stream_id => {
                Err(EventStoreError::configuration(format!(
                    "checkpoint {} belongs to stream {}, processor is configured for {}",
                    checkpoint.id, checkpoint.stream_id, self.config.stream_id
                )))
            }
            Some(checkpoint) => Ok(checkpoint),
            None => Ok(Checkpoint::initial(self.config.name.clone(), self.config.stream_id.clone())),
        }
    }

    /// Delete the checkpoint so the next run starts from the beginning.
    #[instrument(skip(self), fields(processor = %self.config.name))]
    pub async fn reset(&self) -> Result<()> {
        self.checkpoints
            .delete(&self.config.name)
            .await
            .map_err(|e| self.checkpoint_error(e))?;
        gauge!("eventlog_checkpoint_position", "processor" => self.config.name.clone()).set(Position::START.value() as f64);
        info!(processor = %self.config.name, "Checkpoint reset");
        Ok(())
    }

    /// Process everything after the checkpoint once, without going live.
    ///
    /// Returns the checkpoint reached.
    #[instrument(skip(self), fields(processor = %self.config.name, stream_id = %self.config.stream_id))]
    pub async fn catch_up(&self) -> Result<Checkpoint> {
        let started = Instant::now();
        let mut checkpoint = self.checkpoint().await?;

        let mut options = ReadOptions::forward().from_position(checkpoint.position);
        if let Some(filter) = &self.config.type_filter {
            options = options.type_filter(filter.clone());
        }

        let records = match self.store.read_from_stream(&self.config.stream_id, options).await {
            Ok(slice) => slice.into_descriptors(),
            // Nothing to process until the stream's first append.
            Err(err) if err.is_stream_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };

        let count = records.len();
        let mut records = records.into_iter().peekable();
        let mut previous: Option<Position> = None;
        while let Some(record) = records.next() {
            let position = record.position_in(&self.config.stream_id);
            let opens = previous != Some(position);
            let closes = records
                .peek()
                .map_or(true, |next| next.position_in(&self.config.stream_id) != position);
            self.process(&mut checkpoint, &record, position, opens, closes).await?;
            previous = Some(position);
        }

        histogram!("eventlog_catch_up_duration_seconds", "processor" => self.config.name.clone())
            .record(started.elapsed().as_secs_f64());
        if count > 0 {
            debug!(processed = count, position = %checkpoint.position, "Catch-up pass finished");
        }
        Ok(checkpoint)
    }

    /// Catch up, then keep processing new records until `cancel` fires.
    ///
    /// Cancellation returns `Ok(())`. Handler, checkpoint and subscription
    /// errors end the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut options = SubscribeOptions::new().from_position(Position::END);
        if let Some(filter) = &self.config.type_filter {
            options = options.type_filter(filter.clone());
        }

        // Subscribe before the first pass so nothing appended during it is missed.
        let mut subscription = self
            .store
            .subscribe_to_stream(&self.config.stream_id, options)
            .await?;

        info!(
            processor = %self.config.name,
            stream_id = %self.config.stream_id,
            strategy = ?self.config.commit_strategy,
            "Processor started"
        );

        let result = self.drive(&mut subscription, &cancel).await;

        subscription.close();
        match &result {
            Ok(()) => info!(processor = %self.config.name, "Processor stopped"),
            Err(err) => warn!(processor = %self.config.name, error = %err, "Processor failed"),
        }
        result
    }

    async fn drive(&self, subscription: &mut Subscription, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pass = self.catch_up() => { pass?; }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = subscription.recv() => match next {
                    Some(Ok(_)) => {
                        // One pass covers every wake-up already queued.
                        while let Some(pending) = subscription.try_recv() {
                            pending?;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            pass = self.catch_up() => { pass?; }
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Handle one record. `opens` and `closes` tell whether it is the first
    /// or last record at `position`.
    async fn process(
        &self,
        checkpoint: &mut Checkpoint,
        record: &RecordedEventDescriptor,
        position: Position,
        opens: bool,
        closes: bool,
    ) -> Result<()> {
        match self.config.commit_strategy {
            CommitStrategy::BeforeHandling => {
                if opens {
                    self.commit(checkpoint, position).await?;
                }
                self.handle(record, position).await
            }
            CommitStrategy::AfterHandling => {
                self.handle(record, position).await?;
                if closes {
                    self.commit(checkpoint, position).await?;
                }
                Ok(())
            }
        }
    }

    async fn handle(&self, record: &RecordedEventDescriptor, position: Position) -> Result<()> {
        match self.handler.handle(record).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                counter!("eventlog_events_processed_total", "processor" => self.config.name.clone()).increment(1);
                Ok(())
            }
            Err(source) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!("eventlog_processor_failures_total", "processor" => self.config.name.clone()).increment(1);
                let err = EventStoreError::Handler {
                    processor: self.config.name.clone(),
                    position,
                    source,
                };
                err.log();
                Err(err)
            }
        }
    }

    async fn commit(&self, checkpoint: &mut Checkpoint, position: Position) -> Result<()> {
        let next = Checkpoint {
            position,
            ..checkpoint.clone()
        };
        self.checkpoints
            .save(&next)
            .await
            .map_err(|e| self.checkpoint_error(e))?;

        gauge!("eventlog_checkpoint_position", "processor" => self.config.name.clone()).set(position.value() as f64);
        *checkpoint = next;
        Ok(())
    }

    fn checkpoint_error(&self, source: EventStoreError) -> EventStoreError {
        EventStoreError::Checkpoint {
            processor: self.config.name.clone(),
            source: Box::new(source),
        }
    }
}
