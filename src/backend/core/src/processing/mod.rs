//! Checkpointed event processing.
//!
//! - **`checkpoint`**: `Checkpoint` and the memory and PostgreSQL checkpoint stores
//! - **`processor`**: the catch-up and live `Processor`
//! - **`handlers`**: per-record handlers, including the event bus and projector bridges

pub mod checkpoint;
pub mod handlers;
pub mod processor;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use handlers::{
    EventBus, FnProcessingHandler, ProcessingHandler, Projector, SendToEventBusProcessingHandler,
    SendToProjectorProcessingHandler,
};
pub use processor::{CommitStrategy, Processor, ProcessorConfig, ProcessorStats};
