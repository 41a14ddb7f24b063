//! Handlers a processor invokes once per record.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::events::{EventConverter, RecordedEventDescriptor};

/// Work done for each processed record.
#[async_trait]
pub trait ProcessingHandler: Send + Sync {
    async fn handle(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()>;
}

/// Handler backed by a synchronous closure.
pub struct FnProcessingHandler<F> {
    handle: F,
}

impl<F> FnProcessingHandler<F>
where
    F: Fn(&RecordedEventDescriptor) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(handle: F) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl<F> ProcessingHandler for FnProcessingHandler<F>
where
    F: Fn(&RecordedEventDescriptor) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()> {
        (self.handle)(record)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for decoded domain events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Box<dyn Any + Send + Sync>, record: &RecordedEventDescriptor) -> anyhow::Result<()>;
}

/// Decodes each record through an [`EventConverter`] and publishes it.
///
/// Records whose type the converter's registry does not know are skipped,
/// which covers the technical markers seen on the global stream.
pub struct SendToEventBusProcessingHandler {
    converter: EventConverter,
    bus: Arc<dyn EventBus>,
}

impl SendToEventBusProcessingHandler {
    pub fn new(converter: EventConverter, bus: Arc<dyn EventBus>) -> Self {
        Self { converter, bus }
    }
}

#[async_trait]
impl ProcessingHandler for SendToEventBusProcessingHandler {
    async fn handle(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()> {
        if !self.converter.registry().contains(record.type_name()) {
            debug!(type_name = record.type_name(), "Skipping unregistered event type");
            return Ok(());
        }
        let event = self.converter.decode_any(record)?;
        self.bus.publish(event, record).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projector
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-model builder fed with recorded events.
#[async_trait]
pub trait Projector: Send + Sync {
    async fn project(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()>;
}

/// Forwards each record to a [`Projector`].
pub struct SendToProjectorProcessingHandler {
    projector: Arc<dyn Projector>,
}

impl SendToProjectorProcessingHandler {
    pub fn new(projector: Arc<dyn Projector>) -> Self {
        Self { projector }
    }
}

#[async_trait]
impl ProcessingHandler for SendToProjectorProcessingHandler {
    async fn handle(&self, record: &RecordedEventDescriptor) -> anyhow::Result<()> {
        self.projector.project(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DomainEvent, EventDescriptor, EventTypeRegistry, SequenceNumber, StreamId, StreamVersion};
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct AccountOpened {
        owner: String,
    }

    impl DomainEvent for AccountOpened {
        const TYPE_NAME: &'static str = "account_opened";
    }

    #[derive(Default)]
    struct RecordingBus {
        owners: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        async fn publish(&self, event: Box<dyn Any + Send + Sync>, _record: &RecordedEventDescriptor) -> anyhow::Result<()> {
            let opened = event
                .downcast::<AccountOpened>()
                .map_err(|_| anyhow::anyhow!("unexpected event type"))?;
            self.owners.lock().push(opened.owner);
            Ok(())
        }
    }

    fn record(type_name: &str, payload: serde_json::Value) -> RecordedEventDescriptor {
        RecordedEventDescriptor::new(
            EventDescriptor::new("e1", type_name, payload),
            StreamId::new("account-1"),
            StreamVersion::new(0),
            SequenceNumber::new(1),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_event_bus_handler_decodes_registered_types() {
        let registry = Arc::new(EventTypeRegistry::new().with::<AccountOpened>());
        let bus = Arc::new(RecordingBus::default());
        let handler = SendToEventBusProcessingHandler::new(EventConverter::new(registry), bus.clone());

        handler
            .handle(&record("account_opened", json!({ "owner": "jane" })))
            .await
            .unwrap();
        handler
            .handle(&record("es.stream.deleted", json!({ "stream_id": "x" })))
            .await
            .unwrap();

        assert_eq!(*bus.owners.lock(), vec!["jane".to_string()]);
    }

    #[tokio::test]
    async fn test_fn_handler_propagates_errors() {
        let handler = FnProcessingHandler::new(|_: &RecordedEventDescriptor| anyhow::bail!("boom"));
        let err = handler.handle(&record("t", json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
