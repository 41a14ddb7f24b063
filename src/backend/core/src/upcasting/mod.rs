//! Read-time schema evolution.
//!
//! An [`Upcaster`] rewrites records it supports into zero or more records of
//! the current schema. An [`UpcasterChain`] threads every record through its
//! stages in order, feeding each output of stage *i* into stage *i + 1* on its
//! own, and [`UpcastingEventStore`] applies a chain to every read of a wrapped
//! store.

pub mod decorator;
pub mod upcastable;

use std::sync::Arc;

use metrics::counter;
use tracing::trace;

use crate::error::Result;
use crate::events::RecordedEventDescriptor;

pub use decorator::UpcastingEventStore;
pub use upcastable::{UpcastableEventDescriptor, UpcastableEventMetadata, UpcastableEventPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// Upcaster
// ═══════════════════════════════════════════════════════════════════════════════

/// One schema migration step.
pub trait Upcaster: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn supports(&self, descriptor: &UpcastableEventDescriptor) -> bool;

    /// Replace a supported descriptor with its upcast form.
    ///
    /// Returning an empty vector drops the record; several entries split it.
    fn upcast(&self, descriptor: UpcastableEventDescriptor) -> Result<Vec<UpcastableEventDescriptor>>;
}

/// Upcaster for one stored type name, backed by a closure.
pub struct FnUpcaster<F> {
    type_name: String,
    upcast: F,
}

impl<F> FnUpcaster<F>
where
    F: Fn(UpcastableEventDescriptor) -> Result<Vec<UpcastableEventDescriptor>> + Send + Sync,
{
    pub fn new(type_name: impl Into<String>, upcast: F) -> Self {
        Self {
            type_name: type_name.into(),
            upcast,
        }
    }
}

impl<F> Upcaster for FnUpcaster<F>
where
    F: Fn(UpcastableEventDescriptor) -> Result<Vec<UpcastableEventDescriptor>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.type_name
    }

    fn supports(&self, descriptor: &UpcastableEventDescriptor) -> bool {
        descriptor.type_name() == self.type_name
    }

    fn upcast(&self, descriptor: UpcastableEventDescriptor) -> Result<Vec<UpcastableEventDescriptor>> {
        (self.upcast)(descriptor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered list of upcasters.
#[derive(Clone, Default)]
pub struct UpcasterChain {
    stages: Vec<Arc<dyn Upcaster>>,
}

impl UpcasterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage, builder style.
    pub fn with<U: Upcaster + 'static>(mut self, upcaster: U) -> Self {
        self.push(Arc::new(upcaster));
        self
    }

    pub fn push(&mut self, upcaster: Arc<dyn Upcaster>) {
        self.stages.push(upcaster);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one descriptor through every stage.
    pub fn upcast(&self, descriptor: UpcastableEventDescriptor) -> Result<Vec<UpcastableEventDescriptor>> {
        let mut output = Vec::new();
        self.thread(0, descriptor, &mut output)?;
        Ok(output)
    }

    /// Run recorded descriptors through the chain, keeping their order.
    pub fn upcast_records<I>(&self, records: I) -> Result<Vec<RecordedEventDescriptor>>
    where
        I: IntoIterator<Item = RecordedEventDescriptor>,
    {
        if self.is_empty() {
            return Ok(records.into_iter().collect());
        }

        let mut output = Vec::new();
        for record in records {
            let mut upcast = Vec::new();
            self.thread(0, record.into(), &mut upcast)?;
            output.extend(upcast.into_iter().map(UpcastableEventDescriptor::into_recorded));
        }
        Ok(output)
    }

    fn thread(
        &self,
        stage: usize,
        descriptor: UpcastableEventDescriptor,
        output: &mut Vec<UpcastableEventDescriptor>,
    ) -> Result<()> {
        let Some(upcaster) = self.stages.get(stage) else {
            output.push(descriptor);
            return Ok(());
        };

        if !upcaster.supports(&descriptor) {
            return self.thread(stage + 1, descriptor, output);
        }

        trace!(
            upcaster = upcaster.name(),
            event_id = %descriptor.id(),
            type_name = descriptor.type_name(),
            "Upcasting event"
        );
        counter!("eventlog_events_upcast_total").increment(1);

        for next in upcaster.upcast(descriptor)? {
            self.thread(stage + 1, next, output)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for UpcasterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.stages.iter().map(|s| s.name())).finish()
    }
}
