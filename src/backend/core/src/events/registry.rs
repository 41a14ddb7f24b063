//! Explicit registry of domain event types and the converter built on it.
//!
//! The registry is an ordinary value: build it once at startup, wrap it in an
//! `Arc` and hand it to whatever needs to decode events.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::descriptor::{EventDescriptor, EventPayload, RecordedEventDescriptor};
use super::id::EventId;
use crate::error::{EventStoreError, Result};

/// A typed domain event with a stable wire name.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

type Decoder = fn(&EventPayload) -> serde_json::Result<Box<dyn Any + Send + Sync>>;

fn decode_boxed<E: DomainEvent>(payload: &EventPayload) -> serde_json::Result<Box<dyn Any + Send + Sync>> {
    let event: E = payload.deserialize()?;
    Ok(Box::new(event))
}

/// Maps type names to decoders.
#[derive(Default)]
pub struct EventTypeRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under `E::TYPE_NAME`. Registering twice is a no-op.
    pub fn register<E: DomainEvent>(&mut self) -> &mut Self {
        self.decoders.insert(E::TYPE_NAME, decode_boxed::<E>);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<E: DomainEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn decoder(&self, type_name: &str) -> Result<Decoder> {
        self.decoders
            .get(type_name)
            .copied()
            .ok_or_else(|| EventStoreError::UnknownEventType(type_name.to_string()))
    }
}

impl std::fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Converts between typed domain events and descriptors.
#[derive(Debug, Clone)]
pub struct EventConverter {
    registry: Arc<EventTypeRegistry>,
}

impl EventConverter {
    pub fn new(registry: Arc<EventTypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Describe a typed event for appending.
    pub fn to_descriptor<E: DomainEvent>(&self, id: impl Into<EventId>, event: &E) -> Result<EventDescriptor> {
        if !self.registry.contains(E::TYPE_NAME) {
            return Err(EventStoreError::UnknownEventType(E::TYPE_NAME.to_string()));
        }
        Ok(EventDescriptor::new(
            id,
            E::TYPE_NAME,
            EventPayload::from_serializable(event)?,
        ))
    }

    /// Decode a record into a known type.
    pub fn decode<E: DomainEvent>(&self, recorded: &RecordedEventDescriptor) -> Result<E> {
        if recorded.type_name() != E::TYPE_NAME {
            return Err(EventStoreError::UnknownEventType(recorded.type_name().to_string()));
        }
        Ok(recorded.payload().deserialize()?)
    }

    /// Decode a record into whatever type is registered under its name.
    pub fn decode_any(&self, recorded: &RecordedEventDescriptor) -> Result<Box<dyn Any + Send + Sync>> {
        let decoder = self.registry.decoder(recorded.type_name())?;
        Ok(decoder(recorded.payload())?)
    }
}
