use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use factorops_core::{AggregateId, ExpectedVersion, TenantId};
use factorops_events::{EventEnvelope, StreamKey};

/// A decided event on its way into a stream. The store assigns the sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed domain event together with its stream address.
    pub fn from_typed<E>(
        stream: StreamKey,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: factorops_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            tenant_id: stream.tenant_id,
            aggregate_id: stream.aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }

    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.tenant_id, self.aggregate_id)
    }
}

/// An event as persisted. The last `sequence_number` of a stream is its revision for
/// optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// 1-based, gap-free position in the stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.tenant_id, self.aggregate_id)
    }

    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.stream(),
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, tenant-scoped event store.
///
/// An append targets exactly one stream, is checked against `expected_version`, gets
/// sequence numbers `current + 1..` and lands all-or-nothing.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Empty when the stream does not exist.
    fn load_stream(&self, stream: StreamKey) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Every stream of a tenant, each in sequence order. Used to rebuild read models.
    fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn stream_version(&self, stream: StreamKey) -> Result<u64, EventStoreError> {
        Ok(self
            .load_stream(stream)?
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(0))
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, stream: StreamKey) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream)
    }

    fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_tenant(tenant_id)
    }
}
