//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (tenant-scoped) and validate the stream
//!   ↓
//! 2. Rehydrate aggregate
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, checked against the revision read in step 1)
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! `dispatch` runs all five steps. Callers that need a side effect between deciding and
//! persisting (the settlement ledger write on conclusion) use `load` and `commit` directly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use factorops_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use factorops_events::{EventBus, EventEnvelope, StreamKey};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Tenant isolation violation (cross-tenant or cross-aggregate stream mixing).
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    /// Domain validation failure (deterministic).
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },
    /// Mutation outside the allowed status set.
    #[error("state conflict: {0}")]
    StateConflict(String),
    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// The events were persisted even though the call failed.
    pub fn is_after_append(&self) -> bool {
        matches!(self, DispatchError::Publish(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation { field, message } => DispatchError::Validation { field, message },
            DomainError::StateConflict(msg) => DispatchError::StateConflict(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound(msg) => DispatchError::NotFound(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation {
                field: "id".to_string(),
                message: msg,
            },
        }
    }
}

/// A rehydrated aggregate plus the stream revision it was built from.
#[derive(Debug)]
pub struct Loaded<A> {
    pub aggregate: A,
    pub expected: ExpectedVersion,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run on `InMemoryEventStore` and
/// `InMemoryEventBus`. Events are persisted before they are published; if publication
/// fails the events stay persisted (at-least-once delivery).
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full pipeline and return the committed events.
    ///
    /// An empty decision (idempotent command) appends and publishes nothing.
    pub fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: factorops_events::Event + Serialize + DeserializeOwned,
    {
        let loaded = self.load(tenant_id, aggregate_id, make_aggregate)?;
        let decided = loaded.aggregate.handle(&command)?;
        self.commit::<A>(tenant_id, aggregate_id, aggregate_type, &decided, loaded.expected)
    }

    /// Load and rehydrate an aggregate (steps 1 and 2).
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Loaded<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let stream = StreamKey::new(tenant_id, aggregate_id);
        let history = self.store.load_stream(stream)?;
        validate_loaded_stream(stream, &history)?;

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        Ok(Loaded {
            aggregate,
            expected: ExpectedVersion::for_stream(stream_version(&history)),
        })
    }

    /// Persist decided events and publish them (steps 4 and 5).
    pub fn commit<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        decided: &[A::Event],
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate,
        A::Event: factorops_events::Event + Serialize,
    {
        if decided.is_empty() {
            return Ok(vec![]);
        }

        let stream = StreamKey::new(tenant_id, aggregate_id);
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(stream, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(stream: StreamKey, history: &[StoredEvent]) -> Result<(), DispatchError> {
    // A backend must never hand back another tenant's events.
    let mut last = 0u64;
    for (idx, e) in history.iter().enumerate() {
        if e.tenant_id != stream.tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "stream {stream} holds a foreign tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != stream.aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "stream {stream} holds a foreign aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
