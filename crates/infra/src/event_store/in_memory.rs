use std::collections::BTreeMap;
use std::sync::RwLock;

use factorops_core::{ExpectedVersion, TenantId};
use factorops_events::StreamKey;

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Process-local event store. Streams are kept ordered by key so tenant scans are a range
/// read.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<BTreeMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// All events of one append must share tenant, aggregate and aggregate type.
fn single_stream(events: &[UncommittedEvent]) -> Result<(StreamKey, &str), EventStoreError> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend("empty batch".to_string()));
    };
    let stream = first.stream();
    for (idx, e) in events.iter().enumerate().skip(1) {
        if e.tenant_id != stream.tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch mixes tenants at index {idx}"
            )));
        }
        if e.aggregate_id != stream.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch mixes aggregates at index {idx}"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch mixes aggregate types at index {idx}"
            )));
        }
    }
    Ok((stream, first.aggregate_type.as_str()))
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let (key, aggregate_type) = single_stream(&events)?;
        let aggregate_type = aggregate_type.to_string();

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        let stream = streams.entry(key).or_default();
        let current = stream.last().map(|e| e.sequence_number).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {key}: expected {expected_version}, found {current}"
            )));
        }
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream {key} holds '{}', refused '{aggregate_type}'",
                    existing.aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, sequence_number)| StoredEvent {
                event_id: e.event_id,
                tenant_id: e.tenant_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            })
            .collect();
        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    fn load_stream(&self, stream: StreamKey) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(streams.get(&stream).cloned().unwrap_or_default())
    }

    fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(streams
            .iter()
            .filter(|(key, _)| key.tenant_id == tenant_id)
            .flat_map(|(_, events)| events.iter().cloned())
            .collect())
    }
}
