use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use factorops_core::{AggregateId, TenantId};

/// Address of one event stream: a single aggregate instance inside a tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
}

impl StreamKey {
    pub fn new(tenant_id: TenantId, aggregate_id: AggregateId) -> Self {
        Self {
            tenant_id,
            aggregate_id,
        }
    }
}

impl core::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.aggregate_id)
    }
}

/// Published form of a committed event.
///
/// `sequence_number` is the event's position in its stream (1-based, gap-free). Consumers
/// use it to drop duplicates, since the bus delivers at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    stream: StreamKey,
    aggregate_type: String,
    sequence_number: u64,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        stream: StreamKey,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            stream,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            event_type: event_type.into(),
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream(&self) -> StreamKey {
        self.stream
    }

    pub fn tenant_id(&self) -> TenantId {
        self.stream.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.stream.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// True when the event belongs to a stream of the given aggregate type.
    pub fn is_from(&self, aggregate_type: &str) -> bool {
        self.aggregate_type == aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl EventEnvelope<serde_json::Value> {
    /// Deserialize the JSON payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Renamed {
        name: String,
    }

    fn envelope(payload: serde_json::Value) -> EventEnvelope<serde_json::Value> {
        EventEnvelope::new(
            Uuid::now_v7(),
            StreamKey::new(TenantId::new(), AggregateId::new()),
            "factoring.factor",
            3,
            "factoring.factor.updated",
            Utc::now(),
            payload,
        )
    }

    #[test]
    fn stream_accessors_agree() {
        let env = envelope(serde_json::json!({}));
        assert_eq!(env.tenant_id(), env.stream().tenant_id);
        assert_eq!(env.aggregate_id(), env.stream().aggregate_id);
        assert!(env.is_from("factoring.factor"));
        assert!(!env.is_from("factoring.operation"));
    }

    #[test]
    fn decodes_typed_payload() {
        let env = envelope(serde_json::json!({ "name": "Atlas" }));
        assert_eq!(
            env.decode::<Renamed>().unwrap(),
            Renamed {
                name: "Atlas".to_string()
            }
        );
        assert!(envelope(serde_json::json!({ "other": 1 })).decode::<Renamed>().is_err());
    }
}
