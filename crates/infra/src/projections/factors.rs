use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use factorops_core::TenantId;
use factorops_events::EventEnvelope;
use factorops_factoring::{FactorEvent, FactorId, FactorTerms};

use crate::projections::cursor::{CursorCheck, StreamCursors};
use crate::read_model::TenantStore;

pub const FACTOR_AGGREGATE: &str = "factoring.factor";

/// Factor directory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactorReadModel {
    pub factor_id: FactorId,
    pub name: String,
    pub code: Option<String>,
    pub terms: FactorTerms,
    pub active: bool,
}

#[derive(Debug, Error)]
pub enum FactorProjectionError {
    #[error("failed to deserialize factor event: {0}")]
    Deserialize(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

#[derive(Debug)]
pub struct FactorDirectoryProjection<S>
where
    S: TenantStore<FactorId, FactorReadModel>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> FactorDirectoryProjection<S>
where
    S: TenantStore<FactorId, FactorReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    /// Sorted by name.
    pub fn list(&self, tenant_id: TenantId) -> Vec<FactorReadModel> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), FactorProjectionError> {
        if !envelope.is_from(FACTOR_AGGREGATE) {
            return Ok(());
        }

        let stream = envelope.stream();
        let tenant_id = stream.tenant_id;
        let seq = envelope.sequence_number();

        match self.cursors.check(stream, seq) {
            CursorCheck::Skip => return Ok(()),
            CursorCheck::Gap { last, found } => {
                return Err(FactorProjectionError::NonMonotonicSequence { last, found });
            }
            CursorCheck::Apply => {}
        }

        let ev: FactorEvent = envelope
            .decode()
            .map_err(|e| FactorProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, factor_id) = match &ev {
            FactorEvent::FactorRegistered(e) => (e.tenant_id, e.factor_id),
            FactorEvent::FactorUpdated(e) => (e.tenant_id, e.factor_id),
            FactorEvent::FactorDeactivated(e) => (e.tenant_id, e.factor_id),
        };
        if event_tenant != tenant_id || factor_id.0 != stream.aggregate_id {
            return Err(FactorProjectionError::TenantIsolation(
                "factor event does not match its envelope".to_string(),
            ));
        }

        match ev {
            FactorEvent::FactorRegistered(e) => {
                self.store.upsert(
                    tenant_id,
                    factor_id,
                    FactorReadModel {
                        factor_id,
                        name: e.name,
                        code: e.code,
                        terms: e.terms,
                        active: true,
                    },
                );
            }
            FactorEvent::FactorUpdated(e) => {
                self.store.modify(tenant_id, &factor_id, &mut |rm| {
                    rm.name = e.name.clone();
                    rm.code = e.code.clone();
                    rm.terms = e.terms;
                });
            }
            FactorEvent::FactorDeactivated(_) => {
                self.store.modify(tenant_id, &factor_id, &mut |rm| rm.active = false);
            }
        }

        self.cursors.advance(stream, seq);
        Ok(())
    }

    pub fn rebuild_tenant(
        &self,
        tenant_id: TenantId,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), FactorProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        if envs.iter().any(|e| e.tenant_id() != tenant_id) {
            return Err(FactorProjectionError::TenantIsolation(
                "rebuild input spans tenants".to_string(),
            ));
        }
        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);

        envs.sort_by_key(|e| (e.stream(), e.sequence_number()));
        envs.iter().try_for_each(|env| self.apply_envelope(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use factorops_core::AggregateId;
    use factorops_events::StreamKey;
    use factorops_factoring::{FactorDeactivated, FactorRegistered};

    use crate::read_model::InMemoryTenantStore;

    fn envelope(stream: StreamKey, seq: u64, ev: &FactorEvent) -> EventEnvelope<JsonValue> {
        use factorops_events::Event;
        EventEnvelope::new(
            Uuid::now_v7(),
            stream,
            FACTOR_AGGREGATE,
            seq,
            ev.event_type(),
            ev.occurred_at(),
            serde_json::to_value(ev).unwrap(),
        )
    }

    type Directory = FactorDirectoryProjection<Arc<InMemoryTenantStore<FactorId, FactorReadModel>>>;

    fn directory() -> Directory {
        FactorDirectoryProjection::new(Arc::new(InMemoryTenantStore::new()))
    }

    fn registered(stream: StreamKey, name: &str) -> FactorEvent {
        FactorEvent::FactorRegistered(FactorRegistered {
            tenant_id: stream.tenant_id,
            factor_id: FactorId::new(stream.aggregate_id),
            name: name.to_string(),
            code: None,
            terms: FactorTerms::default(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn directory_tracks_registration_and_deactivation() {
        let projection = directory();
        let tenant_id = TenantId::new();
        let zeta = StreamKey::new(tenant_id, AggregateId::new());
        let alpha = StreamKey::new(tenant_id, AggregateId::new());

        projection.apply_envelope(&envelope(zeta, 1, &registered(zeta, "Zeta Capital"))).unwrap();
        projection.apply_envelope(&envelope(alpha, 1, &registered(alpha, "alpha fomento"))).unwrap();
        let deactivated = FactorEvent::FactorDeactivated(FactorDeactivated {
            tenant_id,
            factor_id: FactorId::new(zeta.aggregate_id),
            occurred_at: Utc::now(),
        });
        let env = envelope(zeta, 2, &deactivated);
        projection.apply_envelope(&env).unwrap();
        // redelivery is harmless
        projection.apply_envelope(&env).unwrap();

        let rows = projection.list(tenant_id);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha fomento", "Zeta Capital"]);
        assert!(rows[0].active);
        assert!(!rows[1].active);
        assert!(projection.list(TenantId::new()).is_empty());
    }

    #[test]
    fn foreign_payload_is_rejected() {
        let projection = directory();
        let stream = StreamKey::new(TenantId::new(), AggregateId::new());
        let other = StreamKey::new(TenantId::new(), stream.aggregate_id);

        let err = projection
            .apply_envelope(&envelope(stream, 1, &registered(other, "Atlas")))
            .unwrap_err();
        assert!(matches!(err, FactorProjectionError::TenantIsolation(_)));
    }
}
