use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use factorops_core::{Money, TenantId};
use factorops_events::EventEnvelope;
use factorops_factoring::{FactorId, FactorOperationId, OperationEvent, OperationStatus};

use crate::projections::cursor::{CursorCheck, StreamCursors};
use crate::read_model::TenantStore;

pub const OPERATION_AGGREGATE: &str = "factoring.operation";

/// Listing row for factor operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSummary {
    pub operation_id: FactorOperationId,
    pub number: u64,
    pub factor_id: FactorId,
    pub status: OperationStatus,
    pub reference: Option<String>,
    pub expected_settlement_date: Option<NaiveDate>,
    pub item_count: u32,
    pub version_counter: u32,
    pub gross_amount: Money,
    pub costs_amount: Money,
    pub net_amount: Money,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum OperationProjectionError {
    #[error("failed to deserialize operation event: {0}")]
    Deserialize(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
    #[error("event for unknown operation {0}")]
    UnknownOperation(FactorOperationId),
}

/// Operation listing projection. Reads from it may lag the event stream.
#[derive(Debug)]
pub struct OperationSummaryProjection<S>
where
    S: TenantStore<FactorOperationId, OperationSummary>,
{
    store: S,
    cursors: StreamCursors,
}

impl<S> OperationSummaryProjection<S>
where
    S: TenantStore<FactorOperationId, OperationSummary>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: StreamCursors::new(),
        }
    }

    pub fn get(&self, tenant_id: TenantId, operation_id: &FactorOperationId) -> Option<OperationSummary> {
        self.store.get(tenant_id, operation_id)
    }

    /// Newest first.
    pub fn list(&self, tenant_id: TenantId) -> Vec<OperationSummary> {
        let mut rows = self.store.list(tenant_id);
        rows.sort_by(|a, b| b.number.cmp(&a.number));
        rows
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), OperationProjectionError> {
        if !envelope.is_from(OPERATION_AGGREGATE) {
            return Ok(());
        }

        let stream = envelope.stream();
        let tenant_id = stream.tenant_id;
        let seq = envelope.sequence_number();

        match self.cursors.check(stream, seq) {
            CursorCheck::Skip => return Ok(()),
            CursorCheck::Gap { last, found } => {
                return Err(OperationProjectionError::NonMonotonicSequence { last, found });
            }
            CursorCheck::Apply => {}
        }

        let ev: OperationEvent = envelope
            .decode()
            .map_err(|e| OperationProjectionError::Deserialize(e.to_string()))?;

        let operation_id = ev.operation_id();
        if operation_id.0 != stream.aggregate_id {
            return Err(OperationProjectionError::TenantIsolation(
                "event operation_id does not match envelope aggregate_id".to_string(),
            ));
        }

        if let OperationEvent::OperationCreated(e) = &ev {
            if e.tenant_id != tenant_id {
                return Err(OperationProjectionError::TenantIsolation(
                    "event tenant_id does not match envelope tenant_id".to_string(),
                ));
            }
            self.store.upsert(
                tenant_id,
                operation_id,
                OperationSummary {
                    operation_id,
                    number: e.number,
                    factor_id: e.factor_id,
                    status: OperationStatus::Draft,
                    reference: e.details.reference.clone(),
                    expected_settlement_date: e.details.expected_settlement_date,
                    item_count: 0,
                    version_counter: 0,
                    gross_amount: Money::ZERO,
                    costs_amount: Money::ZERO,
                    net_amount: Money::ZERO,
                    created_at: e.occurred_at,
                    settled_at: None,
                },
            );
            self.cursors.advance(stream, seq);
            return Ok(());
        }

        let mut row = self
            .store
            .get(tenant_id, &operation_id)
            .ok_or(OperationProjectionError::UnknownOperation(operation_id))?;

        match ev {
            OperationEvent::OperationCreated(_) => {}
            OperationEvent::OperationDetailsUpdated(e) => {
                row.reference = e.details.reference;
                row.expected_settlement_date = e.details.expected_settlement_date;
            }
            OperationEvent::ItemAdded(_) => {
                row.item_count += 1;
            }
            OperationEvent::ItemRemoved(_) => {
                row.item_count = row.item_count.saturating_sub(1);
            }
            OperationEvent::VersionGenerated(e) => {
                row.version_counter = e.version.version_number;
                row.gross_amount = e.version.gross_amount;
                row.costs_amount = e.version.costs_amount;
                row.net_amount = e.version.net_amount;
            }
            OperationEvent::OperationSent(_) => {
                row.status = OperationStatus::SentToFactor;
            }
            OperationEvent::ResponsesApplied(e) => {
                row.status = e.resulting_status;
                row.costs_amount = e.costs_amount;
                row.net_amount = e.net_amount;
            }
            OperationEvent::OperationConcluded(e) => {
                row.status = OperationStatus::Completed;
                row.settled_at = Some(e.settled_at);
                if e.expected_settlement_date.is_some() {
                    row.expected_settlement_date = e.expected_settlement_date;
                }
            }
            OperationEvent::OperationCancelled(_) => {
                row.status = OperationStatus::Cancelled;
            }
        }

        self.store.upsert(tenant_id, operation_id, row);
        self.cursors.advance(stream, seq);
        Ok(())
    }

    /// Drop every row of the tenant and replay its history. Envelopes of other tenants are
    /// refused.
    pub fn rebuild_tenant(
        &self,
        tenant_id: TenantId,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), OperationProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        if envs.iter().any(|e| e.tenant_id() != tenant_id) {
            return Err(OperationProjectionError::TenantIsolation(
                "rebuild input spans tenants".to_string(),
            ));
        }

        self.store.clear_tenant(tenant_id);
        self.cursors.clear_tenant(tenant_id);

        envs.sort_by_key(|e| (e.stream(), e.sequence_number()));
        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use factorops_core::AggregateId;
    use factorops_events::{Event, StreamKey};
    use factorops_factoring::{
        OperationCancelled, OperationCreated, OperationDetails, OperationSent, VersionId,
    };

    use crate::read_model::InMemoryTenantStore;

    type Listing = OperationSummaryProjection<Arc<InMemoryTenantStore<FactorOperationId, OperationSummary>>>;

    fn listing() -> Listing {
        OperationSummaryProjection::new(Arc::new(InMemoryTenantStore::new()))
    }

    fn envelope(stream: StreamKey, seq: u64, ev: &OperationEvent) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            stream,
            OPERATION_AGGREGATE,
            seq,
            ev.event_type(),
            ev.occurred_at(),
            serde_json::to_value(ev).unwrap(),
        )
    }

    fn created(stream: StreamKey, number: u64) -> OperationEvent {
        OperationEvent::OperationCreated(OperationCreated {
            tenant_id: stream.tenant_id,
            operation_id: FactorOperationId::new(stream.aggregate_id),
            number,
            factor_id: FactorId::new(AggregateId::new()),
            details: OperationDetails {
                reference: Some(format!("OP-{number}")),
                ..OperationDetails::default()
            },
            occurred_at: Utc::now(),
        })
    }

    fn sent(stream: StreamKey) -> OperationEvent {
        OperationEvent::OperationSent(OperationSent {
            tenant_id: stream.tenant_id,
            operation_id: FactorOperationId::new(stream.aggregate_id),
            version_id: VersionId::new(),
            version_number: 1,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn rows_follow_status_changes_newest_first() {
        let projection = listing();
        let tenant_id = TenantId::new();
        let first = StreamKey::new(tenant_id, AggregateId::new());
        let second = StreamKey::new(tenant_id, AggregateId::new());

        projection.apply_envelope(&envelope(first, 1, &created(first, 1))).unwrap();
        projection.apply_envelope(&envelope(second, 1, &created(second, 2))).unwrap();
        projection.apply_envelope(&envelope(first, 2, &sent(first))).unwrap();
        let cancelled = OperationEvent::OperationCancelled(OperationCancelled {
            tenant_id,
            operation_id: FactorOperationId::new(second.aggregate_id),
            reason: "duplicate entry".to_string(),
            previous_status: OperationStatus::Draft,
            occurred_at: Utc::now(),
        });
        projection.apply_envelope(&envelope(second, 2, &cancelled)).unwrap();

        let rows = projection.list(tenant_id);
        let view: Vec<(u64, OperationStatus)> = rows.iter().map(|r| (r.number, r.status)).collect();
        assert_eq!(
            view,
            vec![(2, OperationStatus::Cancelled), (1, OperationStatus::SentToFactor)]
        );
        assert_eq!(rows[1].reference.as_deref(), Some("OP-1"));
    }

    #[test]
    fn duplicates_are_ignored_and_gaps_reported() {
        let projection = listing();
        let stream = StreamKey::new(TenantId::new(), AggregateId::new());
        let create = envelope(stream, 1, &created(stream, 1));

        projection.apply_envelope(&create).unwrap();
        projection.apply_envelope(&create).unwrap();
        let err = projection.apply_envelope(&envelope(stream, 3, &sent(stream))).unwrap_err();
        assert!(matches!(
            err,
            OperationProjectionError::NonMonotonicSequence { last: 1, found: 3 }
        ));
        assert_eq!(projection.list(stream.tenant_id)[0].status, OperationStatus::Draft);
    }

    #[test]
    fn rebuild_replaces_tenant_rows_and_refuses_mixed_input() {
        let projection = listing();
        let stream = StreamKey::new(TenantId::new(), AggregateId::new());
        let history = vec![envelope(stream, 2, &sent(stream)), envelope(stream, 1, &created(stream, 1))];

        projection.rebuild_tenant(stream.tenant_id, history.clone()).unwrap();
        projection.rebuild_tenant(stream.tenant_id, history.clone()).unwrap();
        let rows = projection.list(stream.tenant_id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, OperationStatus::SentToFactor);

        let err = projection.rebuild_tenant(TenantId::new(), history).unwrap_err();
        assert!(matches!(err, OperationProjectionError::TenantIsolation(_)));
    }
}
