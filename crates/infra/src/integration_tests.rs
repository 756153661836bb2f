//! Integration tests for the full discounting pipeline.
//!
//! Tests: Service → Aggregate → EventStore → EventBus → Projection, plus the ledger and
//! claims side effects.
//!
//! Verifies:
//! - The package/negotiate/conclude lifecycle end to end
//! - Conclusion is idempotent and writes postings exactly once
//! - Ledger and append failures leave no half-written settlement
//! - Installments are open in at most one active operation
//! - Settled installments change custody, so a receivable is discounted once
//! - Tenant isolation is preserved

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{Days, NaiveDate};
    use uuid::Uuid;

    use factorops_accounting::{CostCategory, PostedSettlement, PostingKind};
    use factorops_core::{AggregateId, ExpectedVersion, Money, TenantId};
    use factorops_events::{EventEnvelope, InMemoryEventBus, StreamKey};
    use factorops_factoring::{
        ActionType, Custody, FactorOperationId, FactorTerms, Installment, InstallmentId,
        InstallmentStatus, ItemResponse, OperationDetails, OperationStatus,
    };

    use crate::bundle::{BundleSelector, JsonBundleExporter};
    use crate::command_dispatcher::CommandDispatcher;
    use crate::eligibility::{EligibilityError, EligibilityProvider, InMemoryEligibilityProvider};
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
    };
    use crate::ledger::{
        EventSourcedLedger, FinancialLedger, LedgerError, PostingReceipt, SettlementBatch,
    };
    use crate::service::{
        DiscountingService, FactorInput, InMemoryDiscountingService, LOCK_TABLE_PRUNE_AT, NewItem,
        ServiceError,
    };

    type Bus = Arc<InMemoryEventBus<EventEnvelope<serde_json::Value>>>;

    fn money(major: i64) -> Money {
        Money::from_major(major, 0)
    }

    fn due(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, day).unwrap()
    }

    fn installment(title: &str, cents: i64, day: u32) -> Installment {
        Installment {
            id: InstallmentId::new(),
            title_number: title.to_string(),
            installment_number: 1,
            due_date: due(day),
            status: InstallmentStatus::Open,
            open_balance: Money::from_minor(cents),
        }
    }

    struct World {
        tenant: TenantId,
        provider: Arc<InMemoryEligibilityProvider>,
        a: InstallmentId,
        b: InstallmentId,
        c: InstallmentId,
    }

    impl World {
        fn new() -> Self {
            let tenant = TenantId::new();
            let provider = Arc::new(InMemoryEligibilityProvider::new());
            let a = installment("NF-100", 100_000, 10);
            let b = installment("NF-101", 50_000, 20);
            let c = installment("NF-090", 20_000, 25);
            let ids = (a.id, b.id, c.id);
            provider.insert(tenant, a, Custody::Company);
            provider.insert(tenant, b, Custody::Company);
            provider.insert(tenant, c, Custody::Factor);
            Self {
                tenant,
                provider,
                a: ids.0,
                b: ids.1,
                c: ids.2,
            }
        }

        fn service(&self) -> InMemoryDiscountingService {
            InMemoryDiscountingService::in_memory(self.provider.clone())
        }

        fn custody_of(&self, installment_id: InstallmentId) -> Custody {
            self.provider
                .find_installment(self.tenant, installment_id)
                .unwrap()
                .unwrap()
                .1
        }
    }

    fn discount(installment_id: InstallmentId) -> NewItem {
        NewItem {
            action_type: ActionType::Discount,
            installment_id,
            proposed_due_date: None,
        }
    }

    fn buyback(installment_id: InstallmentId) -> NewItem {
        NewItem {
            action_type: ActionType::Buyback,
            installment_id,
            proposed_due_date: None,
        }
    }

    fn create_with_factor<S, B>(svc: &DiscountingService<S, B>, tenant: TenantId) -> FactorOperationId
    where
        S: EventStore,
        B: factorops_events::EventBus<EventEnvelope<serde_json::Value>>,
    {
        let factor = svc
            .register_factor(
                tenant,
                FactorInput {
                    name: "F1 Capital".to_string(),
                    code: Some("F1".to_string()),
                    terms: FactorTerms::default(),
                },
            )
            .unwrap();
        svc.create_operation(tenant, Some(factor.id_typed()), OperationDetails::default())
            .unwrap()
            .id_typed()
    }

    /// Runs scenarios 1 to 3 and applies version 2 responses, leaving the operation
    /// ready to conclude.
    fn ready_to_conclude<S, B>(svc: &DiscountingService<S, B>, w: &World) -> FactorOperationId
    where
        S: EventStore,
        B: factorops_events::EventBus<EventEnvelope<serde_json::Value>>,
    {
        let op_id = create_with_factor(svc, w.tenant);
        let item_a = svc.add_item(w.tenant, op_id, discount(w.a)).unwrap();
        let item_b = svc.add_item(w.tenant, op_id, discount(w.b)).unwrap();
        let v1 = svc.generate_version(w.tenant, op_id).unwrap();
        svc.send_to_factor(w.tenant, op_id).unwrap();
        svc.apply_responses(
            w.tenant,
            op_id,
            v1.id,
            vec![
                ItemResponse::accepted(item_a.id, money(20)),
                ItemResponse::adjusted(item_b.id, money(480), due(25), money(10)),
            ],
        )
        .unwrap();
        svc.remove_item(w.tenant, op_id, item_b.id).unwrap();
        let item_c = svc.add_item(w.tenant, op_id, buyback(w.c)).unwrap();
        let v2 = svc.generate_version(w.tenant, op_id).unwrap();
        svc.send_to_factor(w.tenant, op_id).unwrap();
        svc.apply_responses(
            w.tenant,
            op_id,
            v2.id,
            vec![
                ItemResponse::accepted(item_a.id, money(20)),
                ItemResponse::accepted(item_c.id, money(5)),
            ],
        )
        .unwrap();
        op_id
    }

    #[test]
    fn scenario_package_negotiate_and_conclude() {
        let w = World::new();
        let svc = w.service();
        let op_id = create_with_factor(&svc, w.tenant);

        // 1. package two discounts and freeze version 1
        let item_a = svc.add_item(w.tenant, op_id, discount(w.a)).unwrap();
        let item_b = svc.add_item(w.tenant, op_id, discount(w.b)).unwrap();
        assert_eq!((item_a.line_no, item_b.line_no), (1, 2));
        let v1 = svc.generate_version(w.tenant, op_id).unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v1.gross_amount, money(1500));
        assert_eq!(v1.items[0].amount_snapshot, money(1000));
        assert_eq!(v1.items[1].amount_snapshot, money(500));

        // 2. send and negotiate
        let op = svc.send_to_factor(w.tenant, op_id).unwrap();
        assert_eq!(op.status(), OperationStatus::SentToFactor);
        let adjusted_due = item_b.due_date_snapshot.checked_add_days(Days::new(5)).unwrap();
        let op = svc
            .apply_responses(
                w.tenant,
                op_id,
                v1.id,
                vec![
                    ItemResponse::accepted(item_a.id, money(20)),
                    ItemResponse::adjusted(item_b.id, money(480), adjusted_due, money(10)),
                ],
            )
            .unwrap();
        assert_eq!(op.status(), OperationStatus::InAdjustment);
        assert_eq!(op.costs_amount(), money(30));

        // 3. rework the package and resend
        svc.remove_item(w.tenant, op_id, item_b.id).unwrap();
        let item_c = svc.add_item(w.tenant, op_id, buyback(w.c)).unwrap();
        assert_eq!(item_c.line_no, 2);
        let v2 = svc.generate_version(w.tenant, op_id).unwrap();
        assert_eq!(v2.version_number, 2);
        assert_eq!(v2.gross_amount, money(1200));
        let op = svc.send_to_factor(w.tenant, op_id).unwrap();
        assert_eq!(op.status(), OperationStatus::SentToFactor);

        // version 1 is still queryable and unchanged
        let versions = svc.list_versions(w.tenant, op_id).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0], v1);

        // 4. accept everything and conclude
        let op = svc
            .apply_responses(
                w.tenant,
                op_id,
                v2.id,
                vec![
                    ItemResponse::accepted(item_a.id, money(20)),
                    ItemResponse::accepted(item_c.id, money(5)),
                ],
            )
            .unwrap();
        assert_eq!(op.status(), OperationStatus::SentToFactor);

        let outcome = svc.conclude(w.tenant, op_id, None, None).unwrap();
        assert!(!outcome.idempotent);
        assert_eq!(outcome.version_id, v2.id);
        assert_eq!(outcome.settlement.discount_amount, money(1000));
        assert_eq!(outcome.settlement.buyback_amount, money(200));
        assert_eq!(outcome.settlement.factor_costs_amount, money(25));
        assert_eq!(outcome.receipts.len(), 3);

        let op = svc.get_operation(w.tenant, op_id).unwrap();
        assert_eq!(op.status(), OperationStatus::Completed);
        assert!(op.settled_at().is_some());

        let postings = svc.ledger_postings(w.tenant).unwrap();
        let mut kinds: Vec<_> = postings.iter().map(|p| p.entry.posting.kind).collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                PostingKind::ArSettlement,
                PostingKind::ApEntry,
                PostingKind::Cost { category: CostCategory::Fee },
            ]
        );
        assert!(postings.iter().all(|p| p.entry.posting.version_id == *v2.id.as_uuid()));

        // 5. conclude again: no-op
        let again = svc.conclude(w.tenant, op_id, None, None).unwrap();
        assert!(again.idempotent);
        assert!(again.receipts.is_empty());
        assert_eq!(again.settlement, outcome.settlement);
        assert_eq!(svc.ledger_postings(w.tenant).unwrap(), postings);
        assert_eq!(
            svc.get_operation(w.tenant, op_id).unwrap().status(),
            OperationStatus::Completed
        );
    }

    #[test]
    fn scenario_cancel_requires_a_reason() {
        let w = World::new();
        let svc = w.service();
        let op_id = create_with_factor(&svc, w.tenant);
        svc.add_item(w.tenant, op_id, discount(w.a)).unwrap();

        let err = svc.cancel(w.tenant, op_id, "ok").unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "reason"));
        assert_eq!(
            svc.get_operation(w.tenant, op_id).unwrap().status(),
            OperationStatus::Draft
        );

        let op = svc.cancel(w.tenant, op_id, "duplicate entry").unwrap();
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert_eq!(op.cancel_reason(), Some("duplicate entry"));

        // the installment is free again
        let other = create_with_factor(&svc, w.tenant);
        svc.add_item(w.tenant, other, discount(w.a)).unwrap();
        assert!(svc.ledger_postings(w.tenant).unwrap().is_empty());
    }

    #[test]
    fn short_reason_is_rejected_even_when_terminal() {
        let w = World::new();
        let svc = w.service();
        let op_id = ready_to_conclude(&svc, &w);
        svc.conclude(w.tenant, op_id, None, None).unwrap();

        let err = svc.cancel(w.tenant, op_id, " x ").unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));
        let err = svc.cancel(w.tenant, op_id, "too late").unwrap_err();
        assert!(matches!(err, ServiceError::StateConflict(_)));
    }

    #[test]
    fn installment_cannot_be_open_in_two_operations() {
        let w = World::new();
        let svc = w.service();
        let first = create_with_factor(&svc, w.tenant);
        let second = create_with_factor(&svc, w.tenant);

        let item = svc.add_item(w.tenant, first, discount(w.a)).unwrap();
        let err = svc.add_item(w.tenant, second, discount(w.a)).unwrap_err();
        assert!(matches!(err, ServiceError::StateConflict(_)));

        let eligible = svc.eligible_installments(w.tenant, None).unwrap();
        assert!(eligible.iter().all(|i| i.id != w.a));

        svc.remove_item(w.tenant, first, item.id).unwrap();
        svc.add_item(w.tenant, second, discount(w.a)).unwrap();
    }

    #[test]
    fn settled_discount_cannot_be_discounted_again() {
        let w = World::new();
        let svc = w.service();
        let first = ready_to_conclude(&svc, &w);
        svc.conclude(w.tenant, first, None, None).unwrap();

        assert_eq!(w.custody_of(w.a), Custody::Factor);
        assert_eq!(w.custody_of(w.c), Custody::Company);
        let eligible: Vec<InstallmentId> = svc
            .eligible_installments(w.tenant, None)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert!(!eligible.contains(&w.a));
        assert!(eligible.contains(&w.b) && eligible.contains(&w.c));
        let custody = svc.custody_installments(w.tenant).unwrap();
        assert_eq!(custody.len(), 1);
        assert_eq!(custody[0].id, w.a);

        let second = create_with_factor(&svc, w.tenant);
        let err = svc.add_item(w.tenant, second, discount(w.a)).unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "installment_id"));

        // buying it back returns it to the company
        let item = svc.add_item(w.tenant, second, buyback(w.a)).unwrap();
        let v1 = svc.generate_version(w.tenant, second).unwrap();
        svc.send_to_factor(w.tenant, second).unwrap();
        svc.apply_responses(w.tenant, second, v1.id, vec![ItemResponse::accepted(item.id, money(3))])
            .unwrap();
        svc.conclude(w.tenant, second, None, None).unwrap();
        assert_eq!(w.custody_of(w.a), Custody::Company);

        let ar_postings = svc
            .ledger_postings(w.tenant)
            .unwrap()
            .iter()
            .filter(|p| p.entry.posting.kind == PostingKind::ArSettlement)
            .count();
        assert_eq!(ar_postings, 1);
    }

    #[test]
    fn adjusted_item_settles_at_agreed_terms() {
        let w = World::new();
        let svc = w.service();
        let op_id = create_with_factor(&svc, w.tenant);
        let item_a = svc.add_item(w.tenant, op_id, discount(w.a)).unwrap();
        let item_b = svc.add_item(w.tenant, op_id, discount(w.b)).unwrap();
        let v1 = svc.generate_version(w.tenant, op_id).unwrap();
        svc.send_to_factor(w.tenant, op_id).unwrap();
        svc.apply_responses(
            w.tenant,
            op_id,
            v1.id,
            vec![
                ItemResponse::accepted(item_a.id, money(20)),
                ItemResponse::adjusted(item_b.id, money(480), due(25), money(10)),
            ],
        )
        .unwrap();

        let v2 = svc.generate_version(w.tenant, op_id).unwrap();
        assert_eq!(v2.gross_amount, money(1480));
        let frozen_b = v2.items.iter().find(|i| i.id == item_b.id).unwrap();
        assert_eq!(frozen_b.package_amount(), money(480));
        assert_eq!(frozen_b.package_due_date(), due(25));
        assert_eq!(frozen_b.amount_snapshot, money(500));
        assert_eq!(frozen_b.due_date_snapshot, due(20));

        svc.send_to_factor(w.tenant, op_id).unwrap();
        svc.apply_responses(
            w.tenant,
            op_id,
            v2.id,
            vec![
                ItemResponse::accepted(item_a.id, money(20)),
                ItemResponse::accepted(item_b.id, money(10)),
            ],
        )
        .unwrap();
        let outcome = svc.conclude(w.tenant, op_id, None, None).unwrap();
        assert_eq!(outcome.settlement.discount_amount, money(1480));
        assert_eq!(svc.get_operation(w.tenant, op_id).unwrap().net_amount(), money(1450));
    }

    #[test]
    fn idle_operation_locks_are_pruned() {
        let w = World::new();
        let svc = w.service();
        for n in 0..LOCK_TABLE_PRUNE_AT + 40 {
            svc.register_factor(
                w.tenant,
                FactorInput {
                    name: format!("Factor {n}"),
                    ..FactorInput::default()
                },
            )
            .unwrap();
        }
        let held = svc.lock_table_len();
        assert!(held > 0 && held < LOCK_TABLE_PRUNE_AT, "lock table holds {held} entries");
    }

    #[test]
    fn add_item_rejects_ineligible_installments() {
        let w = World::new();
        let svc = w.service();
        let op_id = create_with_factor(&svc, w.tenant);

        let err = svc.add_item(w.tenant, op_id, discount(w.c)).unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "installment_id"));

        let err = svc
            .add_item(
                w.tenant,
                op_id,
                NewItem {
                    action_type: ActionType::DueDateChange,
                    installment_id: w.c,
                    proposed_due_date: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "proposed_due_date"));

        let err = svc
            .add_item(w.tenant, op_id, discount(InstallmentId::new()))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        // a failed add leaves no claim behind
        let other = create_with_factor(&svc, w.tenant);
        svc.add_item(w.tenant, other, buyback(w.c)).unwrap();
    }

    #[test]
    fn sent_operation_is_not_editable() {
        let w = World::new();
        let svc = w.service();
        let op_id = create_with_factor(&svc, w.tenant);
        let item = svc.add_item(w.tenant, op_id, discount(w.a)).unwrap();
        svc.generate_version(w.tenant, op_id).unwrap();
        svc.send_to_factor(w.tenant, op_id).unwrap();

        let err = svc.add_item(w.tenant, op_id, discount(w.b)).unwrap_err();
        assert!(matches!(err, ServiceError::StateConflict(_)));
        let err = svc.remove_item(w.tenant, op_id, item.id).unwrap_err();
        assert!(matches!(err, ServiceError::StateConflict(_)));

        // the refused add did not claim B
        let other = create_with_factor(&svc, w.tenant);
        svc.add_item(w.tenant, other, discount(w.b)).unwrap();
    }

    #[test]
    fn create_requires_known_active_factor() {
        let w = World::new();
        let svc = w.service();

        let err = svc
            .create_operation(w.tenant, None, OperationDetails::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "factor_id"));

        let unknown = factorops_factoring::FactorId::new(AggregateId::new());
        let err = svc
            .create_operation(w.tenant, Some(unknown), OperationDetails::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let factor = svc
            .register_factor(
                w.tenant,
                FactorInput {
                    name: "Closed".to_string(),
                    ..FactorInput::default()
                },
            )
            .unwrap();
        svc.deactivate_factor(w.tenant, factor.id_typed()).unwrap();
        let err = svc
            .create_operation(w.tenant, Some(factor.id_typed()), OperationDetails::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref field, .. } if field == "factor_id"));

        let listed = svc.list_factors(w.tenant);
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
    }

    #[test]
    fn listing_follows_lifecycle_and_numbers_are_dense() {
        let w = World::new();
        let svc = w.service();
        let first = ready_to_conclude(&svc, &w);
        let second = create_with_factor(&svc, w.tenant);
        svc.conclude(w.tenant, first, Some(due(30)), None).unwrap();

        let rows = svc.list_operations(w.tenant);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].operation_id, second);
        assert_eq!(rows[0].number, 2);
        assert_eq!(rows[0].status, OperationStatus::Draft);
        assert_eq!(rows[1].operation_id, first);
        assert_eq!(rows[1].number, 1);
        assert_eq!(rows[1].status, OperationStatus::Completed);
        assert_eq!(rows[1].item_count, 2);
        assert_eq!(rows[1].version_counter, 2);
        assert_eq!(rows[1].gross_amount, money(1200));
        assert_eq!(rows[1].costs_amount, money(25));
        assert_eq!(rows[1].net_amount, money(1175));
        assert_eq!(rows[1].expected_settlement_date, Some(due(30)));
    }

    #[test]
    fn read_models_rebuild_from_the_store() {
        let w = World::new();
        let svc = w.service();
        let first = ready_to_conclude(&svc, &w);
        svc.conclude(w.tenant, first, Some(due(30)), None).unwrap();
        create_with_factor(&svc, w.tenant);

        let other = World::new();
        let theirs = create_with_factor(&svc, other.tenant);

        let before = svc.list_operations(w.tenant);
        let factors_before = svc.list_factors(w.tenant);
        let replayed = svc.rebuild_read_models(w.tenant).unwrap();
        assert!(replayed > before.len());

        assert_eq!(svc.list_operations(w.tenant), before);
        assert_eq!(svc.list_factors(w.tenant), factors_before);
        // the other tenant is untouched
        let rows = svc.list_operations(other.tenant);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].operation_id, theirs);
    }

    #[test]
    fn tenants_do_not_see_each_other() {
        let w = World::new();
        let svc = w.service();
        let op_id = ready_to_conclude(&svc, &w);
        svc.conclude(w.tenant, op_id, None, None).unwrap();

        let intruder = TenantId::new();
        assert!(matches!(
            svc.get_operation(intruder, op_id),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.conclude(intruder, op_id, None, None),
            Err(ServiceError::NotFound(_))
        ));
        assert!(svc.list_operations(intruder).is_empty());
        assert!(svc.list_factors(intruder).is_empty());
        assert!(svc.ledger_postings(intruder).unwrap().is_empty());
        assert!(svc.eligible_installments(intruder, None).unwrap().is_empty());
    }

    #[test]
    fn bundle_export_filters_by_selector() {
        let w = World::new();
        let svc = w.service();
        let op_id = ready_to_conclude(&svc, &w);

        let all = svc.export_bundle(w.tenant, op_id, BundleSelector::All).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&all.bytes).unwrap();
        let versions = json["versions"].as_array().unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1]["items"].as_array().unwrap().len(), 2);

        let b = svc.export_bundle(w.tenant, op_id, BundleSelector::SourceDocsB).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&b.bytes).unwrap();
        assert_eq!(json["versions"][0]["items"].as_array().unwrap().len(), 0);
        assert_eq!(json["versions"][1]["items"].as_array().unwrap().len(), 1);
        assert_eq!(json["selector"], "source-docs-b");
    }

    // ---- failure paths ----

    /// Ledger that rejects every batch.
    struct RefusingLedger;

    impl FinancialLedger for RefusingLedger {
        fn post_settlement(&self, _: TenantId, _: SettlementBatch) -> Result<Vec<PostingReceipt>, LedgerError> {
            Err(LedgerError::Rejected("period closed".to_string()))
        }

        fn reverse_settlement(&self, _: TenantId, _: Uuid, _: &str) -> Result<(), LedgerError> {
            Ok(())
        }

        fn postings(&self, _: TenantId) -> Result<Vec<PostedSettlement>, LedgerError> {
            Ok(vec![])
        }
    }

    #[test]
    fn ledger_failure_leaves_operation_unconcluded() {
        let w = World::new();
        let svc = DiscountingService::new(
            CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), Bus::default()),
            w.provider.clone(),
            Arc::new(RefusingLedger),
            Arc::new(JsonBundleExporter),
        );
        let op_id = ready_to_conclude(&svc, &w);

        let err = svc.conclude(w.tenant, op_id, None, None).unwrap_err();
        assert!(matches!(err, ServiceError::LedgerWriteFailure(_)));
        let op = svc.get_operation(w.tenant, op_id).unwrap();
        assert_eq!(op.status(), OperationStatus::SentToFactor);
        assert!(op.settlement().is_none());
    }

    /// Store that refuses to append conclusions while `fail_conclusions` is set.
    struct FlakyStore {
        inner: Arc<InMemoryEventStore>,
        fail_conclusions: AtomicBool,
    }

    impl EventStore for FlakyStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            if self.fail_conclusions.load(Ordering::SeqCst)
                && events.iter().any(|e| e.event_type == "factoring.operation.concluded")
            {
                return Err(EventStoreError::Unavailable("disk full".to_string()));
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(&self, stream: StreamKey) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(stream)
        }

        fn load_tenant(&self, tenant_id: TenantId) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_tenant(tenant_id)
        }
    }

    #[test]
    fn failed_append_reverses_ledger_batch() {
        let w = World::new();
        let inner = Arc::new(InMemoryEventStore::new());
        let bus = Bus::default();
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            fail_conclusions: AtomicBool::new(true),
        });
        let ledger = Arc::new(EventSourcedLedger::new(CommandDispatcher::new(inner, bus.clone())));
        let svc = DiscountingService::new(
            CommandDispatcher::new(store.clone(), bus),
            w.provider.clone(),
            ledger.clone(),
            Arc::new(JsonBundleExporter),
        );
        let op_id = ready_to_conclude(&svc, &w);

        let err = svc.conclude(w.tenant, op_id, None, None).unwrap_err();
        assert!(matches!(err, ServiceError::Infrastructure(_)));
        assert!(ledger.postings(w.tenant).unwrap().is_empty());
        assert_eq!(
            svc.get_operation(w.tenant, op_id).unwrap().status(),
            OperationStatus::SentToFactor
        );
        assert_eq!(w.custody_of(w.a), Custody::Company);
        assert_eq!(w.custody_of(w.c), Custody::Factor);

        // once the store recovers the same keys can be posted
        store.fail_conclusions.store(false, Ordering::SeqCst);
        let outcome = svc.conclude(w.tenant, op_id, None, None).unwrap();
        assert!(!outcome.idempotent);
        assert_eq!(ledger.postings(w.tenant).unwrap().len(), 3);
        assert_eq!(w.custody_of(w.a), Custody::Factor);
    }

    /// Provider that cannot hand one installment over.
    struct StuckCustody {
        inner: Arc<InMemoryEligibilityProvider>,
        stuck: InstallmentId,
    }

    impl EligibilityProvider for StuckCustody {
        fn list_open_installments(
            &self,
            tenant_id: TenantId,
            search: Option<&str>,
        ) -> Result<Vec<Installment>, EligibilityError> {
            self.inner.list_open_installments(tenant_id, search)
        }

        fn list_installments_in_factor_custody(
            &self,
            tenant_id: TenantId,
        ) -> Result<Vec<Installment>, EligibilityError> {
            self.inner.list_installments_in_factor_custody(tenant_id)
        }

        fn find_installment(
            &self,
            tenant_id: TenantId,
            installment_id: InstallmentId,
        ) -> Result<Option<(Installment, Custody)>, EligibilityError> {
            self.inner.find_installment(tenant_id, installment_id)
        }

        fn transfer_custody(
            &self,
            tenant_id: TenantId,
            installment_id: InstallmentId,
            custody: Custody,
        ) -> Result<(), EligibilityError> {
            if installment_id == self.stuck {
                return Err(EligibilityError::Unavailable("receivables offline".to_string()));
            }
            self.inner.transfer_custody(tenant_id, installment_id, custody)
        }
    }

    #[test]
    fn failed_custody_move_undoes_the_conclusion() {
        let w = World::new();
        let provider = Arc::new(StuckCustody {
            inner: w.provider.clone(),
            stuck: w.c,
        });
        let svc = InMemoryDiscountingService::in_memory(provider);
        let op_id = ready_to_conclude(&svc, &w);

        let err = svc.conclude(w.tenant, op_id, None, None).unwrap_err();
        assert!(matches!(err, ServiceError::Infrastructure(_)));
        assert!(svc.ledger_postings(w.tenant).unwrap().is_empty());
        assert_eq!(
            svc.get_operation(w.tenant, op_id).unwrap().status(),
            OperationStatus::SentToFactor
        );
        // the discount moved first and was put back
        assert_eq!(w.custody_of(w.a), Custody::Company);
        assert_eq!(w.custody_of(w.c), Custody::Factor);
    }

    // ---- properties ----

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Accept,
        Adjust,
        Reject,
    }

    fn outcome() -> impl proptest::strategy::Strategy<Value = Outcome> {
        use proptest::prelude::*;
        prop_oneof![Just(Outcome::Accept), Just(Outcome::Adjust), Just(Outcome::Reject)]
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn concluding_twice_posts_once(
            plan in proptest::collection::vec((outcome(), 0i64..5_000), 1..5)
        ) {
            let tenant = TenantId::new();
            let provider = Arc::new(InMemoryEligibilityProvider::new());
            let mut ids = Vec::new();
            for (i, _) in plan.iter().enumerate() {
                let inst = installment(&format!("NF-{i}"), 10_000 * (i as i64 + 1), 5);
                ids.push(inst.id);
                provider.insert(tenant, inst, Custody::Company);
            }
            let svc = InMemoryDiscountingService::in_memory(provider);
            let op_id = create_with_factor(&svc, tenant);
            for id in &ids {
                svc.add_item(tenant, op_id, discount(*id)).unwrap();
            }
            let version = svc.generate_version(tenant, op_id).unwrap();
            svc.send_to_factor(tenant, op_id).unwrap();

            let responses = version
                .items
                .iter()
                .zip(&plan)
                .map(|(item, (kind, fee))| {
                    let fee = Money::from_minor(*fee);
                    match kind {
                        Outcome::Accept => ItemResponse::accepted(item.id, fee),
                        Outcome::Adjust => ItemResponse::adjusted(
                            item.id,
                            Money::from_minor(item.amount_snapshot.minor() / 2),
                            due(28),
                            fee,
                        ),
                        Outcome::Reject => ItemResponse::rejected(item.id, "not eligible"),
                    }
                })
                .collect();
            svc.apply_responses(tenant, op_id, version.id, responses).unwrap();

            let first = svc.conclude(tenant, op_id, None, None).unwrap();
            let postings = svc.ledger_postings(tenant).unwrap();
            let second = svc.conclude(tenant, op_id, None, None).unwrap();

            proptest::prop_assert!(!first.idempotent);
            proptest::prop_assert!(second.idempotent);
            proptest::prop_assert_eq!(first.settlement, second.settlement);
            proptest::prop_assert_eq!(postings.len(), first.receipts.len());
            proptest::prop_assert_eq!(svc.ledger_postings(tenant).unwrap(), postings);
        }
    }
}
