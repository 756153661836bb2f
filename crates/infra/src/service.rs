//! `DiscountingService`: the application layer over the discounting aggregates.
//!
//! Every mutation of an operation runs under a per-aggregate lock, so units of work that
//! span more than the event store (installment claim + append, ledger batch + append)
//! never interleave for the same operation. Listings are served from projections that
//! are caught up from the bus before each read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use factorops_accounting::PostedSettlement;
use factorops_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use factorops_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use factorops_factoring::{
    ActionType, AddItem, ApplyResponses, CancelOperation, ConcludeOperation, CreateOperation, Custody,
    DeactivateFactor, Factor, FactorCommand, FactorId, FactorOperation, FactorOperationId,
    FactorOperationItem, FactorOperationVersion, FactorTerms, GenerateVersion, Installment,
    InstallmentId, ItemId, ItemResponse, OperationCommand, OperationDetails, OperationEvent,
    RegisterFactor, RemoveItem, SendToFactor, SettlementSummary, UpdateFactor,
    UpdateOperationDetails, VersionId,
};

use crate::bundle::{
    BundleError, BundleSelector, DocumentBundle, DocumentBundleExporter, JsonBundleExporter,
};
use crate::claims::InstallmentClaims;
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::eligibility::{EligibilityError, EligibilityProvider};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::ledger::{
    EventSourcedLedger, FinancialLedger, LedgerError, PostingReceipt, SettlementBatch,
};
use crate::projections::{
    FACTOR_AGGREGATE, FactorDirectoryProjection, FactorReadModel, OPERATION_AGGREGATE,
    OperationSummary, OperationSummaryProjection,
};
use crate::read_model::InMemoryTenantStore;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency; retry after refreshing.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("ledger write failed: {0}")]
    LedgerWriteFailure(String),
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl From<DomainError> for ServiceError {
    fn from(value: DomainError) -> Self {
        DispatchError::from(value).into()
    }
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Validation { field, message } => ServiceError::Validation { field, message },
            DispatchError::StateConflict(msg) => ServiceError::StateConflict(msg),
            DispatchError::NotFound(msg) => ServiceError::NotFound(msg),
            DispatchError::Concurrency(msg) => ServiceError::Conflict(msg),
            other => ServiceError::Infrastructure(other.to_string()),
        }
    }
}

impl From<EligibilityError> for ServiceError {
    fn from(value: EligibilityError) -> Self {
        ServiceError::Infrastructure(value.to_string())
    }
}

impl From<LedgerError> for ServiceError {
    fn from(value: LedgerError) -> Self {
        ServiceError::Infrastructure(value.to_string())
    }
}

impl From<BundleError> for ServiceError {
    fn from(value: BundleError) -> Self {
        match value {
            BundleError::UnknownSelector(_) => ServiceError::Validation {
                field: "selector".to_string(),
                message: value.to_string(),
            },
            BundleError::NothingToExport(_) => ServiceError::StateConflict(value.to_string()),
            BundleError::Encoding(_) => ServiceError::Infrastructure(value.to_string()),
        }
    }
}

/// Result of `conclude`. `idempotent` is set when the operation was already completed
/// and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcludeOutcome {
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub idempotent: bool,
    pub settlement: SettlementSummary,
    pub receipts: Vec<PostingReceipt>,
}

#[derive(Debug, Clone, Default)]
pub struct FactorInput {
    pub name: String,
    pub code: Option<String>,
    pub terms: FactorTerms,
}

#[derive(Debug, Clone, Default)]
pub struct FactorPatch {
    pub name: Option<String>,
    pub code: Option<String>,
    pub terms: Option<FactorTerms>,
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub action_type: ActionType,
    pub installment_id: InstallmentId,
    pub proposed_due_date: Option<NaiveDate>,
}

/// A decided but not yet persisted change.
struct Decided<A: Aggregate> {
    aggregate: A,
    expected: ExpectedVersion,
    events: Vec<A::Event>,
}

type AggregateLock = Arc<Mutex<()>>;

/// Size at which idle per-aggregate locks are dropped from the table.
pub(crate) const LOCK_TABLE_PRUNE_AT: usize = 256;

pub type InMemoryDiscountingService =
    DiscountingService<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

pub struct DiscountingService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    eligibility: Arc<dyn EligibilityProvider>,
    ledger: Arc<dyn FinancialLedger>,
    exporter: Arc<dyn DocumentBundleExporter>,
    claims: InstallmentClaims,
    locks: Mutex<HashMap<(TenantId, AggregateId), AggregateLock>>,
    numbers: Mutex<HashMap<TenantId, u64>>,
    operations: OperationSummaryProjection<Arc<InMemoryTenantStore<FactorOperationId, OperationSummary>>>,
    factors: FactorDirectoryProjection<Arc<InMemoryTenantStore<FactorId, FactorReadModel>>>,
    subscription: Mutex<Subscription<EventEnvelope<JsonValue>>>,
}

impl InMemoryDiscountingService {
    /// Fully in-memory wiring: one store and bus shared by operations, factors and the ledger.
    pub fn in_memory(eligibility: Arc<dyn EligibilityProvider>) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let ledger = EventSourcedLedger::new(CommandDispatcher::new(store.clone(), bus.clone()));
        Self::new(
            CommandDispatcher::new(store, bus),
            eligibility,
            Arc::new(ledger),
            Arc::new(JsonBundleExporter),
        )
    }
}

impl<S, B> DiscountingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: CommandDispatcher<S, B>,
        eligibility: Arc<dyn EligibilityProvider>,
        ledger: Arc<dyn FinancialLedger>,
        exporter: Arc<dyn DocumentBundleExporter>,
    ) -> Self {
        let subscription = dispatcher.bus().subscribe();
        Self {
            dispatcher,
            eligibility,
            ledger,
            exporter,
            claims: InstallmentClaims::new(),
            locks: Mutex::new(HashMap::new()),
            numbers: Mutex::new(HashMap::new()),
            operations: OperationSummaryProjection::new(Arc::new(InMemoryTenantStore::new())),
            factors: FactorDirectoryProjection::new(Arc::new(InMemoryTenantStore::new())),
            subscription: Mutex::new(subscription),
        }
    }

    // ---- factors ----

    pub fn register_factor(&self, tenant_id: TenantId, input: FactorInput) -> Result<Factor, ServiceError> {
        let factor_id = FactorId::new(AggregateId::new());
        let factor = self.execute_factor(
            tenant_id,
            factor_id,
            FactorCommand::RegisterFactor(RegisterFactor {
                tenant_id,
                factor_id,
                name: input.name,
                code: input.code,
                terms: input.terms,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(tenant = %tenant_id, factor = %factor_id, name = factor.name(), "factor registered");
        Ok(factor)
    }

    pub fn update_factor(
        &self,
        tenant_id: TenantId,
        factor_id: FactorId,
        patch: FactorPatch,
    ) -> Result<Factor, ServiceError> {
        self.execute_factor(
            tenant_id,
            factor_id,
            FactorCommand::UpdateFactor(UpdateFactor {
                tenant_id,
                factor_id,
                name: patch.name,
                code: patch.code,
                terms: patch.terms,
                occurred_at: Utc::now(),
            }),
        )
    }

    pub fn deactivate_factor(&self, tenant_id: TenantId, factor_id: FactorId) -> Result<Factor, ServiceError> {
        let factor = self.execute_factor(
            tenant_id,
            factor_id,
            FactorCommand::DeactivateFactor(DeactivateFactor {
                tenant_id,
                factor_id,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(tenant = %tenant_id, factor = %factor_id, "factor deactivated");
        Ok(factor)
    }

    pub fn get_factor(&self, tenant_id: TenantId, factor_id: FactorId) -> Result<Factor, ServiceError> {
        let factor = self.load_factor(tenant_id, factor_id)?;
        if !factor.exists() {
            return Err(ServiceError::NotFound(format!("factor {factor_id}")));
        }
        Ok(factor)
    }

    pub fn list_factors(&self, tenant_id: TenantId) -> Vec<FactorReadModel> {
        self.catch_up();
        self.factors.list(tenant_id)
    }

    // ---- installments ----

    /// Open installments not already packaged in an active operation.
    pub fn eligible_installments(
        &self,
        tenant_id: TenantId,
        search: Option<&str>,
    ) -> Result<Vec<Installment>, ServiceError> {
        let mut open = self.eligibility.list_open_installments(tenant_id, search)?;
        open.retain(|i| self.claims.holder(tenant_id, i.id).is_none());
        Ok(open)
    }

    pub fn custody_installments(&self, tenant_id: TenantId) -> Result<Vec<Installment>, ServiceError> {
        Ok(self.eligibility.list_installments_in_factor_custody(tenant_id)?)
    }

    // ---- operations ----

    /// Numbers are allocated per tenant under a lock, so they stay dense.
    pub fn create_operation(
        &self,
        tenant_id: TenantId,
        factor_id: Option<FactorId>,
        details: OperationDetails,
    ) -> Result<FactorOperation, ServiceError> {
        if let Some(factor_id) = factor_id {
            self.load_factor(tenant_id, factor_id)?.ensure_usable()?;
        }

        self.catch_up();
        let mut numbers = self
            .numbers
            .lock()
            .map_err(|_| ServiceError::Infrastructure("numbering lock poisoned".to_string()))?;
        let last = match numbers.get(&tenant_id) {
            Some(n) => *n,
            None => self
                .operations
                .list(tenant_id)
                .iter()
                .map(|s| s.number)
                .max()
                .unwrap_or(0),
        };
        let number = last + 1;

        let operation_id = FactorOperationId::new(AggregateId::new());
        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::CreateOperation(CreateOperation {
                tenant_id,
                operation_id,
                number,
                factor_id,
                details,
                occurred_at: Utc::now(),
            }),
        )?;
        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;
        numbers.insert(tenant_id, number);

        info!(tenant = %tenant_id, operation = %operation_id, number, "operation created");
        Ok(op)
    }

    pub fn update_details(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        patch: OperationDetails,
    ) -> Result<FactorOperation, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::UpdateOperationDetails(UpdateOperationDetails {
                tenant_id,
                operation_id,
                reference: patch.reference,
                issue_date: patch.issue_date,
                expected_settlement_date: patch.expected_settlement_date,
                notes: patch.notes,
                occurred_at: Utc::now(),
            }),
        )?;
        Ok(self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?)
    }

    /// Snapshots the installment as the provider reports it now and claims it for this
    /// operation. The claim is dropped again if the item cannot be recorded.
    pub fn add_item(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        new_item: NewItem,
    ) -> Result<FactorOperationItem, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let (installment, custody) = self
            .eligibility
            .find_installment(tenant_id, new_item.installment_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("installment {}", new_item.installment_id)))?;

        let item_id = ItemId::new();
        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::AddItem(AddItem {
                tenant_id,
                operation_id,
                item_id,
                action_type: new_item.action_type,
                installment,
                custody,
                proposed_due_date: new_item.proposed_due_date,
                occurred_at: Utc::now(),
            }),
        )?;

        self.claims
            .claim(tenant_id, new_item.installment_id, operation_id)?;

        let op = match self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided) {
            Ok(op) => op,
            Err(err) => {
                if !err.is_after_append() {
                    self.claims.release(tenant_id, new_item.installment_id, operation_id);
                }
                return Err(err.into());
            }
        };

        let item = op
            .item(item_id)
            .cloned()
            .ok_or_else(|| ServiceError::Infrastructure(format!("item {item_id} missing after append")))?;
        info!(
            tenant = %tenant_id,
            operation = %operation_id,
            item = %item_id,
            installment = %item.installment_id,
            action = item.action_type.as_str(),
            line_no = item.line_no,
            "item added"
        );
        Ok(item)
    }

    pub fn remove_item(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        item_id: ItemId,
    ) -> Result<FactorOperation, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::RemoveItem(RemoveItem {
                tenant_id,
                operation_id,
                item_id,
                occurred_at: Utc::now(),
            }),
        )?;
        let released: Vec<InstallmentId> = decided
            .events
            .iter()
            .filter_map(|ev| match ev {
                OperationEvent::ItemRemoved(e) => Some(e.installment_id),
                _ => None,
            })
            .collect();

        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;
        self.claims.release_all(tenant_id, released, operation_id);
        info!(tenant = %tenant_id, operation = %operation_id, item = %item_id, "item removed");
        Ok(op)
    }

    pub fn generate_version(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
    ) -> Result<FactorOperationVersion, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let version_id = VersionId::new();
        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::GenerateVersion(GenerateVersion {
                tenant_id,
                operation_id,
                version_id,
                occurred_at: Utc::now(),
            }),
        )?;
        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;

        let version = op
            .version_by_id(version_id)
            .cloned()
            .ok_or_else(|| ServiceError::Infrastructure(format!("version {version_id} missing after append")))?;
        info!(
            tenant = %tenant_id,
            operation = %operation_id,
            version = version.version_number,
            items = version.total_items,
            gross = %version.gross_amount,
            "version generated"
        );
        Ok(version)
    }

    /// Sends the current version. The document bundle is exported afterwards on a
    /// best-effort basis; export failures are logged and never undo the send.
    pub fn send_to_factor(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
    ) -> Result<FactorOperation, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::SendToFactor(SendToFactor {
                tenant_id,
                operation_id,
                occurred_at: Utc::now(),
            }),
        )?;
        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;
        info!(
            tenant = %tenant_id,
            operation = %operation_id,
            version = op.version_counter(),
            "operation sent to factor"
        );

        match self.exporter.export(tenant_id, &op, BundleSelector::All) {
            Ok(bundle) => info!(
                tenant = %tenant_id,
                operation = %operation_id,
                file = %bundle.file_name,
                bytes = bundle.bytes.len(),
                "document bundle exported"
            ),
            Err(e) => warn!(tenant = %tenant_id, operation = %operation_id, error = %e, "document bundle export failed"),
        }
        Ok(op)
    }

    pub fn apply_responses(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        version_id: VersionId,
        responses: Vec<ItemResponse>,
    ) -> Result<FactorOperation, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::ApplyResponses(ApplyResponses {
                tenant_id,
                operation_id,
                version_id,
                responses,
                occurred_at: Utc::now(),
            }),
        )?;
        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;
        info!(
            tenant = %tenant_id,
            operation = %operation_id,
            version = %version_id,
            status = %op.status(),
            costs = %op.costs_amount(),
            net = %op.net_amount(),
            "factor responses applied"
        );
        Ok(op)
    }

    /// Concludes the operation and writes its settlement to the ledger.
    ///
    /// The ledger batch is written first, custody of the settled installments moves
    /// second and the conclusion is appended last. A rejected batch leaves the operation
    /// untouched. A failed custody move or append restores custody and reverses the batch.
    pub fn conclude(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        expected_settlement_date: Option<NaiveDate>,
        notes: Option<String>,
    ) -> Result<ConcludeOutcome, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::ConcludeOperation(ConcludeOperation {
                tenant_id,
                operation_id,
                expected_settlement_date,
                notes,
                occurred_at: Utc::now(),
            }),
        )?;

        let concluded = decided.events.iter().find_map(|ev| match ev {
            OperationEvent::OperationConcluded(e) => Some(e.clone()),
            _ => None,
        });
        let Some(concluded) = concluded else {
            let settlement = decided.aggregate.settlement().copied().ok_or_else(|| {
                ServiceError::Infrastructure(format!("completed operation {operation_id} has no settlement"))
            })?;
            info!(tenant = %tenant_id, operation = %operation_id, "operation already concluded");
            return Ok(ConcludeOutcome {
                operation_id,
                version_id: settlement.version_id,
                idempotent: true,
                settlement,
                receipts: Vec::new(),
            });
        };

        let postings = concluded.settlement.postings(operation_id.0);
        let batch_id = Uuid::now_v7();
        let receipts = if postings.is_empty() {
            Vec::new()
        } else {
            let version_number = decided
                .aggregate
                .version_by_id(concluded.version_id)
                .map(|v| v.version_number)
                .unwrap_or_default();
            self.ledger
                .post_settlement(
                    tenant_id,
                    SettlementBatch {
                        batch_id,
                        postings,
                        description: Some(format!(
                            "factor operation {} settlement, version {version_number}",
                            decided.aggregate.number()
                        )),
                    },
                )
                .map_err(|e| ServiceError::LedgerWriteFailure(e.to_string()))?
        };

        let installments: Vec<InstallmentId> =
            decided.aggregate.items().iter().map(|i| i.installment_id).collect();
        let transfers = decided.aggregate.custody_transfers(concluded.version_id);

        if let Err(err) = self.move_custody(tenant_id, &transfers) {
            self.reverse_batch(tenant_id, operation_id, batch_id, &receipts, &err);
            return Err(err.into());
        }

        if let Err(err) = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided) {
            if err.is_after_append() {
                // Persisted; only the publish failed.
                self.claims.release_all(tenant_id, installments, operation_id);
            } else {
                self.restore_custody(tenant_id, &transfers);
                self.reverse_batch(tenant_id, operation_id, batch_id, &receipts, &err);
            }
            return Err(err.into());
        }

        self.claims.release_all(tenant_id, installments, operation_id);
        info!(
            tenant = %tenant_id,
            operation = %operation_id,
            discount = %concluded.settlement.discount_amount,
            buyback = %concluded.settlement.buyback_amount,
            costs = %concluded.settlement.factor_costs_amount,
            postings = receipts.len(),
            custody_moves = transfers.len(),
            "operation concluded"
        );

        Ok(ConcludeOutcome {
            operation_id,
            version_id: concluded.version_id,
            idempotent: false,
            settlement: concluded.settlement,
            receipts,
        })
    }

    pub fn cancel(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        reason: &str,
    ) -> Result<FactorOperation, ServiceError> {
        let lock = self.lock_for(tenant_id, operation_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("operation lock poisoned".to_string()))?;

        let decided = self.decide_operation(
            tenant_id,
            operation_id,
            OperationCommand::CancelOperation(CancelOperation {
                tenant_id,
                operation_id,
                reason: reason.to_string(),
                occurred_at: Utc::now(),
            }),
        )?;
        let installments: Vec<InstallmentId> =
            decided.aggregate.items().iter().map(|i| i.installment_id).collect();

        let op = self.persist(tenant_id, operation_id.0, OPERATION_AGGREGATE, decided)?;
        self.claims.release_all(tenant_id, installments, operation_id);
        info!(tenant = %tenant_id, operation = %operation_id, reason = op.cancel_reason().unwrap_or_default(), "operation cancelled");
        Ok(op)
    }

    /// Operation detail, rebuilt from its event stream.
    pub fn get_operation(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
    ) -> Result<FactorOperation, ServiceError> {
        let op = self
            .dispatcher
            .load(tenant_id, operation_id.0, |_, id| FactorOperation::empty(FactorOperationId::new(id)))?
            .aggregate;
        if !op.exists() {
            return Err(ServiceError::NotFound(format!("operation {operation_id}")));
        }
        Ok(op)
    }

    pub fn list_versions(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
    ) -> Result<Vec<FactorOperationVersion>, ServiceError> {
        Ok(self.get_operation(tenant_id, operation_id)?.versions().to_vec())
    }

    /// Newest first.
    pub fn list_operations(&self, tenant_id: TenantId) -> Vec<OperationSummary> {
        self.catch_up();
        self.operations.list(tenant_id)
    }

    pub fn export_bundle(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        selector: BundleSelector,
    ) -> Result<DocumentBundle, ServiceError> {
        let op = self.get_operation(tenant_id, operation_id)?;
        Ok(self.exporter.export(tenant_id, &op, selector)?)
    }

    pub fn ledger_postings(&self, tenant_id: TenantId) -> Result<Vec<PostedSettlement>, ServiceError> {
        Ok(self.ledger.postings(tenant_id)?)
    }

    /// Throws away the tenant's listing rows and factor directory and replays them from the
    /// event store. Returns the number of events replayed.
    pub fn rebuild_read_models(&self, tenant_id: TenantId) -> Result<usize, ServiceError> {
        let Ok(subscription) = self.subscription.lock() else {
            return Err(ServiceError::Infrastructure("projection subscription lock poisoned".to_string()));
        };
        // Other tenants' queued events must not be lost; this tenant's are replayed anyway.
        self.apply_pending(&subscription);

        let envelopes: Vec<EventEnvelope<JsonValue>> = self
            .dispatcher
            .store()
            .load_tenant(tenant_id)
            .map_err(|e| ServiceError::Infrastructure(e.to_string()))?
            .iter()
            .map(|stored| stored.to_envelope())
            .collect();
        let replayed = envelopes.len();

        self.operations
            .rebuild_tenant(tenant_id, envelopes.iter().cloned())
            .map_err(|e| ServiceError::Infrastructure(e.to_string()))?;
        self.factors
            .rebuild_tenant(tenant_id, envelopes)
            .map_err(|e| ServiceError::Infrastructure(e.to_string()))?;

        info!(tenant = %tenant_id, events = replayed, "read models rebuilt");
        Ok(replayed)
    }

    // ---- internals ----

    /// Entries nobody holds are pruned once the table reaches `LOCK_TABLE_PRUNE_AT`.
    /// Handles are only cloned under the table lock, so a strong count of one means idle.
    fn lock_for(&self, tenant_id: TenantId, aggregate_id: AggregateId) -> Result<AggregateLock, ServiceError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| ServiceError::Infrastructure("lock table poisoned".to_string()))?;
        let key = (tenant_id, aggregate_id);
        if !locks.contains_key(&key) && locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(locks.entry(key).or_default().clone())
    }

    #[cfg(test)]
    pub(crate) fn lock_table_len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }

    /// Hand settled installments over. On failure the moves already made are undone.
    fn move_custody(
        &self,
        tenant_id: TenantId,
        transfers: &[(InstallmentId, Custody)],
    ) -> Result<(), EligibilityError> {
        for (done, (installment_id, custody)) in transfers.iter().enumerate() {
            if let Err(err) = self
                .eligibility
                .transfer_custody(tenant_id, *installment_id, *custody)
            {
                self.restore_custody(tenant_id, &transfers[..done]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn restore_custody(&self, tenant_id: TenantId, transfers: &[(InstallmentId, Custody)]) {
        for (installment_id, custody) in transfers {
            let previous = match custody {
                Custody::Factor => Custody::Company,
                Custody::Company => Custody::Factor,
            };
            if let Err(e) = self
                .eligibility
                .transfer_custody(tenant_id, *installment_id, previous)
            {
                warn!(tenant = %tenant_id, installment = %installment_id, error = %e, "custody restore failed");
            }
        }
    }

    fn reverse_batch(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        batch_id: Uuid,
        receipts: &[PostingReceipt],
        cause: &dyn std::fmt::Display,
    ) {
        if receipts.is_empty() {
            return;
        }
        match self.ledger.reverse_settlement(
            tenant_id,
            batch_id,
            "operation conclusion could not be recorded",
        ) {
            Ok(()) => warn!(
                tenant = %tenant_id,
                operation = %operation_id,
                batch = %batch_id,
                error = %cause,
                "conclusion failed; settlement postings reversed"
            ),
            Err(rev) => warn!(
                tenant = %tenant_id,
                operation = %operation_id,
                batch = %batch_id,
                error = %cause,
                reversal_error = %rev,
                "conclusion failed and settlement reversal failed"
            ),
        }
    }

    fn load_factor(&self, tenant_id: TenantId, factor_id: FactorId) -> Result<Factor, ServiceError> {
        Ok(self
            .dispatcher
            .load(tenant_id, factor_id.0, |_, id| Factor::empty(FactorId::new(id)))?
            .aggregate)
    }

    fn execute_factor(
        &self,
        tenant_id: TenantId,
        factor_id: FactorId,
        command: FactorCommand,
    ) -> Result<Factor, ServiceError> {
        let lock = self.lock_for(tenant_id, factor_id.0)?;
        let _guard = lock
            .lock()
            .map_err(|_| ServiceError::Infrastructure("factor lock poisoned".to_string()))?;
        let decided = self.decide(tenant_id, factor_id.0, command, |_, id| Factor::empty(FactorId::new(id)))?;
        Ok(self.persist(tenant_id, factor_id.0, FACTOR_AGGREGATE, decided)?)
    }

    fn decide_operation(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
        command: OperationCommand,
    ) -> Result<Decided<FactorOperation>, ServiceError> {
        self.decide(tenant_id, operation_id.0, command, |_, id| {
            FactorOperation::empty(FactorOperationId::new(id))
        })
    }

    fn decide<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Decided<A>, ServiceError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let loaded = self.dispatcher.load(tenant_id, aggregate_id, make_aggregate)?;
        let events = loaded.aggregate.handle(&command)?;
        Ok(Decided {
            aggregate: loaded.aggregate,
            expected: loaded.expected,
            events,
        })
    }

    fn persist<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        decided: Decided<A>,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: factorops_events::Event + Serialize,
    {
        self.dispatcher.commit::<A>(
            tenant_id,
            aggregate_id,
            aggregate_type,
            &decided.events,
            decided.expected,
        )?;
        let mut aggregate = decided.aggregate;
        for ev in &decided.events {
            aggregate.apply(ev);
        }
        Ok(aggregate)
    }

    /// Drain published envelopes into the read models.
    fn catch_up(&self) {
        let Ok(subscription) = self.subscription.lock() else {
            warn!("projection subscription lock poisoned");
            return;
        };
        self.apply_pending(&subscription);
    }

    fn apply_pending(&self, subscription: &Subscription<EventEnvelope<JsonValue>>) {
        for envelope in subscription.drain() {
            if let Err(e) = self.operations.apply_envelope(&envelope) {
                warn!(tenant = %envelope.tenant_id(), aggregate = %envelope.aggregate_id(), error = %e, "operation projection skipped event");
            }
            if let Err(e) = self.factors.apply_envelope(&envelope) {
                warn!(tenant = %envelope.tenant_id(), aggregate = %envelope.aggregate_id(), error = %e, "factor projection skipped event");
            }
        }
    }
}
