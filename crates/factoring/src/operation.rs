use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use factorops_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Money, TenantId};
use factorops_events::Event;

use crate::factor::FactorId;
use crate::installment::{Custody, Installment, InstallmentId};
use crate::item::{ActionType, FactorOperationItem, ItemId, ItemStatus};
use crate::response::{FactorOperationResponse, ItemResponse, Resolution, ResponseStatus, reconcile};
use crate::settlement::SettlementSummary;
use crate::version::{FactorOperationVersion, VersionId};

/// Factor operation identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactorOperationId(pub AggregateId);

impl FactorOperationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for FactorOperationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Operation lifecycle.
///
/// `draft → sent_to_factor → in_adjustment ⇄ sent_to_factor → completed`, with
/// `cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Draft,
    SentToFactor,
    InAdjustment,
    Completed,
    Cancelled,
}

impl OperationStatus {
    /// Items and details may change.
    pub fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::InAdjustment)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::SentToFactor => "sent_to_factor",
            Self::InAdjustment => "in_adjustment",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text metadata of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDetails {
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub expected_settlement_date: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Aggregate root: FactorOperation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorOperation {
    id: FactorOperationId,
    tenant_id: Option<TenantId>,
    number: u64,
    factor_id: Option<FactorId>,
    details: OperationDetails,
    status: OperationStatus,
    version_counter: u32,
    current_version_id: Option<VersionId>,
    sent_version_id: Option<VersionId>,
    items: Vec<FactorOperationItem>,
    removed_items: Vec<FactorOperationItem>,
    versions: Vec<FactorOperationVersion>,
    responses: BTreeMap<(VersionId, ItemId), FactorOperationResponse>,
    items_changed_since_version: bool,
    gross_amount: Money,
    costs_amount: Money,
    net_amount: Money,
    settlement: Option<SettlementSummary>,
    settled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl FactorOperation {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: FactorOperationId) -> Self {
        Self {
            id,
            tenant_id: None,
            number: 0,
            factor_id: None,
            details: OperationDetails::default(),
            status: OperationStatus::Draft,
            version_counter: 0,
            current_version_id: None,
            sent_version_id: None,
            items: Vec::new(),
            removed_items: Vec::new(),
            versions: Vec::new(),
            responses: BTreeMap::new(),
            items_changed_since_version: false,
            gross_amount: Money::ZERO,
            costs_amount: Money::ZERO,
            net_amount: Money::ZERO,
            settlement: None,
            settled_at: None,
            cancel_reason: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> FactorOperationId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn factor_id(&self) -> Option<FactorId> {
        self.factor_id
    }

    pub fn details(&self) -> &OperationDetails {
        &self.details
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn version_counter(&self) -> u32 {
        self.version_counter
    }

    pub fn current_version_id(&self) -> Option<VersionId> {
        self.current_version_id
    }

    pub fn sent_version_id(&self) -> Option<VersionId> {
        self.sent_version_id
    }

    pub fn current_version(&self) -> Option<&FactorOperationVersion> {
        self.current_version_id.and_then(|id| self.version_by_id(id))
    }

    pub fn version_by_id(&self, version_id: VersionId) -> Option<&FactorOperationVersion> {
        self.versions.iter().find(|v| v.id == version_id)
    }

    /// Every generated version, oldest first.
    pub fn versions(&self) -> &[FactorOperationVersion] {
        &self.versions
    }

    /// Live items in `line_no` order.
    pub fn items(&self) -> &[FactorOperationItem] {
        &self.items
    }

    pub fn removed_items(&self) -> &[FactorOperationItem] {
        &self.removed_items
    }

    pub fn item(&self, item_id: ItemId) -> Option<&FactorOperationItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn responses_for(&self, version_id: VersionId) -> Vec<&FactorOperationResponse> {
        self.responses
            .iter()
            .filter(|((v, _), _)| *v == version_id)
            .map(|(_, r)| r)
            .collect()
    }

    pub fn gross_amount(&self) -> Money {
        self.gross_amount
    }

    pub fn costs_amount(&self) -> Money {
        self.costs_amount
    }

    pub fn net_amount(&self) -> Money {
        self.net_amount
    }

    pub fn settlement(&self) -> Option<&SettlementSummary> {
        self.settlement.as_ref()
    }

    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        self.settled_at
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Whether the package was edited after the current version was generated.
    pub fn has_unversioned_changes(&self) -> bool {
        self.items_changed_since_version
    }

    /// Where each installment settled on `version_id` ends up once the operation concludes.
    /// Rejected items and due-date changes keep their custody.
    pub fn custody_transfers(&self, version_id: VersionId) -> Vec<(InstallmentId, Custody)> {
        let Some(version) = self.version_by_id(version_id) else {
            return Vec::new();
        };
        version
            .items
            .iter()
            .filter_map(|item| {
                let response = self.responses.get(&(version_id, item.id))?;
                if response.response_status == ResponseStatus::Rejected {
                    return None;
                }
                match item.action_type {
                    ActionType::Discount => Some((item.installment_id, Custody::Factor)),
                    ActionType::Buyback => Some((item.installment_id, Custody::Company)),
                    ActionType::DueDateChange => None,
                }
            })
            .collect()
    }

    /// Installments this operation holds open (live items while not terminal).
    pub fn open_installments(&self) -> Vec<InstallmentId> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        self.items.iter().map(|i| i.installment_id).collect()
    }
}

impl AggregateRoot for FactorOperation {
    type Id = FactorOperationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOperation. `number` is the tenant-sequential display number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOperation {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub number: u64,
    pub factor_id: Option<FactorId>,
    pub details: OperationDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Partial update: `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOperationDetails {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub reference: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub expected_settlement_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem. Carries the installment as read from the eligibility provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub item_id: ItemId,
    pub action_type: ActionType,
    pub installment: Installment,
    pub custody: Custody,
    pub proposed_due_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveItem {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub item_id: ItemId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateVersion {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToFactor {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponses {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub responses: Vec<ItemResponse>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConcludeOperation. A no-op on a completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcludeOperation {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub expected_settlement_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOperation {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationCommand {
    CreateOperation(CreateOperation),
    UpdateOperationDetails(UpdateOperationDetails),
    AddItem(AddItem),
    RemoveItem(RemoveItem),
    GenerateVersion(GenerateVersion),
    SendToFactor(SendToFactor),
    ApplyResponses(ApplyResponses),
    ConcludeOperation(ConcludeOperation),
    CancelOperation(CancelOperation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCreated {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub number: u64,
    pub factor_id: FactorId,
    pub details: OperationDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Full post-update details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDetailsUpdated {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub details: OperationDetails,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub item: FactorOperationItem,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub item_id: ItemId,
    pub installment_id: InstallmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGenerated {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version: FactorOperationVersion,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSent {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub version_number: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsesApplied {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub responses: Vec<FactorOperationResponse>,
    pub resulting_status: OperationStatus,
    pub costs_amount: Money,
    pub net_amount: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationConcluded {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub version_id: VersionId,
    pub settlement: SettlementSummary,
    pub expected_settlement_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCancelled {
    pub tenant_id: TenantId,
    pub operation_id: FactorOperationId,
    pub reason: String,
    pub previous_status: OperationStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationEvent {
    OperationCreated(OperationCreated),
    OperationDetailsUpdated(OperationDetailsUpdated),
    ItemAdded(ItemAdded),
    ItemRemoved(ItemRemoved),
    VersionGenerated(VersionGenerated),
    OperationSent(OperationSent),
    ResponsesApplied(ResponsesApplied),
    OperationConcluded(OperationConcluded),
    OperationCancelled(OperationCancelled),
}

impl OperationEvent {
    pub fn operation_id(&self) -> FactorOperationId {
        match self {
            OperationEvent::OperationCreated(e) => e.operation_id,
            OperationEvent::OperationDetailsUpdated(e) => e.operation_id,
            OperationEvent::ItemAdded(e) => e.operation_id,
            OperationEvent::ItemRemoved(e) => e.operation_id,
            OperationEvent::VersionGenerated(e) => e.operation_id,
            OperationEvent::OperationSent(e) => e.operation_id,
            OperationEvent::ResponsesApplied(e) => e.operation_id,
            OperationEvent::OperationConcluded(e) => e.operation_id,
            OperationEvent::OperationCancelled(e) => e.operation_id,
        }
    }
}

impl Event for OperationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OperationEvent::OperationCreated(_) => "factoring.operation.created",
            OperationEvent::OperationDetailsUpdated(_) => "factoring.operation.details_updated",
            OperationEvent::ItemAdded(_) => "factoring.operation.item_added",
            OperationEvent::ItemRemoved(_) => "factoring.operation.item_removed",
            OperationEvent::VersionGenerated(_) => "factoring.operation.version_generated",
            OperationEvent::OperationSent(_) => "factoring.operation.sent",
            OperationEvent::ResponsesApplied(_) => "factoring.operation.responses_applied",
            OperationEvent::OperationConcluded(_) => "factoring.operation.concluded",
            OperationEvent::OperationCancelled(_) => "factoring.operation.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OperationEvent::OperationCreated(e) => e.occurred_at,
            OperationEvent::OperationDetailsUpdated(e) => e.occurred_at,
            OperationEvent::ItemAdded(e) => e.occurred_at,
            OperationEvent::ItemRemoved(e) => e.occurred_at,
            OperationEvent::VersionGenerated(e) => e.occurred_at,
            OperationEvent::OperationSent(e) => e.occurred_at,
            OperationEvent::ResponsesApplied(e) => e.occurred_at,
            OperationEvent::OperationConcluded(e) => e.settled_at,
            OperationEvent::OperationCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for FactorOperation {
    type Command = OperationCommand;
    type Event = OperationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OperationEvent::OperationCreated(e) => {
                self.id = e.operation_id;
                self.tenant_id = Some(e.tenant_id);
                self.number = e.number;
                self.factor_id = Some(e.factor_id);
                self.details = e.details.clone();
                self.status = OperationStatus::Draft;
                self.version_counter = 0;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OperationEvent::OperationDetailsUpdated(e) => {
                self.details = e.details.clone();
            }
            OperationEvent::ItemAdded(e) => {
                self.items.push(e.item.clone());
                self.items_changed_since_version = true;
            }
            OperationEvent::ItemRemoved(e) => {
                if let Some(pos) = self.items.iter().position(|i| i.id == e.item_id) {
                    let removed = self.items.remove(pos);
                    self.removed_items.push(removed);
                }
                for (idx, item) in self.items.iter_mut().enumerate() {
                    item.line_no = idx as u32 + 1;
                }
                self.items_changed_since_version = true;
            }
            OperationEvent::VersionGenerated(e) => {
                self.version_counter = e.version.version_number;
                self.current_version_id = Some(e.version.id);
                self.gross_amount = e.version.gross_amount;
                self.costs_amount = e.version.costs_amount;
                self.net_amount = e.version.net_amount;
                // Live items continue from the frozen copies.
                self.items = e.version.items.clone();
                self.versions.push(e.version.clone());
                self.items_changed_since_version = false;
            }
            OperationEvent::OperationSent(e) => {
                self.sent_version_id = Some(e.version_id);
                self.status = OperationStatus::SentToFactor;
            }
            OperationEvent::ResponsesApplied(e) => {
                for response in &e.responses {
                    if let Some(item) = self.items.iter_mut().find(|i| i.id == response.item_id) {
                        item.final_amount = Some(response.final_amount);
                        item.final_due_date = response.final_due_date;
                        item.status = ItemStatus::from(response.response_status);
                    }
                    self.responses
                        .insert((e.version_id, response.item_id), response.clone());
                }
                self.costs_amount = e.costs_amount;
                self.net_amount = e.net_amount;
                self.status = e.resulting_status;
            }
            OperationEvent::OperationConcluded(e) => {
                if e.expected_settlement_date.is_some() {
                    self.details.expected_settlement_date = e.expected_settlement_date;
                }
                if e.notes.is_some() {
                    self.details.notes = e.notes.clone();
                }
                self.settlement = Some(e.settlement);
                self.settled_at = Some(e.settled_at);
                self.status = OperationStatus::Completed;
            }
            OperationEvent::OperationCancelled(e) => {
                self.cancel_reason = Some(e.reason.clone());
                self.status = OperationStatus::Cancelled;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OperationCommand::CreateOperation(cmd) => self.handle_create(cmd),
            OperationCommand::UpdateOperationDetails(cmd) => self.handle_update_details(cmd),
            OperationCommand::AddItem(cmd) => self.handle_add_item(cmd),
            OperationCommand::RemoveItem(cmd) => self.handle_remove_item(cmd),
            OperationCommand::GenerateVersion(cmd) => self.handle_generate_version(cmd),
            OperationCommand::SendToFactor(cmd) => self.handle_send(cmd),
            OperationCommand::ApplyResponses(cmd) => self.handle_apply_responses(cmd),
            OperationCommand::ConcludeOperation(cmd) => self.handle_conclude(cmd),
            OperationCommand::CancelOperation(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl FactorOperation {
    const MIN_CANCEL_REASON_CHARS: usize = 3;

    fn ensure_existing(
        &self,
        tenant_id: TenantId,
        operation_id: FactorOperationId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("operation {operation_id}")));
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != operation_id {
            return Err(DomainError::invariant("operation_id mismatch"));
        }
        Ok(())
    }

    fn ensure_editable(&self, action: &str) -> Result<(), DomainError> {
        if !self.status.is_editable() {
            return Err(DomainError::state_conflict(format!(
                "cannot {action} while operation is {}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOperation) -> Result<Vec<OperationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("operation already exists"));
        }
        let factor_id = cmd
            .factor_id
            .ok_or_else(|| DomainError::validation("factor_id", "factor is required"))?;
        if cmd.number == 0 {
            return Err(DomainError::invariant("operation number must be positive"));
        }

        Ok(vec![OperationEvent::OperationCreated(OperationCreated {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            number: cmd.number,
            factor_id,
            details: cmd.details.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_details(
        &self,
        cmd: &UpdateOperationDetails,
    ) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        self.ensure_editable("edit details")?;

        let mut details = self.details.clone();
        if cmd.reference.is_some() {
            details.reference = cmd.reference.clone();
        }
        if cmd.issue_date.is_some() {
            details.issue_date = cmd.issue_date;
        }
        if cmd.expected_settlement_date.is_some() {
            details.expected_settlement_date = cmd.expected_settlement_date;
        }
        if cmd.notes.is_some() {
            details.notes = cmd.notes.clone();
        }

        Ok(vec![OperationEvent::OperationDetailsUpdated(OperationDetailsUpdated {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            details,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        self.ensure_editable("add items")?;

        if cmd.action_type == ActionType::DueDateChange && cmd.proposed_due_date.is_none() {
            return Err(DomainError::validation(
                "proposed_due_date",
                "due date change requires a proposed due date",
            ));
        }
        if self
            .items
            .iter()
            .any(|i| i.installment_id == cmd.installment.id)
        {
            return Err(DomainError::validation(
                "installment_id",
                format!("installment {} is already in this operation", cmd.installment.id),
            ));
        }
        if self.items.iter().any(|i| i.id == cmd.item_id) {
            return Err(DomainError::conflict(format!("item {} already exists", cmd.item_id)));
        }
        cmd.installment.ensure_eligible(cmd.action_type, cmd.custody)?;

        let line_no = u32::try_from(self.items.len() + 1)
            .map_err(|_| DomainError::invariant("too many items"))?;
        let item = FactorOperationItem::from_installment(
            cmd.item_id,
            line_no,
            cmd.action_type,
            &cmd.installment,
            cmd.proposed_due_date,
        );

        Ok(vec![OperationEvent::ItemAdded(ItemAdded {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            item,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_item(&self, cmd: &RemoveItem) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        self.ensure_editable("remove items")?;

        let item = self
            .item(cmd.item_id)
            .ok_or_else(|| DomainError::not_found(format!("item {}", cmd.item_id)))?;

        Ok(vec![OperationEvent::ItemRemoved(ItemRemoved {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            item_id: item.id,
            installment_id: item.installment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_generate_version(
        &self,
        cmd: &GenerateVersion,
    ) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        self.ensure_editable("generate a version")?;

        let rejected: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Rejected)
            .map(|i| i.line_no.to_string())
            .collect();
        if !rejected.is_empty() {
            return Err(DomainError::validation(
                "items",
                format!("remove rejected items before generating a version (lines {})", rejected.join(", ")),
            ));
        }

        let version = FactorOperationVersion::freeze(
            cmd.version_id,
            self.version_counter + 1,
            self.status,
            &self.items,
            cmd.occurred_at,
        )?;

        Ok(vec![OperationEvent::VersionGenerated(VersionGenerated {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            version,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_send(&self, cmd: &SendToFactor) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        self.ensure_editable("send to the factor")?;

        let current = self.current_version().ok_or_else(|| {
            DomainError::state_conflict("no version generated; generate a version before sending")
        })?;
        if self.items_changed_since_version {
            return Err(DomainError::state_conflict(format!(
                "items changed since version {}; generate a new version before sending",
                current.version_number
            )));
        }
        if self.sent_version_id == Some(current.id) {
            return Err(DomainError::state_conflict(format!(
                "version {} was already sent; generate a new version before sending",
                current.version_number
            )));
        }

        Ok(vec![OperationEvent::OperationSent(OperationSent {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            version_id: current.id,
            version_number: current.version_number,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_responses(
        &self,
        cmd: &ApplyResponses,
    ) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;

        if !matches!(
            self.status,
            OperationStatus::SentToFactor | OperationStatus::InAdjustment
        ) {
            return Err(DomainError::state_conflict(format!(
                "cannot apply responses while operation is {}",
                self.status
            )));
        }
        if self.current_version_id != Some(cmd.version_id) {
            return Err(DomainError::state_conflict(format!(
                "version {} is not the current version",
                cmd.version_id
            )));
        }
        if self.sent_version_id != Some(cmd.version_id) {
            return Err(DomainError::state_conflict(format!(
                "version {} was not sent to the factor",
                cmd.version_id
            )));
        }
        if self.items_changed_since_version {
            return Err(DomainError::state_conflict(format!(
                "items changed since version {} was sent; generate and send a new version",
                cmd.version_id
            )));
        }
        let version = self
            .version_by_id(cmd.version_id)
            .ok_or_else(|| DomainError::invariant("current version missing from history"))?;

        let responses = reconcile(version, &cmd.responses, cmd.occurred_at)?;

        let mut costs_amount = Money::ZERO;
        for response in &responses {
            costs_amount = costs_amount.checked_add(response.costs.total()?)?;
        }
        let net_amount = version.gross_amount.checked_sub(costs_amount)?;
        let resulting_status = match Resolution::of(&responses) {
            Resolution::ReadyToConclude => OperationStatus::SentToFactor,
            Resolution::NeedsAdjustment => OperationStatus::InAdjustment,
        };

        Ok(vec![OperationEvent::ResponsesApplied(ResponsesApplied {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            version_id: cmd.version_id,
            responses,
            resulting_status,
            costs_amount,
            net_amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_conclude(&self, cmd: &ConcludeOperation) -> Result<Vec<OperationEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;

        if self.status == OperationStatus::Completed {
            return Ok(Vec::new());
        }
        if !matches!(
            self.status,
            OperationStatus::SentToFactor | OperationStatus::InAdjustment
        ) {
            return Err(DomainError::state_conflict(format!(
                "cannot conclude while operation is {}",
                self.status
            )));
        }

        let version = self
            .current_version()
            .ok_or_else(|| DomainError::validation("responses", "operation has no version"))?;
        let responses: Vec<FactorOperationResponse> = self
            .responses_for(version.id)
            .into_iter()
            .cloned()
            .collect();
        let settlement = SettlementSummary::compute(version, &responses)?;

        Ok(vec![OperationEvent::OperationConcluded(OperationConcluded {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            version_id: version.id,
            settlement,
            expected_settlement_date: cmd.expected_settlement_date,
            notes: cmd.notes.clone(),
            settled_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOperation) -> Result<Vec<OperationEvent>, DomainError> {
        let reason = cmd.reason.trim();
        if reason.chars().count() < Self::MIN_CANCEL_REASON_CHARS {
            return Err(DomainError::validation(
                "reason",
                format!(
                    "cancel reason must have at least {} characters",
                    Self::MIN_CANCEL_REASON_CHARS
                ),
            ));
        }
        self.ensure_existing(cmd.tenant_id, cmd.operation_id)?;
        if self.status.is_terminal() {
            return Err(DomainError::state_conflict(format!(
                "cannot cancel an operation that is {}",
                self.status
            )));
        }

        Ok(vec![OperationEvent::OperationCancelled(OperationCancelled {
            tenant_id: cmd.tenant_id,
            operation_id: cmd.operation_id,
            reason: reason.to_string(),
            previous_status: self.status,
            occurred_at: cmd.occurred_at,
        })])
    }
}
