use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use factorops_core::{Money, Rate};
use factorops_factoring::{
    ActionType, Factor, FactorId, FactorOperation, FactorOperationId, FactorOperationItem,
    FactorOperationResponse, FactorOperationVersion, FactorTerms, InstallmentId, ItemResponse,
    OperationDetails, OperationStatus, SettlementSummary, VersionId,
};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateFactorRequest {
    pub name: String,
    pub code: Option<String>,
    #[serde(default)]
    pub terms: FactorTerms,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFactorRequest {
    pub name: Option<String>,
    pub code: Option<String>,
    pub terms: Option<FactorTerms>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOperationRequest {
    pub factor_id: Option<String>,
    #[serde(flatten)]
    pub details: OperationDetails,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOperationRequest {
    #[serde(flatten)]
    pub details: OperationDetails,
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub action_type: ActionType,
    pub installment_id: InstallmentId,
    pub proposed_due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyResponsesRequest {
    pub version_id: VersionId,
    pub responses: Vec<ItemResponse>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConcludeRequest {
    pub expected_settlement_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct EligibleQuery {
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BundleQuery {
    pub selector: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct FactorResponse {
    pub id: FactorId,
    pub name: String,
    pub code: Option<String>,
    pub interest_rate: Rate,
    pub fee_rate: Rate,
    pub iof_rate: Rate,
    pub other_cost_rate: Rate,
    pub grace_days: u32,
    pub active: bool,
}

impl From<&Factor> for FactorResponse {
    fn from(f: &Factor) -> Self {
        let terms = f.terms();
        Self {
            id: f.id_typed(),
            name: f.name().to_string(),
            code: f.code().map(str::to_string),
            interest_rate: terms.interest_rate,
            fee_rate: terms.fee_rate,
            iof_rate: terms.iof_rate,
            other_cost_rate: terms.other_cost_rate,
            grace_days: terms.grace_days,
            active: f.is_active(),
        }
    }
}

/// Full operation detail as rebuilt from its stream.
#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub id: FactorOperationId,
    pub number: u64,
    pub factor_id: Option<FactorId>,
    pub status: OperationStatus,
    #[serde(flatten)]
    pub details: OperationDetails,
    pub version_counter: u32,
    pub current_version_id: Option<VersionId>,
    pub sent_version_id: Option<VersionId>,
    pub gross_amount: Money,
    pub costs_amount: Money,
    pub net_amount: Money,
    pub items: Vec<FactorOperationItem>,
    pub removed_items: Vec<FactorOperationItem>,
    /// Responses recorded against the current version.
    pub responses: Vec<FactorOperationResponse>,
    pub settlement: Option<SettlementSummary>,
    pub settled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&FactorOperation> for OperationResponse {
    fn from(op: &FactorOperation) -> Self {
        let responses = op
            .current_version_id()
            .map(|v| op.responses_for(v).into_iter().cloned().collect())
            .unwrap_or_default();
        Self {
            id: op.id_typed(),
            number: op.number(),
            factor_id: op.factor_id(),
            status: op.status(),
            details: op.details().clone(),
            version_counter: op.version_counter(),
            current_version_id: op.current_version_id(),
            sent_version_id: op.sent_version_id(),
            gross_amount: op.gross_amount(),
            costs_amount: op.costs_amount(),
            net_amount: op.net_amount(),
            items: op.items().to_vec(),
            removed_items: op.removed_items().to_vec(),
            responses,
            settlement: op.settlement().copied(),
            settled_at: op.settled_at(),
            cancel_reason: op.cancel_reason().map(str::to_string),
            created_at: op.created_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub operation_id: FactorOperationId,
    pub versions: Vec<FactorOperationVersion>,
}
