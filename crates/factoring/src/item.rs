//! Lines of a factor operation package.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use factorops_core::{Money, uuid_id};

use crate::installment::{Installment, InstallmentId};

uuid_id!(
    /// Identifier of an item within a factor operation.
    ItemId,
    "ItemId"
);

/// What is being negotiated with the factor for an installment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Discount,
    Buyback,
    DueDateChange,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discount => "discount",
            Self::Buyback => "buyback",
            Self::DueDateChange => "due_date_change",
        }
    }
}

/// Negotiation outcome of an item in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Accepted,
    Rejected,
    Adjusted,
}

/// An item of the package.
///
/// The `*_snapshot` fields are copied from the installment when the item is added and
/// are never re-read. Versions hold frozen clones of these items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorOperationItem {
    pub id: ItemId,
    /// 1-based, dense across live items.
    pub line_no: u32,
    pub action_type: ActionType,
    pub installment_id: InstallmentId,
    pub title_number_snapshot: String,
    pub installment_number_snapshot: u32,
    pub due_date_snapshot: NaiveDate,
    pub amount_snapshot: Money,
    /// Amount agreed in an earlier adjustment; proposed again in later versions.
    #[serde(default)]
    pub proposed_amount: Option<Money>,
    pub proposed_due_date: Option<NaiveDate>,
    pub final_due_date: Option<NaiveDate>,
    pub final_amount: Option<Money>,
    pub status: ItemStatus,
}

impl FactorOperationItem {
    pub fn from_installment(
        id: ItemId,
        line_no: u32,
        action_type: ActionType,
        installment: &Installment,
        proposed_due_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            id,
            line_no,
            action_type,
            installment_id: installment.id,
            title_number_snapshot: installment.title_number.clone(),
            installment_number_snapshot: installment.installment_number,
            due_date_snapshot: installment.due_date,
            amount_snapshot: installment.open_balance,
            proposed_amount: None,
            proposed_due_date,
            final_due_date: None,
            final_amount: None,
            status: ItemStatus::Pending,
        }
    }

    /// Amount put to the factor in the current package.
    pub fn package_amount(&self) -> Money {
        self.proposed_amount.unwrap_or(self.amount_snapshot)
    }

    /// Due date put to the factor in the current package.
    pub fn package_due_date(&self) -> NaiveDate {
        self.proposed_due_date.unwrap_or(self.due_date_snapshot)
    }

    /// Open a fresh negotiation round. Terms the factor adjusted become the proposal;
    /// snapshots stay as captured.
    pub(crate) fn begin_round(&mut self) {
        if self.status == ItemStatus::Adjusted {
            if let Some(amount) = self.final_amount {
                self.proposed_amount = Some(amount);
            }
            if let Some(due) = self.final_due_date {
                self.proposed_due_date = Some(due);
            }
        }
        self.final_due_date = None;
        self.final_amount = None;
        self.status = ItemStatus::Pending;
    }
}
