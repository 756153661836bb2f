//! Reconciliation of the factor's per-item determination against a version.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use factorops_core::{DomainError, DomainResult, Money};

use crate::item::{FactorOperationItem, ItemId, ItemStatus};
use crate::version::{FactorOperationVersion, VersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Pending,
    Accepted,
    Rejected,
    Adjusted,
}

impl From<ResponseStatus> for ItemStatus {
    fn from(value: ResponseStatus) -> Self {
        match value {
            ResponseStatus::Pending => ItemStatus::Pending,
            ResponseStatus::Accepted => ItemStatus::Accepted,
            ResponseStatus::Rejected => ItemStatus::Rejected,
            ResponseStatus::Adjusted => ItemStatus::Adjusted,
        }
    }
}

/// Largest amount accepted in a response field (100 billion in major units). Keeps every
/// per-version total far from `i64` overflow.
pub const MAX_RESPONSE_AMOUNT: Money = Money::from_minor(10_000_000_000_000);

fn ensure_amount_in_range(field: &str, amount: Money) -> DomainResult<()> {
    if amount.is_negative() {
        return Err(DomainError::validation(field, format!("{field} cannot be negative")));
    }
    if amount > MAX_RESPONSE_AMOUNT {
        return Err(DomainError::validation(
            field,
            format!("{field} exceeds the maximum of {MAX_RESPONSE_AMOUNT}"),
        ));
    }
    Ok(())
}

/// Costs charged by the factor for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    #[serde(default)]
    pub fee_amount: Money,
    #[serde(default)]
    pub interest_amount: Money,
    #[serde(default)]
    pub iof_amount: Money,
    #[serde(default)]
    pub other_cost_amount: Money,
}

impl CostBreakdown {
    pub fn total(&self) -> DomainResult<Money> {
        Money::sum([
            self.fee_amount,
            self.interest_amount,
            self.iof_amount,
            self.other_cost_amount,
        ])
    }

    pub fn checked_add(&self, other: &CostBreakdown) -> DomainResult<CostBreakdown> {
        Ok(CostBreakdown {
            fee_amount: self.fee_amount.checked_add(other.fee_amount)?,
            interest_amount: self.interest_amount.checked_add(other.interest_amount)?,
            iof_amount: self.iof_amount.checked_add(other.iof_amount)?,
            other_cost_amount: self.other_cost_amount.checked_add(other.other_cost_amount)?,
        })
    }

    fn ensure_in_range(&self) -> DomainResult<()> {
        for (field, amount) in [
            ("fee_amount", self.fee_amount),
            ("interest_amount", self.interest_amount),
            ("iof_amount", self.iof_amount),
            ("other_cost_amount", self.other_cost_amount),
        ] {
            ensure_amount_in_range(field, amount)?;
        }
        Ok(())
    }
}

/// The factor's answer for one item, as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResponse {
    pub item_id: ItemId,
    pub response_status: ResponseStatus,
    #[serde(default)]
    pub response_code: Option<String>,
    #[serde(default)]
    pub response_message: Option<String>,
    #[serde(default)]
    pub accepted_amount: Option<Money>,
    #[serde(default)]
    pub adjusted_amount: Option<Money>,
    #[serde(default)]
    pub adjusted_due_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub costs: CostBreakdown,
}

impl ItemResponse {
    /// Shorthand for an acceptance carrying only a fee.
    pub fn accepted(item_id: ItemId, fee_amount: Money) -> Self {
        Self {
            item_id,
            response_status: ResponseStatus::Accepted,
            response_code: None,
            response_message: None,
            accepted_amount: None,
            adjusted_amount: None,
            adjusted_due_date: None,
            costs: CostBreakdown {
                fee_amount,
                ..CostBreakdown::default()
            },
        }
    }

    pub fn rejected(item_id: ItemId, message: impl Into<String>) -> Self {
        Self {
            item_id,
            response_status: ResponseStatus::Rejected,
            response_code: None,
            response_message: Some(message.into()),
            accepted_amount: None,
            adjusted_amount: None,
            adjusted_due_date: None,
            costs: CostBreakdown::default(),
        }
    }

    pub fn adjusted(
        item_id: ItemId,
        adjusted_amount: Money,
        adjusted_due_date: NaiveDate,
        fee_amount: Money,
    ) -> Self {
        Self {
            item_id,
            response_status: ResponseStatus::Adjusted,
            response_code: None,
            response_message: None,
            accepted_amount: None,
            adjusted_amount: Some(adjusted_amount),
            adjusted_due_date: Some(adjusted_due_date),
            costs: CostBreakdown {
                fee_amount,
                ..CostBreakdown::default()
            },
        }
    }
}

/// Recorded response, bound to an `(item, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorOperationResponse {
    pub item_id: ItemId,
    pub version_id: VersionId,
    pub response_status: ResponseStatus,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub accepted_amount: Option<Money>,
    pub adjusted_amount: Option<Money>,
    pub adjusted_due_date: Option<NaiveDate>,
    pub costs: CostBreakdown,
    /// Amount the factor settles for the item (zero when rejected).
    pub final_amount: Money,
    pub final_due_date: Option<NaiveDate>,
    pub responded_at: DateTime<Utc>,
}

/// Outcome of a complete response set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Every item accepted; the operation may be concluded.
    ReadyToConclude,
    /// At least one item rejected or adjusted; the package must be revised and resent.
    NeedsAdjustment,
}

impl Resolution {
    pub fn of<'a, I>(responses: I) -> Self
    where
        I: IntoIterator<Item = &'a FactorOperationResponse>,
    {
        let all_accepted = responses
            .into_iter()
            .all(|r| r.response_status == ResponseStatus::Accepted);
        if all_accepted {
            Resolution::ReadyToConclude
        } else {
            Resolution::NeedsAdjustment
        }
    }
}

/// Validate `inputs` against every item frozen in `version` and resolve final terms.
///
/// All-or-nothing: any problem fails the whole set and nothing is returned.
pub fn reconcile(
    version: &FactorOperationVersion,
    inputs: &[ItemResponse],
    responded_at: DateTime<Utc>,
) -> DomainResult<Vec<FactorOperationResponse>> {
    let mut by_item: BTreeMap<ItemId, &ItemResponse> = BTreeMap::new();
    for input in inputs {
        if version.item(&input.item_id).is_none() {
            return Err(DomainError::not_found(format!(
                "item {} is not part of version {}",
                input.item_id, version.version_number
            )));
        }
        if by_item.insert(input.item_id, input).is_some() {
            return Err(DomainError::validation(
                "responses",
                format!("duplicate response for item {}", input.item_id),
            ));
        }
    }

    let unresolved: BTreeSet<ItemId> = version
        .items
        .iter()
        .filter(|item| {
            by_item
                .get(&item.id)
                .is_none_or(|r| r.response_status == ResponseStatus::Pending)
        })
        .map(|item| item.id)
        .collect();
    if !unresolved.is_empty() {
        let ids = unresolved
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DomainError::validation(
            "responses",
            format!("items without a resolved response: {ids}"),
        ));
    }

    version
        .items
        .iter()
        .map(|item| resolve(item, version.id, by_item[&item.id], responded_at))
        .collect()
}

fn resolve(
    item: &FactorOperationItem,
    version_id: VersionId,
    input: &ItemResponse,
    responded_at: DateTime<Utc>,
) -> DomainResult<FactorOperationResponse> {
    input.costs.ensure_in_range()?;

    let (final_amount, final_due_date) = match input.response_status {
        ResponseStatus::Accepted => {
            let amount = input.accepted_amount.unwrap_or(item.package_amount());
            ensure_amount_in_range("accepted_amount", amount)?;
            (amount, Some(item.package_due_date()))
        }
        ResponseStatus::Adjusted => {
            let amount = input.adjusted_amount.ok_or_else(|| {
                DomainError::validation(
                    "adjusted_amount",
                    format!("adjusted response for item {} needs an amount", item.id),
                )
            })?;
            let due = input.adjusted_due_date.ok_or_else(|| {
                DomainError::validation(
                    "adjusted_due_date",
                    format!("adjusted response for item {} needs a due date", item.id),
                )
            })?;
            ensure_amount_in_range("adjusted_amount", amount)?;
            (amount, Some(due))
        }
        ResponseStatus::Rejected => (Money::ZERO, None),
        ResponseStatus::Pending => {
            return Err(DomainError::invariant("pending responses are filtered before resolve"));
        }
    };

    Ok(FactorOperationResponse {
        item_id: item.id,
        version_id,
        response_status: input.response_status,
        response_code: input.response_code.clone(),
        response_message: input.response_message.clone(),
        accepted_amount: input.accepted_amount,
        adjusted_amount: input.adjusted_amount,
        adjusted_due_date: input.adjusted_due_date,
        costs: input.costs,
        final_amount,
        final_due_date,
        responded_at,
    })
}
