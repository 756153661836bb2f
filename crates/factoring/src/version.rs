//! Immutable package snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use factorops_core::{DomainError, DomainResult, Money, uuid_id};

use crate::item::FactorOperationItem;
use crate::operation::OperationStatus;

uuid_id!(
    /// Identifier of a generated version.
    VersionId,
    "VersionId"
);

/// A frozen, numbered package as proposed to the factor.
///
/// Versions are only ever appended; nothing in the aggregate mutates one after
/// `VersionGenerated` is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorOperationVersion {
    pub id: VersionId,
    pub version_number: u32,
    pub source_status: OperationStatus,
    pub total_items: u32,
    pub gross_amount: Money,
    /// Always zero: a package carries no cost data until the factor answers.
    pub costs_amount: Money,
    pub net_amount: Money,
    pub created_at: DateTime<Utc>,
    pub items: Vec<FactorOperationItem>,
}

impl FactorOperationVersion {
    /// Freeze `items` into version `version_number`.
    ///
    /// Each frozen copy starts a new round: adjusted terms become the proposal and the
    /// negotiation fields are cleared.
    pub fn freeze(
        id: VersionId,
        version_number: u32,
        source_status: OperationStatus,
        items: &[FactorOperationItem],
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if items.is_empty() {
            return Err(DomainError::validation(
                "items",
                "cannot generate a version without items",
            ));
        }

        let frozen: Vec<FactorOperationItem> = items
            .iter()
            .cloned()
            .map(|mut item| {
                item.begin_round();
                item
            })
            .collect();

        let gross_amount = Money::sum(frozen.iter().map(|i| i.package_amount()))?;
        let costs_amount = Money::ZERO;
        let net_amount = gross_amount.checked_sub(costs_amount)?;
        let total_items = u32::try_from(frozen.len())
            .map_err(|_| DomainError::invariant("too many items in version"))?;

        Ok(Self {
            id,
            version_number,
            source_status,
            total_items,
            gross_amount,
            costs_amount,
            net_amount,
            created_at,
            items: frozen,
        })
    }

    pub fn item(&self, item_id: &crate::item::ItemId) -> Option<&FactorOperationItem> {
        self.items.iter().find(|i| &i.id == item_id)
    }
}
