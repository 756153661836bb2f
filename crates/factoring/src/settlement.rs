//! Settlement figures of a concluded operation.

use serde::{Deserialize, Serialize};

use factorops_accounting::{CostCategory, PostingKind, SettlementPosting};
use factorops_core::{AggregateId, DomainError, DomainResult, Money};

use crate::item::ActionType;
use crate::response::{CostBreakdown, FactorOperationResponse, ResponseStatus};
use crate::version::{FactorOperationVersion, VersionId};

/// What the factor pays (discount), what the company repurchases (buyback) and what the
/// factor charges, computed over the responses of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub version_id: VersionId,
    pub discount_amount: Money,
    pub buyback_amount: Money,
    pub costs: CostBreakdown,
    pub factor_costs_amount: Money,
}

impl SettlementSummary {
    /// Rejected items contribute nothing. Due-date changes contribute costs only.
    pub fn compute(
        version: &FactorOperationVersion,
        responses: &[FactorOperationResponse],
    ) -> DomainResult<Self> {
        if responses.is_empty() {
            return Err(DomainError::validation(
                "responses",
                format!("no responses recorded for version {}", version.version_number),
            ));
        }

        let mut discount_amount = Money::ZERO;
        let mut buyback_amount = Money::ZERO;
        let mut costs = CostBreakdown::default();

        for response in responses {
            if response.version_id != version.id {
                return Err(DomainError::invariant(format!(
                    "response for item {} belongs to another version",
                    response.item_id
                )));
            }
            let item = version.item(&response.item_id).ok_or_else(|| {
                DomainError::invariant(format!(
                    "response for item {} has no frozen item",
                    response.item_id
                ))
            })?;

            costs = costs.checked_add(&response.costs)?;

            if response.response_status == ResponseStatus::Rejected {
                continue;
            }
            match item.action_type {
                ActionType::Discount => {
                    discount_amount = discount_amount.checked_add(response.final_amount)?;
                }
                ActionType::Buyback => {
                    buyback_amount = buyback_amount.checked_add(response.final_amount)?;
                }
                ActionType::DueDateChange => {}
            }
        }

        Ok(Self {
            version_id: version.id,
            discount_amount,
            buyback_amount,
            factor_costs_amount: costs.total()?,
            costs,
        })
    }

    /// Ledger postings for this settlement. Zero amounts are not posted.
    pub fn postings(&self, operation_id: AggregateId) -> Vec<SettlementPosting> {
        let version_id = *self.version_id.as_uuid();
        [
            (PostingKind::ArSettlement, self.discount_amount),
            (PostingKind::ApEntry, self.buyback_amount),
            (PostingKind::Cost { category: CostCategory::Fee }, self.costs.fee_amount),
            (PostingKind::Cost { category: CostCategory::Interest }, self.costs.interest_amount),
            (PostingKind::Cost { category: CostCategory::Iof }, self.costs.iof_amount),
            (PostingKind::Cost { category: CostCategory::Other }, self.costs.other_cost_amount),
        ]
        .into_iter()
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(kind, amount)| SettlementPosting {
            operation_id,
            version_id,
            kind,
            amount,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    use crate::installment::{Installment, InstallmentId, InstallmentStatus};
    use crate::item::{FactorOperationItem, ItemId};
    use crate::operation::OperationStatus;
    use crate::response::{ItemResponse, reconcile};

    fn item(line_no: u32, action: ActionType, cents: i64) -> FactorOperationItem {
        let inst = Installment {
            id: InstallmentId::new(),
            title_number: format!("NF-{line_no}"),
            installment_number: line_no,
            due_date: NaiveDate::from_ymd_opt(2026, 11, 30).unwrap(),
            status: InstallmentStatus::Open,
            open_balance: Money::from_minor(cents),
        };
        let proposed = (action == ActionType::DueDateChange)
            .then(|| NaiveDate::from_ymd_opt(2027, 2, 1).unwrap());
        FactorOperationItem::from_installment(ItemId::new(), line_no, action, &inst, proposed)
    }

    #[test]
    fn splits_discount_buyback_and_costs() {
        let items = vec![
            item(1, ActionType::Discount, 100_000),
            item(2, ActionType::Buyback, 20_000),
            item(3, ActionType::DueDateChange, 7_000),
            item(4, ActionType::Discount, 9_900),
        ];
        let v = FactorOperationVersion::freeze(VersionId::new(), 2, OperationStatus::InAdjustment, &items, Utc::now())
            .unwrap();
        let mut ddc = ItemResponse::accepted(v.items[2].id, Money::ZERO);
        ddc.costs.interest_amount = Money::from_minor(300);
        let responses = reconcile(
            &v,
            &[
                ItemResponse::accepted(v.items[0].id, Money::from_minor(2_000)),
                ItemResponse::accepted(v.items[1].id, Money::from_minor(500)),
                ddc,
                ItemResponse::rejected(v.items[3].id, "blocked debtor"),
            ],
            Utc::now(),
        )
        .unwrap();

        let s = SettlementSummary::compute(&v, &responses).unwrap();
        assert_eq!(s.discount_amount, Money::from_minor(100_000));
        assert_eq!(s.buyback_amount, Money::from_minor(20_000));
        assert_eq!(s.costs.fee_amount, Money::from_minor(2_500));
        assert_eq!(s.factor_costs_amount, Money::from_minor(2_800));

        let op = AggregateId::new();
        let postings = s.postings(op);
        let kinds: Vec<_> = postings.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PostingKind::ArSettlement,
                PostingKind::ApEntry,
                PostingKind::Cost { category: CostCategory::Fee },
                PostingKind::Cost { category: CostCategory::Interest },
            ]
        );
        assert!(postings.iter().all(|p| p.operation_id == op && p.version_id == *v.id.as_uuid()));
    }

    #[test]
    fn empty_response_set_is_invalid() {
        let v = FactorOperationVersion::freeze(
            VersionId::new(),
            1,
            OperationStatus::Draft,
            &[item(1, ActionType::Discount, 100)],
            Utc::now(),
        )
        .unwrap();
        let err = SettlementSummary::compute(&v, &[]).unwrap_err();
        assert_eq!(err.field(), Some("responses"));
    }
}
