//! Receivable installments as exposed by the eligibility provider.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use factorops_core::{DomainError, DomainResult, Money, uuid_id};

use crate::item::ActionType;

uuid_id!(
    /// Identifier of a receivable installment (owned by the receivables subsystem).
    InstallmentId,
    "InstallmentId"
);

/// Collection status of an installment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Open,
    Partial,
    Overdue,
    Paid,
    Cancelled,
}

impl InstallmentStatus {
    /// Open, partially paid or overdue: still has a balance to collect.
    pub fn is_receivable(self) -> bool {
        matches!(self, Self::Open | Self::Partial | Self::Overdue)
    }
}

/// Who currently holds the right to collect an installment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Custody {
    /// Still carried by the company (candidate for discount).
    Company,
    /// Sold to a factor (candidate for buyback or due-date change).
    Factor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub id: InstallmentId,
    /// Display number of the parent receivable title (e.g. "NF-1042").
    pub title_number: String,
    pub installment_number: u32,
    pub due_date: NaiveDate,
    pub status: InstallmentStatus,
    pub open_balance: Money,
}

impl Installment {
    /// Whether this installment may be packaged with `action` given its custody.
    pub fn ensure_eligible(&self, action: ActionType, custody: Custody) -> DomainResult<()> {
        match action {
            ActionType::Discount => {
                if custody == Custody::Factor {
                    return Err(DomainError::validation(
                        "installment_id",
                        format!("installment {} is already in factor custody", self.id),
                    ));
                }
                if !self.status.is_receivable() || !self.open_balance.is_positive() {
                    return Err(DomainError::validation(
                        "installment_id",
                        format!("installment {} has no open balance to discount", self.id),
                    ));
                }
            }
            ActionType::Buyback | ActionType::DueDateChange => {
                if custody != Custody::Factor {
                    return Err(DomainError::validation(
                        "installment_id",
                        format!(
                            "installment {} is not in factor custody ({} requires it)",
                            self.id,
                            action.as_str()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installment(status: InstallmentStatus, balance: i64) -> Installment {
        Installment {
            id: InstallmentId::new(),
            title_number: "NF-1".to_string(),
            installment_number: 1,
            due_date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
            status,
            open_balance: Money::from_minor(balance),
        }
    }

    #[test]
    fn discount_needs_open_balance_outside_factor_custody() {
        let open = installment(InstallmentStatus::Overdue, 100);
        assert!(open.ensure_eligible(ActionType::Discount, Custody::Company).is_ok());
        assert!(open.ensure_eligible(ActionType::Discount, Custody::Factor).is_err());

        let paid = installment(InstallmentStatus::Paid, 0);
        let err = paid
            .ensure_eligible(ActionType::Discount, Custody::Company)
            .unwrap_err();
        assert_eq!(err.field(), Some("installment_id"));
    }

    #[test]
    fn custody_actions_need_factor_custody() {
        let inst = installment(InstallmentStatus::Open, 100);
        assert!(inst.ensure_eligible(ActionType::Buyback, Custody::Factor).is_ok());
        assert!(inst.ensure_eligible(ActionType::DueDateChange, Custody::Factor).is_ok());
        assert!(inst.ensure_eligible(ActionType::Buyback, Custody::Company).is_err());
    }
}
