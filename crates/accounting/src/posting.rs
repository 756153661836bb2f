//! Settlement posting kinds and their chart-of-accounts mapping.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use factorops_core::{AggregateId, Money};

/// High-level account kind (determines normal balance side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub code: String, // e.g. "1200"
    pub name: String, // e.g. "Accounts Receivable"
    pub kind: AccountKind,
}

impl Account {
    pub fn new(code: &str, name: &str, kind: AccountKind) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            kind,
        }
    }
}

/// One side of a journal entry (immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntryLine {
    pub account: Account,
    /// Positive amount in minor units.
    pub amount: Money,
    /// true = debit, false = credit.
    pub is_debit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    Fee,
    Interest,
    Iof,
    Other,
}

/// What a settlement posting records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostingKind {
    /// Receivables written off against the factor (discounted installments).
    ArSettlement,
    /// Amount owed to the factor for repurchased installments.
    ApEntry,
    /// Factor charges.
    Cost { category: CostCategory },
}

/// Uniqueness key of a posting: at most one per operation, version and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostingKey {
    pub operation_id: AggregateId,
    pub version_id: Uuid,
    pub kind: PostingKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPosting {
    pub operation_id: AggregateId,
    pub version_id: Uuid,
    pub kind: PostingKind,
    pub amount: Money,
}

impl SettlementPosting {
    pub fn key(&self) -> PostingKey {
        PostingKey {
            operation_id: self.operation_id,
            version_id: self.version_id,
            kind: self.kind,
        }
    }
}

/// Accounts used to turn settlement postings into balanced journal entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAccounts {
    /// Clearing account for amounts exchanged with the factor.
    pub factor_clearing: Account,
    pub receivables: Account,
    pub factor_payables: Account,
    pub fee_expense: Account,
    pub interest_expense: Account,
    pub iof_expense: Account,
    pub other_cost_expense: Account,
}

impl Default for SettlementAccounts {
    fn default() -> Self {
        Self {
            factor_clearing: Account::new("1110", "Factor Clearing", AccountKind::Asset),
            receivables: Account::new("1200", "Accounts Receivable", AccountKind::Asset),
            factor_payables: Account::new("2100", "Payables to Factor", AccountKind::Liability),
            fee_expense: Account::new("6510", "Factoring Fees", AccountKind::Expense),
            interest_expense: Account::new("6520", "Factoring Interest", AccountKind::Expense),
            iof_expense: Account::new("6530", "IOF on Factoring", AccountKind::Expense),
            other_cost_expense: Account::new("6590", "Other Factoring Costs", AccountKind::Expense),
        }
    }
}

impl SettlementAccounts {
    /// Balanced debit/credit pair for a posting.
    pub fn journal_lines(&self, posting: &SettlementPosting) -> Vec<JournalEntryLine> {
        let (debit, credit) = match posting.kind {
            PostingKind::ArSettlement => (&self.factor_clearing, &self.receivables),
            PostingKind::ApEntry => (&self.receivables, &self.factor_payables),
            PostingKind::Cost { category } => {
                let expense = match category {
                    CostCategory::Fee => &self.fee_expense,
                    CostCategory::Interest => &self.interest_expense,
                    CostCategory::Iof => &self.iof_expense,
                    CostCategory::Other => &self.other_cost_expense,
                };
                (expense, &self.factor_clearing)
            }
        };

        vec![
            JournalEntryLine {
                account: debit.clone(),
                amount: posting.amount,
                is_debit: true,
            },
            JournalEntryLine {
                account: credit.clone(),
                amount: posting.amount,
                is_debit: false,
            },
        ]
    }
}
