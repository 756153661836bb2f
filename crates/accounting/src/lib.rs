//! Financial ledger for factoring settlements (double-entry, event-sourced).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod ledger;
pub mod posting;

pub use ledger::{
    JournalEntry, Ledger, LedgerCommand, LedgerEvent, LedgerId, PostSettlementBatch,
    PostedSettlement, ReverseSettlementBatch, SettlementBatchPosted, SettlementBatchReversed,
};
pub use posting::{
    Account, AccountKind, CostCategory, JournalEntryLine, PostingKey, PostingKind,
    SettlementAccounts, SettlementPosting,
};
