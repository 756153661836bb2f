//! Financial ledger boundary and its event-sourced implementation.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use factorops_accounting::{
    Ledger, LedgerCommand, LedgerEvent, LedgerId, PostSettlementBatch, PostedSettlement,
    PostingKey, ReverseSettlementBatch, SettlementAccounts, SettlementPosting,
};
use factorops_core::{Money, TenantId};
use factorops_events::{EventBus, EventEnvelope};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::EventStore;

pub const LEDGER_AGGREGATE: &str = "accounting.ledger";

/// Postings written atomically: all of them or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementBatch {
    pub batch_id: Uuid,
    pub postings: Vec<SettlementPosting>,
    pub description: Option<String>,
}

/// One accepted posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PostingReceipt {
    pub entry_id: Uuid,
    pub key: PostingKey,
    pub amount: Money,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A posting with the same `(operation, version, kind)` is already active.
    #[error("duplicate posting: {0}")]
    DuplicatePosting(String),
    #[error("ledger rejected the batch: {0}")]
    Rejected(String),
    #[error("ledger store failure: {0}")]
    Store(String),
}

pub trait FinancialLedger: Send + Sync {
    fn post_settlement(
        &self,
        tenant_id: TenantId,
        batch: SettlementBatch,
    ) -> Result<Vec<PostingReceipt>, LedgerError>;

    /// Compensation: reverse every posting of a batch.
    fn reverse_settlement(
        &self,
        tenant_id: TenantId,
        batch_id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError>;

    /// Active (non-reversed) postings.
    fn postings(&self, tenant_id: TenantId) -> Result<Vec<PostedSettlement>, LedgerError>;
}

impl From<DispatchError> for LedgerError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::StateConflict(msg) if msg.starts_with("duplicate posting") => {
                LedgerError::DuplicatePosting(msg)
            }
            DispatchError::Validation { .. }
            | DispatchError::StateConflict(_)
            | DispatchError::InvariantViolation(_)
            | DispatchError::NotFound(_) => LedgerError::Rejected(value.to_string()),
            other => LedgerError::Store(other.to_string()),
        }
    }
}

/// One `Ledger` stream per tenant, driven through the command dispatcher.
#[derive(Debug)]
pub struct EventSourcedLedger<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    accounts: SettlementAccounts,
}

impl<S, B> EventSourcedLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: CommandDispatcher<S, B>) -> Self {
        Self::with_accounts(dispatcher, SettlementAccounts::default())
    }

    pub fn with_accounts(dispatcher: CommandDispatcher<S, B>, accounts: SettlementAccounts) -> Self {
        Self { dispatcher, accounts }
    }

    fn load(&self, tenant_id: TenantId) -> Result<Ledger, LedgerError> {
        let ledger_id = LedgerId::for_tenant(tenant_id);
        let loaded = self
            .dispatcher
            .load(tenant_id, ledger_id.0, |_, id| Ledger::empty(LedgerId::new(id)))?;
        Ok(loaded.aggregate)
    }
}

impl<S, B> FinancialLedger for EventSourcedLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn post_settlement(
        &self,
        tenant_id: TenantId,
        batch: SettlementBatch,
    ) -> Result<Vec<PostingReceipt>, LedgerError> {
        let ledger_id = LedgerId::for_tenant(tenant_id);
        let cmd = LedgerCommand::PostSettlementBatch(PostSettlementBatch {
            tenant_id,
            ledger_id,
            batch_id: batch.batch_id,
            postings: batch.postings,
            accounts: self.accounts.clone(),
            description: batch.description,
            occurred_at: Utc::now(),
        });

        let committed = self.dispatcher.dispatch::<Ledger>(
            tenant_id,
            ledger_id.0,
            LEDGER_AGGREGATE,
            cmd,
            |_, id| Ledger::empty(LedgerId::new(id)),
        )?;

        let mut receipts = Vec::new();
        for stored in committed {
            let ev: LedgerEvent = serde_json::from_value(stored.payload)
                .map_err(|e| LedgerError::Store(e.to_string()))?;
            if let LedgerEvent::SettlementBatchPosted(posted) = ev {
                receipts.extend(posted.entries.iter().map(|entry| PostingReceipt {
                    entry_id: entry.entry_id,
                    key: entry.posting.key(),
                    amount: entry.posting.amount,
                }));
            }
        }
        Ok(receipts)
    }

    fn reverse_settlement(
        &self,
        tenant_id: TenantId,
        batch_id: Uuid,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let ledger_id = LedgerId::for_tenant(tenant_id);
        let cmd = LedgerCommand::ReverseSettlementBatch(ReverseSettlementBatch {
            tenant_id,
            ledger_id,
            batch_id,
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        });
        self.dispatcher.dispatch::<Ledger>(
            tenant_id,
            ledger_id.0,
            LEDGER_AGGREGATE,
            cmd,
            |_, id| Ledger::empty(LedgerId::new(id)),
        )?;
        Ok(())
    }

    fn postings(&self, tenant_id: TenantId) -> Result<Vec<PostedSettlement>, LedgerError> {
        Ok(self.load(tenant_id)?.postings().cloned().collect())
    }
}
