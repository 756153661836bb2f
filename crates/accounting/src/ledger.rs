use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use factorops_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Money, TenantId};
use factorops_events::Event;

use crate::posting::{JournalEntryLine, PostingKey, SettlementAccounts, SettlementPosting};

/// Ledger identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub AggregateId);

impl LedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// The single settlement ledger of a tenant.
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self(AggregateId::from_uuid(*tenant_id.as_uuid()))
    }
}

impl core::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A balanced journal entry generated for one settlement posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: Uuid,
    pub posting: SettlementPosting,
    pub lines: Vec<JournalEntryLine>,
}

/// A posting currently in effect (posted and not reversed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedSettlement {
    pub batch_id: Uuid,
    pub entry: JournalEntry,
    pub posted_at: DateTime<Utc>,
}

/// Aggregate root: Ledger (append-only journal of settlement postings).
///
/// Holds the active postings keyed by `(operation, version, kind)` so duplicates are
/// rejected at the ledger boundary, independent of the caller's own idempotency guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    id: LedgerId,
    tenant_id: Option<TenantId>,
    active: BTreeMap<PostingKey, PostedSettlement>,
    batches: BTreeMap<Uuid, Vec<PostingKey>>,
    version: u64,
    created: bool,
}

impl Ledger {
    /// Empty aggregate for rehydration.
    pub fn empty(id: LedgerId) -> Self {
        Self {
            id,
            tenant_id: None,
            active: BTreeMap::new(),
            batches: BTreeMap::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_posted(&self, key: &PostingKey) -> bool {
        self.active.contains_key(key)
    }

    /// Active postings in key order.
    pub fn postings(&self) -> impl Iterator<Item = &PostedSettlement> {
        self.active.values()
    }

    pub fn has_batch(&self, batch_id: Uuid) -> bool {
        self.batches.contains_key(&batch_id)
    }
}

impl AggregateRoot for Ledger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: post every settlement posting of a conclusion as one atomic batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSettlementBatch {
    pub tenant_id: TenantId,
    pub ledger_id: LedgerId,
    pub batch_id: Uuid,
    pub postings: Vec<SettlementPosting>,
    pub accounts: SettlementAccounts,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: compensate a batch whose surrounding unit of work failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSettlementBatch {
    pub tenant_id: TenantId,
    pub ledger_id: LedgerId,
    pub batch_id: Uuid,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    PostSettlementBatch(PostSettlementBatch),
    ReverseSettlementBatch(ReverseSettlementBatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatchPosted {
    pub tenant_id: TenantId,
    pub ledger_id: LedgerId,
    pub batch_id: Uuid,
    pub entries: Vec<JournalEntry>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Reversal of a batch: the original entries stay in the stream, their keys are freed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatchReversed {
    pub tenant_id: TenantId,
    pub ledger_id: LedgerId,
    pub batch_id: Uuid,
    pub reversed_keys: Vec<PostingKey>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    SettlementBatchPosted(SettlementBatchPosted),
    SettlementBatchReversed(SettlementBatchReversed),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::SettlementBatchPosted(_) => "accounting.ledger.settlement_batch_posted",
            LedgerEvent::SettlementBatchReversed(_) => "accounting.ledger.settlement_batch_reversed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::SettlementBatchPosted(e) => e.occurred_at,
            LedgerEvent::SettlementBatchReversed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Ledger {
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::SettlementBatchPosted(e) => {
                self.id = e.ledger_id;
                if self.tenant_id.is_none() {
                    self.tenant_id = Some(e.tenant_id);
                    self.created = true;
                }
                let mut keys = Vec::with_capacity(e.entries.len());
                for entry in &e.entries {
                    let key = entry.posting.key();
                    keys.push(key);
                    self.active.insert(
                        key,
                        PostedSettlement {
                            batch_id: e.batch_id,
                            entry: entry.clone(),
                            posted_at: e.occurred_at,
                        },
                    );
                }
                self.batches.insert(e.batch_id, keys);
            }
            LedgerEvent::SettlementBatchReversed(e) => {
                for key in &e.reversed_keys {
                    self.active.remove(key);
                }
                self.batches.remove(&e.batch_id);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            LedgerCommand::PostSettlementBatch(cmd) => self.handle_post(cmd),
            LedgerCommand::ReverseSettlementBatch(cmd) => self.handle_reverse(cmd),
        }
    }
}

impl Ledger {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_post(&self, cmd: &PostSettlementBatch) -> Result<Vec<LedgerEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        if cmd.postings.is_empty() {
            return Err(DomainError::validation("postings", "settlement batch must have postings"));
        }
        if self.has_batch(cmd.batch_id) {
            return Err(DomainError::state_conflict(format!(
                "settlement batch {} already posted",
                cmd.batch_id
            )));
        }

        let mut seen = BTreeSet::new();
        let mut entries = Vec::with_capacity(cmd.postings.len());
        for posting in &cmd.postings {
            let key = posting.key();
            if !seen.insert(key) || self.is_posted(&key) {
                return Err(DomainError::state_conflict(format!(
                    "duplicate posting for operation {} version {} ({:?})",
                    key.operation_id, key.version_id, key.kind
                )));
            }
            if !posting.amount.is_positive() {
                return Err(DomainError::validation("amount", "posting amount must be positive"));
            }

            let lines = cmd.accounts.journal_lines(posting);
            ensure_balanced(&lines)?;
            entries.push(JournalEntry {
                entry_id: Uuid::now_v7(),
                posting: posting.clone(),
                lines,
            });
        }

        Ok(vec![LedgerEvent::SettlementBatchPosted(SettlementBatchPosted {
            tenant_id: cmd.tenant_id,
            ledger_id: cmd.ledger_id,
            batch_id: cmd.batch_id,
            entries,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reverse(&self, cmd: &ReverseSettlementBatch) -> Result<Vec<LedgerEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("ledger {}", cmd.ledger_id)));
        }
        self.ensure_tenant(cmd.tenant_id)?;

        let keys = self
            .batches
            .get(&cmd.batch_id)
            .ok_or_else(|| DomainError::not_found(format!("settlement batch {}", cmd.batch_id)))?;

        Ok(vec![LedgerEvent::SettlementBatchReversed(SettlementBatchReversed {
            tenant_id: cmd.tenant_id,
            ledger_id: cmd.ledger_id,
            batch_id: cmd.batch_id,
            reversed_keys: keys.clone(),
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn ensure_balanced(lines: &[JournalEntryLine]) -> Result<(), DomainError> {
    let mut debit_total = Money::ZERO;
    let mut credit_total = Money::ZERO;
    for line in lines {
        if line.is_debit {
            debit_total = debit_total.checked_add(line.amount)?;
        } else {
            credit_total = credit_total.checked_add(line.amount)?;
        }
    }
    if debit_total != credit_total {
        return Err(DomainError::invariant("debits must equal credits"));
    }
    Ok(())
}
