use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use factorops_core::{Aggregate, AggregateId, AggregateRoot, DomainError, Rate, TenantId};
use factorops_events::Event;

/// Factor identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactorId(pub AggregateId);

impl FactorId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for FactorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Default commercial terms a factor offers. Informational: the engine records
/// the factor's actual charges per item when responses come back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorTerms {
    #[serde(default)]
    pub interest_rate: Rate,
    #[serde(default)]
    pub fee_rate: Rate,
    #[serde(default)]
    pub iof_rate: Rate,
    #[serde(default)]
    pub other_cost_rate: Rate,
    #[serde(default)]
    pub grace_days: u32,
}

impl FactorTerms {
    const MAX_BPS: u32 = 10_000;

    fn validate(&self) -> Result<(), DomainError> {
        for (field, rate) in [
            ("interest_rate", self.interest_rate),
            ("fee_rate", self.fee_rate),
            ("iof_rate", self.iof_rate),
            ("other_cost_rate", self.other_cost_rate),
        ] {
            if rate.bps() > Self::MAX_BPS {
                return Err(DomainError::validation(field, "rate cannot exceed 100%"));
            }
        }
        Ok(())
    }
}

/// Aggregate root: Factor (financial institution buying receivables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factor {
    id: FactorId,
    tenant_id: Option<TenantId>,
    name: String,
    code: Option<String>,
    terms: FactorTerms,
    active: bool,
    version: u64,
    created: bool,
}

impl Factor {
    pub fn empty(id: FactorId) -> Self {
        Self {
            id,
            tenant_id: None,
            name: String::new(),
            code: None,
            terms: FactorTerms::default(),
            active: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> FactorId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn terms(&self) -> &FactorTerms {
        &self.terms
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    /// Whether a new operation may reference this factor.
    pub fn ensure_usable(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("factor {}", self.id)));
        }
        if !self.active {
            return Err(DomainError::validation(
                "factor_id",
                format!("factor {} is inactive", self.id),
            ));
        }
        Ok(())
    }
}

impl AggregateRoot for Factor {
    type Id = FactorId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFactor {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub name: String,
    pub code: Option<String>,
    pub terms: FactorTerms,
    pub occurred_at: DateTime<Utc>,
}

/// Partial update: `None` leaves a field unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFactor {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub name: Option<String>,
    pub code: Option<String>,
    pub terms: Option<FactorTerms>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateFactor {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactorCommand {
    RegisterFactor(RegisterFactor),
    UpdateFactor(UpdateFactor),
    DeactivateFactor(DeactivateFactor),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorRegistered {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub name: String,
    pub code: Option<String>,
    pub terms: FactorTerms,
    pub occurred_at: DateTime<Utc>,
}

/// Full post-update state, so projections need no prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorUpdated {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub name: String,
    pub code: Option<String>,
    pub terms: FactorTerms,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorDeactivated {
    pub tenant_id: TenantId,
    pub factor_id: FactorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactorEvent {
    FactorRegistered(FactorRegistered),
    FactorUpdated(FactorUpdated),
    FactorDeactivated(FactorDeactivated),
}

impl Event for FactorEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FactorEvent::FactorRegistered(_) => "factoring.factor.registered",
            FactorEvent::FactorUpdated(_) => "factoring.factor.updated",
            FactorEvent::FactorDeactivated(_) => "factoring.factor.deactivated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            FactorEvent::FactorRegistered(e) => e.occurred_at,
            FactorEvent::FactorUpdated(e) => e.occurred_at,
            FactorEvent::FactorDeactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Factor {
    type Command = FactorCommand;
    type Event = FactorEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            FactorEvent::FactorRegistered(e) => {
                self.id = e.factor_id;
                self.tenant_id = Some(e.tenant_id);
                self.name = e.name.clone();
                self.code = e.code.clone();
                self.terms = e.terms;
                self.active = true;
                self.created = true;
            }
            FactorEvent::FactorUpdated(e) => {
                self.name = e.name.clone();
                self.code = e.code.clone();
                self.terms = e.terms;
            }
            FactorEvent::FactorDeactivated(_) => {
                self.active = false;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            FactorCommand::RegisterFactor(cmd) => self.handle_register(cmd),
            FactorCommand::UpdateFactor(cmd) => self.handle_update(cmd),
            FactorCommand::DeactivateFactor(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl Factor {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(&self, tenant_id: TenantId, factor_id: FactorId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("factor {factor_id}")));
        }
        self.ensure_tenant(tenant_id)?;
        if self.id != factor_id {
            return Err(DomainError::invariant("factor_id mismatch"));
        }
        Ok(())
    }

    fn handle_register(&self, cmd: &RegisterFactor) -> Result<Vec<FactorEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("factor already exists"));
        }

        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("name", "factor name cannot be empty"));
        }
        cmd.terms.validate()?;

        Ok(vec![FactorEvent::FactorRegistered(FactorRegistered {
            tenant_id: cmd.tenant_id,
            factor_id: cmd.factor_id,
            name: name.to_string(),
            code: normalize_code(cmd.code.as_deref()),
            terms: cmd.terms,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateFactor) -> Result<Vec<FactorEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.factor_id)?;

        let name = match cmd.name.as_deref().map(str::trim) {
            Some("") => {
                return Err(DomainError::validation("name", "factor name cannot be empty"));
            }
            Some(n) => n.to_string(),
            None => self.name.clone(),
        };
        let terms = cmd.terms.unwrap_or(self.terms);
        terms.validate()?;
        let code = match &cmd.code {
            Some(c) => normalize_code(Some(c)),
            None => self.code.clone(),
        };

        Ok(vec![FactorEvent::FactorUpdated(FactorUpdated {
            tenant_id: cmd.tenant_id,
            factor_id: cmd.factor_id,
            name,
            code,
            terms,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateFactor) -> Result<Vec<FactorEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.factor_id)?;

        if !self.active {
            return Err(DomainError::state_conflict("factor is already inactive"));
        }

        Ok(vec![FactorEvent::FactorDeactivated(FactorDeactivated {
            tenant_id: cmd.tenant_id,
            factor_id: cmd.factor_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn normalize_code(code: Option<&str>) -> Option<String> {
    code.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string)
}
