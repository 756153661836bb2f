//! Eligible installment provider boundary.
//!
//! The receivables subsystem owns installments. The engine reads them to list candidates
//! for a package and to snapshot one when it is added as an item. The one write is the
//! custody hand-over when an operation settles.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use factorops_core::TenantId;
use factorops_factoring::{Custody, Installment, InstallmentId};

#[derive(Debug, Clone, Error)]
pub enum EligibilityError {
    #[error("eligibility provider unavailable: {0}")]
    Unavailable(String),
    #[error("installment {0} is unknown to the provider")]
    UnknownInstallment(InstallmentId),
}

pub trait EligibilityProvider: Send + Sync {
    /// Installments the company still carries and can discount. `search` matches a
    /// case-insensitive substring of the title number, or the installment number exactly.
    fn list_open_installments(
        &self,
        tenant_id: TenantId,
        search: Option<&str>,
    ) -> Result<Vec<Installment>, EligibilityError>;

    /// Installments already sold to a factor (buyback / due-date change candidates).
    fn list_installments_in_factor_custody(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<Installment>, EligibilityError>;

    fn find_installment(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
    ) -> Result<Option<(Installment, Custody)>, EligibilityError>;

    /// Record who holds the installment now. Called when a discount or buyback settles.
    fn transfer_custody(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
        custody: Custody,
    ) -> Result<(), EligibilityError>;
}

/// In-memory provider for dev and tests.
#[derive(Debug, Default)]
pub struct InMemoryEligibilityProvider {
    inner: RwLock<HashMap<(TenantId, InstallmentId), (Installment, Custody)>>,
}

impl InMemoryEligibilityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an installment.
    pub fn insert(&self, tenant_id: TenantId, installment: Installment, custody: Custody) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, installment.id), (installment, custody));
        }
    }

    fn filtered(
        &self,
        tenant_id: TenantId,
        keep: impl Fn(&Installment, Custody) -> bool,
    ) -> Result<Vec<Installment>, EligibilityError> {
        let map = self
            .inner
            .read()
            .map_err(|_| EligibilityError::Unavailable("lock poisoned".to_string()))?;
        let mut out: Vec<Installment> = map
            .iter()
            .filter(|((t, _), (inst, custody))| *t == tenant_id && keep(inst, *custody))
            .map(|(_, (inst, _))| inst.clone())
            .collect();
        out.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then_with(|| a.title_number.cmp(&b.title_number))
                .then_with(|| a.installment_number.cmp(&b.installment_number))
        });
        Ok(out)
    }
}

fn matches_search(inst: &Installment, search: &str) -> bool {
    let needle = search.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    inst.title_number.to_lowercase().contains(&needle)
        || inst.installment_number.to_string() == needle
}

impl EligibilityProvider for InMemoryEligibilityProvider {
    fn list_open_installments(
        &self,
        tenant_id: TenantId,
        search: Option<&str>,
    ) -> Result<Vec<Installment>, EligibilityError> {
        self.filtered(tenant_id, |inst, custody| {
            custody == Custody::Company
                && inst.status.is_receivable()
                && inst.open_balance.is_positive()
                && search.is_none_or(|s| matches_search(inst, s))
        })
    }

    fn list_installments_in_factor_custody(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<Installment>, EligibilityError> {
        self.filtered(tenant_id, |_, custody| custody == Custody::Factor)
    }

    fn find_installment(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
    ) -> Result<Option<(Installment, Custody)>, EligibilityError> {
        let map = self
            .inner
            .read()
            .map_err(|_| EligibilityError::Unavailable("lock poisoned".to_string()))?;
        Ok(map.get(&(tenant_id, installment_id)).cloned())
    }

    fn transfer_custody(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
        custody: Custody,
    ) -> Result<(), EligibilityError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| EligibilityError::Unavailable("lock poisoned".to_string()))?;
        let (_, held) = map
            .get_mut(&(tenant_id, installment_id))
            .ok_or(EligibilityError::UnknownInstallment(installment_id))?;
        *held = custody;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use factorops_core::Money;
    use factorops_factoring::InstallmentStatus;

    fn inst(title: &str, n: u32, status: InstallmentStatus, cents: i64) -> Installment {
        Installment {
            id: InstallmentId::new(),
            title_number: title.to_string(),
            installment_number: n,
            due_date: NaiveDate::from_ymd_opt(2026, 12, n).unwrap(),
            status,
            open_balance: Money::from_minor(cents),
        }
    }

    #[test]
    fn open_listing_excludes_paid_and_custody() {
        let p = InMemoryEligibilityProvider::new();
        let t = TenantId::new();
        p.insert(t, inst("NF-1", 1, InstallmentStatus::Open, 100), Custody::Company);
        p.insert(t, inst("NF-2", 2, InstallmentStatus::Paid, 0), Custody::Company);
        p.insert(t, inst("NF-3", 3, InstallmentStatus::Open, 100), Custody::Factor);

        let open = p.list_open_installments(t, None).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].title_number, "NF-1");

        let custody = p.list_installments_in_factor_custody(t).unwrap();
        assert_eq!(custody.len(), 1);
        assert_eq!(custody[0].title_number, "NF-3");
    }

    #[test]
    fn search_is_case_insensitive_on_title_or_number() {
        let p = InMemoryEligibilityProvider::new();
        let t = TenantId::new();
        p.insert(t, inst("NF-1042", 1, InstallmentStatus::Open, 100), Custody::Company);
        p.insert(t, inst("DUP-77", 4, InstallmentStatus::Overdue, 100), Custody::Company);

        let hits = p.list_open_installments(t, Some("nf-10")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title_number, "NF-1042");

        // installment numbers match exactly, titles by substring
        let hits = p.list_open_installments(t, Some("4")).unwrap();
        let titles: Vec<&str> = hits.iter().map(|i| i.title_number.as_str()).collect();
        assert_eq!(titles, vec!["NF-1042", "DUP-77"]);

        let hits = p.list_open_installments(t, Some("1")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title_number, "NF-1042");

        let hits = p.list_open_installments(t, Some(" dup ")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].installment_number, 4);

        assert!(p.list_open_installments(t, Some("99")).unwrap().is_empty());
        assert_eq!(p.list_open_installments(t, Some("  ")).unwrap().len(), 2);
    }

    #[test]
    fn transferred_installments_leave_the_open_listing() {
        let p = InMemoryEligibilityProvider::new();
        let t = TenantId::new();
        let i = inst("NF-5", 5, InstallmentStatus::Open, 100);
        let id = i.id;
        p.insert(t, i, Custody::Company);

        p.transfer_custody(t, id, Custody::Factor).unwrap();
        assert!(p.list_open_installments(t, None).unwrap().is_empty());
        assert_eq!(p.find_installment(t, id).unwrap().unwrap().1, Custody::Factor);
        assert_eq!(p.list_installments_in_factor_custody(t).unwrap().len(), 1);

        p.transfer_custody(t, id, Custody::Company).unwrap();
        assert_eq!(p.list_open_installments(t, None).unwrap().len(), 1);

        let err = p.transfer_custody(TenantId::new(), id, Custody::Factor).unwrap_err();
        assert!(matches!(err, EligibilityError::UnknownInstallment(_)));
    }

    #[test]
    fn tenants_are_isolated() {
        let p = InMemoryEligibilityProvider::new();
        let a = TenantId::new();
        let i = inst("NF-1", 1, InstallmentStatus::Open, 100);
        let id = i.id;
        p.insert(a, i, Custody::Company);
        assert!(p.find_installment(TenantId::new(), id).unwrap().is_none());
        assert!(p.find_installment(a, id).unwrap().is_some());
    }
}
