//! Installment claims: an installment is open in at most one active operation.
//!
//! Operation streams are independent, so the rule is enforced here rather than in the
//! aggregate. A claim is taken before the item is appended and released when the item
//! is removed, the operation is cancelled, or it concludes.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use factorops_core::{DomainError, TenantId};
use factorops_factoring::{FactorOperationId, InstallmentId};

#[derive(Debug, Default)]
pub struct InstallmentClaims {
    inner: Mutex<HashMap<(TenantId, InstallmentId), FactorOperationId>>,
}

impl InstallmentClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `installment_id` for `operation_id`. Re-claiming by the same operation is a no-op.
    pub fn claim(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
        operation_id: FactorOperationId,
    ) -> Result<(), DomainError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| DomainError::invariant("installment claims lock poisoned"))?;
        match map.get(&(tenant_id, installment_id)) {
            Some(holder) if *holder != operation_id => Err(DomainError::state_conflict(format!(
                "installment {installment_id} is already open in operation {holder}"
            ))),
            Some(_) => Ok(()),
            None => {
                map.insert((tenant_id, installment_id), operation_id);
                debug!(tenant = %tenant_id, installment = %installment_id, operation = %operation_id, "installment claimed");
                Ok(())
            }
        }
    }

    /// Release a claim held by `operation_id`. Claims held by other operations are untouched.
    pub fn release(
        &self,
        tenant_id: TenantId,
        installment_id: InstallmentId,
        operation_id: FactorOperationId,
    ) {
        if let Ok(mut map) = self.inner.lock() {
            if map.get(&(tenant_id, installment_id)) == Some(&operation_id) {
                map.remove(&(tenant_id, installment_id));
                debug!(tenant = %tenant_id, installment = %installment_id, operation = %operation_id, "installment released");
            }
        }
    }

    pub fn release_all(
        &self,
        tenant_id: TenantId,
        installment_ids: impl IntoIterator<Item = InstallmentId>,
        operation_id: FactorOperationId,
    ) {
        for id in installment_ids {
            self.release(tenant_id, id, operation_id);
        }
    }

    pub fn holder(&self, tenant_id: TenantId, installment_id: InstallmentId) -> Option<FactorOperationId> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(&(tenant_id, installment_id)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factorops_core::AggregateId;

    #[test]
    fn second_operation_cannot_claim() {
        let claims = InstallmentClaims::new();
        let t = TenantId::new();
        let inst = InstallmentId::new();
        let a = FactorOperationId::new(AggregateId::new());
        let b = FactorOperationId::new(AggregateId::new());

        claims.claim(t, inst, a).unwrap();
        claims.claim(t, inst, a).unwrap();
        let err = claims.claim(t, inst, b).unwrap_err();
        assert!(matches!(err, DomainError::StateConflict(_)));

        claims.release(t, inst, b);
        assert_eq!(claims.holder(t, inst), Some(a));

        claims.release(t, inst, a);
        claims.claim(t, inst, b).unwrap();
    }

    #[test]
    fn claims_are_per_tenant() {
        let claims = InstallmentClaims::new();
        let inst = InstallmentId::new();
        let op = FactorOperationId::new(AggregateId::new());
        claims.claim(TenantId::new(), inst, op).unwrap();
        claims
            .claim(TenantId::new(), inst, FactorOperationId::new(AggregateId::new()))
            .unwrap();
    }
}
