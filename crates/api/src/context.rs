use factorops_core::TenantId;

/// Tenant context for a request.
///
/// This is immutable and must be present for all domain routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
