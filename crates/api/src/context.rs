//! Per-request tenant context.

use packflow_core::TenantId;

/// The resolved tenant a request acts on behalf of.
#[derive(Debug, Clone, Copy)]
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
