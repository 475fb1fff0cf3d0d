use stockledger_core::{TenantId, UserId};

/// Tenant context for a request.
///
/// Immutable and present for every ledger route.
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

/// Operator recorded on movements, when the caller supplies one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OperatorContext {
    operator_id: Option<UserId>,
}

impl OperatorContext {
    pub fn new(operator_id: Option<UserId>) -> Self {
        Self { operator_id }
    }

    pub fn operator_id(&self) -> Option<UserId> {
        self.operator_id
    }
}
