// Tenant directory
//
// Resolves API keys and tenant ids to tenants. Key issuance lives elsewhere;
// the static directory serves the tenants listed in configuration.

use crate::config::TenancyConfig;
use crate::models::Tenant;
use async_trait::async_trait;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn resolve_api_key(&self, api_key: &str) -> Option<Tenant>;

    async fn get(&self, tenant_id: &str) -> Option<Tenant>;

    /// The master tenant sees every tenant's jobs
    fn is_master(&self, tenant_id: &str) -> bool;
}

/// Tenants loaded once from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: HashMap<String, Tenant>,
    master_tenant_id: Option<String>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: Vec<Tenant>, master_tenant_id: Option<String>) -> Self {
        Self {
            tenants: tenants.into_iter().map(|t| (t.id.clone(), t)).collect(),
            master_tenant_id,
        }
    }

    pub fn from_config(config: &TenancyConfig) -> Self {
        Self::new(config.tenants.clone(), config.master_tenant_id.clone())
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn resolve_api_key(&self, api_key: &str) -> Option<Tenant> {
        if api_key.is_empty() {
            return None;
        }
        // Every key is compared so timing does not reveal which tenant matched
        let mut found = None;
        for tenant in self.tenants.values() {
            if bool::from(tenant.api_key.as_bytes().ct_eq(api_key.as_bytes())) {
                found = Some(tenant.clone());
            }
        }
        found
    }

    async fn get(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.get(tenant_id).cloned()
    }

    fn is_master(&self, tenant_id: &str) -> bool {
        self.master_tenant_id.as_deref() == Some(tenant_id)
    }
}
