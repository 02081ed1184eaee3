//! Tenant administration client.
//!
//! Resolves tenant tokens presented by devices into tenant records
//! (id, billing plan, addons). A failed verification of a supplied
//! token is an authentication verdict, not an infrastructure error.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::Addon;

#[derive(Debug, Clone, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub plan: String,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub trial: bool,
}

#[derive(Debug, Error)]
pub enum TenantClientError {
    /// The token is well-formed but does not identify a valid tenant.
    #[error("tenant token verification failed: {0}")]
    VerificationFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait TenantClient: Send + Sync {
    async fn check_health(&self) -> Result<(), anyhow::Error>;

    async fn verify_token(&self, tenant_token: &str) -> Result<Tenant, TenantClientError>;
}

/// In-memory tenant resolver backed by a token-to-tenant table.
#[derive(Default)]
pub struct MockTenantClient {
    tenants: Mutex<HashMap<String, Tenant>>,
}

impl MockTenantClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tenant_token: &str, tenant: Tenant) {
        if let Ok(mut tenants) = self.tenants.lock() {
            tenants.insert(tenant_token.to_string(), tenant);
        }
    }
}

#[async_trait]
impl TenantClient for MockTenantClient {
    async fn check_health(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn verify_token(&self, tenant_token: &str) -> Result<Tenant, TenantClientError> {
        let tenants = self
            .tenants
            .lock()
            .map_err(|e| anyhow::anyhow!("tenants mutex poisoned: {}", e))?;
        tenants
            .get(tenant_token)
            .cloned()
            .ok_or_else(|| TenantClientError::VerificationFailed("unknown tenant token".into()))
    }
}
