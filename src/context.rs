//! Request-scoped context passed explicitly down every call chain.
//!
//! Carries the request id, the resolved caller identity and the forwarded
//! request line used for throttling. Nothing in the core reads ambient or
//! global state.

use crate::models::Addon;

/// Identity of the caller on whose behalf an operation runs.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub subject: String,
    pub tenant: String,
    pub plan: String,
    pub addons: Vec<Addon>,
    pub trial: bool,
}

/// Per-request parameter object.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub identity: Option<Identity>,
    /// Original request method as forwarded by the gateway.
    pub forwarded_method: Option<String>,
    /// Original request URI as forwarded by the gateway, query string
    /// included.
    pub forwarded_uri: Option<String>,
}

impl RequestContext {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Default::default()
        }
    }

    /// Tenant id of the current identity, if any.
    pub fn tenant_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.tenant.as_str())
    }

    /// Derive a context scoped to the given tenant, keeping request
    /// metadata.
    pub fn with_tenant(&self, tenant_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.identity = Some(Identity {
            tenant: tenant_id.to_string(),
            ..Default::default()
        });
        ctx
    }

    /// Derive a context carrying the given identity (or none).
    pub fn with_identity(&self, identity: Option<Identity>) -> Self {
        let mut ctx = self.clone();
        ctx.identity = identity;
        ctx
    }

    pub fn with_forwarded(mut self, method: &str, uri: &str) -> Self {
        self.forwarded_method = Some(method.to_string());
        self.forwarded_uri = Some(uri.to_string());
        self
    }
}
