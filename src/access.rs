//! Addon-gated endpoint access.
//!
//! On plans where features are sold as addons, a valid token is not
//! enough: the forwarded request path must belong to a feature the
//! tenant has enabled.

use std::sync::Arc;

use crate::config::DevAuthConfig;
use crate::context::RequestContext;
use crate::error::DevAuthError;
use crate::jwt::Claims;

/// Post-validation access hook run by the verify pipeline.
pub trait AccessChecker: Send + Sync {
    fn check(&self, ctx: &RequestContext, claims: &Claims) -> Result<(), DevAuthError>;
}

/// Checker matching the deployment configuration: addon gating only
/// where features are sold as addons.
pub fn checker_from_config(config: &DevAuthConfig) -> Arc<dyn AccessChecker> {
    if config.have_addons {
        Arc::new(AddonChecker)
    } else {
        Arc::new(NoopChecker)
    }
}

/// Allows everything; used when addons are not in play.
#[derive(Debug, Default)]
pub struct NoopChecker;

impl AccessChecker for NoopChecker {
    fn check(&self, _ctx: &RequestContext, _claims: &Claims) -> Result<(), DevAuthError> {
        Ok(())
    }
}

// Service path segment -> addon that must be enabled to reach it.
const ADDON_RULES: &[(&str, &str)] = &[
    ("deviceconfig", "configure"),
    ("deviceconnect", "troubleshoot"),
    ("devicemonitor", "monitor"),
];

/// Gates addon-backed services by the addons carried in the token.
/// Trial tenants get every addon.
#[derive(Debug, Default)]
pub struct AddonChecker;

impl AccessChecker for AddonChecker {
    fn check(&self, ctx: &RequestContext, claims: &Claims) -> Result<(), DevAuthError> {
        let uri = match ctx.forwarded_uri.as_deref() {
            Some(uri) => uri,
            None => return Ok(()),
        };
        let path = uri.split('?').next().unwrap_or(uri);

        for (service, addon) in ADDON_RULES {
            if !path.split('/').any(|seg| seg == *service) {
                continue;
            }
            if claims.trial {
                return Ok(());
            }
            let enabled = claims
                .addons
                .iter()
                .any(|a| a.name == *addon && a.enabled);
            if !enabled {
                return Err(DevAuthError::Unauthorized);
            }
        }
        Ok(())
    }
}
