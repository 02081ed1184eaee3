//! Plan-weighted API quota computation.
//!
//! Two layers of throttling: an optional process-wide token bucket
//! protecting the service itself, and per-tenant fixed-window quotas
//! enforced by the cache. This module only computes the parameters;
//! counting lives in the cache.

use crate::cache::RateLimitParams;
use crate::context::RequestContext;
use crate::error::DevAuthError;
use crate::models::LIMIT_MAX_DEVICE_COUNT;

use super::DevAuth;

/// Ceiling applied to the weighted quota so the float product always
/// fits a fixed-width counter.
pub const RATE_LIMIT_MAX: u64 = 1 << 50;

pub(super) fn fmt_event_id(tenant: &str, uri: &str) -> String {
    format!("tenant:{}:ratelimit:{}", tenant, uri)
}

/// Query string args do not participate in burst accounting.
pub(super) fn purge_uri_args(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

/// Strip the gateway prefix (`/api/<service>/v<N>/`) so the same route
/// counts identically regardless of API version.
pub(super) fn normalize_forwarded_uri(uri: &str) -> &str {
    let uri = purge_uri_args(uri).trim_start_matches('/');
    let mut parts = uri.splitn(4, '/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("api"), Some(_service), Some(version), Some(rest))
            if version.len() > 1
                && version.starts_with('v')
                && version[1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            rest
        }
        _ => uri,
    }
}

impl DevAuth {
    /// Process-wide guard; runs before any per-tenant accounting.
    pub(super) fn check_rate_limits(&self) -> Result<(), DevAuthError> {
        if let Some(limiter) = &self.limiter {
            limiter.check().map_err(|_| DevAuthError::TooManyRequests)?;
        }
        Ok(())
    }

    /// Compute the throttle parameters for the tenant in `ctx`, or
    /// `None` when the tenant has no device limit (0 = unlimited, so
    /// no request quota either).
    pub async fn rate_limits_from_context(
        &self,
        ctx: &RequestContext,
    ) -> Result<Option<RateLimitParams>, DevAuthError> {
        let limit = self.get_limit(ctx, LIMIT_MAX_DEVICE_COUNT).await?;
        if limit.is_unlimited() {
            return Ok(None);
        }

        let plan = ctx
            .identity
            .as_ref()
            .map(|i| i.plan.as_str())
            .unwrap_or("");
        let weight = self
            .rate_limit_weights
            .get(plan)
            .copied()
            .unwrap_or(self.rate_limit_default_weight);
        let burst = ((limit.value as f64) * weight).min(RATE_LIMIT_MAX as f64) as u64;

        let tenant = match ctx.tenant_id() {
            Some(t) if !t.is_empty() => t,
            _ => "default",
        };
        let uri = normalize_forwarded_uri(ctx.forwarded_uri.as_deref().unwrap_or(""));

        Ok(Some(RateLimitParams {
            burst,
            interval: self.config.rate_limit_interval,
            event_id: fmt_event_id(tenant, uri),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::access::NoopChecker;
    use crate::cache::MemCache;
    use crate::clients::MockOrchestrator;
    use crate::config::JwtKeyConfig;
    use crate::devauth::Config;
    use crate::jwt::JwtService;
    use crate::models::{Limit, PLAN_ENTERPRISE, PLAN_OPEN_SOURCE, PLAN_PROFESSIONAL};
    use crate::store::{DataStore, MemStore};
    use crate::utils::SystemClock;

    fn devauth(store: Arc<MemStore>, weights: &[(&str, f64)]) -> DevAuth {
        let jwt = JwtService::new(&JwtKeyConfig::Hs256 {
            secret: "ratelimit-test".to_string(),
        })
        .unwrap();
        DevAuth::new(
            store,
            Arc::new(MockOrchestrator::new()),
            Arc::new(jwt),
            Arc::new(NoopChecker),
            Config::default(),
        )
        .with_cache(Arc::new(MemCache::new(Arc::new(SystemClock))))
        .with_ratelimits(
            1,
            Duration::from_secs(3600),
            weights
                .iter()
                .map(|(p, w)| (p.to_string(), *w))
                .collect(),
            1.0,
        )
    }

    #[test]
    fn test_normalize_forwarded_uri() {
        assert_eq!(normalize_forwarded_uri("/api/devices/v1/foo/bar"), "foo/bar");
        assert_eq!(normalize_forwarded_uri("/api/devices/v2/foo/bar?x=1"), "foo/bar");
        assert_eq!(normalize_forwarded_uri("/foo/bar"), "foo/bar");
        assert_eq!(normalize_forwarded_uri("/api/devices/version/foo"), "api/devices/version/foo");
    }

    #[tokio::test]
    async fn test_local_token_bucket_guard() {
        let devauth = devauth(Arc::new(MemStore::new()), &[]);
        devauth.check_rate_limits().unwrap();
        assert!(matches!(
            devauth.check_rate_limits().unwrap_err(),
            DevAuthError::TooManyRequests
        ));
    }

    #[tokio::test]
    async fn test_params_without_tenant_use_default_key() {
        let store = Arc::new(MemStore::new());
        let ctx = RequestContext::new("test").with_forwarded("GET", "/api/devices/v1/foo/bar");
        store
            .put_limit(&ctx, Limit::new(LIMIT_MAX_DEVICE_COUNT, 69))
            .await
            .unwrap();

        let devauth = devauth(store, &[]);
        let params = devauth
            .rate_limits_from_context(&ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params.burst, 69);
        assert_eq!(params.event_id, "tenant:default:ratelimit:foo/bar");
    }

    #[tokio::test]
    async fn test_params_apply_plan_weight() {
        let store = Arc::new(MemStore::new());
        let ctx = RequestContext::new("test")
            .with_forwarded("GET", "/api/devices/v1/foo/bar")
            .with_tenant("1234");
        let mut identity = ctx.identity.clone().unwrap();
        identity.plan = PLAN_PROFESSIONAL.to_string();
        let ctx = ctx.with_identity(Some(identity));

        store
            .put_limit(&ctx, Limit::new(LIMIT_MAX_DEVICE_COUNT, 100))
            .await
            .unwrap();

        let devauth = devauth(
            store,
            &[(PLAN_PROFESSIONAL, 5.0), (PLAN_OPEN_SOURCE, 2.0)],
        );
        let params = devauth
            .rate_limits_from_context(&ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params.burst, 500);
        assert_eq!(params.event_id, "tenant:1234:ratelimit:foo/bar");
    }

    #[tokio::test]
    async fn test_params_clamp_overflow() {
        let store = Arc::new(MemStore::new());
        let ctx = RequestContext::new("test")
            .with_forwarded("GET", "/api/devices/v1/foo/bar")
            .with_tenant("1234");
        let mut identity = ctx.identity.clone().unwrap();
        identity.plan = PLAN_ENTERPRISE.to_string();
        let ctx = ctx.with_identity(Some(identity));

        store
            .put_limit(&ctx, Limit::new(LIMIT_MAX_DEVICE_COUNT, 1 << 61))
            .await
            .unwrap();

        let devauth = devauth(store, &[(PLAN_ENTERPRISE, 10.0)]);
        let params = devauth
            .rate_limits_from_context(&ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params.burst, RATE_LIMIT_MAX);
    }

    #[tokio::test]
    async fn test_unlimited_tenant_has_no_quota() {
        let devauth = devauth(Arc::new(MemStore::new()), &[]);
        let ctx = RequestContext::new("test").with_forwarded("GET", "/api/devices/v1/foo/bar");
        assert!(devauth.rate_limits_from_context(&ctx).await.unwrap().is_none());
    }
}
