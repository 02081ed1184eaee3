//! Shared fixtures: an admission core wired to in-memory
//! collaborators, with a controllable clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;

use deviceauth_service::access::NoopChecker;
use deviceauth_service::cache::MemCache;
use deviceauth_service::clients::orchestrator::OrchestratorJob;
use deviceauth_service::clients::{MockOrchestrator, MockTenantClient};
use deviceauth_service::config::JwtKeyConfig;
use deviceauth_service::devauth::{Config, DevAuth};
use deviceauth_service::error::DevAuthError;
use deviceauth_service::jwt::JwtService;
use deviceauth_service::models::{AuthReq, DeviceFilter};
use deviceauth_service::store::MemStore;
use deviceauth_service::utils::FixedClock;
use deviceauth_service::RequestContext;

pub struct Fixture {
    pub devauth: DevAuth,
    pub store: Arc<MemStore>,
    pub cache: Arc<MemCache>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub clock: Arc<FixedClock>,
}

pub fn jwt_service() -> JwtService {
    jwt_service_with("integration-test-secret")
}

pub fn jwt_service_with(secret: &str) -> JwtService {
    JwtService::new(&JwtKeyConfig::Hs256 {
        secret: secret.to_string(),
    })
    .unwrap()
}

/// Single-tenant core with a cache; the clock starts at the real
/// current time so token expiry checks behave, then moves only when a
/// test advances it.
pub fn fixture() -> Fixture {
    fixture_with(Config::default())
}

pub fn fixture_with(config: Config) -> Fixture {
    build(config, None, None)
}

/// Multi-tenant variant of [`fixture`] on top of the given tenant
/// resolver.
pub fn fixture_multitenant(tenant_client: Arc<MockTenantClient>) -> Fixture {
    build(Config::default(), Some(tenant_client), None)
}

/// [`fixture`] with a secondary validation key for rotation scenarios:
/// the primary key stays the default one, the given secret acts as the
/// rotated-out key.
pub fn fixture_with_fallback(fallback_secret: &str) -> Fixture {
    build(Config::default(), None, Some(fallback_secret))
}

fn build(
    config: Config,
    tenant_client: Option<Arc<MockTenantClient>>,
    fallback_secret: Option<&str>,
) -> Fixture {
    let store = Arc::new(MemStore::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let cache = Arc::new(MemCache::new(clock.clone()));

    let mut devauth = DevAuth::new(
        store.clone(),
        orchestrator.clone(),
        Arc::new(jwt_service()),
        Arc::new(NoopChecker),
        config,
    )
    .with_cache(cache.clone())
    .with_clock(clock.clone());
    if let Some(tenant_client) = tenant_client {
        devauth = devauth.with_tenant_verification(tenant_client);
    }
    if let Some(secret) = fallback_secret {
        devauth = devauth.with_jwt_fallback_handler(Arc::new(jwt_service_with(secret)));
    }

    Fixture {
        devauth,
        store,
        cache,
        orchestrator,
        clock,
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new("test")
}

pub fn auth_req(mac: &str, pubkey: &str) -> AuthReq {
    AuthReq {
        id_data: format!(r#"{{"mac":"{}"}}"#, mac),
        pubkey: pubkey.to_string(),
        tenant_token: String::new(),
    }
}

/// Submit an auth request expected to land as a pending auth set and
/// return (device id, auth set id).
pub async fn submit_pending(
    devauth: &DevAuth,
    ctx: &RequestContext,
    req: &AuthReq,
) -> (String, String) {
    let err = devauth.submit_auth_request(ctx, req).await.unwrap_err();
    assert!(
        matches!(err, DevAuthError::Unauthorized),
        "expected unauthorized, got: {:?}",
        err
    );

    let devs = devauth
        .get_devices(ctx, 0, 100, DeviceFilter::default())
        .await
        .unwrap();
    for dev in devs {
        for auth_set in &dev.auth_sets {
            if auth_set.pubkey == req.pubkey && auth_set.id_data == req.id_data {
                return (dev.id.clone(), auth_set.id.clone());
            }
        }
    }
    panic!("auth set was not created for the request");
}

/// Drive a fresh device through submit and accept, then collect its
/// token. Returns (device id, auth set id, raw token).
pub async fn accept_and_issue(
    devauth: &DevAuth,
    ctx: &RequestContext,
    req: &AuthReq,
) -> (String, String, String) {
    let (device_id, auth_id) = submit_pending(devauth, ctx, req).await;
    devauth
        .accept_device_auth(ctx, &device_id, &auth_id)
        .await
        .unwrap();
    let raw = devauth.submit_auth_request(ctx, req).await.unwrap();
    (device_id, auth_id, raw)
}

pub fn provision_job_count(orchestrator: &MockOrchestrator) -> usize {
    orchestrator
        .jobs
        .lock()
        .unwrap()
        .iter()
        .filter(|job| matches!(job, OrchestratorJob::ProvisionDevice(_)))
        .count()
}
