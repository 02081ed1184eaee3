//! Admission and state-machine core.
//!
//! Owns the device/auth-set lifecycle, admission quotas, token
//! issuance and the multi-stage verification pipeline. External
//! collaborators (store, cache, orchestrator, tenant administration)
//! are injected behind traits; the core itself holds no locks and
//! delegates cross-request consistency to the store's idempotent
//! create primitives.
//!
//! Status transitions that collaborating services must observe submit
//! the orchestrator job before committing the local write, so a failed
//! submission leaves local state unchanged.

mod ratelimits;

pub use ratelimits::RATE_LIMIT_MAX;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::AccessChecker;
use crate::cache::{Cache, IdType};
use crate::clients::orchestrator::{
    DecommissioningReq, DeviceInventoryUpdate, OrchestratorClient, ProvisionDeviceReq, ReindexReq,
    UpdateDeviceInventoryReq, UpdateDeviceStatusReq,
};
use crate::clients::tenant::{Tenant, TenantClient, TenantClientError};
use crate::config::DevAuthConfig;
use crate::context::{Identity, RequestContext};
use crate::error::DevAuthError;
use crate::jwt::{parse_claims, Claims, JwtError, JwtHandler};
use crate::models::{
    all_addons_enabled, parse_id_data, AuthReq, AuthSet, AuthSetUpdate, Device, DeviceAttribute,
    DeviceFilter, DeviceUpdate, Limit, PreAuthReq, Status, LIMIT_MAX_DEVICE_COUNT,
    PLAN_ENTERPRISE,
};
use crate::store::{DataStore, StoreError};
use crate::utils::{Clock, SystemClock};

const INVENTORY_SCOPE_IDENTITY: &str = "identity";
const INVENTORY_SCOPE_SYSTEM: &str = "system";
/// Inventory status used to purge deleted preauthorized devices, which
/// were never provisioned and so have no decommissioning workflow.
const STATUS_DECOMMISSIONED: &str = "decommissioned";
const REINDEX_SERVICE: &str = "deviceauth";

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Core runtime settings, independent of how configuration is loaded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Issuer claim stamped into every token.
    pub issuer: String,
    /// Token lifetime in seconds.
    pub expiration_seconds: i64,
    /// Tenant token assumed when a device supplies none.
    pub default_tenant_token: String,
    /// Route inventory-affecting changes through reindex jobs instead
    /// of direct attribute updates.
    pub enable_reporting: bool,
    /// Fixed-window length for per-tenant API quotas.
    pub rate_limit_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            issuer: "deviceauth".to_string(),
            expiration_seconds: 604800,
            default_tenant_token: String::new(),
            enable_reporting: false,
            rate_limit_interval: Duration::from_secs(60),
        }
    }
}

impl From<&DevAuthConfig> for Config {
    fn from(cfg: &DevAuthConfig) -> Self {
        Self {
            issuer: cfg.jwt_issuer.clone(),
            expiration_seconds: cfg.jwt_expiration_seconds,
            default_tenant_token: cfg.default_tenant_token.clone(),
            enable_reporting: cfg.enable_reporting,
            rate_limit_interval: Duration::from_secs(cfg.rate_limit.interval_seconds),
        }
    }
}

pub struct DevAuth {
    db: Arc<dyn DataStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    jwt: Arc<dyn JwtHandler>,
    jwt_fallback: Option<Arc<dyn JwtHandler>>,
    tenant_client: Option<Arc<dyn TenantClient>>,
    cache: Option<Arc<dyn Cache>>,
    checker: Arc<dyn AccessChecker>,
    clock: Arc<dyn Clock>,
    limiter: Option<Arc<DirectRateLimiter>>,
    rate_limit_weights: HashMap<String, f64>,
    rate_limit_default_weight: f64,
    verify_tenant: bool,
    config: Config,
}

impl DevAuth {
    pub fn new(
        db: Arc<dyn DataStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        jwt: Arc<dyn JwtHandler>,
        checker: Arc<dyn AccessChecker>,
        config: Config,
    ) -> Self {
        Self {
            db,
            orchestrator,
            jwt,
            jwt_fallback: None,
            tenant_client: None,
            cache: None,
            checker,
            clock: Arc::new(SystemClock),
            limiter: None,
            rate_limit_weights: HashMap::new(),
            rate_limit_default_weight: 1.0,
            verify_tenant: false,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Enable multi-tenant mode: every authentication request must
    /// resolve a tenant through the given client.
    pub fn with_tenant_verification(mut self, client: Arc<dyn TenantClient>) -> Self {
        self.tenant_client = Some(client);
        self.verify_tenant = true;
        self
    }

    /// Secondary validation key, used during signing key rotation.
    pub fn with_jwt_fallback_handler(mut self, handler: Arc<dyn JwtHandler>) -> Self {
        self.jwt_fallback = Some(handler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Arm the process-wide token-bucket guard (`burst` events per
    /// `period`) and the plan weights applied to per-tenant quotas.
    pub fn with_ratelimits(
        mut self,
        burst: u32,
        period: Duration,
        weights: HashMap<String, f64>,
        default_weight: f64,
    ) -> Self {
        if let Some(quota) = Quota::with_period(period) {
            let quota = match NonZeroU32::new(burst) {
                Some(burst) => quota.allow_burst(burst),
                None => quota,
            };
            self.limiter = Some(Arc::new(RateLimiter::direct(quota)));
        }
        self.rate_limit_weights = weights;
        self.rate_limit_default_weight = default_weight;
        self
    }

    fn tenant_of(ctx: &RequestContext) -> String {
        ctx.tenant_id().unwrap_or("").to_string()
    }

    // ------------------------------------------------------------------
    // Authentication requests
    // ------------------------------------------------------------------

    /// Handle a device authentication request end to end: resolve the
    /// tenant, resolve or create the device and auth set, run the
    /// preauthorization fast path, and mint a token when the auth set
    /// is accepted. Absence of a token (pending, rejected or
    /// quota-blocked device) is the single "unauthorized" outcome.
    pub async fn submit_auth_request(
        &self,
        ctx: &RequestContext,
        req: &AuthReq,
    ) -> Result<String, DevAuthError> {
        let (ctx, tenant) = if self.verify_tenant {
            let (scoped, tenant) = self.get_tenant_with_default(ctx, &req.tenant_token).await?;
            (scoped, Some(tenant))
        } else {
            // devices may replay old tokens carrying identity data;
            // wipe it in single-tenant mode
            (ctx.with_identity(None), None)
        };
        let ctx = &ctx;

        let auth_set = match self.process_pre_auth_request(ctx, req).await {
            Ok(Some(auth_set)) => auth_set,
            Ok(None) => self.process_auth_request(ctx, req).await?,
            // a device never learns whether it was quota-blocked
            Err(DevAuthError::MaxDeviceCountReached) => return Err(DevAuthError::Unauthorized),
            Err(err) => return Err(err),
        };

        if auth_set.status != Status::Accepted {
            return Err(DevAuthError::Unauthorized);
        }

        let now = self.clock.now();
        let mut claims = Claims {
            id: auth_set.id.clone(),
            subject: auth_set.device_id.clone(),
            issuer: self.config.issuer.clone(),
            expires_at: now.timestamp() + self.config.expiration_seconds,
            issued_at: now.timestamp(),
            device: true,
            ..Default::default()
        };
        match &tenant {
            Some(tenant) => {
                claims.tenant = Some(tenant.id.clone());
                claims.plan = Some(tenant.plan.clone());
                claims.addons = tenant.addons.clone();
                claims.trial = tenant.trial;
            }
            None => {
                // single-tenant installations get every capability
                claims.plan = Some(PLAN_ENTERPRISE.to_string());
                claims.addons = all_addons_enabled();
            }
        }

        let raw = self.jwt.sign(&claims).map_err(DevAuthError::Internal)?;
        self.db.add_token(ctx, claims.clone()).await?;

        info!(
            token_id = %claims.id,
            device_id = %claims.subject,
            "token assigned to device"
        );
        self.update_check_in_time(ctx, &auth_set.device_id).await;
        Ok(raw)
    }

    /// Resolve the tenant from the supplied token, falling back to the
    /// configured default token; first success wins. Returns a context
    /// scoped to the resolved tenant.
    async fn get_tenant_with_default(
        &self,
        ctx: &RequestContext,
        tenant_token: &str,
    ) -> Result<(RequestContext, Tenant), DevAuthError> {
        let client = self.tenant_client.as_ref().ok_or_else(|| {
            DevAuthError::Internal(anyhow::anyhow!(
                "tenant verification enabled without a tenant client"
            ))
        })?;
        let default_token = self.config.default_tenant_token.as_str();
        if tenant_token.is_empty() && default_token.is_empty() {
            warn!("tenant token missing");
            return Err(DevAuthError::Unauthorized);
        }

        let mut tenant = None;
        let mut last_err = DevAuthError::Unauthorized;
        for token in [tenant_token, default_token] {
            if token.is_empty() {
                continue;
            }
            match client.verify_token(token).await {
                Ok(t) => {
                    tenant = Some(t);
                    break;
                }
                Err(TenantClientError::VerificationFailed(reason)) => {
                    warn!(%reason, "failed to verify tenant token");
                    last_err = DevAuthError::Unauthorized;
                }
                Err(TenantClientError::Internal(err)) => {
                    warn!(error = %err, "tenant token verification request failed");
                    last_err = DevAuthError::TenantVerification(err);
                }
            }
        }

        match tenant {
            Some(tenant) => {
                let scoped = ctx.with_identity(Some(Identity {
                    subject: "internal".to_string(),
                    tenant: tenant.id.clone(),
                    plan: tenant.plan.clone(),
                    addons: tenant.addons.clone(),
                    trial: tenant.trial,
                }));
                Ok((scoped, tenant))
            }
            None => Err(last_err),
        }
    }

    /// Preauthorization fast path: when a preauthorized auth set exists
    /// for this (identity hash, key), try to auto-accept it.
    async fn process_pre_auth_request(
        &self,
        ctx: &RequestContext,
        req: &AuthReq,
    ) -> Result<Option<AuthSet>, DevAuthError> {
        let (_, id_data_sha256) = parse_id_data(&req.id_data)?;

        let auth_set = match self
            .db
            .get_auth_set_by_data_hash_key_by_status(
                ctx,
                &id_data_sha256,
                &req.pubkey,
                Status::Preauthorized,
            )
            .await
        {
            Ok(auth_set) => auth_set,
            Err(StoreError::AuthSetNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let auth_set = self.handle_pre_auth_device(ctx, auth_set).await?;
        Ok(Some(auth_set))
    }

    async fn handle_pre_auth_device(
        &self,
        ctx: &RequestContext,
        mut auth_set: AuthSet,
    ) -> Result<AuthSet, DevAuthError> {
        // the device status before the transition decides whether
        // provisioning fires
        let dev = self.db.get_device_by_id(ctx, &auth_set.device_id).await?;
        if dev.decommissioning {
            warn!(device_id = %dev.id, "device is being decommissioned");
            return Err(DevAuthError::Unauthorized);
        }

        let previous_status = dev.status;
        if previous_status != Status::Accepted && !self.can_accept_device(ctx).await? {
            return Err(DevAuthError::MaxDeviceCountReached);
        }

        match self.db.reject_auth_sets_for_device(ctx, &auth_set.device_id).await {
            Ok(()) | Err(StoreError::AuthSetNotFound) => {}
            Err(err) => return Err(err.into()),
        }
        self.db
            .update_auth_set_by_id(
                ctx,
                &auth_set.id,
                AuthSetUpdate {
                    status: Some(Status::Accepted),
                },
            )
            .await?;
        self.update_device_status(ctx, &auth_set.device_id, Some(Status::Accepted), previous_status)
            .await?;

        auth_set.status = Status::Accepted;

        if previous_status != Status::Accepted {
            let mut dev = dev;
            dev.status = Status::Accepted;
            dev.auth_sets = vec![auth_set.clone()];
            self.submit_provision_device(ctx, &dev).await?;
        }

        Ok(auth_set)
    }

    /// Regular authentication path: record/locate device and pending
    /// auth set.
    async fn process_auth_request(
        &self,
        ctx: &RequestContext,
        req: &AuthReq,
    ) -> Result<AuthSet, DevAuthError> {
        let dev = self.get_device_from_auth_request(ctx, req).await?;
        let (id_data_struct, id_data_sha256) = parse_id_data(&req.id_data)?;

        let auth_set = AuthSet {
            id: Uuid::new_v4().to_string(),
            device_id: dev.id.clone(),
            id_data: req.id_data.clone(),
            id_data_struct,
            id_data_sha256: id_data_sha256.clone(),
            pubkey: req.pubkey.clone(),
            status: Status::Pending,
            timestamp: self.clock.now(),
        };
        match self.db.add_auth_set(ctx, auth_set).await {
            Ok(()) | Err(StoreError::ObjectExists) => {}
            Err(err) => return Err(err.into()),
        }

        self.update_device_status(ctx, &dev.id, None, dev.status).await?;

        // inserted or already present, pull the canonical record
        let auth_set = self
            .db
            .get_auth_set_by_data_hash_key(ctx, &id_data_sha256, &req.pubkey)
            .await?;
        Ok(auth_set)
    }

    async fn get_device_from_auth_request(
        &self,
        ctx: &RequestContext,
        req: &AuthReq,
    ) -> Result<Device, DevAuthError> {
        let (id_data_struct, id_data_sha256) = parse_id_data(&req.id_data)?;
        let mut dev = Device::new("", &req.id_data, self.clock.now());
        dev.id_data_struct = id_data_struct;
        dev.id_data_sha256 = id_data_sha256.clone();

        let created = match self.db.add_device(ctx, dev).await {
            Ok(()) => true,
            Err(StoreError::ObjectExists) => false,
            Err(err) => return Err(err.into()),
        };

        // in any case the canonical record comes from the store
        let dev = self.db.get_device_by_identity_hash(ctx, &id_data_sha256).await?;

        if created {
            self.set_device_identity(ctx, &dev).await?;
        }

        if dev.decommissioning {
            warn!(device_id = %dev.id, "device is being decommissioned");
            return Err(DevAuthError::Unauthorized);
        }

        Ok(dev)
    }

    /// Push the identity payload to inventory as identity-scope
    /// attributes.
    async fn set_device_identity(
        &self,
        ctx: &RequestContext,
        dev: &Device,
    ) -> Result<(), DevAuthError> {
        let attributes: Vec<DeviceAttribute> = dev
            .id_data_struct
            .iter()
            // "status" is reserved for the admission state, devices may
            // not override it through their identity payload
            .filter(|(name, _)| name.as_str() != "status")
            .map(|(name, value)| DeviceAttribute {
                name: name.clone(),
                description: None,
                value: value.clone(),
                scope: INVENTORY_SCOPE_IDENTITY.to_string(),
            })
            .collect();
        let attributes = serde_json::to_string(&attributes)
            .map_err(|err| anyhow::anyhow!("cannot serialize attributes: {}", err))?;

        self.orchestrator
            .submit_update_device_inventory(UpdateDeviceInventoryReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                device_id: dev.id.clone(),
                scope: INVENTORY_SCOPE_IDENTITY.to_string(),
                attributes,
            })
            .await
            .map_err(DevAuthError::Orchestrator)?;

        if self.config.enable_reporting {
            self.submit_reindex(ctx, &dev.id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admin status transitions
    // ------------------------------------------------------------------

    /// Accept an auth set; valid from pending or rejected, no-op when
    /// already accepted. Fires provisioning only when the device itself
    /// transitions from a non-accepted status.
    pub async fn accept_device_auth(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), DevAuthError> {
        let mut auth_set = self.db.get_auth_set_by_id(ctx, auth_id).await?;
        if auth_set.status == Status::Accepted {
            debug!(device_id, "auth set already accepted");
            return Ok(());
        }
        if auth_set.status != Status::Pending && auth_set.status != Status::Rejected {
            return Err(DevAuthError::BadRequest(
                "auth set can be accepted only from the pending or rejected status".to_string(),
            ));
        }

        // device status before the transition decides whether the
        // provisioning workflow fires
        let mut dev = self.db.get_device_by_id(ctx, device_id).await?;

        // known race: two concurrent accepts near the quota boundary can
        // both pass this check
        if !self.can_accept_device(ctx).await? {
            return Err(DevAuthError::MaxDeviceCountReached);
        }

        self.set_auth_set_status(ctx, device_id, auth_id, Status::Accepted)
            .await?;

        if dev.status == Status::Accepted {
            // device already provisioned in every collaborating service
            return Ok(());
        }

        dev.status = Status::Accepted;
        auth_set.status = Status::Accepted;
        dev.auth_sets = vec![auth_set];
        self.submit_provision_device(ctx, &dev).await
    }

    /// Reject an auth set; valid from pending or accepted.
    pub async fn reject_device_auth(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), DevAuthError> {
        let auth_set = self.db.get_auth_set_by_id(ctx, auth_id).await?;
        if auth_set.status != Status::Pending && auth_set.status != Status::Accepted {
            return Err(DevAuthError::BadRequest(
                "auth set can be rejected only from the accepted or pending status".to_string(),
            ));
        }
        self.set_auth_set_status(ctx, device_id, auth_id, Status::Rejected)
            .await
    }

    /// Reset an auth set back to pending; invalid for preauthorized
    /// sets.
    pub async fn reset_device_auth(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), DevAuthError> {
        let auth_set = self.db.get_auth_set_by_id(ctx, auth_id).await?;
        if auth_set.status == Status::Preauthorized {
            return Err(DevAuthError::BadRequest(
                "preauthorized auth set cannot be moved to the pending status".to_string(),
            ));
        }
        self.set_auth_set_status(ctx, device_id, auth_id, Status::Pending)
            .await
    }

    async fn set_auth_set_status(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
        status: Status,
    ) -> Result<(), DevAuthError> {
        let auth_set = self.db.get_auth_set_by_id(ctx, auth_id).await?;
        if auth_set.device_id != device_id {
            return Err(DevAuthError::DevIdAuthIdMismatch);
        }
        if auth_set.status == status {
            return Ok(());
        }
        let current_status = auth_set.status;

        // any transition into or out of accepted invalidates the
        // device's tokens, in the store and in the cache
        if current_status == Status::Accepted || status == Status::Accepted {
            match self.db.delete_token_by_dev_id(ctx, device_id).await {
                Ok(()) | Err(StoreError::TokenNotFound) => {}
                Err(err) => return Err(err.into()),
            }
            self.cache_delete_token(ctx, device_id).await?;
        }

        if status == Status::Accepted {
            // at most one accepted auth set per device
            match self.db.reject_auth_sets_for_device(ctx, device_id).await {
                Ok(()) | Err(StoreError::AuthSetNotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.db
            .update_auth_set_by_id(
                ctx,
                auth_id,
                AuthSetUpdate {
                    status: Some(status),
                },
            )
            .await?;

        if status == Status::Accepted {
            self.update_device_status(ctx, device_id, Some(status), current_status)
                .await
        } else {
            self.update_device_status(ctx, device_id, None, current_status)
                .await
        }
    }

    /// Propagate a device status change: submit the inventory status
    /// job first, then commit the device record. No-op when the
    /// aggregated status did not change.
    async fn update_device_status(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        status: Option<Status>,
        current_status: Status,
    ) -> Result<(), DevAuthError> {
        let status = match self.db.get_device_status(ctx, device_id).await {
            Ok(new_status) => {
                if new_status == current_status {
                    return Ok(());
                }
                status.unwrap_or(new_status)
            }
            Err(StoreError::AuthSetNotFound) => status.unwrap_or(Status::NoAuth),
            Err(err) => return Err(err.into()),
        };

        let dev = self.db.get_device_by_id(ctx, device_id).await?;

        self.orchestrator
            .submit_update_device_status(UpdateDeviceStatusReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                devices: vec![DeviceInventoryUpdate {
                    id: dev.id.clone(),
                    revision: dev.revision + 1,
                }],
                status: status.as_str().to_string(),
            })
            .await
            .map_err(DevAuthError::Orchestrator)?;

        self.db
            .update_device(
                ctx,
                device_id,
                DeviceUpdate {
                    status: Some(status),
                    updated_ts: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;

        if self.config.enable_reporting {
            self.submit_reindex(ctx, device_id).await?;
        }
        Ok(())
    }

    async fn submit_provision_device(
        &self,
        ctx: &RequestContext,
        dev: &Device,
    ) -> Result<(), DevAuthError> {
        self.orchestrator
            .submit_provision_device(ProvisionDeviceReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                device_id: dev.id.clone(),
                device: dev.clone(),
                status: dev.status.as_str().to_string(),
            })
            .await
            .map_err(DevAuthError::Orchestrator)
    }

    async fn submit_reindex(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), DevAuthError> {
        self.orchestrator
            .submit_reindex(ReindexReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                device_id: device_id.to_string(),
                service: REINDEX_SERVICE.to_string(),
            })
            .await
            .map_err(DevAuthError::Orchestrator)
    }

    // ------------------------------------------------------------------
    // Preauthorization
    // ------------------------------------------------------------------

    /// Create a device with a preauthorized auth set before first
    /// contact. Returns `None` on a fresh preauthorization, the
    /// existing device when `force` upserted the auth set, and
    /// `DeviceExists` on a conflict without `force`.
    pub async fn preauthorize_device(
        &self,
        ctx: &RequestContext,
        req: &PreAuthReq,
    ) -> Result<Option<Device>, DevAuthError> {
        let (id_data_struct, id_data_sha256) = parse_id_data(&req.id_data)?;
        let now = self.clock.now();

        let auth_set_id = if req.auth_set_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.auth_set_id.clone()
        };

        let mut dev = Device::new(&req.device_id, &req.id_data, now);
        dev.status = Status::Preauthorized;
        dev.id_data_struct = id_data_struct.clone();
        dev.id_data_sha256 = id_data_sha256.clone();

        match self.db.add_device(ctx, dev.clone()).await {
            Ok(()) => {}
            Err(StoreError::ObjectExists) => {
                let existing = self
                    .db
                    .get_device_by_identity_hash(ctx, &id_data_sha256)
                    .await?;
                if req.force {
                    // key rotation for an already-preauthorized device
                    let auth_set = AuthSet {
                        id: auth_set_id,
                        device_id: existing.id.clone(),
                        id_data: req.id_data.clone(),
                        id_data_struct,
                        id_data_sha256,
                        pubkey: req.pubkey.clone(),
                        status: Status::Preauthorized,
                        timestamp: now,
                    };
                    self.db.upsert_auth_set_status(ctx, auth_set).await?;
                    return Ok(Some(existing));
                }
                return Err(DevAuthError::DeviceExists);
            }
            Err(err) => return Err(err.into()),
        }

        // publish the new device to inventory before recording the
        // auth set
        self.orchestrator
            .submit_update_device_status(UpdateDeviceStatusReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                devices: vec![DeviceInventoryUpdate {
                    id: dev.id.clone(),
                    revision: dev.revision,
                }],
                status: dev.status.as_str().to_string(),
            })
            .await
            .map_err(DevAuthError::Orchestrator)?;

        let auth_set = AuthSet {
            id: auth_set_id,
            device_id: dev.id.clone(),
            id_data: req.id_data.clone(),
            id_data_struct,
            id_data_sha256,
            pubkey: req.pubkey.clone(),
            status: Status::Preauthorized,
            timestamp: now,
        };
        match self.db.add_auth_set(ctx, auth_set).await {
            Ok(()) => {
                self.set_device_identity(ctx, &dev).await?;
                Ok(None)
            }
            Err(StoreError::ObjectExists) => Err(DevAuthError::DeviceExists),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Decommissioning and deletion
    // ------------------------------------------------------------------

    /// Soft-delete: mark the device as decommissioning and invalidate
    /// its tokens. The record remains until the decommissioning
    /// workflow cleans up.
    pub async fn decommission_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), DevAuthError> {
        warn!(device_id, "decommissioning device");

        // fail early when the device is unknown, before firing jobs
        self.db.get_device_by_id(ctx, device_id).await?;

        self.orchestrator
            .submit_decommission_device(DecommissioningReq {
                request_id: ctx.request_id.clone(),
                tenant_id: Self::tenant_of(ctx),
                device_id: device_id.to_string(),
            })
            .await
            .map_err(DevAuthError::Orchestrator)?;

        self.cache_delete_token(ctx, device_id).await?;
        match self.db.delete_token_by_dev_id(ctx, device_id).await {
            Ok(()) | Err(StoreError::TokenNotFound) => {}
            Err(err) => return Err(err.into()),
        }

        self.db
            .update_device(
                ctx,
                device_id,
                DeviceUpdate {
                    decommissioning: Some(true),
                    updated_ts: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Hard cascade: auth sets, tokens, then the device record.
    pub async fn delete_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), DevAuthError> {
        match self.db.delete_auth_sets_for_device(ctx, device_id).await {
            Ok(()) | Err(StoreError::AuthSetNotFound) => {}
            Err(err) => return Err(err.into()),
        }

        self.cache_delete_token(ctx, device_id).await?;
        match self.db.delete_token_by_dev_id(ctx, device_id).await {
            Ok(()) | Err(StoreError::TokenNotFound) => {}
            Err(err) => return Err(err.into()),
        }

        self.db.delete_device(ctx, device_id).await?;

        if self.config.enable_reporting {
            self.submit_reindex(ctx, device_id).await?;
        }
        Ok(())
    }

    /// Delete a single auth set. Removing a preauthorized set removes
    /// the whole device record, which exists only because of the
    /// preauthorization.
    pub async fn delete_auth_set(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), DevAuthError> {
        warn!(auth_id, device_id, "deleting authentication set");

        self.cache_delete_token(ctx, device_id).await?;

        let auth_set = self.db.get_auth_set_by_id(ctx, auth_id).await?;
        self.db
            .delete_auth_set_for_device(ctx, device_id, auth_id)
            .await?;

        match auth_set.status {
            Status::Preauthorized => {
                // the device was never provisioned, so there is no
                // decommissioning workflow for it; the special
                // "decommissioned" status purges it from inventory
                self.orchestrator
                    .submit_update_device_status(UpdateDeviceStatusReq {
                        request_id: ctx.request_id.clone(),
                        tenant_id: Self::tenant_of(ctx),
                        devices: vec![DeviceInventoryUpdate {
                            id: device_id.to_string(),
                            revision: 0,
                        }],
                        status: STATUS_DECOMMISSIONED.to_string(),
                    })
                    .await
                    .map_err(DevAuthError::Orchestrator)?;

                self.db.delete_device(ctx, device_id).await?;

                if self.config.enable_reporting {
                    self.submit_reindex(ctx, device_id).await?;
                }
                Ok(())
            }
            Status::Accepted => {
                match self.db.delete_token_by_dev_id(ctx, device_id).await {
                    Ok(()) | Err(StoreError::TokenNotFound) => {}
                    Err(err) => return Err(err.into()),
                }
                self.update_device_status(ctx, device_id, None, auth_set.status)
                    .await
            }
            _ => {
                self.update_device_status(ctx, device_id, None, auth_set.status)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Device, DevAuthError> {
        let mut dev = self.db.get_device_by_id(ctx, device_id).await?;
        match self.db.get_auth_sets_for_device(ctx, device_id).await {
            Ok(auth_sets) => dev.auth_sets = auth_sets,
            Err(StoreError::AuthSetNotFound) => return Ok(dev),
            Err(err) => return Err(err.into()),
        }

        if let Some(cache) = &self.cache {
            let tenant = Self::tenant_of(ctx);
            match cache.get_check_in_time(ctx, &tenant, device_id).await {
                Ok(Some(time)) => dev.check_in_time = Some(time),
                Ok(None) => {}
                Err(err) => {
                    warn!(device_id, error = %err, "failed to get check-in time for device");
                }
            }
        }
        Ok(dev)
    }

    pub async fn get_devices(
        &self,
        ctx: &RequestContext,
        skip: usize,
        limit: usize,
        filter: DeviceFilter,
    ) -> Result<Vec<Device>, DevAuthError> {
        let mut devs = self.db.get_devices(ctx, skip, limit, filter).await?;
        for dev in &mut devs {
            match self.db.get_auth_sets_for_device(ctx, &dev.id).await {
                Ok(auth_sets) => dev.auth_sets = auth_sets,
                Err(StoreError::AuthSetNotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(cache) = &self.cache {
            let tenant = Self::tenant_of(ctx);
            let ids: Vec<String> = devs.iter().map(|d| d.id.clone()).collect();
            match cache.get_check_in_times(ctx, &tenant, &ids).await {
                Ok(times) => {
                    for (dev, time) in devs.iter_mut().zip(times) {
                        if let Some(time) = time {
                            dev.check_in_time = Some(time);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "failed to get check-in times for devices"),
            }
        }
        Ok(devs)
    }

    pub async fn get_tenant_device_status(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Status, DevAuthError> {
        let ctx = if tenant_id.is_empty() {
            ctx.clone()
        } else {
            ctx.with_tenant(tenant_id)
        };
        let dev = self.db.get_device_by_id(&ctx, device_id).await?;
        Ok(dev.status)
    }

    // ------------------------------------------------------------------
    // Token verification
    // ------------------------------------------------------------------

    /// Verify a presented session token: parse, tenant-claim and access
    /// checks, throttling, cache fast path, then signature and store
    /// validation on the cold path. Expired tokens are deleted from the
    /// store and reported distinctly from invalid ones.
    pub async fn verify_token(
        &self,
        ctx: &RequestContext,
        raw: &str,
    ) -> Result<Claims, DevAuthError> {
        let claims = match parse_claims(raw) {
            Ok(claims) => claims,
            Err(_) => return Err(DevAuthError::TokenInvalid),
        };
        if !claims.device {
            warn!(token_id = %claims.id, "not a device token");
            return Err(DevAuthError::TokenInvalid);
        }
        self.verify_tenant_claim(&claims)?;

        let ctx = ctx.with_identity(Some(Identity {
            subject: claims.subject.clone(),
            tenant: claims.tenant.clone().unwrap_or_default(),
            plan: claims.plan.clone().unwrap_or_default(),
            addons: claims.addons.clone(),
            trial: claims.trial,
        }));
        let ctx = &ctx;

        self.checker.check(ctx, &claims)?;
        self.check_rate_limits()?;

        if let Some(cache) = &self.cache {
            // a cached hit of the same raw token was validated when it
            // was cached; trust it
            match self.cache_throttle_verify(ctx, cache.as_ref(), raw, &claims).await {
                Ok(Some(cached)) if cached == raw => {
                    self.update_check_in_time(ctx, &claims.subject).await;
                    return Ok(claims);
                }
                Ok(_) => {}
                Err(DevAuthError::TooManyRequests) => return Err(DevAuthError::TooManyRequests),
                Err(err) => {
                    warn!(error = %err, "cache throttle failed, continuing on the cold path");
                }
            }
        }

        self.validate_jwt(ctx, &claims.id, raw).await?;

        // cache miss, fall back to the store
        self.db.get_token(ctx, &claims.id).await?;

        let auth_set = self.db.get_auth_set_by_id(ctx, &claims.id).await?;
        if auth_set.status != Status::Accepted {
            return Err(DevAuthError::Unauthorized);
        }

        let dev = self.db.get_device_by_id(ctx, &auth_set.device_id).await?;
        if dev.decommissioning {
            warn!(
                token_id = %claims.id,
                device_id = %dev.id,
                "token rejected, device is being decommissioned"
            );
            return Err(DevAuthError::Unauthorized);
        }

        self.update_check_in_time(ctx, &auth_set.device_id).await;
        self.cache_set_token(ctx, &claims, raw).await;
        Ok(claims)
    }

    /// Tokens must carry a tenant claim exactly when multi-tenant mode
    /// is on; this defends against tokens minted under the other mode.
    fn verify_tenant_claim(&self, claims: &Claims) -> Result<(), DevAuthError> {
        let has_tenant = claims.tenant.as_deref().map_or(false, |t| !t.is_empty());
        if self.verify_tenant {
            if !has_tenant {
                warn!(token_id = %claims.id, "token without tenant claim in multi-tenant mode");
                return Err(DevAuthError::TokenInvalid);
            }
        } else if has_tenant {
            warn!(token_id = %claims.id, "token with tenant claim in single-tenant mode");
            return Err(DevAuthError::TokenInvalid);
        }
        Ok(())
    }

    async fn validate_jwt(
        &self,
        ctx: &RequestContext,
        jti: &str,
        raw: &str,
    ) -> Result<(), DevAuthError> {
        let mut result = self.jwt.validate(raw);
        if result.is_err() {
            if let Some(fallback) = &self.jwt_fallback {
                result = fallback.validate(raw);
            }
        }
        match result {
            Ok(()) => Ok(()),
            Err(JwtError::Expired) => {
                warn!(token_id = jti, "token expired");
                self.handle_expired_token(ctx, jti).await
            }
            Err(JwtError::Invalid) => {
                warn!(token_id = jti, "token invalid");
                Err(DevAuthError::TokenInvalid)
            }
        }
    }

    /// An expired token is deleted, never kept; a second verification
    /// of the same raw token reports not-found.
    async fn handle_expired_token(
        &self,
        ctx: &RequestContext,
        jti: &str,
    ) -> Result<(), DevAuthError> {
        match self.db.delete_token(ctx, jti).await {
            Ok(()) => Err(DevAuthError::TokenExpired),
            Err(StoreError::TokenNotFound) => Err(DevAuthError::TokenNotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn revoke_token(
        &self,
        ctx: &RequestContext,
        token_id: &str,
    ) -> Result<(), DevAuthError> {
        let claims = self.db.get_token(ctx, token_id).await?;
        warn!(token_id, "revoking token");
        self.db.delete_token(ctx, token_id).await?;
        self.cache_delete_token(ctx, &claims.subject).await?;
        Ok(())
    }

    /// Delete tokens of a single device, or every token of the tenant
    /// (flushing its cache entries).
    pub async fn delete_tokens(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: Option<&str>,
    ) -> Result<(), DevAuthError> {
        let ctx = ctx.with_tenant(tenant_id);
        let result = match device_id {
            Some(device_id) => {
                self.cache_delete_token(&ctx, device_id).await?;
                self.db.delete_token_by_dev_id(&ctx, device_id).await
            }
            None => {
                self.cache_flush(&ctx, tenant_id).await?;
                self.db.delete_tokens(&ctx).await
            }
        };
        match result {
            Ok(()) | Err(StoreError::TokenNotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn cache_throttle_verify(
        &self,
        ctx: &RequestContext,
        cache: &dyn Cache,
        raw: &str,
        claims: &Claims,
    ) -> Result<Option<String>, DevAuthError> {
        let params = self.rate_limits_from_context(ctx).await?;
        let tenant = claims.tenant.clone().unwrap_or_default();
        let method = ctx.forwarded_method.as_deref().unwrap_or("");
        let uri = ratelimits::purge_uri_args(ctx.forwarded_uri.as_deref().unwrap_or(""));

        let cached = cache
            .throttle(
                ctx,
                raw,
                params,
                &tenant,
                &claims.subject,
                IdType::Device,
                uri,
                method,
            )
            .await?;
        Ok(cached)
    }

    async fn cache_set_token(&self, ctx: &RequestContext, claims: &Claims, raw: &str) {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return,
        };
        let expire_in = claims.expires_at - self.clock.now().timestamp();
        if expire_in <= 0 {
            return;
        }
        let tenant = claims.tenant.clone().unwrap_or_default();
        if let Err(err) = cache
            .cache_token(
                ctx,
                &tenant,
                &claims.subject,
                IdType::Device,
                raw,
                Duration::from_secs(expire_in as u64),
            )
            .await
        {
            warn!(token_id = %claims.id, error = %err, "failed to cache token");
        }
    }

    async fn cache_delete_token(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), DevAuthError> {
        if let Some(cache) = &self.cache {
            let tenant = Self::tenant_of(ctx);
            cache
                .delete_token(ctx, &tenant, device_id, IdType::Device)
                .await?;
        }
        Ok(())
    }

    async fn cache_flush(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
    ) -> Result<(), DevAuthError> {
        if let Some(cache) = &self.cache {
            cache.suspend_tenant(ctx, tenant_id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Limits and admission
    // ------------------------------------------------------------------

    /// Read-through cached limit lookup; an absent limit is the zero
    /// value, meaning unlimited.
    pub async fn get_limit(
        &self,
        ctx: &RequestContext,
        name: &str,
    ) -> Result<Limit, DevAuthError> {
        let tenant = Self::tenant_of(ctx);
        if let Some(cache) = &self.cache {
            match cache.get_limit(ctx, &tenant, name).await {
                Ok(Some(limit)) => return Ok(limit),
                Ok(None) => {}
                Err(err) => warn!(name, error = %err, "error fetching limit from cache"),
            }
        }

        let limit = match self.db.get_limit(ctx, name).await {
            Ok(limit) => limit,
            Err(StoreError::LimitNotFound) => Limit::unlimited(name),
            Err(err) => return Err(err.into()),
        };

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.set_limit(ctx, &tenant, limit.clone()).await {
                warn!(name, error = %err, "failed to store limit in cache");
            }
        }
        Ok(limit)
    }

    pub async fn get_tenant_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<Limit, DevAuthError> {
        self.get_limit(&ctx.with_tenant(tenant_id), name).await
    }

    pub async fn set_tenant_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        limit: Limit,
    ) -> Result<(), DevAuthError> {
        let ctx = ctx.with_tenant(tenant_id);
        info!(tenant_id, name = %limit.name, value = limit.value, "setting tenant limit");

        self.db.put_limit(&ctx, limit.clone()).await?;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.set_limit(&ctx, tenant_id, limit).await {
                warn!(tenant_id, error = %err, "failed to store limit in cache");
            }
        }
        Ok(())
    }

    pub async fn delete_tenant_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<(), DevAuthError> {
        let ctx = ctx.with_tenant(tenant_id);
        info!(tenant_id, name, "removing tenant limit");

        self.db.delete_limit(&ctx, name).await?;
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.delete_limit(&ctx, tenant_id, name).await {
                warn!(tenant_id, name, error = %err, "error removing limit from cache");
            }
        }
        Ok(())
    }

    pub async fn get_dev_count_by_status(
        &self,
        ctx: &RequestContext,
        status: Option<Status>,
    ) -> Result<usize, DevAuthError> {
        Ok(self.db.get_dev_count_by_status(ctx, status).await?)
    }

    /// Count admission: allowed iff accepted-count + 1 stays within the
    /// max device count limit (0 = unlimited).
    async fn can_accept_device(&self, ctx: &RequestContext) -> Result<bool, DevAuthError> {
        let limit = self.get_limit(ctx, LIMIT_MAX_DEVICE_COUNT).await?;
        if limit.is_unlimited() {
            return Ok(true);
        }
        let accepted = self
            .db
            .get_dev_count_by_status(ctx, Some(Status::Accepted))
            .await?;
        Ok((accepted as u64) + 1 <= limit.value)
    }

    // ------------------------------------------------------------------
    // Check-in bookkeeping
    // ------------------------------------------------------------------

    /// Best-effort: check-in freshness must never fail an otherwise
    /// valid authentication.
    async fn update_check_in_time(&self, ctx: &RequestContext, device_id: &str) {
        if let Err(err) = self.sync_check_in_time(ctx, device_id).await {
            warn!(
                device_id,
                error = %err,
                "failed to update device check-in time"
            );
        }
    }

    /// Day-granularity debounce: within the same UTC calendar day as
    /// the previously recorded check-in, nothing is written anywhere.
    async fn sync_check_in_time(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), DevAuthError> {
        let now = self.clock.now();
        let tenant = Self::tenant_of(ctx);

        let previous = match &self.cache {
            Some(cache) => cache.get_check_in_time(ctx, &tenant, device_id).await?,
            None => self.db.get_device_by_id(ctx, device_id).await?.check_in_time,
        };
        if let Some(previous) = previous {
            if previous.date_naive() == now.date_naive() {
                return Ok(());
            }
        }

        if let Some(cache) = &self.cache {
            cache.cache_check_in_time(ctx, &tenant, device_id, now).await?;
        }

        if self.config.enable_reporting {
            self.submit_reindex(ctx, device_id).await?;
        } else {
            let attributes = serde_json::to_string(&[DeviceAttribute {
                name: "check_in_time".to_string(),
                description: None,
                value: serde_json::json!(now),
                scope: INVENTORY_SCOPE_SYSTEM.to_string(),
            }])
            .map_err(|err| anyhow::anyhow!("cannot serialize attributes: {}", err))?;

            self.orchestrator
                .submit_update_device_inventory(UpdateDeviceInventoryReq {
                    request_id: ctx.request_id.clone(),
                    tenant_id: tenant.clone(),
                    device_id: device_id.to_string(),
                    scope: INVENTORY_SCOPE_SYSTEM.to_string(),
                    attributes,
                })
                .await
                .map_err(DevAuthError::Orchestrator)?;
        }

        self.db
            .update_device(
                ctx,
                device_id,
                DeviceUpdate {
                    check_in_time: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn health_check(&self, ctx: &RequestContext) -> Result<(), DevAuthError> {
        self.db.ping(ctx).await?;
        self.orchestrator
            .check_health()
            .await
            .map_err(DevAuthError::Orchestrator)?;
        if let Some(tenant_client) = &self.tenant_client {
            tenant_client
                .check_health()
                .await
                .map_err(DevAuthError::TenantVerification)?;
        }
        Ok(())
    }
}
