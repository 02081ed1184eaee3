//! In-memory reference implementation of the credential store.
//!
//! Tenant-scoped maps with the same uniqueness semantics the document
//! store enforces through indexes. Used by the test suite and by
//! embedders that want a self-contained instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DataStore, StoreError};
use crate::context::RequestContext;
use crate::jwt::Claims;
use crate::models::{AuthSet, AuthSetUpdate, Device, DeviceFilter, DeviceUpdate, Limit, Status};

#[derive(Default)]
struct TenantDb {
    devices: HashMap<String, Device>,
    auth_sets: HashMap<String, AuthSet>,
    tokens: HashMap<String, Claims>,
    limits: HashMap<String, Limit>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<HashMap<String, TenantDb>>,
    /// Number of device document writes, observable by tests asserting
    /// write-amplification behavior.
    device_updates: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_update_count(&self) -> usize {
        self.device_updates.load(Ordering::SeqCst)
    }

    fn tenant_of(ctx: &RequestContext) -> String {
        ctx.tenant_id().unwrap_or("").to_string()
    }

    fn with_db<T>(
        &self,
        ctx: &RequestContext,
        f: impl FnOnce(&mut TenantDb) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("store mutex poisoned: {}", e))?;
        let db = inner.entry(Self::tenant_of(ctx)).or_default();
        f(db)
    }
}

#[async_trait]
impl DataStore for MemStore {
    async fn ping(&self, _ctx: &RequestContext) -> Result<(), StoreError> {
        Ok(())
    }

    async fn add_device(&self, ctx: &RequestContext, device: Device) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let exists = db.devices.values().any(|d| {
                d.id == device.id
                    || (!device.id_data_sha256.is_empty()
                        && d.id_data_sha256 == device.id_data_sha256)
            });
            if exists {
                return Err(StoreError::ObjectExists);
            }
            db.devices.insert(device.id.clone(), device);
            Ok(())
        })
    }

    async fn get_device_by_id(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Device, StoreError> {
        self.with_db(ctx, |db| {
            db.devices
                .get(device_id)
                .cloned()
                .ok_or(StoreError::DeviceNotFound)
        })
    }

    async fn get_device_by_identity_hash(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
    ) -> Result<Device, StoreError> {
        self.with_db(ctx, |db| {
            db.devices
                .values()
                .find(|d| d.id_data_sha256 == id_data_sha256)
                .cloned()
                .ok_or(StoreError::DeviceNotFound)
        })
    }

    async fn get_devices(
        &self,
        ctx: &RequestContext,
        skip: usize,
        limit: usize,
        filter: DeviceFilter,
    ) -> Result<Vec<Device>, StoreError> {
        self.with_db(ctx, |db| {
            let mut devices: Vec<Device> = db
                .devices
                .values()
                .filter(|d| filter.status.map_or(true, |s| d.status == s))
                .cloned()
                .collect();
            devices.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(devices.into_iter().skip(skip).take(limit).collect())
        })
    }

    async fn update_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        update: DeviceUpdate,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let dev = db
                .devices
                .get_mut(device_id)
                .ok_or(StoreError::DeviceNotFound)?;
            if let Some(status) = update.status {
                dev.status = status;
            }
            if let Some(decommissioning) = update.decommissioning {
                dev.decommissioning = decommissioning;
            }
            if let Some(check_in_time) = update.check_in_time {
                dev.check_in_time = Some(check_in_time);
            }
            if let Some(updated_ts) = update.updated_ts {
                dev.updated_ts = updated_ts;
            }
            dev.revision += 1;
            self.device_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn delete_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.devices
                .remove(device_id)
                .map(|_| ())
                .ok_or(StoreError::DeviceNotFound)
        })
    }

    async fn get_device_status(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Status, StoreError> {
        self.with_db(ctx, |db| {
            let statuses: Vec<Status> = db
                .auth_sets
                .values()
                .filter(|a| a.device_id == device_id)
                .map(|a| a.status)
                .collect();
            if statuses.is_empty() {
                return Err(StoreError::AuthSetNotFound);
            }
            for status in [
                Status::Accepted,
                Status::Preauthorized,
                Status::Pending,
                Status::Rejected,
            ] {
                if statuses.contains(&status) {
                    return Ok(status);
                }
            }
            Err(StoreError::AuthSetNotFound)
        })
    }

    async fn get_dev_count_by_status(
        &self,
        ctx: &RequestContext,
        status: Option<Status>,
    ) -> Result<usize, StoreError> {
        self.with_db(ctx, |db| {
            Ok(db
                .devices
                .values()
                .filter(|d| status.map_or(true, |s| d.status == s))
                .count())
        })
    }

    async fn add_auth_set(
        &self,
        ctx: &RequestContext,
        auth_set: AuthSet,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let exists = db.auth_sets.values().any(|a| {
                a.id == auth_set.id
                    || (a.id_data_sha256 == auth_set.id_data_sha256
                        && a.pubkey == auth_set.pubkey)
            });
            if exists {
                return Err(StoreError::ObjectExists);
            }
            db.auth_sets.insert(auth_set.id.clone(), auth_set);
            Ok(())
        })
    }

    async fn get_auth_set_by_id(
        &self,
        ctx: &RequestContext,
        auth_id: &str,
    ) -> Result<AuthSet, StoreError> {
        self.with_db(ctx, |db| {
            db.auth_sets
                .get(auth_id)
                .cloned()
                .ok_or(StoreError::AuthSetNotFound)
        })
    }

    async fn get_auth_set_by_data_hash_key(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
        pubkey: &str,
    ) -> Result<AuthSet, StoreError> {
        self.with_db(ctx, |db| {
            db.auth_sets
                .values()
                .find(|a| a.id_data_sha256 == id_data_sha256 && a.pubkey == pubkey)
                .cloned()
                .ok_or(StoreError::AuthSetNotFound)
        })
    }

    async fn get_auth_set_by_data_hash_key_by_status(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
        pubkey: &str,
        status: Status,
    ) -> Result<AuthSet, StoreError> {
        self.with_db(ctx, |db| {
            db.auth_sets
                .values()
                .find(|a| {
                    a.id_data_sha256 == id_data_sha256
                        && a.pubkey == pubkey
                        && a.status == status
                })
                .cloned()
                .ok_or(StoreError::AuthSetNotFound)
        })
    }

    async fn get_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, StoreError> {
        self.with_db(ctx, |db| {
            let mut sets: Vec<AuthSet> = db
                .auth_sets
                .values()
                .filter(|a| a.device_id == device_id)
                .cloned()
                .collect();
            if sets.is_empty() {
                return Err(StoreError::AuthSetNotFound);
            }
            sets.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(sets)
        })
    }

    async fn update_auth_set_by_id(
        &self,
        ctx: &RequestContext,
        auth_id: &str,
        update: AuthSetUpdate,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let aset = db
                .auth_sets
                .get_mut(auth_id)
                .ok_or(StoreError::AuthSetNotFound)?;
            if let Some(status) = update.status {
                aset.status = status;
            }
            Ok(())
        })
    }

    async fn upsert_auth_set_status(
        &self,
        ctx: &RequestContext,
        auth_set: AuthSet,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            if let Some(existing) = db
                .auth_sets
                .values_mut()
                .find(|a| a.id_data_sha256 == auth_set.id_data_sha256 && a.pubkey == auth_set.pubkey)
            {
                existing.status = auth_set.status;
            } else {
                db.auth_sets.insert(auth_set.id.clone(), auth_set);
            }
            Ok(())
        })
    }

    async fn reject_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let mut rejected = 0;
            for aset in db
                .auth_sets
                .values_mut()
                .filter(|a| a.device_id == device_id && a.status == Status::Accepted)
            {
                aset.status = Status::Rejected;
                rejected += 1;
            }
            if rejected == 0 {
                return Err(StoreError::AuthSetNotFound);
            }
            Ok(())
        })
    }

    async fn delete_auth_set_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            match db.auth_sets.get(auth_id) {
                Some(aset) if aset.device_id == device_id => {
                    db.auth_sets.remove(auth_id);
                    Ok(())
                }
                _ => Err(StoreError::AuthSetNotFound),
            }
        })
    }

    async fn delete_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let before = db.auth_sets.len();
            db.auth_sets.retain(|_, a| a.device_id != device_id);
            if db.auth_sets.len() == before {
                return Err(StoreError::AuthSetNotFound);
            }
            Ok(())
        })
    }

    async fn add_token(&self, ctx: &RequestContext, claims: Claims) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.tokens.insert(claims.id.clone(), claims);
            Ok(())
        })
    }

    async fn get_token(&self, ctx: &RequestContext, jti: &str) -> Result<Claims, StoreError> {
        self.with_db(ctx, |db| {
            db.tokens.get(jti).cloned().ok_or(StoreError::TokenNotFound)
        })
    }

    async fn delete_token(&self, ctx: &RequestContext, jti: &str) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.tokens
                .remove(jti)
                .map(|_| ())
                .ok_or(StoreError::TokenNotFound)
        })
    }

    async fn delete_token_by_dev_id(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            let before = db.tokens.len();
            db.tokens.retain(|_, t| t.subject != device_id);
            if db.tokens.len() == before {
                return Err(StoreError::TokenNotFound);
            }
            Ok(())
        })
    }

    async fn delete_tokens(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.tokens.clear();
            Ok(())
        })
    }

    async fn get_limit(&self, ctx: &RequestContext, name: &str) -> Result<Limit, StoreError> {
        self.with_db(ctx, |db| {
            db.limits.get(name).cloned().ok_or(StoreError::LimitNotFound)
        })
    }

    async fn put_limit(&self, ctx: &RequestContext, limit: Limit) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.limits.insert(limit.name.clone(), limit);
            Ok(())
        })
    }

    async fn delete_limit(&self, ctx: &RequestContext, name: &str) -> Result<(), StoreError> {
        self.with_db(ctx, |db| {
            db.limits.remove(name);
            Ok(())
        })
    }
}
