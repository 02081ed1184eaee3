//! Credential store contract.
//!
//! The store is the source of truth for devices, auth sets, session
//! tokens and per-tenant limits. Creation primitives signal a distinct
//! "already exists" condition so callers can implement idempotent
//! insert-or-return-existing flows without read-modify-write races.

mod memory;

pub use memory::MemStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RequestContext;
use crate::jwt::Claims;
use crate::models::{AuthSet, AuthSetUpdate, Device, DeviceFilter, DeviceUpdate, Limit, Status};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object already exists")]
    ObjectExists,

    #[error("device not found")]
    DeviceNotFound,

    #[error("authentication set not found")]
    AuthSetNotFound,

    #[error("token not found")]
    TokenNotFound,

    #[error("limit not found")]
    LimitNotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn ping(&self, ctx: &RequestContext) -> Result<(), StoreError>;

    /// Insert a device; `ObjectExists` when one with the same identity
    /// hash (or id) is already present.
    async fn add_device(&self, ctx: &RequestContext, device: Device) -> Result<(), StoreError>;
    async fn get_device_by_id(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Device, StoreError>;
    async fn get_device_by_identity_hash(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
    ) -> Result<Device, StoreError>;
    async fn get_devices(
        &self,
        ctx: &RequestContext,
        skip: usize,
        limit: usize,
        filter: DeviceFilter,
    ) -> Result<Vec<Device>, StoreError>;
    async fn update_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        update: DeviceUpdate,
    ) -> Result<(), StoreError>;
    async fn delete_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError>;
    /// Aggregate status of a device derived from its auth sets:
    /// accepted > preauthorized > pending > rejected. `AuthSetNotFound`
    /// when the device has no auth sets at all.
    async fn get_device_status(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Status, StoreError>;
    /// Count devices by status; `None` counts all devices.
    async fn get_dev_count_by_status(
        &self,
        ctx: &RequestContext,
        status: Option<Status>,
    ) -> Result<usize, StoreError>;

    /// Insert an auth set; `ObjectExists` when one with the same
    /// (identity hash, public key) or id is already present.
    async fn add_auth_set(
        &self,
        ctx: &RequestContext,
        auth_set: AuthSet,
    ) -> Result<(), StoreError>;
    async fn get_auth_set_by_id(
        &self,
        ctx: &RequestContext,
        auth_id: &str,
    ) -> Result<AuthSet, StoreError>;
    async fn get_auth_set_by_data_hash_key(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
        pubkey: &str,
    ) -> Result<AuthSet, StoreError>;
    async fn get_auth_set_by_data_hash_key_by_status(
        &self,
        ctx: &RequestContext,
        id_data_sha256: &[u8],
        pubkey: &str,
        status: Status,
    ) -> Result<AuthSet, StoreError>;
    async fn get_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<Vec<AuthSet>, StoreError>;
    async fn update_auth_set_by_id(
        &self,
        ctx: &RequestContext,
        auth_id: &str,
        update: AuthSetUpdate,
    ) -> Result<(), StoreError>;
    /// Insert the auth set or, when present, overwrite its status with
    /// the one carried by `auth_set`.
    async fn upsert_auth_set_status(
        &self,
        ctx: &RequestContext,
        auth_set: AuthSet,
    ) -> Result<(), StoreError>;
    /// Force-reject every accepted auth set of the device.
    /// `AuthSetNotFound` when nothing matched.
    async fn reject_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError>;
    async fn delete_auth_set_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
        auth_id: &str,
    ) -> Result<(), StoreError>;
    async fn delete_auth_sets_for_device(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError>;

    /// Persist a session token; tokens exist in the store only while
    /// valid.
    async fn add_token(&self, ctx: &RequestContext, claims: Claims) -> Result<(), StoreError>;
    async fn get_token(&self, ctx: &RequestContext, jti: &str) -> Result<Claims, StoreError>;
    async fn delete_token(&self, ctx: &RequestContext, jti: &str) -> Result<(), StoreError>;
    async fn delete_token_by_dev_id(
        &self,
        ctx: &RequestContext,
        device_id: &str,
    ) -> Result<(), StoreError>;
    /// Delete every token of the context's tenant.
    async fn delete_tokens(&self, ctx: &RequestContext) -> Result<(), StoreError>;

    async fn get_limit(&self, ctx: &RequestContext, name: &str) -> Result<Limit, StoreError>;
    async fn put_limit(&self, ctx: &RequestContext, limit: Limit) -> Result<(), StoreError>;
    async fn delete_limit(&self, ctx: &RequestContext, name: &str) -> Result<(), StoreError>;
}
