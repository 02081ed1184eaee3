//! Hot-path cache contract.
//!
//! The cache is an optional accelerator in front of the store: token
//! fast path, rate-limit counters, per-tenant limits and check-in
//! timestamps. Every read/write through it is best-effort from the
//! caller's point of view except throttling, where `TooManyRequests`
//! is a hard verdict.

mod memory;

pub use memory::MemCache;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::context::RequestContext;
use crate::models::Limit;

/// Kind of principal a cached token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Device,
    User,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Device => "device",
            IdType::User => "user",
        }
    }
}

/// Parameters of one rate-limit bucket: at most `burst` events per
/// `interval`, counted under `event_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitParams {
    pub burst: u64,
    pub interval: Duration,
    pub event_id: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("too many requests")]
    TooManyRequests,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Account one request against the rate-limit bucket (when `params`
    /// is given) and return the cached token for the principal, if any.
    /// `TooManyRequests` is returned before the token lookup.
    #[allow(clippy::too_many_arguments)]
    async fn throttle(
        &self,
        ctx: &RequestContext,
        raw_token: &str,
        params: Option<RateLimitParams>,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
        uri: &str,
        method: &str,
    ) -> Result<Option<String>, CacheError>;

    /// Store the raw token for the principal, expiring after `expire_in`.
    async fn cache_token(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
        raw_token: &str,
        expire_in: Duration,
    ) -> Result<(), CacheError>;

    /// Drop the cached token for the principal, if any.
    async fn delete_token(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        id_type: IdType,
    ) -> Result<(), CacheError>;

    async fn get_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Limit>, CacheError>;
    async fn set_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        limit: Limit,
    ) -> Result<(), CacheError>;
    async fn delete_limit(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        name: &str,
    ) -> Result<(), CacheError>;

    async fn cache_check_in_time(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
        time: DateTime<Utc>,
    ) -> Result<(), CacheError>;
    async fn get_check_in_time(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Option<DateTime<Utc>>, CacheError>;
    /// Batched check-in lookup; the result is positionally aligned with
    /// `device_ids`.
    async fn get_check_in_times(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
        device_ids: &[String],
    ) -> Result<Vec<Option<DateTime<Utc>>>, CacheError>;

    /// Flush every cached entry belonging to the tenant.
    async fn suspend_tenant(
        &self,
        ctx: &RequestContext,
        tenant_id: &str,
    ) -> Result<(), CacheError>;
}
