//! Error taxonomy for the admission core.
//!
//! Tagged variants rather than string matching: callers dispatch on the
//! kind (unauthorized vs. expired vs. throttled) to produce different
//! client-facing signals.

use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DevAuthError {
    /// Authentication refused. Pending, rejected and quota-blocked devices
    /// all surface as this single kind; the reason is never revealed to
    /// the device.
    #[error("dev auth: unauthorized")]
    Unauthorized,

    #[error("dev auth: bad request: {0}")]
    BadRequest(String),

    #[error("device ID and authentication set ID mismatch")]
    DevIdAuthIdMismatch,

    #[error("maximum number of accepted devices reached")]
    MaxDeviceCountReached,

    #[error("device already exists")]
    DeviceExists,

    #[error("device not found")]
    DeviceNotFound,

    #[error("authentication set not found")]
    AuthSetNotFound,

    #[error("token not found")]
    TokenNotFound,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("too many requests")]
    TooManyRequests,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("orchestrator job submission failed: {0}")]
    Orchestrator(#[source] anyhow::Error),

    #[error("tenant verification request failed: {0}")]
    TenantVerification(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for DevAuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ObjectExists => DevAuthError::Conflict("object already exists".into()),
            StoreError::DeviceNotFound => DevAuthError::DeviceNotFound,
            StoreError::AuthSetNotFound => DevAuthError::AuthSetNotFound,
            StoreError::TokenNotFound => DevAuthError::TokenNotFound,
            StoreError::LimitNotFound => {
                DevAuthError::Internal(anyhow::anyhow!("limit not found"))
            }
            StoreError::Internal(e) => DevAuthError::Internal(e),
        }
    }
}

impl From<CacheError> for DevAuthError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::TooManyRequests => DevAuthError::TooManyRequests,
            CacheError::Internal(e) => DevAuthError::Internal(e),
        }
    }
}
