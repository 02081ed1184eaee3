//! Domain model for device admission control.
//!
//! Devices, their authentication sets, per-tenant limits and the request
//! payloads accepted by the admission core.

mod authset;
mod device;
mod limit;

pub use authset::{AuthSet, AuthSetUpdate};
pub use device::{parse_id_data, Device, DeviceAttribute, DeviceUpdate, Status};
pub use limit::{Limit, LIMIT_MAX_DEVICE_COUNT};

use serde::{Deserialize, Serialize};

/// Subscription plan names recognized by the rate-limit engine.
pub const PLAN_OPEN_SOURCE: &str = "opensource";
pub const PLAN_PROFESSIONAL: &str = "professional";
pub const PLAN_ENTERPRISE: &str = "enterprise";

/// A feature add-on attached to a tenant subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    pub enabled: bool,
}

impl Addon {
    pub fn new(name: &str, enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            enabled,
        }
    }
}

/// Fallback addon set used when tenant verification is disabled: a
/// single-tenant installation gets every capability.
pub fn all_addons_enabled() -> Vec<Addon> {
    ["configure", "monitor", "troubleshoot"]
        .iter()
        .map(|name| Addon::new(name, true))
        .collect()
}

/// Device authentication request as submitted by a device.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthReq {
    /// Raw identity payload, a JSON document.
    pub id_data: String,
    /// Device public key in PEM form.
    pub pubkey: String,
    /// Tenant token supplied by the device, may be empty.
    #[serde(default)]
    pub tenant_token: String,
}

/// Administrator request to preauthorize a device before first contact.
#[derive(Debug, Clone, Deserialize)]
pub struct PreAuthReq {
    pub device_id: String,
    pub auth_set_id: String,
    pub id_data: String,
    pub pubkey: String,
    /// Upsert the auth set even if the device already exists (key rotation
    /// for preauthorized devices).
    #[serde(default)]
    pub force: bool,
}

/// Filter for device listings.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub status: Option<Status>,
}
