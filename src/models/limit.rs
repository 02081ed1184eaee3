//! Per-tenant named quotas.

use serde::{Deserialize, Serialize};

/// Name of the quota capping the number of accepted devices per tenant.
pub const LIMIT_MAX_DEVICE_COUNT: &str = "max_devices";

/// A named per-tenant numeric quota. A value of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub name: String,
    pub value: u64,
}

impl Limit {
    pub fn new(name: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }

    /// Absent limits are normalized to the zero value, meaning unlimited.
    pub fn unlimited(name: &str) -> Self {
        Self::new(name, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.value == 0
    }
}
