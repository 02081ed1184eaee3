//! Device model - one physical unit known to the platform.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuthSet;
use crate::error::DevAuthError;

/// Admission status shared by devices and their authentication sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    NoAuth,
    Pending,
    Preauthorized,
    Accepted,
    Rejected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NoAuth => "noauth",
            Status::Pending => "pending",
            Status::Preauthorized => "preauthorized",
            Status::Accepted => "accepted",
            Status::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noauth" => Ok(Status::NoAuth),
            "pending" => Ok(Status::Pending),
            "preauthorized" => Ok(Status::Preauthorized),
            "accepted" => Ok(Status::Accepted),
            "rejected" => Ok(Status::Rejected),
            _ => Err(format!("invalid device status: {}", s)),
        }
    }
}

/// Device entity (tenant-scoped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// Raw identity payload as submitted by the device.
    pub id_data: String,
    /// Parsed form of the identity payload.
    pub id_data_struct: BTreeMap<String, Value>,
    /// SHA-256 of the raw identity payload; the per-tenant uniqueness key.
    pub id_data_sha256: Vec<u8>,
    pub status: Status,
    pub decommissioning: bool,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
    /// Last time the device was observed alive, if ever.
    pub check_in_time: Option<DateTime<Utc>>,
    /// Authentication sets attached to this device, populated on reads.
    #[serde(default)]
    pub auth_sets: Vec<AuthSet>,
    /// Monotonic version for optimistic updates pushed to external services.
    pub revision: u32,
}

impl Device {
    /// Create a new device record. When `id` is empty a fresh UUID is
    /// assigned.
    pub fn new(id: &str, id_data: &str, now: DateTime<Utc>) -> Self {
        let id = if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        Self {
            id,
            id_data: id_data.to_string(),
            id_data_struct: BTreeMap::new(),
            id_data_sha256: Vec::new(),
            status: Status::Pending,
            decommissioning: false,
            created_ts: now,
            updated_ts: now,
            check_in_time: None,
            auth_sets: Vec::new(),
            revision: 0,
        }
    }
}

/// Partial update applied to a stored device.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub status: Option<Status>,
    pub decommissioning: Option<bool>,
    pub check_in_time: Option<DateTime<Utc>>,
    pub updated_ts: Option<DateTime<Utc>>,
}

/// Inventory attribute pushed to the inventory service via the
/// orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAttribute {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
    pub scope: String,
}

/// Parse a raw identity payload into its structured form and content hash.
///
/// The hash is computed over the raw payload bytes, so devices submitting
/// byte-identical identity documents always resolve to the same device.
pub fn parse_id_data(id_data: &str) -> Result<(BTreeMap<String, Value>, Vec<u8>), DevAuthError> {
    let id_data_struct: BTreeMap<String, Value> = serde_json::from_str(id_data)
        .map_err(|e| DevAuthError::BadRequest(format!("failed to parse identity data: {}", e)))?;

    let mut hash = Sha256::new();
    hash.update(id_data.as_bytes());
    let id_data_sha256 = hash.finalize().to_vec();

    Ok((id_data_struct, id_data_sha256))
}
