//! Authentication set model - one (identity data, public key) registration
//! attempt tied to a device.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Status;

/// One identity+public-key registration attempt for a device.
///
/// A device may accumulate several auth sets over its lifetime (key
/// rotation), but at most one of them is `accepted` at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSet {
    pub id: String,
    pub device_id: String,
    pub id_data: String,
    pub id_data_struct: BTreeMap<String, Value>,
    pub id_data_sha256: Vec<u8>,
    pub pubkey: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

/// Partial update applied to a stored auth set.
#[derive(Debug, Clone, Default)]
pub struct AuthSetUpdate {
    pub status: Option<Status>,
}
