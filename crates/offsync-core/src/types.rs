//! Core types: change records, their identifiers and content checksums

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Unique identifier for a change record
///
/// Uses ULID so ids minted on one device sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(pub Ulid);

impl ChangeId {
    /// Create a new ChangeId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Create a ChangeId from a ULID
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Get the underlying ULID
    pub fn as_ulid(&self) -> &Ulid {
        &self.0
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Stable per-installation identifier
///
/// Distinguishes the origin of a change without requiring a user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh random device id (`device_<base58>`)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(format!("device_{}", bs58::encode(bytes).into_string()))
    }

    /// Wrap an existing identifier, e.g. one loaded from storage
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of mutation a change record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Whether a change of this kind must carry a payload
    pub fn requires_data(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload lifecycle of a change record
///
/// ```text
/// pending ──▶ syncing ──▶ synced
///    ▲           │
///    │           ├──▶ failed ──▶ (retried next cycle)
///    └───────────┘  (batch-level transport error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Syncing => "syncing",
            ChangeStatus::Synced => "synced",
            ChangeStatus::Failed => "failed",
        }
    }

    /// Records in these states are picked up by the next sync cycle
    pub fn is_awaiting_upload(&self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Failed)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(entity_type, entity_id)` pair naming the business object a change touches
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Atomic unit of synchronization: one create/update/delete of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Serialized entity state at the time of the change; opaque to the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub sync_status: ChangeStatus,
    pub version: u64,
    /// Hex SHA-256 of `data`, see [`calculate_checksum`]
    pub checksum: String,
    pub device_id: DeviceId,
}

impl ChangeRecord {
    /// Build a new pending record stamped with the current time
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        data: Option<Value>,
        device_id: DeviceId,
    ) -> Self {
        let checksum = calculate_checksum(data.as_ref());
        Self {
            id: ChangeId::new(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            data,
            timestamp: Utc::now(),
            sync_status: ChangeStatus::Pending,
            version: 1,
            checksum,
            device_id,
        }
    }

    /// Override the creation time
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Re-hash `data` and compare against the stored checksum.
    ///
    /// A mismatch means the record was corrupted or altered after creation.
    pub fn verify_checksum(&self) -> bool {
        calculate_checksum(self.data.as_ref()) == self.checksum
    }
}

/// Deterministic hex SHA-256 digest of a payload.
///
/// Hashes the compact JSON rendering; object keys are sorted by
/// `serde_json::Map`, so equal values always hash equal. An absent
/// payload hashes as JSON `null`.
pub fn calculate_checksum(data: Option<&Value>) -> String {
    let rendered = data.map_or_else(|| Value::Null.to_string(), Value::to_string);
    hex::encode(Sha256::digest(rendered.as_bytes()))
}
