use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};
use crate::paths::validate_segment;
use crate::storage::Hash;

pub const MAX_MEMO_BYTES: usize = 32 * 1024;

/// Per-dataset settings. `version` always names the latest committed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub memo: String,
    /// Run object GC synchronously after every committed write.
    #[serde(default)]
    pub garbage_collect: bool,
    /// Free-form settings owned by the layers above (lens code, viewport layout, ...).
    #[serde(default = "empty_object", with = "json_object")]
    pub extra: serde_json::Value,
}

fn empty_object() -> serde_json::Value { serde_json::Value::Object(Default::default()) }

impl Default for DatasetConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self { version: 0, created: now, updated: now, memo: String::new(), garbage_collect: false, extra: empty_object() }
    }
}

impl DatasetConfig {
    pub fn with_memo<S: Into<String>>(mut self, memo: S) -> Self {
        self.memo = memo.into();
        self
    }

    pub fn with_garbage_collect(mut self, on: bool) -> Self {
        self.garbage_collect = on;
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    /// Checked before every persisted write.
    pub fn validate(&self) -> StoreResult<()> {
        if self.memo.len() > MAX_MEMO_BYTES {
            return Err(StoreError::validation(format!("memo is {} bytes, limit is {}", self.memo.len(), MAX_MEMO_BYTES)));
        }
        if !self.extra.is_object() {
            return Err(StoreError::validation("config extra must be a JSON object"));
        }
        if self.updated < self.created {
            return Err(StoreError::validation("config updated precedes created"));
        }
        Ok(())
    }
}

/// `extra` is a JSON object. Self-describing formats store it inline; compact
/// binary formats cannot carry an untyped value and get its JSON text instead.
mod json_object {
    use super::*;

    pub fn serialize<S: Serializer>(value: &serde_json::Value, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            value.serialize(serializer)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<serde_json::Value, D::Error> {
        if deserializer.is_human_readable() {
            serde_json::Value::deserialize(deserializer)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text).map_err(serde::de::Error::custom)
        }
    }
}

/// Where one record's payload lives and when it last changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub hash: Hash,
    /// Snapshot version at which `hash` last changed. Filled in at commit when absent.
    #[serde(default)]
    pub version: Option<u64>,
    pub changed: DateTime<Utc>,
}

impl RecordMeta {
    /// A record whose version is assigned by the snapshot it is committed in.
    pub fn pending(hash: Hash, changed: DateTime<Utc>) -> Self {
        Self { hash, version: None, changed }
    }

    pub fn version(&self) -> u64 { self.version.unwrap_or(0) }
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub version: u64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub records: BTreeMap<String, RecordMeta>,
}

impl VersionSnapshot {
    pub fn empty(version: u64, created: DateTime<Utc>) -> Self {
        Self { version, created, records: BTreeMap::new() }
    }
}

pub fn validate_record_id(id: &str) -> StoreResult<()> {
    validate_segment(id).map_err(|e| StoreError::validation(format!("record id '{}': {}", id, e)))
}

/// Counts from one GC pass. Failures are logged and counted, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub datasets: usize,
    pub objects_scanned: usize,
    pub objects_deleted: usize,
    pub snapshots_deleted: usize,
    pub temp_files_deleted: usize,
    pub failures: usize,
}

impl GcReport {
    pub fn absorb(&mut self, other: &GcReport) {
        self.datasets += other.datasets;
        self.objects_scanned += other.objects_scanned;
        self.objects_deleted += other.objects_deleted;
        self.snapshots_deleted += other.snapshots_deleted;
        self.temp_files_deleted += other.temp_files_deleted;
        self.failures += other.failures;
    }
}
