//! Store-wide configuration.
//! A single immutable `StoreConfig` value is shared (behind `Arc`) by every store
//! constructed from it; nothing reads ambient settings after construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::storage::codec::Codec;

/// Name of the optional settings file under the store root.
pub const SETTINGS_FILE: &str = "shelf.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Jail root; every resolved path must stay under it.
    pub root: PathBuf,
    /// Codec for structured files (configs, snapshots, metadata, record objects).
    #[serde(default)]
    pub codec: Codec,
    /// Keep `<file>.backup` after a successful write so reads can fall back one generation.
    #[serde(default = "StoreConfig::default_retain_backup")]
    pub retain_backup: bool,
    /// Attachments created or updated within this window are never pruned.
    #[serde(default = "StoreConfig::default_attachment_grace_seconds")]
    pub attachment_grace_seconds: u64,
    /// A hold still unreleased after this long logs a warning.
    #[serde(default = "StoreConfig::default_hold_warning_ms")]
    pub hold_warning_ms: u64,
    /// Snapshots older than this (other than the current one) are swept.
    #[serde(default = "StoreConfig::default_version_retention_days")]
    pub version_retention_days: u64,
    /// Interval between `prune_random` passes in the maintenance loop.
    #[serde(default = "StoreConfig::default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    /// Interval between version-retention sweeps in the maintenance loop.
    #[serde(default = "StoreConfig::default_retention_interval_ms")]
    pub retention_interval_ms: u64,
}

impl StoreConfig {
    fn default_retain_backup() -> bool { true }
    fn default_attachment_grace_seconds() -> u64 { 30 * 60 }
    fn default_hold_warning_ms() -> u64 { 10_000 }
    fn default_version_retention_days() -> u64 { 30 }
    fn default_prune_interval_ms() -> u64 { 60_000 }
    fn default_retention_interval_ms() -> u64 { 3_600_000 }

    /// Defaults rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            codec: Codec::default(),
            retain_backup: Self::default_retain_backup(),
            attachment_grace_seconds: Self::default_attachment_grace_seconds(),
            hold_warning_ms: Self::default_hold_warning_ms(),
            version_retention_days: Self::default_version_retention_days(),
            prune_interval_ms: Self::default_prune_interval_ms(),
            retention_interval_ms: Self::default_retention_interval_ms(),
        }
    }

    /// Load `<root>/shelf.json` if present, else defaults. The `root` field in the
    /// file is ignored; the directory it was loaded from wins.
    pub fn load<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref();
        let path = root.join(SETTINGS_FILE);
        let mut cfg = match std::fs::read(&path) {
            Ok(bytes) => {
                let mut v: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::validation(format!("{}: {}", path.display(), e)))?;
                if let Some(obj) = v.as_object_mut() {
                    obj.insert("root".into(), serde_json::json!(root));
                }
                serde_json::from_value::<StoreConfig>(v)
                    .map_err(|e| StoreError::validation(format!("{}: {}", path.display(), e)))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::new(root),
            Err(e) => return Err(StoreError::io(format!("read {}", path.display()), e)),
        };
        cfg.root = root.to_path_buf();
        debug!(target: "shelfdb::config", "loaded store config root='{}' codec={:?}", cfg.root.display(), cfg.codec);
        Ok(cfg)
    }

    /// Apply `SHELFDB_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> StoreResult<Self> {
        if let Ok(codec) = std::env::var("SHELFDB_CODEC") {
            self.codec = codec.parse()?;
        }
        if let Ok(ms) = std::env::var("SHELFDB_PRUNE_INTERVAL_MS") {
            self.prune_interval_ms = ms
                .parse()
                .map_err(|_| StoreError::validation(format!("SHELFDB_PRUNE_INTERVAL_MS='{}' is not a number", ms)))?;
        }
        Ok(self)
    }

    pub fn attachment_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.attachment_grace_seconds as i64)
    }

    pub fn hold_warning(&self) -> Duration { Duration::from_millis(self.hold_warning_ms) }

    pub fn version_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.version_retention_days as i64)
    }

    pub fn prune_interval(&self) -> Duration { Duration::from_millis(self.prune_interval_ms.max(1)) }

    pub fn retention_interval(&self) -> Duration { Duration::from_millis(self.retention_interval_ms.max(1)) }
}
