pub mod attachments;
pub mod config;
pub mod dataset;
pub mod error;
pub mod maintenance;
pub mod paths;
pub mod storage;

use std::sync::Arc;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};

use attachments::{AttachmentRegistry, HoldRegistry};
use dataset::{ChangeSink, DatasetStore};
use paths::Source;
use storage::{FileStore, LockRegistry};

/// One store stack over one root: the shared config, lock registry, hold
/// registry and base file store every layer is built from. Layers opened from
/// the same context serialize against each other; separate contexts do not.
#[derive(Clone)]
pub struct StoreContext {
    config: Arc<StoreConfig>,
    locks: LockRegistry,
    holds: HoldRegistry,
    files: FileStore,
}

impl StoreContext {
    pub fn new(config: StoreConfig) -> Self {
        let locks = LockRegistry::new();
        let files = FileStore::new(&config, locks.clone());
        Self { config: Arc::new(config), locks, holds: HoldRegistry::new(), files }
    }

    /// Load `<root>/shelf.json` (if any), apply env overrides, create the root.
    pub async fn open<P: AsRef<std::path::Path>>(root: P) -> StoreResult<Self> {
        let config = StoreConfig::load(root)?.with_env_overrides()?;
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|e| StoreError::io(format!("create root {}", config.root.display()), e))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &StoreConfig { &self.config }
    pub fn locks(&self) -> &LockRegistry { &self.locks }
    pub fn holds(&self) -> &HoldRegistry { &self.holds }
    pub fn files(&self) -> &FileStore { &self.files }

    pub fn attachments(&self) -> StoreResult<Arc<AttachmentRegistry>> {
        Ok(Arc::new(AttachmentRegistry::new(&self.files, &self.config, self.holds.clone())?))
    }

    pub fn datasets(
        &self,
        source: Source,
        attachments: Arc<AttachmentRegistry>,
        sink: Arc<dyn ChangeSink>,
    ) -> StoreResult<Arc<DatasetStore>> {
        Ok(Arc::new(DatasetStore::new(&self.files, &self.config, source, attachments, sink)?))
    }
}
