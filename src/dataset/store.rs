//! Versioned record store.
//! ------------------------
//! A dataset is a folder `<source>/<owner>/<name>/` holding:
//! - `config<ext>`: the `DatasetConfig`, whose `version` names the current snapshot;
//! - `versions/<n><ext>`: one immutable `VersionSnapshot` per committed write;
//! - `objects/<hash>.blob`: the dataset's private store of encoded record payloads.
//!
//! Every mutation runs under the `dataset:<path>` lock and ends in
//! `write_version`, which persists the snapshot first and the config second. A
//! snapshot newer than the config is therefore possible after a crash and is
//! ignored until a later write overwrites it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use futures_util::pin_mut;
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentHold, AttachmentRegistry, HashUrl, LinkResolver};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::paths::{DataPath, ResourcePath, Source};
use crate::storage::{BlobStore, FileStore, Hash, KeyGuard, StreamHasher};

use super::gc;
use super::notify::ChangeSink;
use super::types::{validate_record_id, DatasetConfig, RecordMeta, VersionSnapshot};
use super::value::RecordValue;

pub struct DatasetStore {
    source: Source,
    files: FileStore,
    attachments: Arc<AttachmentRegistry>,
    sink: Arc<dyn ChangeSink>,
    retention: chrono::Duration,
}

impl DatasetStore {
    pub fn new(
        files: &FileStore,
        config: &StoreConfig,
        source: Source,
        attachments: Arc<AttachmentRegistry>,
        sink: Arc<dyn ChangeSink>,
    ) -> StoreResult<Self> {
        let prefix = DataPath::new([source.as_str()])?;
        Ok(Self {
            source,
            files: files.scoped(&prefix, files.codec().extension()),
            attachments,
            sink,
            retention: config.version_retention(),
        })
    }

    pub fn source(&self) -> Source { self.source }

    pub fn attachments(&self) -> &Arc<AttachmentRegistry> { &self.attachments }

    pub fn resource(&self, owner: &str, name: &str) -> ResourcePath { ResourcePath::dataset(self.source, owner, name) }

    // ------------------------------------------------------------- layout

    pub(crate) fn files(&self) -> &FileStore { &self.files }

    pub(crate) fn retention(&self) -> chrono::Duration { self.retention }

    pub(crate) fn dataset_dir(&self, owner: &str, name: &str) -> StoreResult<DataPath> { DataPath::new([owner, name]) }

    fn config_path(&self, owner: &str, name: &str) -> StoreResult<DataPath> {
        self.dataset_dir(owner, name)?.child("config")
    }

    pub(crate) fn version_path(&self, owner: &str, name: &str, version: u64) -> StoreResult<DataPath> {
        self.dataset_dir(owner, name)?.child("versions")?.child(version.to_string())
    }

    pub(crate) fn objects(&self, owner: &str, name: &str) -> StoreResult<BlobStore> {
        Ok(BlobStore::new(&self.files, &self.dataset_dir(owner, name)?.child("objects")?))
    }

    pub(crate) async fn lock_dataset(&self, owner: &str, name: &str) -> KeyGuard {
        self.files.locks().lock(&format!("dataset:{}", self.resource(owner, name))).await
    }

    // ------------------------------------------------------------- config

    /// Create an empty dataset at version 0. `Conflict` if it already exists.
    pub async fn create(&self, owner: &str, name: &str, mut config: DatasetConfig) -> StoreResult<DatasetConfig> {
        let config_path = self.config_path(owner, name)?;
        let _guard = self.lock_dataset(owner, name).await;
        if self.files.exists(&config_path).await? {
            return Err(StoreError::conflict(format!("dataset {} already exists", self.resource(owner, name))));
        }
        let now = Utc::now();
        config.version = 0;
        config.created = now;
        config.updated = now;
        config.validate()?;
        self.files.write_value(&self.version_path(owner, name, 0)?, &VersionSnapshot::empty(0, now)).await?;
        self.files.write_value(&config_path, &config).await?;
        info!(target: "shelfdb::dataset", "dataset created {}", self.resource(owner, name));
        self.sink.notify(&self.resource(owner, name), 0);
        Ok(config)
    }

    pub async fn read_config(&self, owner: &str, name: &str) -> StoreResult<DatasetConfig> {
        self.files.read_value(&self.config_path(owner, name)?).await
    }

    /// Replace the user-editable parts of the config. `version` and `created`
    /// are owned by the store and kept.
    pub async fn write_config(&self, owner: &str, name: &str, config: DatasetConfig) -> StoreResult<DatasetConfig> {
        let _guard = self.lock_dataset(owner, name).await;
        let current = self.read_config(owner, name).await?;
        let next = DatasetConfig { version: current.version, created: current.created, updated: Utc::now(), ..config };
        next.validate()?;
        self.files.write_value(&self.config_path(owner, name)?, &next).await?;
        debug!(target: "shelfdb::dataset", "config written {}", self.resource(owner, name));
        Ok(next)
    }

    pub async fn exists(&self, owner: &str, name: &str) -> StoreResult<bool> {
        self.files.exists(&self.config_path(owner, name)?).await
    }

    // ----------------------------------------------------------- snapshots

    /// Load one snapshot; `None` means the current one.
    pub async fn read_version(&self, owner: &str, name: &str, version: Option<u64>) -> StoreResult<VersionSnapshot> {
        let version = match version {
            Some(v) => v,
            None => self.read_config(owner, name).await?.version,
        };
        self.files.read_value(&self.version_path(owner, name, version)?).await
    }

    /// Snapshot numbers present on disk, ascending. May include one ahead of the config.
    pub async fn versions(&self, owner: &str, name: &str) -> StoreResult<Vec<u64>> {
        let dir = self.dataset_dir(owner, name)?.child("versions")?;
        let names: Vec<String> = self.files.list(&dir).try_collect().await?;
        let mut out: Vec<u64> = names.iter().filter_map(|n| n.parse().ok()).collect();
        out.sort_unstable();
        Ok(out)
    }

    async fn current(&self, owner: &str, name: &str) -> StoreResult<(DatasetConfig, VersionSnapshot)> {
        let config = self.read_config(owner, name).await?;
        let snapshot = self.read_version(owner, name, Some(config.version)).await?;
        Ok((config, snapshot))
    }

    /// Commit `snapshot` as the next version.
    pub async fn write_version(&self, owner: &str, name: &str, snapshot: VersionSnapshot) -> StoreResult<VersionSnapshot> {
        let _guard = self.lock_dataset(owner, name).await;
        self.write_version_locked(owner, name, snapshot).await
    }

    async fn write_version_locked(&self, owner: &str, name: &str, mut snapshot: VersionSnapshot) -> StoreResult<VersionSnapshot> {
        let (mut config, previous) = self.current(owner, name).await?;
        let next = config.version + 1;
        let now = Utc::now();
        snapshot.version = next;
        snapshot.created = now;
        for meta in snapshot.records.values_mut() {
            if meta.version.is_none() {
                meta.version = Some(next);
            }
        }
        self.files.write_value(&self.version_path(owner, name, next)?, &snapshot).await?;
        config.version = next;
        config.updated = now;
        config.validate()?;
        self.files.write_value(&self.config_path(owner, name)?, &config).await?;
        debug!(
            target: "shelfdb::dataset",
            "version committed {} v{} records={}",
            self.resource(owner, name), next, snapshot.records.len()
        );

        self.prune_replaced(owner, name, &previous, &snapshot).await;
        if config.garbage_collect {
            let report = gc::collect_objects_locked(self, owner, name, &snapshot).await;
            debug!(target: "shelfdb::gc", "inline object gc {} {:?}", self.resource(owner, name), report);
        }
        self.sink.notify(&self.resource(owner, name), next);
        Ok(snapshot)
    }

    /// For every record removed or changed between `old` and `new`, load the old
    /// payload and prune the attachments it referenced.
    async fn prune_replaced(&self, owner: &str, name: &str, old: &VersionSnapshot, new: &VersionSnapshot) {
        let objects = match self.objects(owner, name) {
            Ok(o) => o,
            Err(e) => {
                warn!(target: "shelfdb::dataset", "prune skipped for {}: {}", self.resource(owner, name), e);
                return;
            }
        };
        let mut candidates = BTreeSet::new();
        for (id, old_meta) in &old.records {
            if new.records.get(id).map(|m| m.hash == old_meta.hash).unwrap_or(false) {
                continue;
            }
            match objects.read_value::<RecordValue>(&old_meta.hash).await {
                Ok(value) => candidates.extend(value.references()),
                Err(e) => warn!(target: "shelfdb::dataset", "could not load replaced record {}: {}", id, e),
            }
        }
        for hash in candidates {
            if let Err(e) = self.attachments.prune(&hash, self).await {
                warn!(target: "shelfdb::attachments", "prune of {} failed: {}", hash, e);
            }
        }
    }

    // ------------------------------------------------------------- records

    /// Write inline attachments to the registry, swap them for refs, and link
    /// every other referenced attachment to `linker`. Holds are pushed to `holds`.
    async fn resolve_attachments(
        &self,
        value: &mut RecordValue,
        linker: &ResourcePath,
        holds: &mut Vec<AttachmentHold>,
    ) -> StoreResult<()> {
        let mut written = BTreeSet::new();
        for node in value.inline_attachments_mut() {
            let (data, mime_type) = match &mut *node {
                RecordValue::Attachment { data, mime_type } => (std::mem::take(data), mime_type.clone()),
                _ => continue,
            };
            let hold = self.attachments.write_bytes(&data, &mime_type, [linker.clone()]).await?;
            written.insert(hold.hash());
            *node = RecordValue::AttachmentRef(HashUrl::new(hold.hash(), mime_type));
            holds.push(hold);
        }
        for hash in value.references() {
            if written.contains(&hash) {
                continue;
            }
            let hold = self.attachments.hold(hash);
            match self.attachments.link(&hash, [linker.clone()]).await {
                Ok(()) => holds.push(hold),
                Err(e) if e.is_not_found() => {
                    warn!(target: "shelfdb::dataset", "{} references unknown attachment {}", linker, hash);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Validate, resolve and store one record payload; returns its meta for the next snapshot.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_record(
        &self,
        objects: &BlobStore,
        owner: &str,
        name: &str,
        id: &str,
        mut value: RecordValue,
        previous: Option<&RecordMeta>,
        now: DateTime<Utc>,
        holds: &mut Vec<AttachmentHold>,
    ) -> StoreResult<RecordMeta> {
        validate_record_id(id)?;
        value.validate()?;
        let linker = self.resource(owner, name).record(id);
        self.resolve_attachments(&mut value, &linker, holds).await?;
        let hash = objects.write_value(&value).await?;
        Ok(match previous {
            Some(meta) if meta.hash == hash => meta.clone(),
            _ => RecordMeta::pending(hash, now),
        })
    }

    fn release(holds: Vec<AttachmentHold>) {
        for h in holds {
            h.release();
        }
    }

    /// Insert or replace one record. Writing identical content keeps the
    /// record's version; the dataset version still advances.
    pub async fn write_entry(&self, owner: &str, name: &str, id: &str, value: RecordValue) -> StoreResult<RecordMeta> {
        let _guard = self.lock_dataset(owner, name).await;
        let (_, mut snapshot) = self.current(owner, name).await?;
        let objects = self.objects(owner, name)?;
        let mut holds = Vec::new();
        let meta = self
            .prepare_record(&objects, owner, name, id, value, snapshot.records.get(id), Utc::now(), &mut holds)
            .await?;
        snapshot.records.insert(id.to_string(), meta);
        let committed = self.write_version_locked(owner, name, snapshot).await?;
        Self::release(holds);
        committed
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::corrupt(format!("record {} missing after commit", id)))
    }

    pub async fn delete_entry(&self, owner: &str, name: &str, id: &str) -> StoreResult<VersionSnapshot> {
        let _guard = self.lock_dataset(owner, name).await;
        let (_, mut snapshot) = self.current(owner, name).await?;
        if snapshot.records.remove(id).is_none() {
            return Err(StoreError::not_found(format!("{}", self.resource(owner, name).record(id))));
        }
        self.write_version_locked(owner, name, snapshot).await
    }

    /// Replace the whole record set with `entries`; anything not yielded is removed.
    pub async fn overwrite<S>(&self, owner: &str, name: &str, entries: S) -> StoreResult<VersionSnapshot>
    where
        S: Stream<Item = (String, RecordValue)>,
    {
        let _guard = self.lock_dataset(owner, name).await;
        let (_, mut snapshot) = self.current(owner, name).await?;
        let objects = self.objects(owner, name)?;
        let previous = std::mem::take(&mut snapshot.records);
        let now = Utc::now();
        let mut holds = Vec::new();
        pin_mut!(entries);
        while let Some((id, value)) = entries.next().await {
            let meta = self.prepare_record(&objects, owner, name, &id, value, previous.get(&id), now, &mut holds).await?;
            snapshot.records.insert(id, meta);
        }
        let committed = self.write_version_locked(owner, name, snapshot).await?;
        Self::release(holds);
        Ok(committed)
    }

    /// Apply `entries` on top of the current records; `None` deletes that id.
    pub async fn merge<S>(&self, owner: &str, name: &str, entries: S) -> StoreResult<VersionSnapshot>
    where
        S: Stream<Item = (String, Option<RecordValue>)>,
    {
        let _guard = self.lock_dataset(owner, name).await;
        let (_, mut snapshot) = self.current(owner, name).await?;
        let objects = self.objects(owner, name)?;
        let now = Utc::now();
        let mut holds = Vec::new();
        pin_mut!(entries);
        while let Some((id, value)) = entries.next().await {
            match value {
                Some(value) => {
                    let previous = snapshot.records.get(&id).cloned();
                    let meta = self
                        .prepare_record(&objects, owner, name, &id, value, previous.as_ref(), now, &mut holds)
                        .await?;
                    snapshot.records.insert(id, meta);
                }
                None => {
                    snapshot.records.remove(&id);
                }
            }
        }
        let committed = self.write_version_locked(owner, name, snapshot).await?;
        Self::release(holds);
        Ok(committed)
    }

    pub async fn read_entry_meta(&self, owner: &str, name: &str, id: &str) -> StoreResult<RecordMeta> {
        let (_, snapshot) = self.current(owner, name).await?;
        snapshot
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("{}", self.resource(owner, name).record(id))))
    }

    pub async fn read_entry(&self, owner: &str, name: &str, id: &str) -> StoreResult<RecordValue> {
        let meta = self.read_entry_meta(owner, name, id).await?;
        self.objects(owner, name)?.read_value(&meta.hash).await
    }

    pub async fn entry_exists(&self, owner: &str, name: &str, id: &str) -> StoreResult<bool> {
        match self.read_entry_meta(owner, name, id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Record metas of the current snapshot accepted by `filter`, in id order.
    pub async fn iterate_entries_meta<F>(&self, owner: &str, name: &str, filter: F) -> StoreResult<Vec<(String, RecordMeta)>>
    where
        F: Fn(&str, &RecordMeta) -> bool,
    {
        let (_, snapshot) = self.current(owner, name).await?;
        Ok(snapshot.records.into_iter().filter(|(id, meta)| filter(id, meta)).collect())
    }

    /// Records accepted by `filter`. The filter runs on metadata, so rejected
    /// records are never loaded; accepted payloads load lazily as the stream is polled.
    pub async fn iterate_entries<F>(
        &self,
        owner: &str,
        name: &str,
        filter: F,
    ) -> StoreResult<BoxStream<'static, StoreResult<(String, RecordValue)>>>
    where
        F: Fn(&str, &RecordMeta) -> bool,
    {
        let metas = self.iterate_entries_meta(owner, name, filter).await?;
        let objects = self.objects(owner, name)?;
        Ok(stream::iter(metas)
            .then(move |(id, meta)| {
                let objects = objects.clone();
                async move {
                    let value = objects.read_value::<RecordValue>(&meta.hash).await?;
                    Ok((id, value))
                }
            })
            .boxed())
    }

    /// Fingerprint of the current record set: ids and payload hashes only, so
    /// two datasets with the same content hash the same.
    pub async fn collection_hash(&self, owner: &str, name: &str) -> StoreResult<Hash> {
        let (_, snapshot) = self.current(owner, name).await?;
        let mut hasher = StreamHasher::new();
        for (id, meta) in &snapshot.records {
            hasher.update(id.as_bytes());
            hasher.update(&[0]);
            hasher.update(meta.hash.as_bytes());
        }
        Ok(hasher.finish())
    }

    // ------------------------------------------------------------ datasets

    /// Remove a dataset and everything under it, then prune the attachments
    /// its records referenced. Returns whether it existed.
    pub async fn delete(&self, owner: &str, name: &str) -> StoreResult<bool> {
        let _guard = self.lock_dataset(owner, name).await;
        let mut referenced = BTreeSet::new();
        match self.current(owner, name).await {
            Ok((_, snapshot)) => {
                let objects = self.objects(owner, name)?;
                for meta in snapshot.records.values() {
                    match objects.read_value::<RecordValue>(&meta.hash).await {
                        Ok(v) => referenced.extend(v.references()),
                        Err(e) => warn!(target: "shelfdb::dataset", "unreadable record during delete: {}", e),
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                let dir = self.files.dir_path(&self.dataset_dir(owner, name)?)?;
                if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
        self.files.delete(&self.dataset_dir(owner, name)?).await?;
        info!(target: "shelfdb::dataset", "dataset deleted {}", self.resource(owner, name));
        for hash in referenced {
            if let Err(e) = self.attachments.prune(&hash, self).await {
                warn!(target: "shelfdb::attachments", "prune of {} failed: {}", hash, e);
            }
        }
        Ok(true)
    }

    /// Dataset names under `owner`.
    pub fn list(&self, owner: &str) -> BoxStream<'static, StoreResult<String>> {
        match DataPath::new([owner]) {
            Ok(dir) => self.files.list_folders(&dir),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    pub fn list_owners(&self) -> BoxStream<'static, StoreResult<String>> {
        self.files.list_folders(&DataPath::root())
    }
}

impl LinkResolver for DatasetStore {
    fn references<'a>(&'a self, linker: &'a ResourcePath) -> BoxFuture<'a, StoreResult<Option<HashSet<Hash>>>> {
        Box::pin(async move {
            if linker.source != self.source {
                return Ok(None);
            }
            let Some(id) = linker.record_id.as_deref() else {
                // dataset-level linkers are not resolvable from record content
                return Ok(None);
            };
            match self.read_entry(&linker.owner, &linker.name, id).await {
                Ok(value) => Ok(Some(value.references().into_iter().collect())),
                Err(e) if e.is_not_found() => Ok(Some(HashSet::new())),
                Err(e) => Err(e),
            }
        })
    }
}
