//! Reference-tracked attachment registry.
//!
//! Every attachment is a blob under `attachments/blobs` plus an
//! `AttachmentMeta` under `attachments/meta`, both named by the content hash.
//! `linkers` records which resources are believed to reference the attachment;
//! it is only ever widened on write and narrowed by `validate`, which asks a
//! [`LinkResolver`] what each linker references *now*. An attachment with no
//! verified linkers and no in-process hold is deleted.
//!
//! All persisted changes to one attachment happen under `attachment:<hash>`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use rand::seq::SliceRandom;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::paths::{DataPath, ResourcePath};
use crate::storage::{BlobStore, FileStore, Hash, KeyGuard, LockRegistry};

use super::holds::{AttachmentHold, HoldRegistry};
use super::meta::AttachmentMeta;

/// Answers "which attachments does this resource reference right now?".
pub trait LinkResolver: Send + Sync {
    /// `Ok(None)` means the resolver does not serve `linker` (for example another
    /// source); such linkers are kept as they are. A resource that no longer
    /// exists resolves to an empty set.
    fn references<'a>(&'a self, linker: &'a ResourcePath) -> BoxFuture<'a, StoreResult<Option<HashSet<Hash>>>>;
}

/// Tries each resolver in turn; the first one that serves a linker answers.
#[derive(Clone, Default)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn LinkResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn LinkResolver>>) -> Self { Self { resolvers } }

    pub fn push(&mut self, resolver: Arc<dyn LinkResolver>) { self.resolvers.push(resolver); }
}

impl LinkResolver for ResolverChain {
    fn references<'a>(&'a self, linker: &'a ResourcePath) -> BoxFuture<'a, StoreResult<Option<HashSet<Hash>>>> {
        Box::pin(async move {
            for r in &self.resolvers {
                if let Some(found) = r.references(linker).await? {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        })
    }
}

/// Result of one `prune_random` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// No attachments registered.
    Empty,
    /// The chosen attachment was locked by someone else; skipped.
    Busy(Hash),
    Retained(Hash),
    Deleted(Hash),
}

pub struct AttachmentRegistry {
    meta: FileStore,
    blobs: BlobStore,
    locks: LockRegistry,
    holds: HoldRegistry,
    grace: chrono::Duration,
    hold_warning: Duration,
}

impl AttachmentRegistry {
    pub fn new(files: &FileStore, config: &StoreConfig, holds: HoldRegistry) -> StoreResult<Self> {
        let base = DataPath::new(["attachments"])?;
        Ok(Self {
            meta: files.scoped(&base.child("meta")?, files.codec().extension()),
            blobs: BlobStore::new(files, &base.child("blobs")?),
            locks: files.locks().clone(),
            holds,
            grace: config.attachment_grace(),
            hold_warning: config.hold_warning(),
        })
    }

    pub fn blobs(&self) -> &BlobStore { &self.blobs }

    pub fn holds(&self) -> &HoldRegistry { &self.holds }

    pub(crate) fn meta_store(&self) -> &FileStore { &self.meta }

    fn meta_key(hash: &Hash) -> StoreResult<DataPath> { DataPath::new([hash.to_hex()]) }

    fn lock_key(hash: &Hash) -> String { format!("attachment:{}", hash) }

    async fn lock(&self, hash: &Hash) -> KeyGuard { self.locks.lock(&Self::lock_key(hash)).await }

    /// Pin `hash` against pruning until the returned hold is released.
    pub fn hold(&self, hash: Hash) -> AttachmentHold { self.holds.hold(hash, self.hold_warning) }

    /// Stream an attachment in, register `linkers`, and return a hold on it.
    /// The caller releases the hold once the referencing record is committed.
    pub async fn write_stream<R, I>(&self, reader: &mut R, mime_type: &str, linkers: I) -> StoreResult<AttachmentHold>
    where
        R: AsyncRead + Unpin,
        I: IntoIterator<Item = ResourcePath>,
    {
        if mime_type.trim().is_empty() {
            return Err(StoreError::validation("attachment mime type cannot be empty"));
        }
        let staged = self.blobs.stage(reader).await?;
        let hash = staged.hash;
        let _guard = self.lock(&hash).await;
        let hold = self.hold(hash);
        self.blobs.commit(staged).await?;
        let now = Utc::now();
        let linkers: Vec<ResourcePath> = linkers.into_iter().collect();
        let mime = mime_type.to_string();
        self.meta
            .update::<AttachmentMeta, _>(&Self::meta_key(&hash)?, move |cur| {
                let mut meta = cur.unwrap_or_else(|| AttachmentMeta::new(hash, mime, now));
                meta.merge_linkers(linkers, now);
                Ok(Some(meta))
            })
            .await?;
        debug!(target: "shelfdb::attachments", "attachment written hash={}", hash);
        Ok(hold)
    }

    pub async fn write_bytes<I>(&self, bytes: &[u8], mime_type: &str, linkers: I) -> StoreResult<AttachmentHold>
    where
        I: IntoIterator<Item = ResourcePath>,
    {
        let mut reader = bytes;
        self.write_stream(&mut reader, mime_type, linkers).await
    }

    /// Union `linkers` into an existing attachment and stamp `updated`, even
    /// when every linker is already listed, so the grace window restarts.
    pub async fn link<I>(&self, hash: &Hash, linkers: I) -> StoreResult<()>
    where
        I: IntoIterator<Item = ResourcePath>,
    {
        let _guard = self.lock(hash).await;
        let linkers: Vec<ResourcePath> = linkers.into_iter().collect();
        let now = Utc::now();
        let h = *hash;
        self.meta
            .update::<AttachmentMeta, _>(&Self::meta_key(hash)?, move |cur| match cur {
                Some(mut meta) => {
                    meta.merge_linkers(linkers, now);
                    Ok(Some(meta))
                }
                None => Err(StoreError::not_found(format!("attachment {}", h))),
            })
            .await?;
        Ok(())
    }

    /// Re-derive the linker set through `resolver`; delete the attachment if
    /// nothing references it and it is not held. Returns whether it was retained.
    pub async fn validate(&self, hash: &Hash, resolver: &dyn LinkResolver) -> StoreResult<bool> {
        let _guard = self.lock(hash).await;
        self.validate_locked(hash, resolver).await
    }

    /// `validate`, except attachments created or updated within the grace window are kept.
    pub async fn prune(&self, hash: &Hash, resolver: &dyn LinkResolver) -> StoreResult<bool> {
        let _guard = self.lock(hash).await;
        self.prune_locked(hash, resolver).await
    }

    /// Prune one randomly chosen attachment. Skips when it is locked.
    pub async fn prune_random(&self, resolver: &dyn LinkResolver) -> StoreResult<PruneOutcome> {
        let hashes: Vec<Hash> = self.iterate().try_collect().await?;
        let picked = hashes.choose(&mut rand::thread_rng()).copied();
        let Some(hash) = picked else {
            return Ok(PruneOutcome::Empty);
        };
        let _guard = match self.locks.try_lock(&Self::lock_key(&hash)) {
            Ok(g) => g,
            Err(e) => {
                debug!(target: "shelfdb::attachments", "prune_random skipped: {}", e);
                return Ok(PruneOutcome::Busy(hash));
            }
        };
        if self.prune_locked(&hash, resolver).await? {
            Ok(PruneOutcome::Retained(hash))
        } else {
            Ok(PruneOutcome::Deleted(hash))
        }
    }

    async fn prune_locked(&self, hash: &Hash, resolver: &dyn LinkResolver) -> StoreResult<bool> {
        match self.meta.read_value::<AttachmentMeta>(&Self::meta_key(hash)?).await {
            Ok(meta) if meta.within_grace(Utc::now(), self.grace) => {
                debug!(target: "shelfdb::attachments", "prune skipped inside grace window hash={}", hash);
                Ok(true)
            }
            Ok(_) => self.validate_locked(hash, resolver).await,
            Err(e) if e.is_not_found() => self.validate_locked(hash, resolver).await,
            Err(e) => Err(e),
        }
    }

    async fn validate_locked(&self, hash: &Hash, resolver: &dyn LinkResolver) -> StoreResult<bool> {
        let key = Self::meta_key(hash)?;
        let meta = match self.meta.read_value::<AttachmentMeta>(&key).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                // blob without meta: nothing can reference it by registration
                if !self.holds.is_held(hash) && self.blobs.exists(hash).await? {
                    self.blobs.delete(hash).await?;
                    info!(target: "shelfdb::attachments", "removed unregistered blob {}", hash);
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        // held: an uncommitted write owns it and its linkers stay as they are
        if self.holds.is_held(hash) {
            debug!(target: "shelfdb::attachments", "validate skipped for held attachment {}", hash);
            return Ok(true);
        }

        let mut verified = BTreeSet::new();
        for linker in &meta.linkers {
            match resolver.references(linker).await {
                Ok(None) => {
                    verified.insert(linker.clone());
                }
                Ok(Some(refs)) => {
                    if refs.contains(hash) {
                        verified.insert(linker.clone());
                    }
                }
                Err(e) => {
                    warn!(target: "shelfdb::attachments", "could not resolve linker {} of {}: {}", linker, hash, e);
                    verified.insert(linker.clone());
                }
            }
        }

        if verified.is_empty() && !self.holds.is_held(hash) {
            self.blobs.delete(hash).await?;
            self.meta.delete(&key).await?;
            info!(target: "shelfdb::attachments", "attachment deleted hash={}", hash);
            return Ok(false);
        }
        if verified != meta.linkers {
            let dropped = meta.linkers.len() - verified.len();
            let mut next = meta;
            next.linkers = verified;
            self.meta.write_value(&key, &next).await?;
            debug!(target: "shelfdb::attachments", "validate dropped {} stale linker(s) of {}", dropped, hash);
        }
        Ok(true)
    }

    /// Attachment metadata and bytes.
    pub async fn read(&self, hash: &Hash) -> StoreResult<(AttachmentMeta, Vec<u8>)> {
        let meta = self.read_meta(hash).await?;
        let bytes = self.blobs.read(hash).await?;
        Ok((meta, bytes))
    }

    pub async fn read_meta(&self, hash: &Hash) -> StoreResult<AttachmentMeta> {
        self.meta.read_value(&Self::meta_key(hash)?).await
    }

    pub async fn exists(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(self.meta.exists(&Self::meta_key(hash)?).await? && self.blobs.exists(hash).await?)
    }

    /// Lazily enumerate registered attachments.
    pub fn iterate(&self) -> BoxStream<'static, StoreResult<Hash>> {
        self.meta
            .list(&DataPath::root())
            .filter_map(|item| async move {
                match item {
                    Ok(name) => name.parse::<Hash>().ok().map(Ok),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed()
    }

    /// Remove temp files left in the attachment folders by interrupted writes.
    pub async fn sweep_temp(&self, older_than: Duration) -> StoreResult<usize> {
        let root = DataPath::root();
        Ok(self.meta.sweep_temp(&root, older_than).await? + self.blobs.files().sweep_temp(&root, older_than).await?)
    }
}
