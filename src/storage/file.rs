//! Durable file primitive.
//! -----------------------
//! Every value lives in a canonical file `<name><ext>`, with the previous
//! generation kept as `<name><ext>.backup`. Writes go to a temp sibling
//! `<name><ext>.tmp-<uuid>` on the same volume, are fsynced, and only then
//! swapped into place, so a reader sees either the old complete value or the
//! new complete value. Reads fall back to the backup exactly once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::paths::{unescape_segment, DataPath};

use super::codec::Codec;
use super::hash::{Hash, StreamHasher};
use super::locks::{KeyGuard, LockRegistry};

const BACKUP_SUFFIX: &str = ".backup";
const TEMP_MARKER: &str = ".tmp-";
const STAGED_PREFIX: &str = ".staged-";
const STREAM_CHUNK: usize = 64 * 1024;

/// A fully written, fsynced temp file whose final name is not known yet.
#[derive(Debug)]
pub struct Staged {
    pub(crate) path: PathBuf,
    pub hash: Hash,
    pub len: u64,
}

#[derive(Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
    prefix: DataPath,
    extension: String,
    codec: Codec,
    retain_backup: bool,
    locks: LockRegistry,
}

#[derive(Clone, Copy, PartialEq)]
enum EntryKind {
    Files,
    Folders,
}

impl FileStore {
    /// File store over the whole jail root, using the codec's extension.
    pub fn new(config: &StoreConfig, locks: LockRegistry) -> Self {
        Self {
            root: Arc::new(config.root.clone()),
            prefix: DataPath::root(),
            extension: config.codec.extension().to_string(),
            codec: config.codec,
            retain_backup: config.retain_backup,
            locks,
        }
    }

    /// A store over a sub-folder with its own file extension. Shares root, codec and locks.
    pub fn scoped(&self, prefix: &DataPath, extension: &str) -> Self {
        Self {
            root: self.root.clone(),
            prefix: self.prefix.join(prefix),
            extension: extension.to_string(),
            codec: self.codec,
            retain_backup: self.retain_backup,
            locks: self.locks.clone(),
        }
    }

    pub fn root(&self) -> &Path { &self.root }
    pub fn prefix(&self) -> &DataPath { &self.prefix }
    pub fn extension(&self) -> &str { &self.extension }
    pub fn codec(&self) -> Codec { self.codec }
    pub fn locks(&self) -> &LockRegistry { &self.locks }

    /// Canonical filesystem path for `path`, jail-checked.
    pub fn file_path(&self, path: &DataPath) -> StoreResult<PathBuf> {
        self.prefix.join(path).to_file(&self.root, &self.extension)
    }

    /// Directory filesystem path for `path`, jail-checked.
    pub fn dir_path(&self, path: &DataPath) -> StoreResult<PathBuf> {
        self.prefix.join(path).to_dir(&self.root)
    }

    // ---------------------------------------------------------------- writes

    /// Atomically replace the value at `path` with `bytes`. Writers of the
    /// same path are serialized on the `file:` lock.
    pub async fn write(&self, path: &DataPath, bytes: &[u8]) -> StoreResult<()> {
        let file = self.file_path(path)?;
        let _guard = self.lock_file(&file).await;
        self.write_locked(&file, bytes).await?;
        debug!(target: "shelfdb::storage", "write ok path={} bytes={}", path, bytes.len());
        Ok(())
    }

    /// Caller holds the `file:` lock for `file`.
    async fn write_locked(&self, file: &Path, bytes: &[u8]) -> StoreResult<()> {
        ensure_parent(file).await?;
        let tmp = suffixed(file, &format!("{}{}", TEMP_MARKER, Uuid::new_v4().simple()));
        if let Err(e) = write_temp(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        self.commit(&tmp, file).await
    }

    async fn lock_file(&self, file: &Path) -> KeyGuard {
        self.locks.lock(&format!("file:{}", file.display())).await
    }

    /// Like [`write`](Self::write) but drains `reader`. Returns bytes written.
    pub async fn write_stream<R: AsyncRead + Unpin>(&self, path: &DataPath, reader: &mut R) -> StoreResult<u64> {
        let staged = self.stage(reader).await?;
        let len = staged.len;
        self.commit_staged(&staged, path).await?;
        Ok(len)
    }

    /// Encode `value` with the store codec and write it.
    pub async fn write_value<T: Serialize + ?Sized>(&self, path: &DataPath, value: &T) -> StoreResult<()> {
        let bytes = self.codec.encode(value)?;
        self.write(path, &bytes).await
    }

    /// Drain `reader` into a fsynced temp file under this store's folder,
    /// hashing as it goes. The result must be committed or discarded.
    pub async fn stage<R: AsyncRead + Unpin>(&self, reader: &mut R) -> StoreResult<Staged> {
        let dir = self.dir_path(&DataPath::root())?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(format!("create dir {}", dir.display()), e))?;
        let path = dir.join(format!("{}{}", STAGED_PREFIX, Uuid::new_v4().simple()));
        match stream_to_file(&path, reader).await {
            Ok((hash, len)) => Ok(Staged { path, hash, len }),
            Err(e) => {
                let _ = fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    /// Move a staged file into place at `path`.
    pub async fn commit_staged(&self, staged: &Staged, path: &DataPath) -> StoreResult<()> {
        let file = self.file_path(path)?;
        let _guard = self.lock_file(&file).await;
        ensure_parent(&file).await?;
        self.commit(&staged.path, &file).await
    }

    /// Commit `staged` at `path` only if nothing is stored there yet; the check
    /// and the commit happen under one `file:` lock. Returns whether it committed.
    /// A staged file that was not committed is left for the caller to discard.
    pub async fn commit_staged_if_absent(&self, staged: &Staged, path: &DataPath) -> StoreResult<bool> {
        let file = self.file_path(path)?;
        let _guard = self.lock_file(&file).await;
        if exists(&file).await? || exists(&suffixed(&file, BACKUP_SUFFIX)).await? {
            return Ok(false);
        }
        ensure_parent(&file).await?;
        self.commit(&staged.path, &file).await?;
        Ok(true)
    }

    /// Write `bytes` at `path` unless something is already stored there.
    /// Returns whether it wrote.
    pub async fn write_if_absent(&self, path: &DataPath, bytes: &[u8]) -> StoreResult<bool> {
        let file = self.file_path(path)?;
        let _guard = self.lock_file(&file).await;
        if exists(&file).await? || exists(&suffixed(&file, BACKUP_SUFFIX)).await? {
            return Ok(false);
        }
        self.write_locked(&file, bytes).await?;
        Ok(true)
    }

    pub async fn discard_staged(&self, staged: Staged) {
        if let Err(e) = fs::remove_file(&staged.path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(target: "shelfdb::storage", "discard staged {} failed: {}", staged.path.display(), e);
            }
        }
    }

    /// Swap a complete temp file into the canonical name, keeping the previous
    /// generation as backup. The canonical name is never left holding partial data.
    async fn commit(&self, tmp: &Path, file: &Path) -> StoreResult<()> {
        let backup = suffixed(file, BACKUP_SUFFIX);
        let result = async {
            if exists(file).await? {
                remove_if_present(&backup).await?;
                // Prefer a hard link so the canonical name never disappears; fall back to rename.
                if fs::hard_link(file, &backup).await.is_err() {
                    fs::rename(file, &backup)
                        .await
                        .map_err(|e| StoreError::io(format!("rename {} -> backup", file.display()), e))?;
                }
            }
            fs::rename(tmp, file)
                .await
                .map_err(|e| StoreError::io(format!("rename {} -> {}", tmp.display(), file.display()), e))
        }
        .await;
        if let Err(e) = result {
            let _ = fs::remove_file(tmp).await;
            return Err(e);
        }
        if !self.retain_backup {
            if let Err(e) = remove_if_present(&backup).await {
                debug!(target: "shelfdb::storage", "backup cleanup skipped for {}: {}", file.display(), e);
            }
        }
        if let Some(parent) = file.parent() {
            fsync_dir(parent).await;
        }
        Ok(())
    }

    // ----------------------------------------------------------------- reads

    /// Read raw bytes, falling back to the backup when the canonical file is missing.
    pub async fn read(&self, path: &DataPath) -> StoreResult<Vec<u8>> {
        self.read_decoded(path, Ok).await
    }

    /// Read and decode with the store codec; a canonical file that fails to
    /// decode is treated as corrupt and the backup is tried once.
    pub async fn read_value<T: DeserializeOwned>(&self, path: &DataPath) -> StoreResult<T> {
        let codec = self.codec;
        self.read_decoded(path, move |bytes| codec.decode::<T>(&bytes)).await
    }

    async fn read_decoded<T, F>(&self, path: &DataPath, decode: F) -> StoreResult<T>
    where
        F: Fn(Vec<u8>) -> StoreResult<T>,
    {
        let file = self.file_path(path)?;
        let primary = match fs::read(&file).await {
            Ok(bytes) => decode(bytes),
            Err(e) => Err(StoreError::io(format!("read {}", file.display()), e)),
        };
        let primary_err = match primary {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let backup = suffixed(&file, BACKUP_SUFFIX);
        match fs::read(&backup).await {
            Ok(bytes) => match decode(bytes) {
                Ok(v) => {
                    if !primary_err.is_not_found() {
                        warn!(target: "shelfdb::storage", "recovered {} from backup after: {}", path, primary_err);
                    }
                    Ok(v)
                }
                Err(backup_err) => Err(StoreError::corrupt(format!(
                    "{}: {} (backup: {})",
                    path, primary_err, backup_err
                ))),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // corrupt with no backup reads as absent
                if !primary_err.is_not_found() {
                    warn!(target: "shelfdb::storage", "{} unreadable and no backup: {}", path, primary_err);
                    return Err(StoreError::not_found(format!("{}: {}", path, primary_err)));
                }
                Err(StoreError::not_found(path.to_string()))
            }
            Err(e) => Err(StoreError::io(format!("read {}", backup.display()), e)),
        }
    }

    /// True if a canonical or backup file exists for `path`.
    pub async fn exists(&self, path: &DataPath) -> StoreResult<bool> {
        let file = self.file_path(path)?;
        Ok(exists(&file).await? || exists(&suffixed(&file, BACKUP_SUFFIX)).await?)
    }

    /// Lazily enumerate the names of values stored directly under `path`.
    pub fn list(&self, path: &DataPath) -> BoxStream<'static, StoreResult<String>> {
        list_dir(self.dir_path(path), EntryKind::Files, self.extension.clone())
    }

    /// Lazily enumerate the names of sub-folders directly under `path`.
    pub fn list_folders(&self, path: &DataPath) -> BoxStream<'static, StoreResult<String>> {
        list_dir(self.dir_path(path), EntryKind::Folders, self.extension.clone())
    }

    // ------------------------------------------------------ mutate in place

    /// Remove canonical, backup and any folder of the same name. Idempotent.
    pub async fn delete(&self, path: &DataPath) -> StoreResult<()> {
        if !path.is_root() {
            let file = self.file_path(path)?;
            let _guard = self.lock_file(&file).await;
            remove_if_present(&file).await?;
            remove_if_present(&suffixed(&file, BACKUP_SUFFIX)).await?;
        }
        let dir = self.dir_path(path)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(format!("remove dir {}", dir.display()), e)),
        }
        debug!(target: "shelfdb::storage", "delete ok path={}", path);
        Ok(())
    }

    /// Read-modify-write under a lock keyed by the resolved file path.
    /// `f` receives the current value (or `None` when absent) and returns the
    /// value to write, or `None` to leave the file untouched. Returns what was written.
    pub async fn update<T, F>(&self, path: &DataPath, f: F) -> StoreResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> StoreResult<Option<T>>,
    {
        let file = self.file_path(path)?;
        let _guard = self.lock_file(&file).await;
        let current = match self.read_value::<T>(path).await {
            Ok(v) => Some(v),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match f(current)? {
            Some(next) => {
                let bytes = self.codec.encode(&next)?;
                self.write_locked(&file, &bytes).await?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    /// Best-effort move of canonical and backup from `from` to `to`.
    pub async fn rename(&self, from: &DataPath, to: &DataPath) -> StoreResult<()> {
        let src = self.file_path(from)?;
        let dst = self.file_path(to)?;
        if src == dst {
            return if self.exists(from).await? { Ok(()) } else { Err(StoreError::not_found(from.to_string())) };
        }
        // both locks, always in sorted path order
        let (first, second) = if src < dst { (&src, &dst) } else { (&dst, &src) };
        let _g1 = self.lock_file(first).await;
        let _g2 = self.lock_file(second).await;
        ensure_parent(&dst).await?;
        let mut moved = false;
        for (a, b) in [(src.clone(), dst.clone()), (suffixed(&src, BACKUP_SUFFIX), suffixed(&dst, BACKUP_SUFFIX))] {
            match fs::rename(&a, &b).await {
                Ok(()) => moved = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(target: "shelfdb::storage", "rename {} -> {} failed: {}", a.display(), b.display(), e),
            }
        }
        if !moved {
            return Err(StoreError::not_found(from.to_string()));
        }
        Ok(())
    }

    /// Remove temp and staged files under `path` older than `older_than`,
    /// left behind by writes that never reached their final rename.
    pub async fn sweep_temp(&self, path: &DataPath, older_than: Duration) -> StoreResult<usize> {
        let dir = self.dir_path(path)?;
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(format!("read dir {}", dir.display()), e)),
        };
        let now = SystemTime::now();
        let mut removed = 0usize;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("read dir {}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.contains(TEMP_MARKER) || name.starts_with(STAGED_PREFIX)) {
                continue;
            }
            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(_) => continue,
            };
            if age >= older_than && fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(target: "shelfdb::storage", "sweep_temp removed={} dir={}", removed, dir.display());
        }
        Ok(removed)
    }
}

fn suffixed(file: &Path, suffix: &str) -> PathBuf {
    let mut name = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    file.with_file_name(name)
}

async fn exists(p: &Path) -> StoreResult<bool> {
    fs::try_exists(p).await.map_err(|e| StoreError::io(format!("stat {}", p.display()), e))
}

async fn remove_if_present(p: &Path) -> StoreResult<()> {
    match fs::remove_file(p).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(format!("remove {}", p.display()), e)),
    }
}

async fn ensure_parent(file: &Path) -> StoreResult<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(format!("create dir {}", parent.display()), e))?;
    }
    Ok(())
}

async fn write_temp(tmp: &Path, bytes: &[u8]) -> StoreResult<()> {
    let ctx = || format!("write {}", tmp.display());
    let mut f = fs::File::create(tmp).await.map_err(|e| StoreError::io(ctx(), e))?;
    f.write_all(bytes).await.map_err(|e| StoreError::io(ctx(), e))?;
    f.flush().await.map_err(|e| StoreError::io(ctx(), e))?;
    f.sync_all().await.map_err(|e| StoreError::io(ctx(), e))?;
    Ok(())
}

async fn stream_to_file<R: AsyncRead + Unpin>(path: &Path, reader: &mut R) -> StoreResult<(Hash, u64)> {
    let ctx = || format!("stage {}", path.display());
    let mut f = fs::File::create(path).await.map_err(|e| StoreError::io(ctx(), e))?;
    let mut hasher = StreamHasher::new();
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| StoreError::io(ctx(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        f.write_all(&buf[..n]).await.map_err(|e| StoreError::io(ctx(), e))?;
    }
    f.flush().await.map_err(|e| StoreError::io(ctx(), e))?;
    f.sync_all().await.map_err(|e| StoreError::io(ctx(), e))?;
    let len = hasher.len();
    Ok((hasher.finish(), len))
}

async fn fsync_dir(dir: &Path) {
    // Not every platform can open a directory for sync; failures are ignored.
    if let Ok(f) = fs::File::open(dir).await {
        let _ = f.sync_all().await;
    }
}

/// Decode a directory entry name into a logical name, or `None` if it is not
/// an entry of the requested kind (backups, temps, foreign files).
fn classify_name(name: &str, kind: EntryKind, extension: &str) -> Option<StoreResult<String>> {
    match kind {
        EntryKind::Files => {
            let (stem, rest) = name.split_once('.')?;
            if stem.is_empty() || extension.strip_prefix('.') != Some(rest) {
                return None;
            }
            Some(unescape_segment(stem))
        }
        EntryKind::Folders => {
            if name.contains('.') {
                return None;
            }
            Some(unescape_segment(name))
        }
    }
}

enum ListState {
    Start(StoreResult<PathBuf>),
    Reading(fs::ReadDir),
    Done,
}

fn list_dir(dir: StoreResult<PathBuf>, kind: EntryKind, extension: String) -> BoxStream<'static, StoreResult<String>> {
    stream::unfold(ListState::Start(dir), move |state| {
        let extension = extension.clone();
        async move {
            let mut rd = match state {
                ListState::Done => return None,
                ListState::Start(Err(e)) => return Some((Err(e), ListState::Done)),
                ListState::Start(Ok(dir)) => match fs::read_dir(&dir).await {
                    Ok(rd) => rd,
                    Err(e) if e.kind() == ErrorKind::NotFound => return None,
                    Err(e) => return Some((Err(StoreError::io(format!("read dir {}", dir.display()), e)), ListState::Done)),
                },
                ListState::Reading(rd) => rd,
            };
            loop {
                match rd.next_entry().await {
                    Ok(Some(entry)) => {
                        let is_dir = match entry.file_type().await {
                            Ok(t) => t.is_dir(),
                            Err(_) => continue,
                        };
                        if is_dir != (kind == EntryKind::Folders) {
                            continue;
                        }
                        let name = entry.file_name().to_string_lossy().to_string();
                        if let Some(item) = classify_name(&name, kind, &extension) {
                            return Some((item, ListState::Reading(rd)));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(StoreError::io("read dir entry", e)), ListState::Done)),
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_skips_backups_and_temps() {
        let ext = ".json";
        assert_eq!(classify_name("abc.json", EntryKind::Files, ext).unwrap().unwrap(), "abc");
        assert_eq!(classify_name("a%2Eb.json", EntryKind::Files, ext).unwrap().unwrap(), "a.b");
        assert!(classify_name("abc.json.backup", EntryKind::Files, ext).is_none());
        assert!(classify_name("abc.json.tmp-1234", EntryKind::Files, ext).is_none());
        assert!(classify_name(".staged-1234", EntryKind::Files, ext).is_none());
        assert!(classify_name("abc.blob", EntryKind::Files, ext).is_none());
        assert_eq!(classify_name("sub%20dir", EntryKind::Folders, ext).unwrap().unwrap(), "sub dir");
        assert!(classify_name("abc.json", EntryKind::Folders, ext).is_none());
    }

    #[test]
    fn suffix_appends_to_file_name() {
        let p = Path::new("/r/a/b.json");
        assert_eq!(suffixed(p, ".backup"), Path::new("/r/a/b.json.backup"));
    }
}
