//! Content-addressed blob store.
//! Blobs are immutable: the file name is the SHA-256 of the bytes, so a second
//! write of the same content is a no-op and there is never a backup generation.

use futures_util::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::paths::DataPath;

use super::codec::Codec;
use super::file::{FileStore, Staged};
use super::hash::Hash;

pub const BLOB_EXT: &str = ".blob";

#[derive(Clone)]
pub struct BlobStore {
    files: FileStore,
}

impl BlobStore {
    /// Blob store rooted at `prefix` under `base`.
    pub fn new(base: &FileStore, prefix: &DataPath) -> Self {
        Self { files: base.scoped(prefix, BLOB_EXT) }
    }

    pub fn files(&self) -> &FileStore { &self.files }

    pub fn codec(&self) -> Codec { self.files.codec() }

    fn key(hash: &Hash) -> StoreResult<DataPath> {
        DataPath::new([hash.to_hex()])
    }

    /// Store `bytes` under their hash. Returns the hash.
    pub async fn write(&self, bytes: &[u8]) -> StoreResult<Hash> {
        let hash = Hash::digest(bytes);
        let key = Self::key(&hash)?;
        if self.files.write_if_absent(&key, bytes).await? {
            debug!(target: "shelfdb::blob", "blob stored hash={} bytes={}", hash, bytes.len());
        }
        Ok(hash)
    }

    /// Stream `reader` into the store, hashing while writing. The staged file is
    /// only committed if no blob with the same hash exists yet.
    pub async fn write_stream<R: AsyncRead + Unpin>(&self, reader: &mut R) -> StoreResult<(Hash, u64)> {
        let staged = self.stage(reader).await?;
        let len = staged.len;
        let hash = self.commit(staged).await?;
        Ok((hash, len))
    }

    /// Drain `reader` into a staged file. The hash is known once this returns,
    /// so callers can lock on it before [`commit`](Self::commit).
    pub async fn stage<R: AsyncRead + Unpin>(&self, reader: &mut R) -> StoreResult<Staged> {
        self.files.stage(reader).await
    }

    /// Move a staged file into place under its hash, or drop it if that blob exists.
    pub async fn commit(&self, staged: Staged) -> StoreResult<Hash> {
        let (hash, len) = (staged.hash, staged.len);
        let key = Self::key(&hash)?;
        match self.files.commit_staged_if_absent(&staged, &key).await {
            Ok(true) => {
                debug!(target: "shelfdb::blob", "blob streamed hash={} bytes={}", hash, len);
                Ok(hash)
            }
            Ok(false) => {
                self.files.discard_staged(staged).await;
                Ok(hash)
            }
            Err(e) => {
                self.files.discard_staged(staged).await;
                Err(e)
            }
        }
    }

    /// Encode `value` and store the encoded bytes. The hash is over the encoding.
    pub async fn write_value<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<Hash> {
        let bytes = self.codec().encode(value)?;
        self.write(&bytes).await
    }

    /// Read the blob and check it still hashes to its name.
    pub async fn read(&self, hash: &Hash) -> StoreResult<Vec<u8>> {
        let bytes = self.files.read(&Self::key(hash)?).await?;
        let actual = Hash::digest(&bytes);
        if actual != *hash {
            return Err(StoreError::corrupt(format!("blob {} hashes to {}", hash, actual)));
        }
        Ok(bytes)
    }

    pub async fn read_value<T: DeserializeOwned>(&self, hash: &Hash) -> StoreResult<T> {
        let bytes = self.read(hash).await?;
        self.codec().decode(&bytes)
    }

    pub async fn exists(&self, hash: &Hash) -> StoreResult<bool> {
        self.files.exists(&Self::key(hash)?).await
    }

    pub async fn delete(&self, hash: &Hash) -> StoreResult<()> {
        self.files.delete(&Self::key(hash)?).await
    }

    /// Lazily enumerate stored hashes. Names that are not hashes are skipped.
    pub fn iterate(&self) -> BoxStream<'static, StoreResult<Hash>> {
        self.files
            .list(&DataPath::root())
            .filter_map(|item| async move {
                match item {
                    Ok(name) => name.parse::<Hash>().ok().map(Ok),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed()
    }
}
