use super::*;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::paths::{ResourcePath, Source};
use crate::storage::{FileStore, Hash, LockRegistry};
use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// In-memory stand-in for the record store: linker -> referenced hashes.
#[derive(Default)]
struct MapResolver {
    refs: Mutex<HashMap<ResourcePath, HashSet<Hash>>>,
}

impl MapResolver {
    fn set(&self, linker: &ResourcePath, hashes: &[Hash]) {
        self.refs.lock().insert(linker.clone(), hashes.iter().copied().collect());
    }
}

impl LinkResolver for MapResolver {
    fn references<'a>(&'a self, linker: &'a ResourcePath) -> BoxFuture<'a, StoreResult<Option<HashSet<Hash>>>> {
        Box::pin(async move {
            if linker.source != Source::Datasets {
                return Ok(None);
            }
            Ok(Some(self.refs.lock().get(linker).cloned().unwrap_or_default()))
        })
    }
}

fn registry(dir: &std::path::Path) -> AttachmentRegistry {
    let cfg = StoreConfig::new(dir);
    let files = FileStore::new(&cfg, LockRegistry::new());
    AttachmentRegistry::new(&files, &cfg, HoldRegistry::new()).unwrap()
}

fn rec(id: &str) -> ResourcePath {
    ResourcePath::dataset(Source::Datasets, "u", "d").record(id)
}

/// Push `created`/`updated` back past the grace window.
async fn age(reg: &AttachmentRegistry, hash: &Hash, hours: i64) {
    let mut meta = reg.read_meta(hash).await.unwrap();
    let past = chrono::Utc::now() - chrono::Duration::hours(hours);
    meta.created = past;
    meta.updated = past;
    let key = crate::paths::DataPath::new([hash.to_hex()]).unwrap();
    reg.meta_store().write_value(&key, &meta).await.unwrap();
}

#[tokio::test]
async fn test_write_registers_meta_and_holds() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let hold = reg.write_bytes(b"png-bytes", "image/png", [rec("r1")]).await.unwrap();
    let h = hold.hash();
    assert_eq!(h, Hash::digest(b"png-bytes"));
    assert!(reg.holds().is_held(&h));
    let (meta, bytes) = reg.read(&h).await.unwrap();
    assert_eq!(bytes, b"png-bytes");
    assert_eq!(meta.mime_type, "image/png");
    assert!(meta.linkers.contains(&rec("r1")));
    assert!(tmp.path().join("attachments").join("meta").join(format!("{}.json", h)).exists());
    assert!(tmp.path().join("attachments").join("blobs").join(format!("{}.blob", h)).exists());
    hold.release();
    assert!(!reg.holds().is_held(&h));
}

#[tokio::test]
async fn test_second_write_merges_linkers() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let h = reg.write_bytes(b"same", "text/plain", [rec("a")]).await.unwrap().hash();
    reg.write_bytes(b"same", "text/plain", [rec("b")]).await.unwrap();
    let meta = reg.read_meta(&h).await.unwrap();
    assert_eq!(meta.linkers.len(), 2);
    let all: Vec<Hash> = reg.iterate().try_collect().await.unwrap();
    assert_eq!(all, vec![h]);
}

#[tokio::test]
async fn test_link_requires_existing_attachment() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let err = reg.link(&Hash::digest(b"ghost"), [rec("x")]).await.unwrap_err();
    assert!(err.is_not_found());
    let h = reg.write_bytes(b"real", "text/plain", Vec::<ResourcePath>::new()).await.unwrap().hash();
    reg.link(&h, [rec("x"), rec("y")]).await.unwrap();
    assert_eq!(reg.read_meta(&h).await.unwrap().linkers.len(), 2);
}

#[tokio::test]
async fn test_validate_drops_stale_linkers_and_deletes_orphans() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let resolver = MapResolver::default();
    let h = reg.write_bytes(b"doc", "text/plain", [rec("keep"), rec("gone")]).await.unwrap().hash();
    resolver.set(&rec("keep"), &[h]);

    assert!(reg.validate(&h, &resolver).await.unwrap());
    let meta = reg.read_meta(&h).await.unwrap();
    assert_eq!(meta.linkers.iter().cloned().collect::<Vec<_>>(), vec![rec("keep")]);

    resolver.set(&rec("keep"), &[]);
    assert!(!reg.validate(&h, &resolver).await.unwrap());
    assert!(!reg.exists(&h).await.unwrap());
    assert!(!reg.blobs().exists(&h).await.unwrap());
}

#[tokio::test]
async fn test_unknown_source_linkers_are_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let lens = ResourcePath::dataset(Source::Lenses, "u", "l").record("r");
    let h = reg.write_bytes(b"lens-data", "text/plain", [lens.clone()]).await.unwrap().hash();
    assert!(reg.validate(&h, &MapResolver::default()).await.unwrap());
    assert!(reg.read_meta(&h).await.unwrap().linkers.contains(&lens));
}

#[tokio::test]
async fn test_hold_blocks_deletion() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let resolver = MapResolver::default();
    let hold = reg.write_bytes(b"pending", "text/plain", [rec("r")]).await.unwrap();
    let h = hold.hash();
    assert!(reg.validate(&h, &resolver).await.unwrap());
    assert!(reg.exists(&h).await.unwrap());
    drop(hold);
    assert!(!reg.validate(&h, &resolver).await.unwrap());
    assert!(!reg.exists(&h).await.unwrap());
}

#[tokio::test]
async fn test_prune_respects_grace_window() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let resolver = MapResolver::default();
    let h = reg.write_bytes(b"fresh", "text/plain", [rec("r")]).await.unwrap().hash();
    // unreferenced but inside the window
    assert!(reg.prune(&h, &resolver).await.unwrap());
    assert!(reg.exists(&h).await.unwrap());
    age(&reg, &h, 2).await;
    assert!(!reg.prune(&h, &resolver).await.unwrap());
    assert!(!reg.exists(&h).await.unwrap());
}

#[tokio::test]
async fn test_prune_keeps_old_but_referenced() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let resolver = MapResolver::default();
    let h = reg.write_bytes(b"old", "text/plain", [rec("r")]).await.unwrap().hash();
    resolver.set(&rec("r"), &[h]);
    age(&reg, &h, 48).await;
    assert!(reg.prune(&h, &resolver).await.unwrap());
}

#[tokio::test]
async fn test_prune_random_outcomes() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = Arc::new(registry(tmp.path()));
    let resolver = MapResolver::default();
    assert_eq!(reg.prune_random(&resolver).await.unwrap(), PruneOutcome::Empty);

    let h = reg.write_bytes(b"only", "text/plain", [rec("r")]).await.unwrap().hash();
    age(&reg, &h, 2).await;
    {
        let _busy = reg.blobs().files().locks().lock(&format!("attachment:{}", h)).await;
        assert_eq!(reg.prune_random(&resolver).await.unwrap(), PruneOutcome::Busy(h));
    }
    assert_eq!(reg.prune_random(&resolver).await.unwrap(), PruneOutcome::Deleted(h));
    assert_eq!(reg.prune_random(&resolver).await.unwrap(), PruneOutcome::Empty);
}

#[tokio::test]
async fn test_validate_removes_unregistered_blob() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let h = reg.blobs().write(b"stray").await.unwrap();
    assert!(!reg.validate(&h, &MapResolver::default()).await.unwrap());
    assert!(!reg.blobs().exists(&h).await.unwrap());
}

#[tokio::test]
async fn test_chain_uses_first_serving_resolver() {
    let datasets = Arc::new(MapResolver::default());
    let h = Hash::digest(b"c");
    datasets.set(&rec("r"), &[h]);
    let chain = ResolverChain::new(vec![datasets.clone() as Arc<dyn LinkResolver>]);
    assert!(chain.references(&rec("r")).await.unwrap().unwrap().contains(&h));
    let viewport = ResourcePath::dataset(Source::Viewports, "u", "v");
    assert!(chain.references(&viewport).await.unwrap().is_none());
}

#[tokio::test]
async fn test_validate_leaves_linkers_of_held_attachment() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let resolver = MapResolver::default();
    let h = reg.write_bytes(b"relinking", "text/plain", [rec("r1")]).await.unwrap().hash();
    age(&reg, &h, 2).await;

    // r1 is being rewritten to reference h again but has not committed yet
    let hold = reg.hold(h);
    reg.link(&h, [rec("r1")]).await.unwrap();
    assert!(reg.validate(&h, &resolver).await.unwrap());
    assert!(reg.read_meta(&h).await.unwrap().linkers.contains(&rec("r1")));

    resolver.set(&rec("r1"), &[h]);
    hold.release();
    age(&reg, &h, 2).await;
    assert!(reg.prune(&h, &resolver).await.unwrap());
    assert!(reg.exists(&h).await.unwrap());
}

#[tokio::test]
async fn test_link_restamps_known_linker() {
    let tmp = tempfile::tempdir().unwrap();
    let reg = registry(tmp.path());
    let h = reg.write_bytes(b"stamp", "text/plain", [rec("a")]).await.unwrap().hash();
    age(&reg, &h, 2).await;
    let before = reg.read_meta(&h).await.unwrap();
    reg.link(&h, [rec("a")]).await.unwrap();
    let after = reg.read_meta(&h).await.unwrap();
    assert_eq!(after.linkers, before.linkers);
    assert!(after.updated > before.updated);
    assert_eq!(after.created, before.created);
    // back inside the grace window
    assert!(reg.prune(&h, &MapResolver::default()).await.unwrap());
    assert!(reg.exists(&h).await.unwrap());
}
