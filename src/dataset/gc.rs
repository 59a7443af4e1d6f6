//! Dataset garbage collection.
//! Two independent passes per dataset:
//! - object GC drops payload blobs the current snapshot no longer references;
//! - version retention drops non-current snapshots older than the retention window.
//!
//! Both log and skip a candidate that fails instead of aborting the pass.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::storage::Hash;

use super::store::DatasetStore;
use super::types::{GcReport, VersionSnapshot};

/// Temp files younger than this belong to writes that may still be running.
pub const TEMP_FILE_MIN_AGE: Duration = Duration::from_secs(3600);

/// Object GC for one dataset, taking the dataset lock.
pub async fn collect_objects(store: &DatasetStore, owner: &str, name: &str) -> StoreResult<GcReport> {
    let _guard = store.lock_dataset(owner, name).await;
    let snapshot = store.read_version(owner, name, None).await?;
    Ok(collect_objects_locked(store, owner, name, &snapshot).await)
}

/// Object GC against `current`. Caller holds the dataset lock.
pub(crate) async fn collect_objects_locked(
    store: &DatasetStore,
    owner: &str,
    name: &str,
    current: &VersionSnapshot,
) -> GcReport {
    let mut report = GcReport { datasets: 1, ..Default::default() };
    let objects = match store.objects(owner, name) {
        Ok(o) => o,
        Err(e) => {
            warn!(target: "shelfdb::gc", "object gc skipped for {}: {}", store.resource(owner, name), e);
            report.failures += 1;
            return report;
        }
    };
    let live: HashSet<Hash> = current.records.values().map(|m| m.hash).collect();
    let mut present = objects.iterate();
    while let Some(item) = present.next().await {
        let hash = match item {
            Ok(h) => h,
            Err(e) => {
                warn!(target: "shelfdb::gc", "object listing failed for {}: {}", store.resource(owner, name), e);
                report.failures += 1;
                continue;
            }
        };
        report.objects_scanned += 1;
        if live.contains(&hash) {
            continue;
        }
        match objects.delete(&hash).await {
            Ok(()) => report.objects_deleted += 1,
            Err(e) => {
                warn!(target: "shelfdb::gc", "could not delete object {}: {}", hash, e);
                report.failures += 1;
            }
        }
    }
    if report.objects_deleted > 0 {
        debug!(target: "shelfdb::gc", "object gc {} deleted={}", store.resource(owner, name), report.objects_deleted);
    }
    report
}

/// Delete snapshots older than the retention window, never the current one.
/// Every snapshot file on disk is considered, so gaps left by earlier sweeps do
/// not hide older files.
pub async fn sweep_versions(store: &DatasetStore, owner: &str, name: &str, now: DateTime<Utc>) -> StoreResult<GcReport> {
    let _guard = store.lock_dataset(owner, name).await;
    let current = store.read_config(owner, name).await?.version;
    let cutoff = now - store.retention();
    let mut report = GcReport { datasets: 1, ..Default::default() };
    for version in store.versions(owner, name).await? {
        if version >= current {
            continue;
        }
        let path = store.version_path(owner, name, version)?;
        let created = match store.files().read_value::<VersionSnapshot>(&path).await {
            Ok(s) => s.created,
            Err(e) => {
                warn!(target: "shelfdb::gc", "snapshot {} of {} unreadable: {}", version, store.resource(owner, name), e);
                report.failures += 1;
                continue;
            }
        };
        if created >= cutoff {
            continue;
        }
        match store.files().delete(&path).await {
            Ok(()) => report.snapshots_deleted += 1,
            Err(e) => {
                warn!(target: "shelfdb::gc", "could not delete snapshot {} of {}: {}", version, store.resource(owner, name), e);
                report.failures += 1;
            }
        }
    }
    Ok(report)
}

/// Full maintenance pass over every dataset of `store`: version retention,
/// object GC and stale temp file removal.
pub async fn sweep_all(store: &DatasetStore, now: DateTime<Utc>) -> GcReport {
    let mut total = GcReport::default();
    let mut owners = store.list_owners();
    while let Some(owner) = owners.next().await {
        let owner = match owner {
            Ok(o) => o,
            Err(e) => {
                warn!(target: "shelfdb::gc", "owner listing failed: {}", e);
                total.failures += 1;
                continue;
            }
        };
        let mut names = store.list(&owner);
        while let Some(name) = names.next().await {
            let name = match name {
                Ok(n) => n,
                Err(e) => {
                    warn!(target: "shelfdb::gc", "dataset listing failed for {}: {}", owner, e);
                    total.failures += 1;
                    continue;
                }
            };
            total.absorb(&sweep_dataset(store, &owner, &name, now).await);
        }
    }
    info!(
        target: "shelfdb::gc",
        "sweep {} datasets={} snapshots_deleted={} objects_deleted={} temp_files={} failures={}",
        store.source().as_str(), total.datasets, total.snapshots_deleted, total.objects_deleted,
        total.temp_files_deleted, total.failures
    );
    total
}

async fn sweep_dataset(store: &DatasetStore, owner: &str, name: &str, now: DateTime<Utc>) -> GcReport {
    let mut report = match sweep_versions(store, owner, name, now).await {
        Ok(r) => r,
        Err(e) => {
            warn!(target: "shelfdb::gc", "retention failed for {}: {}", store.resource(owner, name), e);
            return GcReport { datasets: 1, failures: 1, ..Default::default() };
        }
    };
    match collect_objects(store, owner, name).await {
        Ok(r) => {
            report.objects_scanned += r.objects_scanned;
            report.objects_deleted += r.objects_deleted;
            report.failures += r.failures;
        }
        Err(e) => {
            warn!(target: "shelfdb::gc", "object gc failed for {}: {}", store.resource(owner, name), e);
            report.failures += 1;
        }
    }
    report.temp_files_deleted += sweep_dataset_temp(store, owner, name).await;
    report
}

async fn sweep_dataset_temp(store: &DatasetStore, owner: &str, name: &str) -> usize {
    let Ok(dir) = store.dataset_dir(owner, name) else {
        return 0;
    };
    let mut removed = 0;
    for sub in [None, Some("versions"), Some("objects")] {
        let path = match sub {
            Some(s) => match dir.child(s) {
                Ok(p) => p,
                Err(_) => continue,
            },
            None => dir.clone(),
        };
        match store.files().sweep_temp(&path, TEMP_FILE_MIN_AGE).await {
            Ok(n) => removed += n,
            Err(e) => debug!(target: "shelfdb::gc", "temp sweep skipped {}: {}", path, e),
        }
    }
    removed
}
