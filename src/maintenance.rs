//! Background upkeep for one store root.
//! Attachment GC runs one random `prune` per tick so no pass ever blocks on a
//! full scan; the retention pass walks every dataset of every source.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentRegistry, LinkResolver, PruneOutcome, ResolverChain};
use crate::dataset::{gc, ChangeSink, DatasetStore, GcReport};
use crate::error::StoreResult;
use crate::paths::Source;
use crate::StoreContext;

pub struct Maintenance {
    registry: Arc<AttachmentRegistry>,
    stores: Vec<Arc<DatasetStore>>,
    resolver: ResolverChain,
    prune_every: Duration,
    retention_every: Duration,
}

impl Maintenance {
    /// Open the registry and one dataset store per source.
    pub fn open(ctx: &StoreContext, sink: Arc<dyn ChangeSink>) -> StoreResult<Self> {
        let registry = ctx.attachments()?;
        let mut stores = Vec::with_capacity(Source::ALL.len());
        for source in Source::ALL {
            stores.push(ctx.datasets(source, registry.clone(), sink.clone())?);
        }
        Ok(Self::new(registry, stores, ctx.config().prune_interval(), ctx.config().retention_interval()))
    }

    pub fn new(
        registry: Arc<AttachmentRegistry>,
        stores: Vec<Arc<DatasetStore>>,
        prune_every: Duration,
        retention_every: Duration,
    ) -> Self {
        let resolver = ResolverChain::new(stores.iter().map(|s| s.clone() as Arc<dyn LinkResolver>).collect());
        Self { registry, stores, resolver, prune_every, retention_every }
    }

    pub fn registry(&self) -> &Arc<AttachmentRegistry> { &self.registry }

    pub fn store(&self, source: Source) -> Option<&Arc<DatasetStore>> {
        self.stores.iter().find(|s| s.source() == source)
    }

    /// One incremental attachment GC step.
    pub async fn prune_tick(&self) -> StoreResult<PruneOutcome> {
        let outcome = self.registry.prune_random(&self.resolver).await?;
        debug!(target: "shelfdb::maintenance", "prune tick {:?}", outcome);
        Ok(outcome)
    }

    /// Version retention, object GC and temp cleanup over every dataset.
    pub async fn retention_pass(&self, now: DateTime<Utc>) -> GcReport {
        let mut total = GcReport::default();
        for store in &self.stores {
            total.absorb(&gc::sweep_all(store, now).await);
        }
        match self.registry.sweep_temp(gc::TEMP_FILE_MIN_AGE).await {
            Ok(n) => total.temp_files_deleted += n,
            Err(e) => {
                warn!(target: "shelfdb::maintenance", "attachment temp sweep failed: {}", e);
                total.failures += 1;
            }
        }
        info!(
            target: "shelfdb::maintenance",
            "retention pass datasets={} snapshots_deleted={} objects_deleted={} failures={}",
            total.datasets, total.snapshots_deleted, total.objects_deleted, total.failures
        );
        total
    }

    /// Run both timers until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut prune = tokio::time::interval(self.prune_every);
        let mut retention = tokio::time::interval(self.retention_every);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(
            target: "shelfdb::maintenance",
            "maintenance running prune_every={:?} retention_every={:?}",
            self.prune_every, self.retention_every
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(target: "shelfdb::maintenance", "maintenance stopping");
                    break;
                }
                _ = prune.tick() => {
                    if let Err(e) = self.prune_tick().await {
                        warn!(target: "shelfdb::maintenance", "prune tick failed: {}", e);
                    }
                }
                _ = retention.tick() => {
                    self.retention_pass(Utc::now()).await;
                }
            }
        }
    }
}
