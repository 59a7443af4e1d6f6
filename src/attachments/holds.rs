//! In-process holds on attachment hashes.
//! A hold keeps an attachment alive between the blob write and the commit of
//! the record that references it. Holds are never persisted and never expire;
//! one left open past the warning window is only reported.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::storage::Hash;

#[derive(Clone, Default)]
pub struct HoldRegistry {
    counts: Arc<Mutex<HashMap<Hash, usize>>>,
}

impl HoldRegistry {
    pub fn new() -> Self { Self::default() }

    /// Place a hold on `hash`. A warning is logged if it is still held after `warn_after`.
    pub fn hold(&self, hash: Hash, warn_after: Duration) -> AttachmentHold {
        *self.counts.lock().entry(hash).or_insert(0) += 1;
        let timer = tokio::runtime::Handle::try_current().ok().map(|rt| {
            rt.spawn(async move {
                tokio::time::sleep(warn_after).await;
                warn!(
                    target: "shelfdb::attachments",
                    "hold on {} not released after {:?}; was the owning record committed?",
                    hash, warn_after
                );
            })
        });
        AttachmentHold { hash, registry: self.clone(), timer, released: false }
    }

    pub fn is_held(&self, hash: &Hash) -> bool { self.count(hash) > 0 }

    pub fn count(&self, hash: &Hash) -> usize { self.counts.lock().get(hash).copied().unwrap_or(0) }

    fn release_one(&self, hash: &Hash) {
        let mut map = self.counts.lock();
        if let Some(n) = map.get_mut(hash) {
            *n -= 1;
            if *n == 0 {
                map.remove(hash);
            }
        }
    }
}

/// A live hold. Call [`release`](Self::release) after the referencing record is
/// durably committed; dropping the hold releases it too.
pub struct AttachmentHold {
    hash: Hash,
    registry: HoldRegistry,
    timer: Option<JoinHandle<()>>,
    released: bool,
}

impl AttachmentHold {
    pub fn hash(&self) -> Hash { self.hash }

    pub fn release(mut self) { self.release_inner(); }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(t) = self.timer.take() {
            t.abort();
        }
        self.registry.release_one(&self.hash);
        debug!(target: "shelfdb::attachments", "hold released hash={}", self.hash);
    }
}

impl Drop for AttachmentHold {
    fn drop(&mut self) { self.release_inner(); }
}

impl std::fmt::Debug for AttachmentHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentHold").field("hash", &self.hash).field("released", &self.released).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Collects warning messages emitted while installed.
    #[derive(Clone, Default)]
    struct Warnings(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> Layer<S> for Warnings {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() != tracing::Level::WARN {
                return;
            }
            struct Message<'a>(&'a mut String);
            impl tracing::field::Visit for Message<'_> {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                    if field.name() == "message" {
                        self.0.push_str(&format!("{:?}", value));
                    }
                }
            }
            let mut msg = String::new();
            event.record(&mut Message(&mut msg));
            self.0.lock().push(msg);
        }
    }

    #[tokio::test]
    async fn overdue_hold_warns_but_stays_held() {
        let warnings = Warnings::default();
        let _default = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));
        let holds = HoldRegistry::new();
        let h = Hash::digest(b"leaky");
        let g = holds.hold(h, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let seen = warnings.0.lock().clone();
        assert_eq!(seen.len(), 1, "{:?}", seen);
        assert!(seen[0].contains("not released"));
        assert!(holds.is_held(&h));
        g.release();
        assert!(!holds.is_held(&h));
    }

    #[tokio::test]
    async fn released_hold_never_warns() {
        let warnings = Warnings::default();
        let _default = tracing::subscriber::set_default(tracing_subscriber::registry().with(warnings.clone()));
        let holds = HoldRegistry::new();
        holds.hold(Hash::digest(b"prompt"), Duration::from_millis(5)).release();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(warnings.0.lock().is_empty());
    }

    #[tokio::test]
    async fn counts_nest_and_release() {
        let holds = HoldRegistry::new();
        let h = Hash::digest(b"held");
        let a = holds.hold(h, Duration::from_secs(10));
        let b = holds.hold(h, Duration::from_secs(10));
        assert_eq!(holds.count(&h), 2);
        a.release();
        assert!(holds.is_held(&h));
        drop(b);
        assert!(!holds.is_held(&h));
    }

    #[test]
    fn works_outside_a_runtime() {
        let holds = HoldRegistry::new();
        let h = Hash::digest(b"sync");
        let g = holds.hold(h, Duration::from_millis(1));
        assert_eq!(g.hash(), h);
        g.release();
        assert_eq!(holds.count(&h), 0);
    }
}
