//! Change notifications emitted after a dataset version is committed.

use tokio::sync::broadcast;
use tracing::trace;

use crate::paths::ResourcePath;

pub trait ChangeSink: Send + Sync {
    fn notify(&self, path: &ResourcePath, version: u64);
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ChangeSink for NullSink {
    fn notify(&self, _path: &ResourcePath, _version: u64) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: ResourcePath,
    pub version: u64,
}

/// Fan-out to any number of in-process subscribers. Slow subscribers lag and
/// lose the oldest events rather than blocking writers.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> { self.tx.subscribe() }
}

impl ChangeSink for BroadcastSink {
    fn notify(&self, path: &ResourcePath, version: u64) {
        // no subscribers is not an error
        let delivered = self.tx.send(ChangeEvent { path: path.clone(), version }).unwrap_or(0);
        trace!(target: "shelfdb::dataset", "change {}@{} delivered to {}", path, version, delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Source;

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let p = ResourcePath::dataset(Source::Datasets, "u", "d");
        sink.notify(&p, 4);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, ChangeEvent { path: p, version: 4 });
    }

    #[test]
    fn send_without_subscribers_is_fine() {
        BroadcastSink::new(1).notify(&ResourcePath::dataset(Source::Meta, "a", "b"), 1);
        NullSink.notify(&ResourcePath::dataset(Source::Meta, "a", "b"), 1);
    }
}
