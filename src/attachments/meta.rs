use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::ResourcePath;
use crate::storage::Hash;

use super::hash_url::HashUrl;

/// Persisted per attachment next to its blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub hash: Hash,
    pub mime_type: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Resources whose content is believed to reference this attachment.
    #[serde(default)]
    pub linkers: BTreeSet<ResourcePath>,
}

impl AttachmentMeta {
    pub fn new<M: Into<String>>(hash: Hash, mime_type: M, now: DateTime<Utc>) -> Self {
        Self { hash, mime_type: mime_type.into(), created: now, updated: now, linkers: BTreeSet::new() }
    }

    /// Union `linkers` in and stamp `updated`.
    pub fn merge_linkers<I: IntoIterator<Item = ResourcePath>>(&mut self, linkers: I, now: DateTime<Utc>) {
        self.linkers.extend(linkers);
        self.updated = now;
    }

    /// True while either timestamp is inside the grace window.
    pub fn within_grace(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now - self.created < grace || now - self.updated < grace
    }

    pub fn url(&self) -> HashUrl { HashUrl::new(self.hash, self.mime_type.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Source;

    #[test]
    fn grace_uses_newest_stamp() {
        let now = Utc::now();
        let mut m = AttachmentMeta::new(Hash::digest(b"m"), "text/plain", now - chrono::Duration::hours(2));
        let grace = chrono::Duration::minutes(30);
        assert!(!m.within_grace(now, grace));
        m.merge_linkers([ResourcePath::dataset(Source::Datasets, "u", "d").record("r")], now - chrono::Duration::minutes(5));
        assert!(m.within_grace(now, grace));
        assert_eq!(m.linkers.len(), 1);
    }
}
