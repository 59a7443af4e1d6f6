//! Attachments: content-addressed blobs with a declared MIME type, referenced
//! from record content by hash-URL and garbage collected once unreferenced.

pub mod hash_url;
pub mod holds;
pub mod meta;
pub mod registry;

pub use hash_url::HashUrl;
pub use holds::{AttachmentHold, HoldRegistry};
pub use meta::AttachmentMeta;
pub use registry::{AttachmentRegistry, LinkResolver, PruneOutcome, ResolverChain};

#[cfg(test)]
#[path = "attachments_tests.rs"]
mod attachments_tests;
