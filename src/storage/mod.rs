//!
//! shelfdb storage layer
//! ---------------------
//! The bottom of the stack. `FileStore` gives crash-safe named values under a
//! jail root (temp file, fsync, swap, retained backup), `BlobStore` layers
//! immutable content-addressed blobs on top, and `LockRegistry` serializes
//! read-modify-write cycles per key across every layer that shares it.
//!
//! Layout on disk is plain folders of escaped names, so a store can be inspected
//! (and repaired) with ordinary tools.

pub mod blob;
pub mod codec;
pub mod file;
pub mod hash;
pub mod locks;

pub use blob::BlobStore;
pub use codec::Codec;
pub use file::{FileStore, Staged};
pub use hash::{Hash, StreamHasher};
pub use locks::{KeyGuard, LockRegistry};
