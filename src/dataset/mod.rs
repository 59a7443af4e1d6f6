//! Versioned datasets of records.

pub mod gc;
pub mod notify;
pub mod store;
pub mod types;
pub mod value;

pub use notify::{BroadcastSink, ChangeEvent, ChangeSink, NullSink};
pub use store::DatasetStore;
pub use types::{DatasetConfig, GcReport, RecordMeta, VersionSnapshot};
pub use value::{RecordValue, Scalar};
