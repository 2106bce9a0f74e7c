//! Persistence layer: which messages were processed, and past digests.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{DigestStamp, StoredDigest, TrackingStats, TrackingStore};
