//! Embedded read replica: SQLite-backed storage plus the pipeline that
//! keeps it in sync with the primary via an initial snapshot pull and a
//! subscription to the event bus for incremental updates.

pub mod pipeline;
pub mod store;

pub use pipeline::ReplicationPipeline;
pub use store::{ReplicaConfig, ReplicaStore, ReplicaVariant};
