//! Storage and transport port traits — implemented by `config-postgres`
//! (primary store, event bus) and `config-replica` (replica reads).
//! Core logic depends only on these traits, never on sqlx/rusqlite
//! directly, mirroring `sem_os_core::ports`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{AuditEntry, Config, ConfigMember, Project, Proposal, VariantBody};

/// Full desired state for a config write: base + environment variants +
/// members. The caller always supplies the complete desired state, never a
/// partial patch — diffing against the stored state happens in
/// `config-core::service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentVariantInput {
    pub environment_id: String,
    pub body: VariantBody,
    pub use_base_schema: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigWriteInput {
    pub name: String,
    pub description: String,
    pub base: VariantBody,
    pub environments: Vec<EnvironmentVariantInput>,
    pub members: Vec<ConfigMember>,
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn get_config_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<Config>>;
    async fn get_config(&self, config_id: Uuid) -> Result<Config>;
    async fn get_project(&self, project_id: Uuid) -> Result<Project>;

    /// Create a new config at version 1. Fails with `BadRequest` if the
    /// name already exists in the project.
    async fn create_config(
        &self,
        project_id: Uuid,
        input: ConfigWriteInput,
        author: Option<&str>,
    ) -> Result<Config>;

    /// Replace base + variants + members in a single transaction, append a
    /// `ConfigVersion` snapshot and a `config_updated` audit entry. Fails
    /// with `StaleVersion` if `expected_version` doesn't match the stored
    /// version.
    async fn update_config(
        &self,
        config_id: Uuid,
        expected_version: i64,
        input: ConfigWriteInput,
        author: Option<&str>,
        originating_proposal_id: Option<Uuid>,
    ) -> Result<Config>;

    /// Delete a config and cascade to its variants and version history.
    async fn delete_config(&self, config_id: Uuid, expected_version: i64, author: Option<&str>) -> Result<()>;

    async fn append_audit_entry(&self, entry: AuditEntry) -> Result<()>;

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal>;
    async fn get_proposal(&self, proposal_id: Uuid) -> Result<Proposal>;
    async fn save_proposal(&self, proposal: Proposal) -> Result<Proposal>;
    async fn list_pending_proposals(&self, config_id: Uuid) -> Result<Vec<Proposal>>;
}

/// Wire payload published on the event bus channel on every successful
/// mutation (§6: `{"configId", "version", "kind"}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigChangeEvent {
    pub config_id: Uuid,
    pub version: i64,
    pub kind: ConfigChangeKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeKind {
    Upsert,
    Delete,
}

/// A long-lived pub/sub client. `start`/`stop` are idempotent; message
/// delivery to subscribers happens out-of-band via whatever channel the
/// adapter hands back from `subscribe()`.
#[async_trait]
pub trait EventBusClient: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn notify(&self, event: &ConfigChangeEvent) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// A fresh receiver over every event published after this call. Used
    /// by the replication pipeline; late subscribers miss anything sent
    /// before they subscribed, which is fine since the pipeline always
    /// follows a subscribe with a snapshot pull.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConfigChangeEvent>;
}

/// A snapshot source for the replication pipeline's periodic full pull.
/// Implemented by the primary-store adapter; the replica never talks to
/// Postgres directly outside of this and the event bus.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Pull up to `batch_size` config rows starting after `after_id`
    /// (`None` for the first page), ordered by id for stable pagination.
    async fn pull_snapshot_batch(
        &self,
        after_id: Option<Uuid>,
        batch_size: i64,
    ) -> Result<Vec<ConfigSnapshotRow>>;

    /// Fetch a single config by id for the incremental path — applying one
    /// `upsert` event shouldn't require a full batch pull.
    async fn pull_one(&self, config_id: Uuid) -> Result<Option<ConfigSnapshotRow>>;

    /// All config ids currently live on the primary, for tombstone
    /// detection during a full snapshot pull.
    async fn all_config_ids(&self) -> Result<Vec<Uuid>>;

    async fn acquire_consumer_id(&self, restored: Option<String>) -> Result<String>;
    async fn report_last_used_at(&self, consumer_id: &str) -> Result<()>;
    async fn cleanup_idle_consumers(&self, idle_cutoff_seconds: i64) -> Result<u64>;
}

/// A single config row as seen by the replication pipeline — the base
/// variant plus every environment variant, flattened for replica storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshotRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub version: i64,
    pub variants: Vec<ConfigVariantRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVariantRow {
    pub environment_id: Option<String>, // None = base variant
    pub value: serde_json::Value,
    pub overrides: serde_json::Value,
}
