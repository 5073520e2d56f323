//! Postgres-backed [`PrimaryStore`] and [`SnapshotSource`]. All SQL is
//! runtime-checked (`sqlx::query`/`query_as`, not the `query!` macros) so
//! the crate builds without a live database, matching the teacher's
//! `PgSnapshotStore`.

use anyhow::anyhow;
use async_trait::async_trait;
use config_core::error::{ConfigError, Result};
use config_core::ports::{
    ConfigSnapshotRow, ConfigVariantRow, ConfigWriteInput, PrimaryStore, SnapshotSource,
};
use config_core::types::{AuditEntry, Config, Project, Proposal};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::rows::{
    config_from_rows, member_role_to_str, project_from_rows, proposal_status_to_str,
    rejection_reason_to_str, ConfigRow, EnvironmentRow, MemberRow, ProjectRow, ProposalRow,
    VariantRow,
};

pub struct PgPrimaryStore {
    pool: PgPool,
}

impl PgPrimaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_config(pool: impl sqlx::PgExecutor<'_> + Copy, config_id: Uuid) -> Result<Config> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"SELECT id, project_id, name, description, version, base_value, base_schema, base_overrides
               FROM configs WHERE id = $1"#,
        )
        .bind(config_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?
        .ok_or_else(|| ConfigError::not_found(format!("config {config_id}")))?;

        let variants = sqlx::query_as::<_, VariantRow>(
            r#"SELECT id, config_id, environment_id, value, schema, overrides, use_base_schema
               FROM config_variants WHERE config_id = $1 ORDER BY environment_id"#,
        )
        .bind(config_id)
        .fetch_all(pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        let members = sqlx::query_as::<_, MemberRow>(
            r#"SELECT user_email, role FROM config_members WHERE config_id = $1 ORDER BY user_email"#,
        )
        .bind(config_id)
        .fetch_all(pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        config_from_rows(row, variants, members).map_err(ConfigError::Internal)
    }
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn get_config_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<Config>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM configs WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        match id {
            Some(id) => Ok(Some(Self::load_config(&self.pool, id).await?)),
            None => Ok(None),
        }
    }

    async fn get_config(&self, config_id: Uuid) -> Result<Config> {
        Self::load_config(&self.pool, config_id).await
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, require_proposals, allow_self_approvals FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?
        .ok_or_else(|| ConfigError::not_found(format!("project {project_id}")))?;

        let environments = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, name, require_proposals FROM environments WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        Ok(project_from_rows(row, environments))
    }

    async fn create_config(
        &self,
        project_id: Uuid,
        input: ConfigWriteInput,
        author: Option<&str>,
    ) -> Result<Config> {
        let mut tx = self.pool.begin().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM configs WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id)
        .bind(&input.name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        if existing.is_some() {
            return Err(ConfigError::bad_request(format!(
                "config named {} already exists in this project",
                input.name
            )));
        }

        let config_id = Uuid::new_v4();
        let overrides_json = serde_json::to_value(&input.base.overrides).map_err(|e| ConfigError::Internal(e.into()))?;
        sqlx::query(
            r#"INSERT INTO configs (id, project_id, name, description, version, base_value, base_schema, base_overrides)
               VALUES ($1, $2, $3, $4, 1, $5, $6, $7)"#,
        )
        .bind(config_id)
        .bind(project_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.base.value)
        .bind(&input.base.schema)
        .bind(&overrides_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        insert_variants(&mut tx, config_id, &input).await?;
        insert_members(&mut tx, config_id, &input).await?;
        insert_version(&mut tx, config_id, 1, &input, author, None).await?;

        tx.commit().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Self::load_config(&self.pool, config_id).await
    }

    async fn update_config(
        &self,
        config_id: Uuid,
        expected_version: i64,
        input: ConfigWriteInput,
        author: Option<&str>,
        originating_proposal_id: Option<Uuid>,
    ) -> Result<Config> {
        let mut tx = self.pool.begin().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM configs WHERE id = $1 FOR UPDATE")
                .bind(config_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        let current_version =
            current_version.ok_or_else(|| ConfigError::not_found(format!("config {config_id}")))?;
        if current_version != expected_version {
            return Err(ConfigError::StaleVersion {
                expected: expected_version,
                current: current_version,
            });
        }
        let new_version = current_version + 1;

        let overrides_json = serde_json::to_value(&input.base.overrides).map_err(|e| ConfigError::Internal(e.into()))?;
        sqlx::query(
            r#"UPDATE configs SET description = $2, version = $3, base_value = $4, base_schema = $5, base_overrides = $6
               WHERE id = $1"#,
        )
        .bind(config_id)
        .bind(&input.description)
        .bind(new_version)
        .bind(&input.base.value)
        .bind(&input.base.schema)
        .bind(&overrides_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        sqlx::query("DELETE FROM config_variants WHERE config_id = $1")
            .bind(config_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        sqlx::query("DELETE FROM config_members WHERE config_id = $1")
            .bind(config_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;

        insert_variants(&mut tx, config_id, &input).await?;
        insert_members(&mut tx, config_id, &input).await?;
        insert_version(&mut tx, config_id, new_version, &input, author, originating_proposal_id).await?;

        tx.commit().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Self::load_config(&self.pool, config_id).await
    }

    async fn delete_config(&self, config_id: Uuid, expected_version: i64, _author: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM configs WHERE id = $1 FOR UPDATE")
                .bind(config_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        let current_version =
            current_version.ok_or_else(|| ConfigError::not_found(format!("config {config_id}")))?;
        if current_version != expected_version {
            return Err(ConfigError::StaleVersion {
                expected: expected_version,
                current: current_version,
            });
        }
        sqlx::query("DELETE FROM configs WHERE id = $1")
            .bind(config_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        tx.commit().await.map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Ok(())
    }

    async fn append_audit_entry(&self, entry: AuditEntry) -> Result<()> {
        let payload = serde_json::to_value(&entry.payload).map_err(|e| ConfigError::Internal(e.into()))?;
        sqlx::query("INSERT INTO audit_log (id, actor_id, payload, created_at) VALUES ($1, $2, $3, $4)")
            .bind(entry.id)
            .bind(&entry.actor_id)
            .bind(&payload)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Ok(())
    }

    async fn create_proposal(&self, proposal: Proposal) -> Result<Proposal> {
        save_proposal_row(&self.pool, &proposal, true).await?;
        Ok(proposal)
    }

    async fn get_proposal(&self, proposal_id: Uuid) -> Result<Proposal> {
        let row = sqlx::query_as::<_, ProposalRow>(
            r#"SELECT id, config_id, proposer_id, base_config_version, description, members, delete,
                      variants, status, reviewer_id, rejection_reason, rejected_in_favor_of_proposal_id,
                      created_at, approved_at, rejected_at
               FROM proposals WHERE id = $1"#,
        )
        .bind(proposal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?
        .ok_or_else(|| ConfigError::not_found(format!("proposal {proposal_id}")))?;
        Proposal::try_from(row).map_err(ConfigError::Internal)
    }

    async fn save_proposal(&self, proposal: Proposal) -> Result<Proposal> {
        save_proposal_row(&self.pool, &proposal, false).await?;
        Ok(proposal)
    }

    async fn list_pending_proposals(&self, config_id: Uuid) -> Result<Vec<Proposal>> {
        let rows = sqlx::query_as::<_, ProposalRow>(
            r#"SELECT id, config_id, proposer_id, base_config_version, description, members, delete,
                      variants, status, reviewer_id, rejection_reason, rejected_in_favor_of_proposal_id,
                      created_at, approved_at, rejected_at
               FROM proposals WHERE config_id = $1 AND status = 'pending'"#,
        )
        .bind(config_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        rows.into_iter()
            .map(|r| Proposal::try_from(r).map_err(ConfigError::Internal))
            .collect()
    }
}

async fn insert_variants(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config_id: Uuid,
    input: &ConfigWriteInput,
) -> Result<()> {
    for env in &input.environments {
        let overrides_json = serde_json::to_value(&env.body.overrides).map_err(|e| ConfigError::Internal(e.into()))?;
        sqlx::query(
            r#"INSERT INTO config_variants (id, config_id, environment_id, value, schema, overrides, use_base_schema)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(Uuid::new_v4())
        .bind(config_id)
        .bind(&env.environment_id)
        .bind(&env.body.value)
        .bind(&env.body.schema)
        .bind(&overrides_json)
        .bind(env.use_base_schema)
        .execute(&mut **tx)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
    }
    Ok(())
}

async fn insert_members(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config_id: Uuid,
    input: &ConfigWriteInput,
) -> Result<()> {
    for member in &input.members {
        sqlx::query("INSERT INTO config_members (config_id, user_email, role) VALUES ($1, $2, $3)")
            .bind(config_id)
            .bind(&member.user_email)
            .bind(member_role_to_str(member.role))
            .execute(&mut **tx)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
    }
    Ok(())
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config_id: Uuid,
    version: i64,
    input: &ConfigWriteInput,
    author: Option<&str>,
    originating_proposal_id: Option<Uuid>,
) -> Result<()> {
    let snapshot = serde_json::json!({
        "description": input.description,
        "base": { "value": input.base.value, "schema": input.base.schema, "overrides": input.base.overrides },
        "environments": input.environments,
        "members": input.members,
    });
    sqlx::query(
        r#"INSERT INTO config_versions (config_id, version, snapshot, author, originating_proposal_id, created_at)
           VALUES ($1, $2, $3, $4, $5, now())"#,
    )
    .bind(config_id)
    .bind(version)
    .bind(snapshot)
    .bind(author)
    .bind(originating_proposal_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
    Ok(())
}

async fn save_proposal_row(pool: &PgPool, proposal: &Proposal, insert: bool) -> Result<()> {
    let description = serde_json::to_value(&proposal.description).map_err(|e| ConfigError::Internal(e.into()))?;
    let members = serde_json::to_value(&proposal.members).map_err(|e| ConfigError::Internal(e.into()))?;
    let variants = serde_json::to_value(&proposal.variants).map_err(|e| ConfigError::Internal(e.into()))?;
    let status = proposal_status_to_str(proposal.status);
    let rejection_reason = proposal.rejection_reason.map(rejection_reason_to_str);

    let query = if insert {
        r#"INSERT INTO proposals
           (id, config_id, proposer_id, base_config_version, description, members, delete, variants,
            status, reviewer_id, rejection_reason, rejected_in_favor_of_proposal_id,
            created_at, approved_at, rejected_at)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)"#
    } else {
        r#"UPDATE proposals SET
           config_id=$2, proposer_id=$3, base_config_version=$4, description=$5, members=$6, delete=$7,
           variants=$8, status=$9, reviewer_id=$10, rejection_reason=$11, rejected_in_favor_of_proposal_id=$12,
           created_at=$13, approved_at=$14, rejected_at=$15
           WHERE id=$1"#
    };

    sqlx::query(query)
        .bind(proposal.id)
        .bind(proposal.config_id)
        .bind(&proposal.proposer_id)
        .bind(proposal.base_config_version)
        .bind(description)
        .bind(members)
        .bind(proposal.delete)
        .bind(variants)
        .bind(status)
        .bind(&proposal.reviewer_id)
        .bind(rejection_reason)
        .bind(proposal.rejected_in_favor_of_proposal_id)
        .bind(proposal.created_at)
        .bind(proposal.approved_at)
        .bind(proposal.rejected_at)
        .execute(pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
    Ok(())
}

async fn snapshot_row_for(pool: &PgPool, config: Config) -> Result<ConfigSnapshotRow> {
    let mut variants = vec![ConfigVariantRow {
        environment_id: None,
        value: config.base.value.clone(),
        overrides: serde_json::to_value(&config.base.overrides).map_err(|e| ConfigError::Internal(e.into()))?,
    }];
    for v in &config.variants {
        variants.push(ConfigVariantRow {
            environment_id: Some(v.environment_id.clone()),
            value: v.body.value.clone(),
            overrides: serde_json::to_value(&v.body.overrides).map_err(|e| ConfigError::Internal(e.into()))?,
        });
    }
    let _ = pool; // kept for symmetry with the batch path; no further queries needed here
    Ok(ConfigSnapshotRow {
        id: config.id,
        project_id: config.project_id,
        name: config.name.clone(),
        version: config.version,
        variants,
    })
}

#[async_trait]
impl SnapshotSource for PgPrimaryStore {
    async fn pull_one(&self, config_id: Uuid) -> Result<Option<ConfigSnapshotRow>> {
        match Self::load_config(&self.pool, config_id).await {
            Ok(config) => Ok(Some(snapshot_row_for(&self.pool, config).await?)),
            Err(ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pull_snapshot_batch(&self, after_id: Option<Uuid>, batch_size: i64) -> Result<Vec<ConfigSnapshotRow>> {
        let ids: Vec<Uuid> = sqlx::query(
            r#"SELECT id FROM configs
               WHERE ($1::uuid IS NULL OR id > $1) ORDER BY id LIMIT $2"#,
        )
        .bind(after_id)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?
        .into_iter()
        .map(|row| row.get::<Uuid, _>("id"))
        .collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let config = Self::load_config(&self.pool, id).await?;
            out.push(snapshot_row_for(&self.pool, config).await?);
        }
        Ok(out)
    }

    async fn all_config_ids(&self) -> Result<Vec<Uuid>> {
        sqlx::query_scalar("SELECT id FROM configs")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))
    }

    async fn acquire_consumer_id(&self, restored: Option<String>) -> Result<String> {
        if let Some(id) = &restored {
            sqlx::query("UPDATE replication_consumers SET last_used_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
            return Ok(id.clone());
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO replication_consumers (id, last_used_at) VALUES ($1, now())")
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Ok(id)
    }

    async fn report_last_used_at(&self, consumer_id: &str) -> Result<()> {
        sqlx::query("UPDATE replication_consumers SET last_used_at = now() WHERE id = $1")
            .bind(consumer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Ok(())
    }

    async fn cleanup_idle_consumers(&self, idle_cutoff_seconds: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM replication_consumers WHERE last_used_at < now() - make_interval(secs => $1)",
        )
        .bind(idle_cutoff_seconds as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| ConfigError::Internal(anyhow!(e)))?;
        Ok(result.rows_affected())
    }
}
