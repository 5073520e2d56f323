//! Embedded SQLite replica storage. A single [`rusqlite::Connection`]
//! behind a mutex — one writer (the replication pipeline), arbitrarily
//! many readers via `spawn_blocking`, matching how rusqlite is meant to be
//! used from an async binary.

use std::sync::Mutex;

use anyhow::{Context, Result};
use config_core::ports::ConfigSnapshotRow;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS configs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    UNIQUE(project_id, name)
);
CREATE TABLE IF NOT EXISTS config_variants (
    config_id TEXT NOT NULL REFERENCES configs(id) ON DELETE CASCADE,
    environment_id TEXT,
    value TEXT NOT NULL,
    overrides TEXT NOT NULL,
    PRIMARY KEY (config_id, environment_id)
);
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct ReplicaVariant {
    pub environment_id: Option<String>,
    pub value: serde_json::Value,
    pub overrides: serde_json::Value,
}

pub struct ReplicaConfig {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub version: i64,
    pub variants: Vec<ReplicaVariant>,
}

pub struct ReplicaStore {
    conn: Mutex<Connection>,
}

impl ReplicaStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("opening replica sqlite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA).context("applying replica schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert or replace a config row, ignoring the write if the stored
    /// version is already at or ahead of the incoming one — the primary
    /// can redeliver snapshot rows the incremental stream already applied.
    pub fn upsert_config(&self, row: &ConfigSnapshotRow) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let existing_version: Option<i64> = tx
            .query_row(
                "SELECT version FROM configs WHERE id = ?1",
                params![row.id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(existing) = existing_version {
            if existing >= row.version {
                return Ok(());
            }
        }
        tx.execute(
            r#"INSERT INTO configs (id, project_id, name, version) VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(id) DO UPDATE SET project_id=excluded.project_id, name=excluded.name, version=excluded.version"#,
            params![row.id.to_string(), row.project_id.to_string(), row.name, row.version],
        )?;
        tx.execute(
            "DELETE FROM config_variants WHERE config_id = ?1",
            params![row.id.to_string()],
        )?;
        for variant in &row.variants {
            tx.execute(
                "INSERT INTO config_variants (config_id, environment_id, value, overrides) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.id.to_string(),
                    variant.environment_id,
                    variant.value.to_string(),
                    variant.overrides.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_config(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM configs WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Drop every config row; used on cold start when the stored consumer
    /// id was rejected by the primary (its resume cursor has been
    /// garbage-collected) and a full resync is required.
    pub fn clear_all_configs(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("DELETE FROM config_variants; DELETE FROM configs;")?;
        Ok(())
    }

    pub fn all_config_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM configs")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|s| Uuid::parse_str(&s).context("parsing stored config id"))
            .collect()
    }

    pub fn get_config(&self, id: Uuid) -> Result<Option<ReplicaConfig>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT project_id, name, version FROM configs WHERE id = ?1",
                params![id.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((project_id, name, version)) = row else {
            return Ok(None);
        };
        let mut stmt = conn.prepare("SELECT environment_id, value, overrides FROM config_variants WHERE config_id = ?1")?;
        let variants = stmt
            .query_map(params![id.to_string()], |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let variants = variants
            .into_iter()
            .map(|(environment_id, value, overrides)| {
                Ok(ReplicaVariant {
                    environment_id,
                    value: serde_json::from_str(&value)?,
                    overrides: serde_json::from_str(&overrides)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(ReplicaConfig {
            id,
            project_id: Uuid::parse_str(&project_id)?,
            name,
            version,
            variants,
        }))
    }

    pub fn get_config_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<ReplicaConfig>> {
        let id: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM configs WHERE project_id = ?1 AND name = ?2",
                params![project_id.to_string(), name],
                |r| r.get(0),
            )
            .optional()?
        };
        match id {
            Some(id) => self.get_config(Uuid::parse_str(&id)?),
            None => Ok(None),
        }
    }

    /// The variant for `environment_id` if the replica has one, else the
    /// base variant (NULL `environment_id`), else `None`. Mirrors spec §4.J's
    /// `getEnvironmentalConfig`.
    pub fn get_environmental_config(
        &self,
        project_id: Uuid,
        config_name: &str,
        environment_id: &str,
    ) -> Result<Option<ReplicaVariant>> {
        let Some(config) = self.get_config_by_name(project_id, config_name)? else {
            return Ok(None);
        };
        if let Some(variant) = config
            .variants
            .iter()
            .find(|v| v.environment_id.as_deref() == Some(environment_id))
        {
            return Ok(Some(variant.clone()));
        }
        Ok(config.variants.into_iter().find(|v| v.environment_id.is_none()))
    }

    /// Thin wrapper over [`Self::get_environmental_config`] returning only
    /// the resolved value, per spec §4.J's `getConfigValue`.
    pub fn get_config_value(
        &self,
        project_id: Uuid,
        config_name: &str,
        environment_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .get_environmental_config(project_id, config_name, environment_id)?
            .map(|v| v.value))
    }

    pub fn load_consumer_id(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM kv WHERE key = 'consumer_id'", [], |r| r.get(0))
            .optional()
            .map_err(Into::into)
    }

    pub fn save_consumer_id(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES ('consumer_id', ?1) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![id],
        )?;
        Ok(())
    }
}
