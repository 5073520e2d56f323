//! configd-replica-agent — standalone process that mirrors the config
//! service's primary store into a local SQLite replica.
//!
//! Reads config from env vars:
//!   CONFIGD_DATABASE_URL      — Postgres connection string (required)
//!   CONFIGD_REPLICA_DB_PATH   — path to the local SQLite file (default: ./config-replica.sqlite3)
//!   CONFIGD_EVENT_CHANNEL     — Postgres NOTIFY channel name (default: config_changes)

use std::sync::Arc;

use config_postgres::{PgEventBusClient, PgPrimaryStore};
use config_replica::{ReplicaStore, ReplicationPipeline};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,configd_replica_agent=debug".into()),
        )
        .init();

    let database_url = std::env::var("CONFIGD_DATABASE_URL").expect("CONFIGD_DATABASE_URL must be set");
    let replica_db_path =
        std::env::var("CONFIGD_REPLICA_DB_PATH").unwrap_or_else(|_| "./config-replica.sqlite3".into());
    let event_channel = std::env::var("CONFIGD_EVENT_CHANNEL").unwrap_or_else(|_| "config_changes".into());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("connected to primary database");

    let source: Arc<dyn config_core::ports::SnapshotSource> = Arc::new(PgPrimaryStore::new(pool.clone()));
    let events: Arc<dyn config_core::ports::EventBusClient> =
        Arc::new(PgEventBusClient::new(pool, event_channel));
    let replica = Arc::new(ReplicaStore::open(&replica_db_path).expect("failed to open replica database"));

    let pipeline = ReplicationPipeline::new(replica, source, events);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(path = %replica_db_path, "starting replication pipeline");
    pipeline.run(shutdown_rx).await;
    tracing::info!("replication pipeline stopped");
}
