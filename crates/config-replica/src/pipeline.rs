//! Replication pipeline: a cold-start (or resumed) full snapshot pull,
//! incremental application of event bus notifications in between, a
//! periodic full re-pull as a backstop, and periodic heartbeat/idle-cleanup
//! of the consumer lease. Shaped like the teacher's
//! `TaskQueueListener::run` — a loop driven by a `watch::Receiver<bool>`
//! shutdown signal, with a fixed backoff after error instead of a tight
//! retry spin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config_core::ports::{ConfigChangeEvent, ConfigChangeKind, EventBusClient, SnapshotSource};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::store::ReplicaStore;

const SNAPSHOT_BATCH_SIZE: i64 = 500;
const ERROR_BACKOFF: Duration = Duration::from_millis(1000);
/// Consumers idle longer than this are reaped by a housekeeping primary;
/// report liveness well inside that window.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Full re-pull cadence: the incremental event stream is the fast path,
/// this is the correctness backstop that catches anything it missed.
const PULL_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Trigger idle-consumer cleanup on the primary roughly once per this many
/// full pulls rather than on every one.
const CLEANUP_FREQUENCY_PULLS: u64 = 128;
const IDLE_CONSUMER_CUTOFF_SECONDS: i64 = 24 * 60 * 60;

pub struct ReplicationPipeline {
    store: Arc<ReplicaStore>,
    source: Arc<dyn SnapshotSource>,
    events: Arc<dyn EventBusClient>,
}

impl ReplicationPipeline {
    pub fn new(store: Arc<ReplicaStore>, source: Arc<dyn SnapshotSource>, events: Arc<dyn EventBusClient>) -> Self {
        Self { store, source, events }
    }

    /// Run until `shutdown` is set to `true`. On a fresh database (no
    /// stored consumer id) this clears any partial state and does a full
    /// resync; on resume it trusts the replica's existing rows and only
    /// reconciles tombstones (configs deleted on the primary while this
    /// consumer was offline).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.events.start().await.ok();
        let mut receiver = self.events.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.resync().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "replication resync failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }

        let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat_tick.tick().await; // first tick fires immediately

        let mut pull_tick = tokio::time::interval(PULL_INTERVAL);
        pull_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pull_tick.tick().await;

        let mut pull_count: u64 = 0;

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.apply_event(event).await {
                                error!(error = %e, "failed to apply replication event");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "replication consumer lagged, forcing full resync");
                            if let Err(e) = self.resync().await {
                                error!(error = %e, "resync after lag failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!("event bus channel closed, stopping replication pipeline");
                            return;
                        }
                    }
                }
                _ = heartbeat_tick.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "failed to report replication consumer heartbeat");
                    }
                }
                _ = pull_tick.tick() => {
                    pull_count += 1;
                    if let Err(e) = self.snapshot_pull_and_reconcile().await {
                        error!(error = %e, "periodic full snapshot pull failed");
                    }
                    if pull_count % CLEANUP_FREQUENCY_PULLS == 0 {
                        match self.source.cleanup_idle_consumers(IDLE_CONSUMER_CUTOFF_SECONDS).await {
                            Ok(reaped) if reaped > 0 => info!(reaped, "reaped idle replication consumers"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "idle consumer cleanup failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("replication pipeline shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Cold start (or resume): acquire/persist the consumer id, clear the
    /// replica on a fresh start, then pull and reconcile.
    async fn resync(&self) -> Result<()> {
        let restored = {
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.load_consumer_id()).await??
        };
        let fresh_start = restored.is_none();
        let consumer_id = self.source.acquire_consumer_id(restored).await?;
        {
            let store = self.store.clone();
            let consumer_id = consumer_id.clone();
            tokio::task::spawn_blocking(move || store.save_consumer_id(&consumer_id)).await??;
        }

        if fresh_start {
            info!("cold start: clearing replica before full resync");
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.clear_all_configs()).await??;
        }

        self.snapshot_pull_and_reconcile().await
    }

    /// A single full batched snapshot pull plus tombstone reconciliation.
    /// Runs once at startup and then on every `PULL_INTERVAL` tick as the
    /// backstop for anything the incremental event stream missed.
    async fn snapshot_pull_and_reconcile(&self) -> Result<()> {
        let mut after = None;
        loop {
            let batch = self.source.pull_snapshot_batch(after, SNAPSHOT_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            after = batch.last().map(|row| row.id);
            let store = self.store.clone();
            let count = batch.len();
            tokio::task::spawn_blocking(move || -> Result<()> {
                for row in &batch {
                    store.upsert_config(row)?;
                }
                Ok(())
            })
            .await??;
            if count < SNAPSHOT_BATCH_SIZE as usize {
                break;
            }
        }

        self.reconcile_tombstones().await?;
        info!("replication snapshot pull complete");
        Ok(())
    }

    async fn reconcile_tombstones(&self) -> Result<()> {
        let live_ids: std::collections::HashSet<_> = self.source.all_config_ids().await?.into_iter().collect();
        let store = self.store.clone();
        let local_ids = tokio::task::spawn_blocking(move || store.all_config_ids()).await??;
        for id in local_ids {
            if !live_ids.contains(&id) {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.delete_config(id)).await??;
            }
        }
        Ok(())
    }

    async fn apply_event(&self, event: ConfigChangeEvent) -> Result<()> {
        match event.kind {
            ConfigChangeKind::Delete => {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.delete_config(event.config_id)).await??;
            }
            ConfigChangeKind::Upsert => {
                if let Some(row) = self.source.pull_one(event.config_id).await? {
                    let store = self.store.clone();
                    tokio::task::spawn_blocking(move || store.upsert_config(&row)).await??;
                }
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        let store = self.store.clone();
        let Some(consumer_id) = tokio::task::spawn_blocking(move || store.load_consumer_id()).await?? else {
            return Ok(());
        };
        self.source.report_last_used_at(&consumer_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_core::error::Result as ConfigResult;
    use config_core::ports::{ConfigSnapshotRow, ConfigVariantRow};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    struct FakeSource {
        batches: StdMutex<Vec<Vec<ConfigSnapshotRow>>>,
        live_ids: Vec<uuid::Uuid>,
        report_calls: StdMutex<u32>,
        cleanup_calls: StdMutex<u32>,
    }

    #[async_trait::async_trait]
    impl SnapshotSource for FakeSource {
        async fn pull_snapshot_batch(
            &self,
            _after_id: Option<uuid::Uuid>,
            _batch_size: i64,
        ) -> ConfigResult<Vec<ConfigSnapshotRow>> {
            let mut batches = self.batches.lock().unwrap();
            Ok(if batches.is_empty() { vec![] } else { batches.remove(0) })
        }

        async fn pull_one(&self, config_id: uuid::Uuid) -> ConfigResult<Option<ConfigSnapshotRow>> {
            Ok(self.live_ids.iter().find(|id| **id == config_id).map(|id| ConfigSnapshotRow {
                id: *id,
                project_id: uuid::Uuid::new_v4(),
                name: "cfg".into(),
                version: 1,
                variants: vec![ConfigVariantRow {
                    environment_id: None,
                    value: serde_json::json!(true),
                    overrides: serde_json::json!([]),
                }],
            }))
        }

        async fn all_config_ids(&self) -> ConfigResult<Vec<uuid::Uuid>> {
            Ok(self.live_ids.clone())
        }

        async fn acquire_consumer_id(&self, restored: Option<String>) -> ConfigResult<String> {
            Ok(restored.unwrap_or_else(|| "consumer-1".to_string()))
        }

        async fn report_last_used_at(&self, _consumer_id: &str) -> ConfigResult<()> {
            *self.report_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn cleanup_idle_consumers(&self, _idle_cutoff_seconds: i64) -> ConfigResult<u64> {
            *self.cleanup_calls.lock().unwrap() += 1;
            Ok(0)
        }
    }

    struct FakeEvents {
        tx: broadcast::Sender<ConfigChangeEvent>,
    }

    #[async_trait::async_trait]
    impl EventBusClient for FakeEvents {
        async fn start(&self) -> ConfigResult<()> {
            Ok(())
        }
        async fn stop(&self) -> ConfigResult<()> {
            Ok(())
        }
        async fn notify(&self, _event: &ConfigChangeEvent) -> ConfigResult<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
            self.tx.subscribe()
        }
    }

    fn sample_row(id: uuid::Uuid, version: i64) -> ConfigSnapshotRow {
        ConfigSnapshotRow {
            id,
            project_id: uuid::Uuid::new_v4(),
            name: "flag".into(),
            version,
            variants: vec![ConfigVariantRow {
                environment_id: None,
                value: serde_json::json!(true),
                overrides: serde_json::json!([]),
            }],
        }
    }

    #[tokio::test]
    async fn resync_applies_batches_and_reconciles_tombstones() {
        let keep = uuid::Uuid::new_v4();
        let drop = uuid::Uuid::new_v4();
        let store = Arc::new(ReplicaStore::open_in_memory().unwrap());
        store.upsert_config(&sample_row(drop, 1)).unwrap();

        let source = Arc::new(FakeSource {
            batches: StdMutex::new(vec![vec![sample_row(keep, 1)]]),
            live_ids: vec![keep],
            report_calls: StdMutex::new(0),
            cleanup_calls: StdMutex::new(0),
        });
        let (tx, _rx) = broadcast::channel(16);
        let events = Arc::new(FakeEvents { tx });

        let pipeline = ReplicationPipeline::new(store.clone(), source, events);
        pipeline.resync().await.unwrap();

        assert!(store.get_config(keep).unwrap().is_some());
        assert!(store.get_config(drop).unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_event_upserts_and_deletes() {
        let id = uuid::Uuid::new_v4();
        let store = Arc::new(ReplicaStore::open_in_memory().unwrap());
        let source = Arc::new(FakeSource {
            batches: StdMutex::new(vec![]),
            live_ids: vec![id],
            report_calls: StdMutex::new(0),
            cleanup_calls: StdMutex::new(0),
        });
        let (tx, _rx) = broadcast::channel(16);
        let events = Arc::new(FakeEvents { tx });
        let pipeline = ReplicationPipeline::new(store.clone(), source, events);

        pipeline
            .apply_event(ConfigChangeEvent { config_id: id, version: 1, kind: ConfigChangeKind::Upsert })
            .await
            .unwrap();
        assert!(store.get_config(id).unwrap().is_some());

        pipeline
            .apply_event(ConfigChangeEvent { config_id: id, version: 2, kind: ConfigChangeKind::Delete })
            .await
            .unwrap();
        assert!(store.get_config(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_reports_persisted_consumer_id() {
        let store = Arc::new(ReplicaStore::open_in_memory().unwrap());
        store.save_consumer_id("consumer-1").unwrap();
        let source = Arc::new(FakeSource {
            batches: StdMutex::new(vec![]),
            live_ids: vec![],
            report_calls: StdMutex::new(0),
            cleanup_calls: StdMutex::new(0),
        });
        let (tx, _rx) = broadcast::channel(16);
        let events = Arc::new(FakeEvents { tx });
        let pipeline = ReplicationPipeline::new(store, source.clone(), events);

        pipeline.heartbeat().await.unwrap();
        assert_eq!(*source.report_calls.lock().unwrap(), 1);
    }

    #[test]
    fn cleanup_fires_once_per_frequency_window() {
        let mut pull_count: u64 = 0;
        let mut cleanups = 0;
        for _ in 0..CLEANUP_FREQUENCY_PULLS * 2 {
            pull_count += 1;
            if pull_count % CLEANUP_FREQUENCY_PULLS == 0 {
                cleanups += 1;
            }
        }
        assert_eq!(cleanups, 2);
    }
}
