//! LISTEN/NOTIFY-backed [`EventBusClient`]. `notify` issues `pg_notify`;
//! `start` spawns a background task that holds a [`PgListener`] open and
//! rebroadcasts every message to local subscribers, reconnecting with
//! exponential backoff on drop — the same `tokio::select!`-over-a-
//! `watch::Receiver<bool>` shutdown shape as the teacher's
//! `TaskQueueListener::run`, adapted from polling a table to holding a
//! push-based connection open. A second task runs a periodic healthcheck
//! query and forces a reconnect if it stalls or errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config_core::error::{ConfigError, Result};
use config_core::ports::{ConfigChangeEvent, EventBusClient};
use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

/// §4.I: initial 500ms, doubling, capped at 30s, ±20% jitter.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTHCHECK_STATEMENT_TIMEOUT_SECS: i64 = 5;
const BROADCAST_CAPACITY: usize = 256;

/// Reported through the `onError` sink (§4.I) without killing the listener.
pub type ErrorSink = Arc<dyn Fn(&ConfigError) + Send + Sync>;

fn jittered(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(backoff.as_secs_f64() * factor)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

pub struct PgEventBusClient {
    pool: PgPool,
    channel: String,
    connected: Arc<AtomicBool>,
    tx: broadcast::Sender<ConfigChangeEvent>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    on_error: ErrorSink,
    healthcheck_interval: Duration,
}

impl PgEventBusClient {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self::with_error_sink(pool, channel, Arc::new(|e| error!(error = %e, "event bus error")))
    }

    pub fn with_error_sink(pool: PgPool, channel: impl Into<String>, on_error: ErrorSink) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            pool,
            channel: channel.into(),
            connected: Arc::new(AtomicBool::new(false)),
            tx,
            shutdown_tx: Mutex::new(None),
            on_error,
            healthcheck_interval: HEALTHCHECK_INTERVAL,
        }
    }

    /// Exposed for tests that want a faster healthcheck cadence than the
    /// production default.
    pub fn with_healthcheck_interval(mut self, interval: Duration) -> Self {
        self.healthcheck_interval = interval;
        self
    }

    async fn listen_loop(
        pool: PgPool,
        channel: String,
        connected: Arc<AtomicBool>,
        tx: broadcast::Sender<ConfigChangeEvent>,
        on_error: ErrorSink,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(l) => l,
                Err(e) => {
                    let err = ConfigError::Transient(format!("failed to open event listener: {e}"));
                    error!(error = %e, "failed to open config event listener, retrying");
                    on_error(&err);
                    connected.store(false, Ordering::SeqCst);
                    let wait = jittered(backoff);
                    backoff = next_backoff(backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };
            if let Err(e) = listener.listen(&channel).await {
                let err = ConfigError::Transient(format!("failed to LISTEN on {channel}: {e}"));
                error!(error = %e, channel, "failed to LISTEN, retrying");
                on_error(&err);
                let wait = jittered(backoff);
                backoff = next_backoff(backoff);
                tokio::time::sleep(wait).await;
                continue;
            }
            backoff = INITIAL_BACKOFF;
            connected.store(true, Ordering::SeqCst);
            info!(channel, "config event listener connected");

            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(note) => match serde_json::from_str::<ConfigChangeEvent>(note.payload()) {
                                Ok(event) => {
                                    let _ = tx.send(event);
                                }
                                Err(e) => warn!(error = %e, "dropping unparseable config change notification"),
                            },
                            Err(e) => {
                                let err = ConfigError::Transient(format!("event listener connection lost: {e}"));
                                error!(error = %e, "config event listener connection lost, reconnecting");
                                on_error(&err);
                                connected.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
            let wait = jittered(backoff);
            backoff = next_backoff(backoff);
            tokio::time::sleep(wait).await;
        }
    }

    /// Runs `SELECT 1` on a short-lived connection every `interval`, forcing
    /// `connected` false on failure so the listener loop's own reconnect
    /// logic (and the replication pipeline's periodic snapshot) compensate.
    async fn healthcheck_loop(
        pool: PgPool,
        connected: Arc<AtomicBool>,
        on_error: ErrorSink,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            let check = async {
                let mut conn = pool.acquire().await?;
                sqlx::query(&format!(
                    "SET LOCAL statement_timeout = {}",
                    HEALTHCHECK_STATEMENT_TIMEOUT_SECS * 1000
                ))
                .execute(&mut *conn)
                .await?;
                sqlx::query("SELECT 1").execute(&mut *conn).await?;
                Ok::<(), sqlx::Error>(())
            };
            if let Err(e) = check.await {
                let err = ConfigError::Transient(format!("event bus healthcheck failed: {e}"));
                warn!(error = %e, "event bus healthcheck failed");
                on_error(&err);
                connected.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl EventBusClient for PgEventBusClient {
    async fn start(&self) -> Result<()> {
        let mut guard = self.shutdown_tx.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = self.pool.clone();
        let channel = self.channel.clone();
        let connected = self.connected.clone();
        let tx = self.tx.clone();
        let on_error = self.on_error.clone();
        tokio::spawn(Self::listen_loop(
            pool.clone(),
            channel,
            connected.clone(),
            tx,
            on_error.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::healthcheck_loop(
            pool,
            connected,
            on_error,
            self.healthcheck_interval,
            shutdown_rx,
        ));
        *guard = Some(shutdown_tx);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.shutdown_tx.lock().await;
        if let Some(tx) = guard.take() {
            let _ = tx.send(true);
        }
        debug!("config event listener stopped");
        Ok(())
    }

    async fn notify(&self, event: &ConfigChangeEvent) -> Result<()> {
        let payload = serde_json::to_string(event).map_err(|e| ConfigError::Internal(e.into()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| ConfigError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.tx.subscribe()
    }
}
