//! Storage connection lifecycle: the first open at startup and the periodic
//! keep-alive ping. Outages in either go through the escalation controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::StoreError;
use crate::escalation::{EscalationOutcome, FailureEscalationController, StorageProbe};
use crate::notify::FailureContext;

/// Holds the database once it could be opened. Until then a reconnect is a
/// fresh open, afterwards it reopens the existing handle in place.
pub struct StorageSlot {
    path: String,
    db: Mutex<Option<Database>>,
}

impl StorageSlot {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            db: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self) -> Option<Database> {
        self.db.lock().ok()?.clone()
    }

    async fn connect(&self) -> Result<Database, StoreError> {
        if let Some(db) = self.get() {
            db.run_blocking(|db| db.reconnect()).await?;
            return Ok(db);
        }

        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || {
            let db = Database::open(&path)?;
            db.execute_init()?;
            Ok::<_, StoreError>(db)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))??;

        let mut slot = self
            .db
            .lock()
            .map_err(|_| StoreError::Worker("storage slot mutex poisoned".to_string()))?;
        *slot = Some(db.clone());
        Ok(db)
    }
}

#[async_trait]
impl StorageProbe for StorageSlot {
    async fn ping(&self) -> Result<(), StoreError> {
        let db = self
            .get()
            .ok_or_else(|| StoreError::StorageUnavailable("database was never opened".to_string()))?;
        db.run_blocking(|db| db.ping()).await
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.connect().await.map(|_| ())
    }
}

/// Opens the database and initialises the schema. An unreachable database is
/// escalated like any runtime outage; startup continues only if a reconnect
/// attempt brings it back.
pub async fn open_storage(slot: &StorageSlot, escalation: &FailureEscalationController) -> anyhow::Result<Database> {
    if let Err(e) = slot.connect().await {
        if !e.is_storage_unavailable() {
            return Err(e.into());
        }
        let context = FailureContext::for_event("startup")
            .with_argument(slot.path())
            .with_error(&e);
        match escalation.handle_storage_failure(context).await {
            EscalationOutcome::Recovered { attempt } => {
                info!("Database reachable after startup reconnection attempt {}", attempt);
            }
            outcome => bail!("database unavailable at startup ({:?}): {}", outcome, e),
        }
    }

    let db = slot
        .get()
        .ok_or_else(|| anyhow!("database handle missing after a successful open"))?;
    let stage = escalation.confirm_healthy().await?;
    info!("Database ready, escalation stage: {}", stage);
    Ok(db)
}

/// Pings the database every `every` so an idle outage is caught before the
/// next message needs storage.
pub async fn keep_alive(
    storage: Arc<dyn StorageProbe>,
    escalation: Arc<FailureEscalationController>,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once, the database was just opened
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match storage.ping().await {
            Ok(()) => debug!("Database keep-alive ping ok"),
            Err(e) if e.is_storage_unavailable() => {
                warn!("Database keep-alive ping failed: {}", e);
                let context = FailureContext::for_event("keepalive").with_error(&e);
                escalation.handle_storage_failure(context).await;
            }
            Err(e) => warn!("Database keep-alive ping returned an error: {}", e),
        }
    }
}
