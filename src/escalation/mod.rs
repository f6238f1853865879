//! Escalating remediation for an unreachable database.
//!
//! Two reconnect attempts are made locally. If both fail the controller walks
//! the persisted stages: restart the process, then reboot the host, then give
//! up and wait for a human. Each destructive action is taken at most once per
//! stage and the stage is on disk before the action starts.

pub mod marker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::notify::{FailureContext, Notification, NotificationSink, Severity};
use crate::remediation::RemediationApi;

pub use marker::{EscalationStage, MarkerRecord, MarkerStore};

/// Exit code used when the controller restarts the process.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Something that can check and re-establish the storage connection.
#[async_trait]
pub trait StorageProbe: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;
    async fn reconnect(&self) -> Result<(), StoreError>;
}

/// Terminates the current process so the supervisor can start a fresh one.
pub trait ProcessControl: Send + Sync {
    fn terminate(&self);
}

pub struct ExitProcess;

impl ProcessControl for ExitProcess {
    fn terminate(&self) {
        error!("Terminating process for supervisor restart (exit code {})", RESTART_EXIT_CODE);
        std::process::exit(RESTART_EXIT_CODE);
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub reconnect_backoff: Duration,
    pub reboot_timeout: Duration,
    pub reboot_cooldown: Duration,
    pub host_id: Option<String>,
}

impl EscalationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            reboot_timeout: Duration::from_secs(config.reboot_timeout_secs),
            reboot_cooldown: Duration::from_secs(config.reboot_cooldown_secs),
            host_id: config.do_droplet_id.clone(),
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(15),
            reboot_timeout: Duration::from_secs(30),
            reboot_cooldown: Duration::from_secs(60),
            host_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Reconnect attempt `attempt` (1 or 2) succeeded.
    Recovered { attempt: u8 },
    /// `RestartAttempted` was persisted and the process asked to terminate.
    RestartIssued,
    /// `HostRebootAttempted` was persisted and the reboot call issued.
    HostRebootIssued,
    /// Automatic remediation just ran out.
    Exhausted,
    /// Remediation had already run out before this failure.
    AlreadyExhausted,
    /// Another escalation is already handling the outage.
    InProgress,
    /// The marker store could not be read or written, nothing destructive was done.
    Aborted,
}

pub struct FailureEscalationController {
    storage: Arc<dyn StorageProbe>,
    markers: Arc<MarkerStore>,
    remediation: Arc<dyn RemediationApi>,
    process: Arc<dyn ProcessControl>,
    sink: Arc<dyn NotificationSink>,
    settings: EscalationSettings,
    in_flight: Mutex<()>,
}

fn ordinal(attempt: u8) -> &'static str {
    match attempt {
        1 => "1st",
        2 => "2nd",
        _ => "next",
    }
}

impl FailureEscalationController {
    pub fn new(
        storage: Arc<dyn StorageProbe>,
        markers: Arc<MarkerStore>,
        remediation: Arc<dyn RemediationApi>,
        process: Arc<dyn ProcessControl>,
        sink: Arc<dyn NotificationSink>,
        settings: EscalationSettings,
    ) -> Self {
        Self {
            storage,
            markers,
            remediation,
            process,
            sink,
            settings,
            in_flight: Mutex::new(()),
        }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Runs a marker store call on the blocking pool, it fsyncs.
    async fn with_markers<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&MarkerStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let markers = self.markers.clone();
        tokio::task::spawn_blocking(move || f(&markers)).await?
    }

    pub async fn record(&self) -> anyhow::Result<Option<MarkerRecord>> {
        self.with_markers(|m| m.record()).await
    }

    /// Entry point for every `StorageUnavailable` error.
    pub async fn handle_storage_failure(&self, context: FailureContext) -> EscalationOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Storage failure reported while an escalation is running: {}", context.render());
            return EscalationOutcome::InProgress;
        };

        error!("Storage failure, starting escalation\n{}", context.render());

        match self.with_markers(|m| m.current()).await {
            Ok(EscalationStage::Exhausted) => {
                warn!("Automatic remediation is exhausted, waiting for manual intervention");
                return EscalationOutcome::AlreadyExhausted;
            }
            Ok(_) => {}
            Err(e) => return self.abort(&context, e).await,
        }

        self.notify(
            Severity::Warning,
            "Database failure caught! Attempting to reconnect to the database!",
            Some(context.clone()),
        )
        .await;

        if self.try_reconnect(1).await {
            return self.recovered(1).await;
        }

        info!(
            "Waiting {} before the 2nd reconnection attempt",
            humantime::format_duration(self.settings.reconnect_backoff)
        );
        tokio::time::sleep(self.settings.reconnect_backoff).await;

        if self.try_reconnect(2).await {
            return self.recovered(2).await;
        }

        self.escalate(context).await
    }

    /// Called once storage answers at startup. A restart or reboot that fixed
    /// the outage clears its marker here.
    pub async fn confirm_healthy(&self) -> anyhow::Result<EscalationStage> {
        let stage = self.with_markers(|m| m.current()).await?;
        match stage {
            EscalationStage::None => {}
            EscalationStage::Exhausted => {
                warn!("Storage is reachable but escalation markers say remediation is exhausted");
                self.notify(
                    Severity::Warning,
                    "Database is reachable again, but automatic remediation stays disabled until the escalation state is reset.",
                    None,
                )
                .await;
            }
            EscalationStage::RestartAttempted | EscalationStage::HostRebootAttempted => {
                self.with_markers(|m| m.clear_markers()).await?;
                info!("Storage recovered after {}, markers cleared", stage);
                self.notify(
                    Severity::Info,
                    format!("Database connection restored after escalation ({}).", stage),
                    None,
                )
                .await;
            }
        }
        Ok(stage)
    }

    /// Manual reset, re-arms automatic remediation.
    pub async fn reset(&self) -> anyhow::Result<EscalationStage> {
        let previous = self.with_markers(|m| {
            let previous = m.current()?;
            m.clear_markers()?;
            Ok(previous)
        })
        .await?;
        info!("Escalation state reset manually (was {})", previous);
        Ok(previous)
    }

    async fn try_reconnect(&self, attempt: u8) -> bool {
        match self.storage.reconnect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} reconnection attempt failed: {}", ordinal(attempt), e);
                false
            }
        }
    }

    async fn recovered(&self, attempt: u8) -> EscalationOutcome {
        if let Err(e) = self.with_markers(|m| m.clear_markers()).await {
            error!("Reconnected but failed to clear escalation markers: {:#}", e);
        }
        info!("{} reconnection attempt succeeded", ordinal(attempt));
        self.notify(
            Severity::Info,
            format!("{} reconnection attempt successfully connected!", ordinal(attempt)),
            None,
        )
        .await;
        EscalationOutcome::Recovered { attempt }
    }

    async fn escalate(&self, context: FailureContext) -> EscalationOutcome {
        let stage = match self.with_markers(|m| m.current()).await {
            Ok(stage) => stage,
            Err(e) => return self.abort(&context, e).await,
        };

        match stage {
            EscalationStage::None => {
                if let Err(e) = self
                    .with_markers(|m| m.set_marker(EscalationStage::RestartAttempted))
                    .await
                {
                    return self.abort(&context, e).await;
                }
                self.notify(
                    Severity::Critical,
                    "Reconnecting failed, escalating to reboot",
                    Some(context),
                )
                .await;
                self.process.terminate();
                EscalationOutcome::RestartIssued
            }
            EscalationStage::RestartAttempted => {
                if let Err(e) = self
                    .with_markers(|m| m.set_marker(EscalationStage::HostRebootAttempted))
                    .await
                {
                    return self.abort(&context, e).await;
                }
                self.notify(
                    Severity::Critical,
                    "Reconnecting and bot rebooting failed, escalating to VM reboot",
                    Some(context),
                )
                .await;
                self.reboot_host().await;
                info!(
                    "Host reboot issued, cooling down for {}",
                    humantime::format_duration(self.settings.reboot_cooldown)
                );
                tokio::time::sleep(self.settings.reboot_cooldown).await;
                EscalationOutcome::HostRebootIssued
            }
            EscalationStage::HostRebootAttempted => {
                self.notify(
                    Severity::Critical,
                    "VM reboot did not fix the problem, automatic remediation is exhausted. Manual intervention required.",
                    Some(context),
                )
                .await;
                if let Err(e) = self
                    .with_markers(|m| m.set_marker(EscalationStage::Exhausted))
                    .await
                {
                    error!("Failed to persist exhausted escalation marker: {:#}", e);
                }
                EscalationOutcome::Exhausted
            }
            EscalationStage::Exhausted => EscalationOutcome::AlreadyExhausted,
        }
    }

    /// Issues the single reboot request. Failures are logged and reported,
    /// the stage stays advanced since there is no confirmation channel.
    async fn reboot_host(&self) {
        let Some(host_id) = self.settings.host_id.clone() else {
            error!("Host reboot requested but no host id is configured");
            self.notify(
                Severity::Critical,
                "Host reboot could not be requested: no host id configured.",
                None,
            )
            .await;
            return;
        };

        match self
            .remediation
            .reboot_host(&host_id, self.settings.reboot_timeout)
            .await
        {
            Ok(()) => info!("Reboot of host {} accepted", host_id),
            Err(e) => {
                error!("Reboot request for host {} failed, treating as issued: {}", host_id, e);
                self.notify(
                    Severity::Warning,
                    format!("Reboot request for host {} may not have gone through: {}", host_id, e),
                    None,
                )
                .await;
            }
        }
    }

    async fn abort(&self, context: &FailureContext, err: anyhow::Error) -> EscalationOutcome {
        error!("Escalation marker store unusable, not escalating: {:#}", err);
        self.notify(
            Severity::Critical,
            format!("Database failure could not be escalated, marker store error: {}", err),
            Some(context.clone()),
        )
        .await;
        EscalationOutcome::Aborted
    }

    async fn notify(&self, severity: Severity, message: impl Into<String>, context: Option<FailureContext>) {
        let mut notification = Notification::operator(severity, message);
        if let Some(context) = context {
            notification = notification.with_context(context);
        }
        self.sink.notify(notification).await;
    }
}
