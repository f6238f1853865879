use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the message log store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database cannot be reached or used at all. Triggers escalation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// A row with this key already exists. Expected when a live event and a
    /// replay race on the same message.
    #[error("message {0} is already logged")]
    DuplicateKey(u64),
    #[error("message {0} is not logged")]
    NotFound(u64),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("blocking database task failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, StoreError::StorageUnavailable(_) | StoreError::Worker(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly,
            ) => StoreError::StorageUnavailable(err.to_string()),
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Errors from the infrastructure reboot call.
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("host reboot is not configured (missing API token or host id)")]
    NotConfigured,
    #[error("reboot request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("reboot request rejected with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reboot request failed: {0}")]
    Transport(String),
}

/// Why a reconciliation run stopped without producing counts.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconciliation cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("history source failed: {0}")]
    History(String),
}
