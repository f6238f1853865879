//! Durable record of how far storage-failure remediation has progressed.
//!
//! One JSON file holds the whole state. Writes go through a temp file that is
//! fsynced and renamed over the target, so a crash leaves either the old or
//! the new record and never a mix of stages.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const MARKER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStage {
    #[default]
    None,
    RestartAttempted,
    HostRebootAttempted,
    Exhausted,
}

impl std::fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EscalationStage::None => "none",
            EscalationStage::RestartAttempted => "restart attempted",
            EscalationStage::HostRebootAttempted => "host reboot attempted",
            EscalationStage::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub schema_version: u32,
    pub stage: EscalationStage,
    pub updated_at: DateTime<Utc>,
}

pub struct MarkerStore {
    path: PathBuf,
    // Serializes read-modify-write sequences within this process.
    lock: Mutex<()>,
}

impl MarkerStore {
    /// Opens the store and validates any record already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        if let Some(record) = store.read_record()? {
            info!(
                "Escalation marker found at {}: {} (since {})",
                store.path.display(),
                record.stage,
                record.updated_at
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> Result<Option<MarkerRecord>> {
        let _guard = self.guard()?;
        self.read_record()
    }

    /// Stage currently persisted, `None` when no marker exists.
    pub fn current(&self) -> Result<EscalationStage> {
        Ok(self.record()?.map(|r| r.stage).unwrap_or_default())
    }

    /// True when remediation has reached at least `stage`.
    pub fn has_marker(&self, stage: EscalationStage) -> Result<bool> {
        if stage == EscalationStage::None {
            return Ok(false);
        }
        Ok(self.current()? >= stage)
    }

    /// Persists `stage`. The record is on disk when this returns.
    pub fn set_marker(&self, stage: EscalationStage) -> Result<()> {
        if stage == EscalationStage::None {
            bail!("use clear_markers to reset escalation state");
        }
        let _guard = self.guard()?;
        let current = self.read_record()?.map(|r| r.stage).unwrap_or_default();
        if stage < current {
            bail!("refusing to move escalation stage back from {} to {}", current, stage);
        }

        let record = MarkerRecord {
            schema_version: MARKER_SCHEMA_VERSION,
            stage,
            updated_at: Utc::now(),
        };
        let raw = serde_json::to_string_pretty(&record)?;
        write_synced_atomic(&self.path, &raw)?;
        debug!("Escalation marker set to {} at {}", stage, self.path.display());
        Ok(())
    }

    pub fn clear_markers(&self) -> Result<()> {
        let _guard = self.guard()?;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                sync_parent_dir(&self.path)?;
                debug!("Escalation markers cleared at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("escalation marker lock poisoned"))
    }

    fn read_record(&self) -> Result<Option<MarkerRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read marker file {}", self.path.display()))
            }
        };
        let record: MarkerRecord = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse marker file {}", self.path.display()))?;
        if record.schema_version != MARKER_SCHEMA_VERSION {
            bail!(
                "unsupported escalation marker schema: expected {}, found {}",
                MARKER_SCHEMA_VERSION,
                record.schema_version
            );
        }
        Ok(Some(record))
    }
}

fn write_synced_atomic(path: &Path, content: &str) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = parent_dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("escalation_state"),
        std::process::id()
    ));
    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
            .with_context(|| format!("failed to flush {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!("failed to rename {} to {}", temp_path.display(), path.display())
    })?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    File::open(parent_dir)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("failed to flush directory {}", parent_dir.display()))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_means_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::open(dir.path().join("state.json")).unwrap();
        assert_eq!(store.current().unwrap(), EscalationStage::None);
        assert!(!store.has_marker(EscalationStage::RestartAttempted).unwrap());
    }

    #[test]
    fn test_markers_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = MarkerStore::open(&path).unwrap();
            store.set_marker(EscalationStage::RestartAttempted).unwrap();
        }

        let reopened = MarkerStore::open(&path).unwrap();
        assert_eq!(reopened.current().unwrap(), EscalationStage::RestartAttempted);
        assert!(reopened.has_marker(EscalationStage::RestartAttempted).unwrap());
        assert!(!reopened.has_marker(EscalationStage::HostRebootAttempted).unwrap());
    }

    #[test]
    fn test_later_stage_implies_earlier_markers() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::open(dir.path().join("state.json")).unwrap();
        store.set_marker(EscalationStage::HostRebootAttempted).unwrap();
        assert!(store.has_marker(EscalationStage::RestartAttempted).unwrap());
        assert!(store.has_marker(EscalationStage::HostRebootAttempted).unwrap());
    }

    #[test]
    fn test_stage_never_moves_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::open(dir.path().join("state.json")).unwrap();
        store.set_marker(EscalationStage::Exhausted).unwrap();
        assert!(store.set_marker(EscalationStage::RestartAttempted).is_err());
        assert!(store.set_marker(EscalationStage::None).is_err());
        assert_eq!(store.current().unwrap(), EscalationStage::Exhausted);
    }

    #[test]
    fn test_clear_resets_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = MarkerStore::open(&path).unwrap();
        store.set_marker(EscalationStage::RestartAttempted).unwrap();
        store.clear_markers().unwrap();
        assert!(!path.exists());
        assert_eq!(store.current().unwrap(), EscalationStage::None);
        store.clear_markers().unwrap();
    }

    #[test]
    fn test_file_format_is_inspectable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = MarkerStore::open(&path).unwrap();
        store.set_marker(EscalationStage::HostRebootAttempted).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], 1);
        assert_eq!(raw["stage"], "host_reboot_attempted");
        assert!(raw["updated_at"].is_string());
        // No temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "stage_2").unwrap();
        assert!(MarkerStore::open(&path).is_err());
    }
}
