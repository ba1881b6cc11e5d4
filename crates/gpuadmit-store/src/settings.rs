//! Persisted scheduler settings

use async_trait::async_trait;
use gpuadmit_core::{AdmitError, AdmitResult, JobCategory, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// The document written on every configuration or priority change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    /// Capacity settings
    pub scheduler: SchedulerSettings,
    /// Category priority order, highest first
    pub priority_order: Vec<JobCategory>,
}

/// Durable home for scheduler settings
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load previously saved settings, `None` if nothing was saved yet
    async fn load(&self) -> AdmitResult<Option<PersistedSettings>>;

    /// Save settings; on error the previous document must remain intact
    async fn save(&self, settings: &PersistedSettings) -> AdmitResult<()>;
}

/// JSON file store
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "settings".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> AdmitResult<Option<PersistedSettings>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted settings");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let settings = serde_json::from_slice(&content)?;
        info!(path = %self.path.display(), "Loaded persisted settings");
        Ok(Some(settings))
    }

    async fn save(&self, settings: &PersistedSettings) -> AdmitResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write-then-rename so a failed write never truncates the old file
        let temp = self.temp_path();
        let content = serde_json::to_vec_pretty(settings)?;
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}

/// In-memory store, used when no state path is configured
#[derive(Default)]
pub struct MemorySettingsStore {
    saved: RwLock<Option<PersistedSettings>>,
    fail_writes: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail, as a full or read-only disk would
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn saved(&self) -> Option<PersistedSettings> {
        self.saved.read().await.clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> AdmitResult<Option<PersistedSettings>> {
        Ok(self.saved.read().await.clone())
    }

    async fn save(&self, settings: &PersistedSettings) -> AdmitResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AdmitError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "settings store rejected the write",
            )));
        }
        *self.saved.write().await = Some(settings.clone());
        Ok(())
    }
}
