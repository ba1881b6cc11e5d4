//! Configuration types for gpuadmit

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{AdmitError, AdmitResult, JobCategory};

/// Lowest memory fraction a worker may be told to use
pub const MIN_MEMORY_FRACTION: f64 = 0.05;
/// Highest memory fraction a worker may be told to use
pub const MAX_MEMORY_FRACTION: f64 = 0.99;
/// Upper bound for any per-device slot count
pub const MAX_SLOTS: u32 = 64;

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Worker runtime configuration
    pub runtime: RuntimeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Job retention configuration
    pub retention: RetentionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> AdmitResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdmitError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| AdmitError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9290,
        }
    }
}

/// Scheduler configuration as read from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fraction of device memory a single job may use (advisory)
    pub memory_fraction: f64,
    /// Concurrent jobs per GPU
    pub gpu_slots_per_device: u32,
    /// Concurrent CPU jobs
    pub cpu_slots: u32,
    /// Seconds to wait for a worker to acknowledge cancellation
    pub cancel_grace_secs: u64,
    /// Run GPU-class jobs on the CPU when no GPU is present
    pub cpu_fallback: bool,
    /// Category priority order, highest first
    pub priority_order: Vec<JobCategory>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            memory_fraction: 0.9,
            gpu_slots_per_device: 1,
            cpu_slots: 2,
            cancel_grace_secs: 10,
            cpu_fallback: true,
            priority_order: JobCategory::default_order(),
        }
    }
}

impl SchedulerConfig {
    /// Runtime-mutable part of the configuration, clamped
    ///
    /// A non-finite memory fraction is an error; it never falls back to
    /// the defaults.
    pub fn settings(&self) -> AdmitResult<SchedulerSettings> {
        SchedulerSettings {
            memory_fraction: self.memory_fraction,
            gpu_slots_per_device: self.gpu_slots_per_device,
            cpu_slots: self.cpu_slots,
        }
        .clamped()
        .map_err(|e| AdmitError::Config(format!("[scheduler] {}", e)))
    }
}

/// Effective capacity settings, always within the clamped ranges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub memory_fraction: f64,
    pub gpu_slots_per_device: u32,
    pub cpu_slots: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            memory_fraction: 0.9,
            gpu_slots_per_device: 1,
            cpu_slots: 2,
        }
    }
}

/// Partial configuration update; absent fields keep their value
///
/// Slot counts are signed so that out-of-range input clamps instead of
/// failing to deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub memory_fraction: Option<f64>,
    #[serde(default)]
    pub gpu_slots_per_device: Option<i64>,
    #[serde(default)]
    pub cpu_slots: Option<i64>,
}

impl From<SchedulerSettings> for ConfigUpdate {
    fn from(settings: SchedulerSettings) -> Self {
        Self {
            memory_fraction: Some(settings.memory_fraction),
            gpu_slots_per_device: Some(settings.gpu_slots_per_device as i64),
            cpu_slots: Some(settings.cpu_slots as i64),
        }
    }
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.memory_fraction.is_none()
            && self.gpu_slots_per_device.is_none()
            && self.cpu_slots.is_none()
    }
}

impl SchedulerSettings {
    /// Re-validate settings that came from outside, such as a config file
    pub fn clamped(self) -> AdmitResult<Self> {
        SchedulerSettings::default()
            .apply(&ConfigUpdate::from(self))
            .map(|(settings, _)| settings)
    }

    /// Validate and clamp an update against these settings
    ///
    /// Returns the new settings and the names of the fields the update
    /// touched. A non-finite memory fraction is rejected outright.
    pub fn apply(&self, update: &ConfigUpdate) -> AdmitResult<(SchedulerSettings, Vec<String>)> {
        let mut next = *self;
        let mut fields = Vec::new();

        if let Some(fraction) = update.memory_fraction {
            if !fraction.is_finite() {
                return Err(AdmitError::Validation(format!(
                    "memory_fraction must be a finite number, got {}",
                    fraction
                )));
            }
            next.memory_fraction = fraction.clamp(MIN_MEMORY_FRACTION, MAX_MEMORY_FRACTION);
            fields.push("memory_fraction".to_string());
        }

        if let Some(slots) = update.gpu_slots_per_device {
            next.gpu_slots_per_device = clamp_slots(slots);
            fields.push("gpu_slots_per_device".to_string());
        }

        if let Some(slots) = update.cpu_slots {
            next.cpu_slots = clamp_slots(slots);
            fields.push("cpu_slots".to_string());
        }

        Ok((next, fields))
    }
}

fn clamp_slots(slots: i64) -> u32 {
    slots.clamp(1, MAX_SLOTS as i64) as u32
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker executable spawned once per job
    pub worker_command: PathBuf,
    /// Arguments passed before the category argument
    pub worker_args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_command: PathBuf::from("gpuadmit-worker"),
            worker_args: Vec::new(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// File holding persisted scheduler settings; in-memory when unset
    pub state_path: Option<PathBuf>,
}

/// Retention of finished jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age after which terminal jobs are purged
    pub max_age_secs: u64,
    /// Interval between sweeps
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 24 * 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
