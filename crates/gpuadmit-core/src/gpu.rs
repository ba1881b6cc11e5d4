//! Device identities and GPU detection

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{AdmitError, AdmitResult};

/// Identity of a schedulable device
///
/// GPUs are addressed by their driver index; the CPU is a single sentinel
/// device whose capacity comes from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceId {
    Gpu(u32),
    Cpu,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceId::Gpu(index) => write!(f, "gpu:{}", index),
            DeviceId::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = AdmitError;

    fn from_str(s: &str) -> AdmitResult<Self> {
        if s == "cpu" {
            return Ok(DeviceId::Cpu);
        }
        s.strip_prefix("gpu:")
            .and_then(|index| index.parse().ok())
            .map(DeviceId::Gpu)
            .ok_or_else(|| AdmitError::Validation(format!("Malformed device id: {}", s)))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = AdmitError;

    fn try_from(value: String) -> AdmitResult<Self> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

/// Represents a GPU device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index
    pub index: u32,
    /// Device name
    pub name: String,
    /// Total memory in bytes
    pub memory_total: u64,
    /// GPU vendor
    pub vendor: GpuVendor,
}

impl GpuDevice {
    pub fn id(&self) -> DeviceId {
        DeviceId::Gpu(self.index)
    }
}

/// GPU vendor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// GPU information for the system
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuInfo {
    /// List of detected GPU devices
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    /// Create empty GPU info (no GPUs detected)
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    pub fn total_count(&self) -> u32 {
        self.devices.len() as u32
    }
}

/// Detect GPUs on the system
///
/// On Linux/Windows this queries `nvidia-smi`; a missing driver simply
/// yields no GPUs. On macOS a single Apple Silicon GPU is reported.
pub fn detect_gpus() -> GpuInfo {
    #[cfg(target_os = "macos")]
    {
        detect_apple_gpus()
    }

    #[cfg(not(target_os = "macos"))]
    {
        detect_nvidia_gpus().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "No NVIDIA GPUs detected");
            GpuInfo::empty()
        })
    }
}

/// Detect Apple Silicon GPUs (macOS only)
#[cfg(target_os = "macos")]
fn detect_apple_gpus() -> GpuInfo {
    // Unified memory; the size is not meaningful for slot accounting
    let device = GpuDevice {
        index: 0,
        name: "Apple Silicon GPU".to_string(),
        memory_total: 0,
        vendor: GpuVendor::Apple,
    };

    GpuInfo {
        devices: vec![device],
    }
}

/// Detect NVIDIA GPUs via `nvidia-smi`
#[cfg(not(target_os = "macos"))]
fn detect_nvidia_gpus() -> AdmitResult<GpuInfo> {
    let output = std::process::Command::new("nvidia-smi")
        .arg("--query-gpu=index,name,memory.total")
        .arg("--format=csv,noheader,nounits")
        .output()
        .map_err(|e| AdmitError::Gpu(format!("Failed to run nvidia-smi: {}", e)))?;

    if !output.status.success() {
        return Err(AdmitError::Gpu(format!(
            "nvidia-smi exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(GpuInfo {
        devices: parse_nvidia_smi(&stdout),
    })
}

/// Parse `index, name, memory.total [MiB]` CSV rows; malformed rows are skipped
pub fn parse_nvidia_smi(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_string();
            let mib: u64 = fields.next()?.parse().ok()?;
            Some(GpuDevice {
                index,
                name,
                memory_total: mib * 1024 * 1024,
                vendor: GpuVendor::Nvidia,
            })
        })
        .collect()
}
