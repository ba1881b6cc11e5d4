//! Runtime trait definitions

use async_trait::async_trait;
use gpuadmit_core::{AdmitResult, DeviceId, JobCategory};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything a worker needs to start a job
#[derive(Debug, Clone)]
pub struct JobLaunch {
    pub task_id: Uuid,
    pub category: JobCategory,
    pub device: DeviceId,
    /// Advisory per-job memory ceiling as a fraction of device memory
    pub memory_fraction: f64,
    /// Opaque submission payload
    pub payload: serde_json::Value,
}

/// Notification from a worker, keyed by task id
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub task_id: Uuid,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// Progress percentage; expected but not required to be non-decreasing
    Progress(u8),
    /// Finished successfully with an optional opaque result
    Completed(Option<serde_json::Value>),
    /// Finished with a diagnostic message
    Failed(String),
    /// Acknowledges a stop request
    Stopped,
}

impl WorkerEvent {
    pub fn new(task_id: Uuid, kind: WorkerEventKind) -> Self {
        Self { task_id, kind }
    }
}

/// Channel on which workers report back to the scheduler
pub type WorkerEvents = mpsc::UnboundedSender<WorkerEvent>;

/// Runtime trait for executing jobs outside the scheduler
///
/// `start` must return as soon as the job has been handed off; completion
/// is reported through the events channel.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a job
    async fn start(&self, launch: JobLaunch, events: WorkerEvents) -> AdmitResult<()>;

    /// Ask a running job to stop; acknowledged with `WorkerEventKind::Stopped`
    async fn stop(&self, task_id: Uuid) -> AdmitResult<()>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
