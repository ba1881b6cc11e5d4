//! Job, category and lifecycle type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{AdmitError, AdmitResult, DeviceId};

/// Longest accepted category name
pub const MAX_CATEGORY_LEN: usize = 64;

/// Kind of work a job performs
///
/// The well-known ML workloads have their own variants; any other
/// well-formed name is carried as [`JobCategory::Custom`] and is only
/// schedulable once it appears in the priority order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobCategory {
    Transcription,
    Diarization,
    Translation,
    QuickAnalysis,
    DeepAnalysis,
    Chat,
    Custom(String),
}

impl JobCategory {
    /// Canonical name of the category
    pub fn as_str(&self) -> &str {
        match self {
            JobCategory::Transcription => "transcription",
            JobCategory::Diarization => "diarization",
            JobCategory::Translation => "translation",
            JobCategory::QuickAnalysis => "quick_analysis",
            JobCategory::DeepAnalysis => "deep_analysis",
            JobCategory::Chat => "chat",
            JobCategory::Custom(name) => name,
        }
    }

    /// Priority order used when nothing has been persisted yet
    pub fn default_order() -> Vec<JobCategory> {
        vec![
            JobCategory::Transcription,
            JobCategory::Diarization,
            JobCategory::Translation,
            JobCategory::QuickAnalysis,
            JobCategory::DeepAnalysis,
            JobCategory::Chat,
        ]
    }
}

impl FromStr for JobCategory {
    type Err = AdmitError;

    fn from_str(s: &str) -> AdmitResult<Self> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        let category = match name.as_str() {
            "transcription" => JobCategory::Transcription,
            "diarization" => JobCategory::Diarization,
            "translation" => JobCategory::Translation,
            "quick_analysis" => JobCategory::QuickAnalysis,
            "deep_analysis" => JobCategory::DeepAnalysis,
            "chat" => JobCategory::Chat,
            _ => {
                let well_formed = !name.is_empty()
                    && name.len() <= MAX_CATEGORY_LEN
                    && name
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
                if !well_formed {
                    return Err(AdmitError::Validation(format!(
                        "Malformed category name: {:?}",
                        s
                    )));
                }
                JobCategory::Custom(name)
            }
        };
        Ok(category)
    }
}

impl TryFrom<String> for JobCategory {
    type Error = AdmitError;

    fn try_from(value: String) -> AdmitResult<Self> {
        value.parse()
    }
}

impl From<JobCategory> for String {
    fn from(category: JobCategory) -> Self {
        category.as_str().to_string()
    }
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of device a job needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    #[default]
    Gpu,
    Cpu,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::Gpu => write!(f, "gpu"),
            ResourceClass::Cpu => write!(f, "cpu"),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a free slot
    Queued,
    /// Handed to a worker
    Running,
    /// Stop requested, waiting for the worker or the grace timer
    Cancelling,
    /// Worker reported success
    Done,
    /// Worker reported failure
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl JobStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a job in this state holds a device slot
    pub fn occupies_slot(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Cancelling)
    }

    /// Allowed edges of the lifecycle state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = AdmitError;

    fn from_str(s: &str) -> AdmitResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "cancelling" => Ok(JobStatus::Cancelling),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(AdmitError::Validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// A unit of work tracked by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique task identifier
    pub id: Uuid,
    /// Job category
    pub category: JobCategory,
    /// Device class required
    pub resource_class: ResourceClass,
    /// Priority rank, higher is served first
    pub rank: u32,
    /// Owning context (project id or similar), opaque to the scheduler
    pub context_id: String,
    /// Current status
    pub status: JobStatus,
    /// Assigned device, set while running or cancelling
    pub device: Option<DeviceId>,
    /// Last reported progress (0-100)
    pub progress: Option<u8>,
    /// Diagnostic for failed jobs
    pub error: Option<String>,
    /// Opaque result reported by the worker
    pub result: Option<serde_json::Value>,
    /// Submission sequence number, used as FIFO tie-break
    pub sequence: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the job was handed to a worker
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job
    pub fn new(
        category: JobCategory,
        resource_class: ResourceClass,
        rank: u32,
        context_id: String,
        sequence: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            resource_class,
            rank,
            context_id,
            status: JobStatus::Queued,
            device: None,
            progress: None,
            error: None,
            result: None,
            sequence,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job along the lifecycle state machine
    ///
    /// Keeps the device assignment consistent with the new state: leaving
    /// the slot-holding states clears the device.
    pub fn transition(&mut self, next: JobStatus) -> AdmitResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AdmitError::Internal(format!(
                "Illegal transition {} -> {} for task {}",
                self.status, next, self.id
            )));
        }

        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                self.device = None;
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse() {
        assert_eq!(
            "quick-analysis".parse::<JobCategory>().unwrap(),
            JobCategory::QuickAnalysis
        );
        assert_eq!("Chat".parse::<JobCategory>().unwrap(), JobCategory::Chat);
        assert_eq!(
            "summarize".parse::<JobCategory>().unwrap(),
            JobCategory::Custom("summarize".to_string())
        );
        assert!("".parse::<JobCategory>().is_err());
        assert!("drop table".parse::<JobCategory>().is_err());
    }

    #[test]
    fn test_category_serde_as_string() {
        let json = serde_json::to_string(&JobCategory::DeepAnalysis).unwrap();
        assert_eq!(json, "\"deep_analysis\"");
        let back: JobCategory = serde_json::from_str("\"diarization\"").unwrap();
        assert_eq!(back, JobCategory::Diarization);
        assert!(serde_json::from_str::<JobCategory>("\"no spaces\"").is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Done));
        assert!(!Cancelling.can_transition_to(Done));
        for terminal in [Done, Failed, Cancelled] {
            for next in [Queued, Running, Cancelling, Done, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_job_transition_clears_device() {
        let mut job = Job::new(
            JobCategory::Chat,
            ResourceClass::Gpu,
            1,
            "project-1".to_string(),
            0,
        );
        assert_eq!(job.status, JobStatus::Queued);

        job.transition(JobStatus::Running).unwrap();
        job.device = Some(DeviceId::Gpu(0));
        assert!(job.started_at.is_some());

        job.transition(JobStatus::Done).unwrap();
        assert!(job.device.is_none());
        assert!(job.finished_at.is_some());
        assert!(job.transition(JobStatus::Failed).is_err());
    }
}
