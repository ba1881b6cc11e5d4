//! Task registry: the authoritative record of every job

use chrono::{DateTime, Utc};
use gpuadmit_core::{AdmitError, AdmitResult, DeviceId, Job, JobCategory, JobStatus};
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Owns job records and the queue of waiting jobs
#[derive(Debug, Default)]
pub struct TaskRegistry {
    jobs: HashMap<Uuid, Job>,
    /// Submission payloads, held until the job is dispatched
    payloads: HashMap<Uuid, serde_json::Value>,
    /// Ids of queued jobs in submission order
    queue: Vec<Uuid>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted job
    pub fn insert(&mut self, job: Job, payload: serde_json::Value) {
        let id = job.id;
        if job.status == JobStatus::Queued {
            self.queue.push(id);
            self.payloads.insert(id, payload);
        }
        self.jobs.insert(id, job);
    }

    /// Get a job by ID
    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// All jobs in submission order
    pub fn list(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.sequence);
        jobs
    }

    /// Jobs with the given status, in submission order
    pub fn list_by_status(&self, status: JobStatus) -> Vec<&Job> {
        self.list()
            .into_iter()
            .filter(|j| j.status == status)
            .collect()
    }

    /// Jobs owned by a context, in submission order
    pub fn list_by_context(&self, context_id: &str) -> Vec<&Job> {
        self.list()
            .into_iter()
            .filter(|j| j.context_id == context_id)
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queued jobs in the order they would be dequeued
    pub fn queue_order(&self) -> Vec<&Job> {
        let mut queued: Vec<&Job> = self.queue.iter().filter_map(|id| self.jobs.get(id)).collect();
        queued.sort_by_key(|j| (Reverse(j.rank), j.sequence));
        queued
    }

    /// Categories that currently have queued jobs
    pub fn queued_categories(&self) -> Vec<&JobCategory> {
        let mut categories: Vec<&JobCategory> = self
            .queue
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|j| &j.category)
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Number of jobs holding a slot on the device
    pub fn running_on(&self, device: DeviceId) -> u32 {
        self.jobs
            .values()
            .filter(|j| j.status.occupies_slot() && j.device == Some(device))
            .count() as u32
    }

    /// Best queued job accepted by `ready`: highest rank, then earliest submission
    pub fn next_candidate<F>(&self, ready: F) -> Option<Uuid>
    where
        F: Fn(&Job) -> bool,
    {
        self.queue
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| ready(j))
            .min_by_key(|j| (Reverse(j.rank), j.sequence))
            .map(|j| j.id)
    }

    /// Recompute the rank of every queued job; running jobs keep theirs
    pub fn rerank<F>(&mut self, rank_of: F)
    where
        F: Fn(&JobCategory) -> Option<u32>,
    {
        for id in &self.queue {
            if let Some(job) = self.jobs.get_mut(id) {
                if let Some(rank) = rank_of(&job.category) {
                    job.rank = rank;
                }
            }
        }
    }

    fn transition(&mut self, id: &Uuid, next: JobStatus) -> AdmitResult<&mut Job> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| AdmitError::TaskNotFound(id.to_string()))?;
        let was_queued = job.status == JobStatus::Queued;
        job.transition(next)?;

        if was_queued {
            self.queue.retain(|queued| queued != id);
        }
        Ok(job)
    }

    /// Move a queued job onto a device; returns its payload for dispatch
    pub fn start(&mut self, id: &Uuid, device: DeviceId) -> AdmitResult<serde_json::Value> {
        self.transition(id, JobStatus::Running)?.device = Some(device);
        Ok(self.payloads.remove(id).unwrap_or(serde_json::Value::Null))
    }

    /// Cancel a queued job, or finish cancelling a running one
    pub fn mark_cancelled(&mut self, id: &Uuid) -> AdmitResult<()> {
        self.transition(id, JobStatus::Cancelled)?;
        self.payloads.remove(id);
        Ok(())
    }

    /// Running job asked to stop
    pub fn mark_cancelling(&mut self, id: &Uuid) -> AdmitResult<()> {
        self.transition(id, JobStatus::Cancelling).map(|_| ())
    }

    pub fn complete(&mut self, id: &Uuid, result: Option<serde_json::Value>) -> AdmitResult<()> {
        let job = self.transition(id, JobStatus::Done)?;
        job.result = result;
        job.progress = Some(100);
        Ok(())
    }

    pub fn fail(&mut self, id: &Uuid, message: String) -> AdmitResult<()> {
        self.transition(id, JobStatus::Failed)?.error = Some(message);
        Ok(())
    }

    /// Record worker progress; returns false when the report was ignored
    ///
    /// Only jobs holding a slot have a worker that can report.
    pub fn apply_progress(&mut self, id: &Uuid, progress: u8) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status.occupies_slot() => {
                job.progress = Some(progress.min(100));
                true
            }
            _ => {
                debug!(task_id = %id, "Ignoring progress for task without a worker");
                false
            }
        }
    }

    /// Remove terminal jobs that finished before `cutoff`
    pub fn purge_finished(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.map_or(false, |t| t < cutoff))
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuadmit_core::ResourceClass;

    fn job(category: JobCategory, rank: u32, sequence: u64) -> Job {
        Job::new(
            category,
            ResourceClass::Gpu,
            rank,
            "project-1".to_string(),
            sequence,
        )
    }

    #[test]
    fn test_insert_and_queue() {
        let mut registry = TaskRegistry::new();
        let first = job(JobCategory::Chat, 1, 0);
        let id = first.id;
        registry.insert(first, serde_json::json!({"prompt": "hi"}));
        registry.insert(job(JobCategory::Chat, 1, 1), serde_json::Value::Null);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.queue_len(), 2);
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Queued);
        assert_eq!(registry.list_by_status(JobStatus::Queued).len(), 2);
    }

    #[test]
    fn test_next_candidate_rank_then_fifo() {
        let mut registry = TaskRegistry::new();
        let low = job(JobCategory::Chat, 1, 0);
        let high_a = job(JobCategory::Transcription, 6, 1);
        let high_b = job(JobCategory::Transcription, 6, 2);
        let (low_id, a_id, b_id) = (low.id, high_a.id, high_b.id);
        registry.insert(low, serde_json::Value::Null);
        registry.insert(high_b, serde_json::Value::Null);
        registry.insert(high_a, serde_json::Value::Null);

        assert_eq!(registry.next_candidate(|_| true), Some(a_id));
        registry.start(&a_id, DeviceId::Gpu(0)).unwrap();
        assert_eq!(registry.next_candidate(|_| true), Some(b_id));
        assert_eq!(
            registry.next_candidate(|j| j.category == JobCategory::Chat),
            Some(low_id)
        );

        let order: Vec<Uuid> = registry.queue_order().iter().map(|j| j.id).collect();
        assert_eq!(order, vec![b_id, low_id]);
    }

    #[test]
    fn test_start_assigns_device_and_takes_payload() {
        let mut registry = TaskRegistry::new();
        let j = job(JobCategory::Diarization, 5, 0);
        let id = j.id;
        registry.insert(j, serde_json::json!({"file": "a.wav"}));

        let payload = registry.start(&id, DeviceId::Gpu(1)).unwrap();
        assert_eq!(payload, serde_json::json!({"file": "a.wav"}));
        assert_eq!(registry.queue_len(), 0);
        assert_eq!(registry.running_on(DeviceId::Gpu(1)), 1);
        assert_eq!(registry.running_on(DeviceId::Gpu(0)), 0);

        registry.mark_cancelling(&id).unwrap();
        assert_eq!(registry.running_on(DeviceId::Gpu(1)), 1);

        registry.mark_cancelled(&id).unwrap();
        assert_eq!(registry.running_on(DeviceId::Gpu(1)), 0);
        assert!(registry.get(&id).unwrap().device.is_none());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut registry = TaskRegistry::new();
        let j = job(JobCategory::Chat, 1, 0);
        let id = j.id;
        registry.insert(j, serde_json::Value::Null);
        registry.start(&id, DeviceId::Cpu).unwrap();
        registry.fail(&id, "worker crashed".to_string()).unwrap();

        assert!(registry.complete(&id, None).is_err());
        assert!(registry.mark_cancelled(&id).is_err());
        assert!(!registry.apply_progress(&id, 50));
        assert_eq!(
            registry.get(&id).unwrap().error.as_deref(),
            Some("worker crashed")
        );
    }

    #[test]
    fn test_progress_unknown_task_ignored() {
        let mut registry = TaskRegistry::new();
        assert!(!registry.apply_progress(&Uuid::new_v4(), 10));

        let j = job(JobCategory::Chat, 1, 0);
        let id = j.id;
        registry.insert(j, serde_json::Value::Null);
        assert!(!registry.apply_progress(&id, 30));
        assert!(registry.get(&id).unwrap().progress.is_none());

        registry.start(&id, DeviceId::Gpu(0)).unwrap();
        assert!(registry.apply_progress(&id, 70));
        assert!(registry.apply_progress(&id, 40));
        assert_eq!(registry.get(&id).unwrap().progress, Some(40));
    }

    #[test]
    fn test_rerank_only_touches_queued() {
        let mut registry = TaskRegistry::new();
        let running = job(JobCategory::Chat, 1, 0);
        let queued = job(JobCategory::Chat, 1, 1);
        let (running_id, queued_id) = (running.id, queued.id);
        registry.insert(running, serde_json::Value::Null);
        registry.insert(queued, serde_json::Value::Null);
        registry.start(&running_id, DeviceId::Gpu(0)).unwrap();

        registry.rerank(|c| (*c == JobCategory::Chat).then_some(9));
        assert_eq!(registry.get(&running_id).unwrap().rank, 1);
        assert_eq!(registry.get(&queued_id).unwrap().rank, 9);
    }

    #[test]
    fn test_purge_finished() {
        let mut registry = TaskRegistry::new();
        let done = job(JobCategory::Chat, 1, 0);
        let queued = job(JobCategory::Chat, 1, 1);
        let done_id = done.id;
        registry.insert(done, serde_json::Value::Null);
        registry.insert(queued, serde_json::Value::Null);
        registry.start(&done_id, DeviceId::Gpu(0)).unwrap();
        registry.complete(&done_id, None).unwrap();

        assert_eq!(registry.purge_finished(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(registry.purge_finished(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.queue_len(), 1);
    }
}
