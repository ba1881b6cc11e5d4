//! Admission controller
//!
//! All scheduler state sits behind one mutex. Every operation takes the
//! lock, mutates, and ends with a scheduling pass if it could have freed or
//! occupied a slot. Worker reports arrive on a channel and are applied by a
//! background task under the same lock.

use chrono::Utc;
use gpuadmit_core::{
    detect_gpus, AdmitError, AdmitResult, ConfigUpdate, DeviceId, GpuInfo, Job, JobCategory,
    JobStatus, ResourceClass, SchedulerConfig, SchedulerSettings,
};
use gpuadmit_runtime::{JobLaunch, Runtime, WorkerEvent, WorkerEventKind, WorkerEvents};
use gpuadmit_store::{PersistedSettings, SettingsStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inventory::{DeviceInventory, DeviceStatus};
use crate::placement::{LeastLoadedPlacement, PlacementStrategy};
use crate::priority::{CategoryRank, PriorityTable};
use crate::registry::TaskRegistry;

/// Request to submit a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub category: JobCategory,
    #[serde(default)]
    pub resource_class: ResourceClass,
    /// Owning context, opaque to the scheduler
    #[serde(default)]
    pub context_id: String,
    /// Opaque payload handed to the worker
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SubmitRequest {
    pub fn new(category: JobCategory, resource_class: ResourceClass) -> Self {
        Self {
            category,
            resource_class,
            context_id: String::new(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Filter for job listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub context_id: Option<String>,
}

/// Snapshot of scheduler state for status surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub devices: Vec<DeviceStatus>,
    pub queue_size: usize,
    pub config: SchedulerSettings,
    pub priorities: Vec<CategoryRank>,
}

/// Startup options for the controller
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Initial capacity settings, overridden by persisted settings
    pub settings: SchedulerSettings,
    /// Initial priority order, overridden by persisted settings
    pub priority_order: Vec<JobCategory>,
    /// How long a cancelled job may hold its slot without acknowledgement
    pub cancel_grace: Duration,
    pub cpu_fallback: bool,
    pub gpus: GpuInfo,
}

impl ControllerOptions {
    /// Build options from the config file section; invalid values are an error
    pub fn from_config(config: &SchedulerConfig, gpus: GpuInfo) -> AdmitResult<Self> {
        Ok(Self {
            settings: config.settings()?,
            priority_order: config.priority_order.clone(),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
            cpu_fallback: config.cpu_fallback,
            gpus,
        })
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        let config = SchedulerConfig::default();
        Self {
            settings: SchedulerSettings::default(),
            priority_order: config.priority_order,
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
            cpu_fallback: config.cpu_fallback,
            gpus: GpuInfo::empty(),
        }
    }
}

struct SchedulerState {
    registry: TaskRegistry,
    inventory: DeviceInventory,
    priorities: PriorityTable,
    settings: SchedulerSettings,
    next_sequence: u64,
}

struct Inner {
    state: Mutex<SchedulerState>,
    runtime: Arc<dyn Runtime>,
    store: Arc<dyn SettingsStore>,
    placement: Arc<dyn PlacementStrategy>,
    events: WorkerEvents,
    cancel_grace: Duration,
}

/// The scheduler: decides when and where submitted jobs start
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    /// Create a controller and start its worker event loop
    ///
    /// Settings found in the store take precedence over `options`.
    pub async fn new(
        options: ControllerOptions,
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn SettingsStore>,
    ) -> AdmitResult<Self> {
        let (settings, order) = match store.load().await? {
            Some(saved) => {
                info!("Restoring persisted scheduler settings");
                (saved.scheduler.clamped()?, saved.priority_order)
            }
            None => (options.settings, options.priority_order),
        };
        let priorities = PriorityTable::new(order)?;
        let inventory = DeviceInventory::new(options.gpus, options.cpu_fallback);

        info!(
            gpus = inventory.gpu_count(),
            gpu_slots_per_device = settings.gpu_slots_per_device,
            cpu_slots = settings.cpu_slots,
            runtime = runtime.name(),
            "Admission controller initialized"
        );

        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(SchedulerState {
                registry: TaskRegistry::new(),
                inventory,
                priorities,
                settings,
                next_sequence: 0,
            }),
            runtime,
            store,
            placement: Arc::new(LeastLoadedPlacement),
            events,
            cancel_grace: options.cancel_grace,
        });

        spawn_event_loop(Arc::downgrade(&inner), receiver);

        Ok(Self { inner })
    }

    /// Queue a job and try to start it; returns the task id
    pub async fn submit(&self, request: SubmitRequest) -> AdmitResult<Uuid> {
        let mut state = self.inner.state.lock().await;

        let rank = state
            .priorities
            .rank(&request.category)
            .ok_or_else(|| AdmitError::UnknownCategory(request.category.to_string()))?;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let job = Job::new(
            request.category,
            request.resource_class,
            rank,
            request.context_id,
            sequence,
        );
        let id = job.id;

        info!(
            task_id = %id,
            category = %job.category,
            resource_class = %job.resource_class,
            rank = rank,
            "Job submitted"
        );

        state.registry.insert(job, request.payload);
        self.schedule(&mut state).await;

        Ok(id)
    }

    /// Start queued jobs while any of them has a free slot
    ///
    /// Returns the number of jobs handed to the runtime.
    async fn schedule(&self, state: &mut SchedulerState) -> usize {
        let mut started = 0;

        loop {
            let gpu_target = self.target(state, ResourceClass::Gpu);
            let cpu_target = self.target(state, ResourceClass::Cpu);
            let target_for = |class: ResourceClass| match class {
                ResourceClass::Gpu => gpu_target,
                ResourceClass::Cpu => cpu_target,
            };

            let candidate = state
                .registry
                .next_candidate(|job| target_for(job.resource_class).is_some())
                .and_then(|id| state.registry.get(&id))
                .map(|job| (job.id, job.category.clone(), job.resource_class));

            let Some((id, category, class)) = candidate else {
                break;
            };
            let Some(device) = target_for(class) else {
                break;
            };

            let payload = match state.registry.start(&id, device) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(task_id = %id, error = %e, "Failed to start queued job");
                    break;
                }
            };

            let launch = JobLaunch {
                task_id: id,
                category: category.clone(),
                device,
                memory_fraction: state.settings.memory_fraction,
                payload,
            };

            match self.inner.runtime.start(launch, self.inner.events.clone()).await {
                Ok(()) => {
                    started += 1;
                    info!(
                        task_id = %id,
                        category = %category,
                        device = %device,
                        "Job started"
                    );
                }
                Err(e) => {
                    error!(task_id = %id, error = %e, "Worker hand-off failed");
                    if let Err(e) = state.registry.fail(&id, e.to_string()) {
                        error!(task_id = %id, error = %e, "Failed to record hand-off failure");
                    }
                }
            }
        }

        if started > 0 {
            debug!(
                started = started,
                queued = state.registry.queue_len(),
                "Scheduling pass complete"
            );
        }

        started
    }

    /// Device the next job of this class would start on, if any
    fn target(&self, state: &SchedulerState, class: ResourceClass) -> Option<DeviceId> {
        let loads = state
            .inventory
            .loads(class, &state.registry, &state.settings);
        self.inner.placement.place(&loads)
    }

    /// Cancel a job; returns its status after the request
    ///
    /// Queued jobs are cancelled at once. Running jobs move to `cancelling`
    /// until the worker acknowledges or the grace period runs out. Finished
    /// jobs are left alone.
    pub async fn cancel(&self, task_id: Uuid) -> AdmitResult<JobStatus> {
        let mut state = self.inner.state.lock().await;

        let status = state
            .registry
            .get(&task_id)
            .map(|j| j.status)
            .ok_or_else(|| AdmitError::TaskNotFound(task_id.to_string()))?;

        match status {
            JobStatus::Queued => {
                state.registry.mark_cancelled(&task_id)?;
                info!(task_id = %task_id, "Queued job cancelled");
            }
            JobStatus::Running => {
                state.registry.mark_cancelling(&task_id)?;
                info!(
                    task_id = %task_id,
                    grace_secs = self.inner.cancel_grace.as_secs_f64(),
                    "Cancelling running job"
                );
                if let Err(e) = self.inner.runtime.stop(task_id).await {
                    warn!(task_id = %task_id, error = %e, "Failed to signal worker to stop");
                }
                self.spawn_grace_timer(task_id);
            }
            _ => debug!(task_id = %task_id, status = %status, "Cancel ignored"),
        }

        Ok(state
            .registry
            .get(&task_id)
            .map(|j| j.status)
            .unwrap_or(status))
    }

    fn spawn_grace_timer(&self, task_id: Uuid) {
        let inner = Arc::downgrade(&self.inner);
        let grace = self.inner.cancel_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = inner.upgrade() {
                AdmissionController { inner }.expire_cancel(task_id).await;
            }
        });
    }

    /// Force a job still in `cancelling` to `cancelled` and reclaim its slot
    async fn expire_cancel(&self, task_id: Uuid) {
        let mut state = self.inner.state.lock().await;

        if state.registry.get(&task_id).map(|j| j.status) != Some(JobStatus::Cancelling) {
            return;
        }

        warn!(
            task_id = %task_id,
            grace_secs = self.inner.cancel_grace.as_secs_f64(),
            "Worker did not acknowledge cancellation, reclaiming slot"
        );

        if let Err(e) = state.registry.mark_cancelled(&task_id) {
            error!(task_id = %task_id, error = %e, "Failed to force cancellation");
            return;
        }
        self.schedule(&mut state).await;
    }

    /// Apply a report from the worker boundary
    ///
    /// Reports for unknown or finished tasks are ignored; a worker may
    /// still be talking about a job the controller already gave up on.
    pub async fn handle_event(&self, event: WorkerEvent) {
        let WorkerEvent { task_id, kind } = event;
        let mut state = self.inner.state.lock().await;

        let Some(status) = state.registry.get(&task_id).map(|j| j.status) else {
            warn!(task_id = %task_id, "Ignoring report for unknown task");
            return;
        };

        let freed: AdmitResult<bool> = match (kind, status) {
            (WorkerEventKind::Progress(progress), _) => {
                state.registry.apply_progress(&task_id, progress);
                Ok(false)
            }
            (_, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled) => {
                debug!(task_id = %task_id, status = %status, "Ignoring report for finished task");
                Ok(false)
            }
            (_, JobStatus::Queued) => {
                warn!(task_id = %task_id, "Ignoring report for a job that never started");
                Ok(false)
            }
            (_, JobStatus::Cancelling) => {
                info!(task_id = %task_id, "Worker acknowledged cancellation");
                state.registry.mark_cancelled(&task_id).map(|_| true)
            }
            (WorkerEventKind::Completed(result), JobStatus::Running) => {
                info!(task_id = %task_id, "Job completed");
                state.registry.complete(&task_id, result).map(|_| true)
            }
            (WorkerEventKind::Failed(message), JobStatus::Running) => {
                warn!(task_id = %task_id, error = %message, "Job failed");
                state.registry.fail(&task_id, message).map(|_| true)
            }
            (WorkerEventKind::Stopped, JobStatus::Running) => {
                warn!(task_id = %task_id, "Worker stopped without a cancel request");
                state
                    .registry
                    .fail(&task_id, "Worker stopped unexpectedly".to_string())
                    .map(|_| true)
            }
        };

        match freed {
            Ok(true) => {
                self.schedule(&mut state).await;
            }
            Ok(false) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to apply worker report"),
        }
    }

    /// Validate, clamp, persist and apply a configuration change
    ///
    /// Running jobs are never preempted; lowered slot counts only take
    /// effect as jobs finish.
    pub async fn update_config(&self, update: ConfigUpdate) -> AdmitResult<SchedulerSettings> {
        let mut state = self.inner.state.lock().await;

        let (next, fields) = state.settings.apply(&update)?;
        if fields.is_empty() {
            return Ok(state.settings);
        }

        let document = PersistedSettings {
            scheduler: next,
            priority_order: state.priorities.order().to_vec(),
        };
        if let Err(e) = self.inner.store.save(&document).await {
            warn!(error = %e, fields = ?fields, "Failed to persist configuration, keeping previous values");
            return Err(AdmitError::Persistence {
                fields,
                reason: e.to_string(),
            });
        }

        state.settings = next;
        info!(
            memory_fraction = next.memory_fraction,
            gpu_slots_per_device = next.gpu_slots_per_device,
            cpu_slots = next.cpu_slots,
            "Configuration updated"
        );

        self.schedule(&mut state).await;
        Ok(next)
    }

    /// Replace the priority order; returns the resulting rank table
    ///
    /// Queued jobs are re-ranked, running jobs keep their rank.
    pub async fn set_priority_order(
        &self,
        order: Vec<JobCategory>,
    ) -> AdmitResult<Vec<CategoryRank>> {
        let mut state = self.inner.state.lock().await;

        let table = PriorityTable::new(order)?;
        let missing: Vec<String> = state
            .registry
            .queued_categories()
            .into_iter()
            .filter(|c| !table.contains(c))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AdmitError::Validation(format!(
                "Priority order drops categories with queued jobs: {}",
                missing.join(", ")
            )));
        }

        let document = PersistedSettings {
            scheduler: state.settings,
            priority_order: table.order().to_vec(),
        };
        if let Err(e) = self.inner.store.save(&document).await {
            warn!(error = %e, "Failed to persist priority order, keeping previous order");
            return Err(AdmitError::Persistence {
                fields: vec!["priority_order".to_string()],
                reason: e.to_string(),
            });
        }

        state.registry.rerank(|c| table.rank(c));
        state.priorities = table;
        let ranks = state.priorities.ranks();

        info!(order = ?state.priorities.order(), "Priority order updated");

        self.schedule(&mut state).await;
        Ok(ranks)
    }

    /// Re-detect GPUs and schedule against the new inventory
    pub async fn refresh_devices(&self) -> AdmitResult<Vec<DeviceStatus>> {
        let gpu_info = tokio::task::spawn_blocking(detect_gpus)
            .await
            .map_err(|e| AdmitError::Gpu(format!("GPU detection task failed: {}", e)))?;
        Ok(self.set_devices(gpu_info).await)
    }

    /// Replace the GPU inventory with the given devices
    pub async fn set_devices(&self, gpu_info: GpuInfo) -> Vec<DeviceStatus> {
        let mut state = self.inner.state.lock().await;
        state.inventory.refresh(gpu_info);
        self.schedule(&mut state).await;
        state.inventory.status(&state.registry, &state.settings)
    }

    /// Remove finished jobs older than `max_age`; returns how many were removed
    pub async fn purge_finished(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::days(36500));
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let mut state = self.inner.state.lock().await;
        let purged = state.registry.purge_finished(cutoff);
        if purged > 0 {
            info!(purged = purged, remaining = state.registry.len(), "Purged finished jobs");
        }
        purged
    }

    /// Get a job by id
    pub async fn job(&self, task_id: Uuid) -> AdmitResult<Job> {
        let state = self.inner.state.lock().await;
        state
            .registry
            .get(&task_id)
            .cloned()
            .ok_or_else(|| AdmitError::TaskNotFound(task_id.to_string()))
    }

    /// List jobs in submission order
    pub async fn jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.inner.state.lock().await;
        let jobs = match (&filter.context_id, filter.status) {
            (Some(context_id), _) => state.registry.list_by_context(context_id),
            (None, Some(status)) => state.registry.list_by_status(status),
            (None, None) => state.registry.list(),
        };
        jobs.into_iter()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect()
    }

    /// Queued jobs in the order they will be started
    pub async fn queue_order(&self) -> Vec<Job> {
        let state = self.inner.state.lock().await;
        state.registry.queue_order().into_iter().cloned().collect()
    }

    /// Current effective configuration
    pub async fn config(&self) -> SchedulerSettings {
        self.inner.state.lock().await.settings
    }

    /// Current rank table
    pub async fn priorities(&self) -> Vec<CategoryRank> {
        self.inner.state.lock().await.priorities.ranks()
    }

    /// Devices, queue size, configuration and ranks in one snapshot
    pub async fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock().await;
        SchedulerStatus {
            devices: state.inventory.status(&state.registry, &state.settings),
            queue_size: state.registry.queue_len(),
            config: state.settings,
            priorities: state.priorities.ranks(),
        }
    }
}

fn spawn_event_loop(inner: Weak<Inner>, mut receiver: mpsc::UnboundedReceiver<WorkerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            AdmissionController { inner }.handle_event(event).await;
        }
        debug!("Worker event loop stopped");
    });
}
