//! CLI commands implementation

use anyhow::{Context, Result};
use gpuadmit_core::{ConfigUpdate, Job, JobStatus, SchedulerSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Submit response from API
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
}

/// Cancel response from API
#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
}

/// Device occupancy
#[derive(Debug, Deserialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub memory_total: u64,
    pub slots: u32,
    pub running: u32,
}

/// Category rank
#[derive(Debug, Deserialize)]
pub struct CategoryRank {
    pub category: String,
    pub rank: u32,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub devices: Vec<DeviceStatus>,
    pub queue_size: usize,
    pub config: SchedulerSettings,
    pub priorities: Vec<CategoryRank>,
}

/// Submit a job
pub async fn submit(
    client: &ApiClient,
    category: String,
    cpu: bool,
    context: String,
    payload: Option<String>,
) -> Result<()> {
    #[derive(Serialize)]
    struct SubmitRequest {
        category: String,
        resource_class: &'static str,
        context_id: String,
        payload: serde_json::Value,
    }

    let req = SubmitRequest {
        category: category.clone(),
        resource_class: if cpu { "cpu" } else { "gpu" },
        context_id: context,
        payload: parse_payload(payload.as_deref())?,
    };

    let response = client
        .client
        .post(client.url("/api/v1/jobs"))
        .json(&req)
        .send()
        .await?;

    if response.status().is_success() {
        let submitted: SubmitResponse = response.json().await?;
        println!("Job submitted");
        println!("  ID: {}", submitted.task_id);
        println!("  Category: {}", category);
        println!("  Status: {}", submitted.status);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to submit job: {}", error);
    }

    Ok(())
}

/// Cancel a job
pub async fn cancel(client: &ApiClient, task_id: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/jobs/{}/cancel", task_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let cancelled: CancelResponse = response.json().await?;
        println!("Job {} is {}", cancelled.task_id, cancelled.status);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to cancel job: {}", error);
    }

    Ok(())
}

/// List jobs
pub async fn jobs(client: &ApiClient, status: Option<String>, context: Option<String>) -> Result<()> {
    let mut query = Vec::new();
    if let Some(status) = status {
        query.push(("status", status));
    }
    if let Some(context) = context {
        query.push(("context_id", context));
    }

    let response = client
        .client
        .get(client.url("/api/v1/jobs"))
        .query(&query)
        .send()
        .await?;

    if response.status().is_success() {
        let jobs: Vec<Job> = response.json().await?;
        print_job_table(&jobs, "No jobs found");
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list jobs: {}", error);
    }

    Ok(())
}

/// Show a single job
pub async fn job(client: &ApiClient, task_id: Uuid) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/jobs/{}", task_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let job: Job = response.json().await?;
        print_job_details(&job);
    } else {
        let error = response.text().await?;
        eprintln!("Job not found: {}", error);
    }

    Ok(())
}

/// Show queued jobs in the order they will start
pub async fn queue(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/queue")).send().await?;

    if response.status().is_success() {
        let jobs: Vec<Job> = response.json().await?;
        print_job_table(&jobs, "Queue is empty");
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get queue: {}", error);
    }

    Ok(())
}

/// Show system status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpuadmit v{}", status.version);
        println!();
        println!("Queued jobs: {}", status.queue_size);
        print_settings(&status.config);
        println!();
        print_devices(&status.devices);
        println!();
        println!("Priorities:");
        for rank in status.priorities {
            println!("  {:<20} {}", rank.category, rank.rank);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// Show or update scheduler configuration
pub async fn config(
    client: &ApiClient,
    memory_fraction: Option<f64>,
    gpu_slots: Option<i64>,
    cpu_slots: Option<i64>,
) -> Result<()> {
    let update = ConfigUpdate {
        memory_fraction,
        gpu_slots_per_device: gpu_slots,
        cpu_slots,
    };

    let request = if update.is_empty() {
        client.client.get(client.url("/api/v1/config"))
    } else {
        client.client.put(client.url("/api/v1/config")).json(&update)
    };
    let response = request.send().await?;

    if response.status().is_success() {
        let settings: SchedulerSettings = response.json().await?;
        if !update.is_empty() {
            println!("Configuration updated");
        }
        print_settings(&settings);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to update configuration: {}", error);
    }

    Ok(())
}

/// Show or replace the priority order
pub async fn priorities(client: &ApiClient, order: Vec<String>) -> Result<()> {
    #[derive(Serialize)]
    struct PriorityOrderRequest {
        order: Vec<String>,
    }

    let request = if order.is_empty() {
        client.client.get(client.url("/api/v1/priorities"))
    } else {
        client
            .client
            .put(client.url("/api/v1/priorities"))
            .json(&PriorityOrderRequest { order })
    };
    let response = request.send().await?;

    if response.status().is_success() {
        let ranks: Vec<CategoryRank> = response.json().await?;
        println!("{:<20} {:<6}", "CATEGORY", "RANK");
        println!("{}", "-".repeat(27));
        for rank in ranks {
            println!("{:<20} {:<6}", rank.category, rank.rank);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to update priorities: {}", error);
    }

    Ok(())
}

/// Re-detect GPUs
pub async fn refresh(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/devices/refresh"))
        .send()
        .await?;

    if response.status().is_success() {
        let devices: Vec<DeviceStatus> = response.json().await?;
        print_devices(&devices);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to refresh devices: {}", error);
    }

    Ok(())
}

fn parse_payload(payload: Option<&str>) -> Result<serde_json::Value> {
    match payload {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

fn format_memory(bytes: u64) -> String {
    if bytes == 0 {
        "-".to_string()
    } else {
        format!("{}GB", bytes / (1024 * 1024 * 1024))
    }
}

fn format_progress(job: &Job) -> String {
    job.progress
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string())
}

fn print_job_table(jobs: &[Job], empty: &str) {
    if jobs.is_empty() {
        println!("{}", empty);
        return;
    }

    println!(
        "{:<36} {:<16} {:<6} {:<11} {:<8} {:<8}",
        "ID", "CATEGORY", "RANK", "STATUS", "DEVICE", "PROGRESS"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        let device = job
            .device
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<16} {:<6} {:<11} {:<8} {:<8}",
            job.id,
            job.category,
            job.rank,
            job.status,
            device,
            format_progress(job)
        );
    }
}

fn print_job_details(job: &Job) {
    println!("Job: {}", job.id);
    println!("  Category: {} (rank {})", job.category, job.rank);
    println!("  Resource: {}", job.resource_class);
    if !job.context_id.is_empty() {
        println!("  Context: {}", job.context_id);
    }
    println!("  Status: {}", job.status);
    if let Some(device) = job.device {
        println!("  Device: {}", device);
    }
    println!("  Progress: {}", format_progress(job));
    println!("  Submitted: {}", job.created_at);
    if let Some(finished) = job.finished_at {
        println!("  Finished: {}", finished);
    }
    if let Some(error) = &job.error {
        println!("  Error: {}", error);
    }
    if let Some(result) = &job.result {
        println!("  Result: {}", result);
    }
}

fn print_settings(settings: &SchedulerSettings) {
    println!("Memory fraction: {:.2}", settings.memory_fraction);
    println!("GPU slots per device: {}", settings.gpu_slots_per_device);
    println!("CPU slots: {}", settings.cpu_slots);
}

fn print_devices(devices: &[DeviceStatus]) {
    println!(
        "{:<8} {:<30} {:<8} {:<8}",
        "DEVICE", "NAME", "MEMORY", "RUNNING"
    );
    println!("{}", "-".repeat(58));
    for device in devices {
        println!(
            "{:<8} {:<30} {:<8} {}/{}",
            device.id,
            device.name,
            format_memory(device.memory_total),
            device.running,
            device.slots
        );
    }
}
