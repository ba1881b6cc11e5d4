//! Process-based runtime implementation
//!
//! Every job runs as one worker process. The JSON payload is written to the
//! worker's stdin and the worker reports back on stdout, one message per
//! line:
//!
//! ```text
//! PROGRESS 42
//! RESULT {"segments": 118}
//! ERROR model file is corrupt
//! ```
//!
//! Exit status decides success or failure; any other stdout line is ignored.

use async_trait::async_trait;
use gpuadmit_core::{AdmitError, AdmitResult, DeviceId, RuntimeConfig};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::traits::{JobLaunch, Runtime, WorkerEvent, WorkerEventKind, WorkerEvents};

/// Lines of stderr kept as a failure diagnostic
const STDERR_TAIL_LINES: usize = 20;
/// How long to wait for output readers after the worker exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-based runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Worker executable
    pub worker_command: PathBuf,
    /// Arguments passed before the category name
    pub worker_args: Vec<String>,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ProcessRuntimeConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            worker_command: config.worker_command.clone(),
            worker_args: config.worker_args.clone(),
        }
    }
}

/// A parsed stdout protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolLine {
    Progress(u8),
    Result(serde_json::Value),
    Error(String),
}

/// Parse one line of worker output
pub fn parse_line(line: &str) -> Option<ProtocolLine> {
    let line = line.trim();
    let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    match keyword {
        "PROGRESS" => {
            let value: f64 = rest.trim_end_matches('%').parse().ok()?;
            if !value.is_finite() {
                return None;
            }
            Some(ProtocolLine::Progress(value.clamp(0.0, 100.0) as u8))
        }
        "RESULT" => {
            let value = serde_json::from_str(rest)
                .unwrap_or_else(|_| serde_json::Value::String(rest.to_string()));
            Some(ProtocolLine::Result(value))
        }
        "ERROR" if !rest.is_empty() => Some(ProtocolLine::Error(rest.to_string())),
        _ => None,
    }
}

/// What the worker said on stdout besides progress
#[derive(Debug, Default)]
struct ProtocolSummary {
    result: Option<serde_json::Value>,
    error: Option<String>,
}

/// Process-based runtime for executing jobs
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
    /// Stop switches of live workers
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl ProcessRuntime {
    /// Create a new process runtime
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the command to start a worker
    fn build_command(&self, launch: &JobLaunch) -> Command {
        let mut cmd = Command::new(&self.config.worker_command);

        cmd.args(&self.config.worker_args);
        cmd.arg(launch.category.as_str());

        cmd.env("GPUADMIT_TASK_ID", launch.task_id.to_string());
        cmd.env("GPUADMIT_DEVICE", launch.device.to_string());
        cmd.env(
            "GPUADMIT_MEMORY_FRACTION",
            format!("{:.2}", launch.memory_fraction),
        );

        // Pin the worker to its GPU, or hide all GPUs from CPU jobs
        match launch.device {
            DeviceId::Gpu(index) => cmd.env("CUDA_VISIBLE_DEVICES", index.to_string()),
            DeviceId::Cpu => cmd.env("CUDA_VISIBLE_DEVICES", ""),
        };

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Number of workers currently alive
    pub async fn live_workers(&self) -> usize {
        self.running.lock().await.len()
    }
}

async fn read_protocol<R>(reader: R, task_id: Uuid, events: WorkerEvents) -> ProtocolSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = ProtocolSummary::default();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match parse_line(&line) {
            Some(ProtocolLine::Progress(p)) => {
                let _ = events.send(WorkerEvent::new(task_id, WorkerEventKind::Progress(p)));
            }
            Some(ProtocolLine::Result(value)) => summary.result = Some(value),
            Some(ProtocolLine::Error(message)) => summary.error = Some(message),
            None => debug!(task_id = %task_id, line = %line, "Worker output"),
        }
    }

    summary
}

async fn read_tail<R>(reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail).join("\n")
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn start(&self, launch: JobLaunch, events: WorkerEvents) -> AdmitResult<()> {
        let task_id = launch.task_id;

        info!(
            task_id = %task_id,
            category = %launch.category,
            device = %launch.device,
            "Starting worker process"
        );

        let mut child = self.build_command(&launch).spawn().map_err(|e| {
            error!(task_id = %task_id, error = %e, "Failed to spawn worker process");
            AdmitError::Runtime(format!("Failed to spawn worker: {}", e))
        })?;

        debug!(task_id = %task_id, pid = child.id().unwrap_or(0), "Worker process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&launch.payload)?;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!(task_id = %task_id, error = %e, "Failed to write payload to worker");
                }
                // Dropping stdin closes it so the worker sees EOF
            });
        }

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_protocol(out, task_id, events.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_tail(err)));

        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.running.lock().await.insert(task_id, stop_tx);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(task_id = %task_id, error = %e, "Failed to kill worker process");
                    }
                    None
                }
            };
            running.lock().await.remove(&task_id);

            let summary = match stdout {
                Some(handle) => match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                    Ok(Ok(summary)) => summary,
                    _ => ProtocolSummary::default(),
                },
                None => ProtocolSummary::default(),
            };
            let stderr_tail = match stderr {
                Some(handle) => match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                    Ok(Ok(tail)) => tail,
                    _ => String::new(),
                },
                None => String::new(),
            };

            let kind = match exit {
                None => WorkerEventKind::Stopped,
                Some(Ok(status)) if status.success() => WorkerEventKind::Completed(summary.result),
                Some(Ok(status)) => {
                    let message = summary
                        .error
                        .or_else(|| (!stderr_tail.is_empty()).then_some(stderr_tail))
                        .unwrap_or_else(|| format!("Worker exited with {}", status));
                    WorkerEventKind::Failed(message)
                }
                Some(Err(e)) => WorkerEventKind::Failed(format!("Failed to wait for worker: {}", e)),
            };

            debug!(task_id = %task_id, outcome = ?kind, "Worker process finished");
            let _ = events.send(WorkerEvent::new(task_id, kind));
        });

        Ok(())
    }

    async fn stop(&self, task_id: Uuid) -> AdmitResult<()> {
        match self.running.lock().await.remove(&task_id) {
            Some(stop) => {
                info!(task_id = %task_id, "Stopping worker process");
                let _ = stop.send(());
            }
            None => debug!(task_id = %task_id, "Stop requested for a worker that already exited"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuadmit_core::JobCategory;
    use tokio::sync::mpsc;

    fn launch(device: DeviceId) -> JobLaunch {
        JobLaunch {
            task_id: Uuid::new_v4(),
            category: JobCategory::Transcription,
            device,
            memory_fraction: 0.8,
            payload: serde_json::json!({"file": "meeting.wav"}),
        }
    }

    fn shell_runtime(script: &str) -> ProcessRuntime {
        ProcessRuntime::new(ProcessRuntimeConfig {
            worker_command: PathBuf::from("sh"),
            worker_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        })
    }

    async fn last_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEventKind> {
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = !matches!(event.kind, WorkerEventKind::Progress(_));
            kinds.push(event.kind);
            if terminal {
                break;
            }
        }
        kinds
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("PROGRESS 42"), Some(ProtocolLine::Progress(42)));
        assert_eq!(parse_line("PROGRESS 250"), Some(ProtocolLine::Progress(100)));
        assert_eq!(parse_line("PROGRESS 12.5%"), Some(ProtocolLine::Progress(12)));
        assert_eq!(parse_line("PROGRESS soon"), None);
        assert_eq!(
            parse_line("RESULT {\"segments\": 3}"),
            Some(ProtocolLine::Result(serde_json::json!({"segments": 3})))
        );
        assert_eq!(
            parse_line("RESULT done"),
            Some(ProtocolLine::Result(serde_json::json!("done")))
        );
        assert_eq!(
            parse_line("ERROR out of memory"),
            Some(ProtocolLine::Error("out of memory".to_string()))
        );
        assert_eq!(parse_line("loading model..."), None);
    }

    #[test]
    fn test_process_runtime_config_default() {
        let config = ProcessRuntimeConfig::default();
        assert_eq!(config.worker_command, PathBuf::from("gpuadmit-worker"));
        assert_eq!(ProcessRuntime::new(config).name(), "process");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_success_reports_progress_and_result() {
        let runtime = shell_runtime(
            "cat > /dev/null; echo 'PROGRESS 50'; echo \"RESULT {\\\"device\\\": \\\"$GPUADMIT_DEVICE\\\"}\"",
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        runtime.start(launch(DeviceId::Gpu(1)), tx).await.unwrap();

        let kinds = last_event(&mut rx).await;
        assert_eq!(kinds[0], WorkerEventKind::Progress(50));
        assert_eq!(
            kinds.last(),
            Some(&WorkerEventKind::Completed(Some(
                serde_json::json!({"device": "gpu:1"})
            )))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_failure_carries_diagnostic() {
        let runtime = shell_runtime("echo 'ERROR model missing'; exit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();

        runtime.start(launch(DeviceId::Cpu), tx).await.unwrap();

        let kinds = last_event(&mut rx).await;
        assert_eq!(
            kinds.last(),
            Some(&WorkerEventKind::Failed("model missing".to_string()))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_worker() {
        let runtime = shell_runtime("exec sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = launch(DeviceId::Gpu(0));
        let task_id = job.task_id;

        runtime.start(job, tx).await.unwrap();
        assert_eq!(runtime.live_workers().await, 1);

        runtime.stop(task_id).await.unwrap();
        let kinds = last_event(&mut rx).await;
        assert_eq!(kinds.last(), Some(&WorkerEventKind::Stopped));
        assert_eq!(runtime.live_workers().await, 0);

        // Stopping again is harmless
        runtime.stop(task_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
            worker_command: PathBuf::from("/nonexistent/gpuadmit-worker"),
            worker_args: Vec::new(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = runtime.start(launch(DeviceId::Cpu), tx).await;
        assert!(matches!(result, Err(AdmitError::Runtime(_))));
    }
}
