//! gpuadmit CLI
//!
//! Command-line interface for interacting with the gpuadmit daemon.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// gpuadmit - admission control for GPU-bound ML jobs
#[derive(Parser, Debug)]
#[command(name = "gpuadmit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9290", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Submit {
        /// Job category (e.g., transcription, chat)
        category: String,

        /// Run on the CPU instead of a GPU
        #[arg(long)]
        cpu: bool,

        /// Owning context identifier
        #[arg(long, default_value = "")]
        context: String,

        /// JSON payload handed to the worker
        #[arg(long)]
        payload: Option<String>,
    },

    /// Cancel a job
    Cancel {
        /// Task ID
        task_id: Uuid,
    },

    /// List jobs
    Jobs {
        /// Only show jobs in this status
        #[arg(long)]
        status: Option<String>,

        /// Only show jobs of this context
        #[arg(long)]
        context: Option<String>,
    },

    /// Show a single job
    Job {
        /// Task ID
        task_id: Uuid,
    },

    /// Show queued jobs in start order
    Queue,

    /// Show devices, queue size and configuration
    Status,

    /// Show or change scheduler configuration
    Config {
        /// Fraction of device memory a job may use
        #[arg(long)]
        memory_fraction: Option<f64>,

        /// Concurrent jobs per GPU
        #[arg(long, allow_hyphen_values = true)]
        gpu_slots: Option<i64>,

        /// Concurrent CPU jobs
        #[arg(long, allow_hyphen_values = true)]
        cpu_slots: Option<i64>,
    },

    /// Show or replace the category priority order
    Priorities {
        /// New order, highest priority first
        order: Vec<String>,
    },

    /// Re-detect GPUs on the daemon host
    Refresh,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Submit {
            category,
            cpu,
            context,
            payload,
        } => {
            commands::submit(&client, category, cpu, context, payload).await?;
        }
        Commands::Cancel { task_id } => {
            commands::cancel(&client, task_id).await?;
        }
        Commands::Jobs { status, context } => {
            commands::jobs(&client, status, context).await?;
        }
        Commands::Job { task_id } => {
            commands::job(&client, task_id).await?;
        }
        Commands::Queue => {
            commands::queue(&client).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Config {
            memory_fraction,
            gpu_slots,
            cpu_slots,
        } => {
            commands::config(&client, memory_fraction, gpu_slots, cpu_slots).await?;
        }
        Commands::Priorities { order } => {
            commands::priorities(&client, order).await?;
        }
        Commands::Refresh => {
            commands::refresh(&client).await?;
        }
    }

    Ok(())
}
