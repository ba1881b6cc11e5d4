//! gpuadmit-runtime: Worker boundary
//!
//! This crate defines how the scheduler hands work to the outside world:
//! - The `Runtime` trait and the events workers report back
//! - A process-based runtime speaking a line-oriented progress protocol

pub mod process;
pub mod traits;

pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use traits::{JobLaunch, Runtime, WorkerEvent, WorkerEventKind, WorkerEvents};
