//! gpuadmit-core: Core types for the gpuadmit scheduler
//!
//! This crate provides the fundamental types used throughout gpuadmit:
//! - Job records, categories and lifecycle states
//! - Device identities and GPU detection
//! - Configuration types and clamping rules
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
