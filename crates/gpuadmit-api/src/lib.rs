//! gpuadmit-api: REST API server for gpuadmit
//!
//! This crate exposes the admission controller over HTTP:
//! - Job submission, listing and cancellation
//! - Live configuration and priority order
//! - Device and queue status

pub mod rest;

pub use rest::create_router;
