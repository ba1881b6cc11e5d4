//! gpuadmit-scheduler: GPU admission-control scheduler
//!
//! This crate decides when and where submitted jobs start:
//! - Device inventory and least-loaded placement
//! - Category priority table
//! - Task registry and lifecycle state machine
//! - Admission controller with cancellation and live reconfiguration

pub mod inventory;
pub mod placement;
pub mod priority;
pub mod registry;
pub mod scheduler;

pub use inventory::{DeviceInventory, DeviceStatus};
pub use placement::{DeviceLoad, LeastLoadedPlacement, PlacementStrategy};
pub use priority::{CategoryRank, PriorityTable};
pub use registry::TaskRegistry;
pub use scheduler::{AdmissionController, ControllerOptions, JobFilter, SchedulerStatus, SubmitRequest};
