//! gpuadmit-store: Settings storage
//!
//! This crate persists the runtime-mutable scheduler state:
//! - Capacity settings (memory fraction, slot counts)
//! - Category priority order

pub mod settings;

pub use settings::{FileSettingsStore, MemorySettingsStore, PersistedSettings, SettingsStore};
