//! Device inventory for GPU and CPU capacity
//!
//! The inventory only knows which devices exist and how many slots each
//! has. How many jobs run on a device is always read from the task
//! registry, so the two can never disagree.

use gpuadmit_core::{DeviceId, GpuDevice, GpuInfo, ResourceClass, SchedulerSettings};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::placement::DeviceLoad;
use crate::registry::TaskRegistry;

/// Inventory of schedulable devices
pub struct DeviceInventory {
    /// Detected GPU devices
    gpus: Vec<GpuDevice>,
    /// Let GPU-class jobs use the CPU when there is no GPU
    cpu_fallback: bool,
}

impl DeviceInventory {
    /// Create a new inventory from GPU info
    pub fn new(gpu_info: GpuInfo, cpu_fallback: bool) -> Self {
        let mut gpus = gpu_info.devices;
        gpus.sort_by_key(|d| d.index);
        gpus.dedup_by_key(|d| d.index);
        Self { gpus, cpu_fallback }
    }

    /// Create an inventory with no GPUs
    pub fn empty() -> Self {
        Self::new(GpuInfo::empty(), true)
    }

    /// Replace the GPU list with a fresh detection result
    pub fn refresh(&mut self, gpu_info: GpuInfo) {
        let previous = self.gpus.len();
        *self = Self::new(gpu_info, self.cpu_fallback);
        info!(
            previous = previous,
            gpus = self.gpus.len(),
            "Device inventory refreshed"
        );
    }

    /// Get the total number of GPUs
    pub fn gpu_count(&self) -> u32 {
        self.gpus.len() as u32
    }

    pub fn gpus(&self) -> &[GpuDevice] {
        &self.gpus
    }

    /// Slot count of a device under the given settings
    pub fn slots(&self, device: DeviceId, settings: &SchedulerSettings) -> u32 {
        match device {
            DeviceId::Gpu(_) => settings.gpu_slots_per_device,
            DeviceId::Cpu => settings.cpu_slots,
        }
    }

    /// Devices a job of the given class may run on
    pub fn eligible(&self, class: ResourceClass) -> Vec<DeviceId> {
        match class {
            ResourceClass::Gpu if self.gpus.is_empty() && self.cpu_fallback => vec![DeviceId::Cpu],
            ResourceClass::Gpu => self.gpus.iter().map(GpuDevice::id).collect(),
            ResourceClass::Cpu => vec![DeviceId::Cpu],
        }
    }

    /// Current load of every device eligible for the class
    pub fn loads(
        &self,
        class: ResourceClass,
        registry: &TaskRegistry,
        settings: &SchedulerSettings,
    ) -> Vec<DeviceLoad> {
        self.eligible(class)
            .into_iter()
            .map(|device| DeviceLoad {
                device,
                running: registry.running_on(device),
                slots: self.slots(device, settings),
            })
            .collect()
    }

    /// Status of every device, GPUs first, CPU last
    pub fn status(&self, registry: &TaskRegistry, settings: &SchedulerSettings) -> Vec<DeviceStatus> {
        let gpus = self.gpus.iter().map(|gpu| DeviceStatus {
            id: gpu.id(),
            name: gpu.name.clone(),
            memory_total: gpu.memory_total,
            slots: settings.gpu_slots_per_device,
            running: registry.running_on(gpu.id()),
        });
        let cpu = DeviceStatus {
            id: DeviceId::Cpu,
            name: "CPU".to_string(),
            memory_total: 0,
            slots: settings.cpu_slots,
            running: registry.running_on(DeviceId::Cpu),
        };
        gpus.chain(std::iter::once(cpu)).collect()
    }
}

/// Device with its live occupancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub name: String,
    /// Total memory in bytes, 0 for the CPU
    pub memory_total: u64,
    pub slots: u32,
    pub running: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuadmit_core::{GpuVendor, Job, JobCategory};

    fn create_test_gpu_info(count: u32) -> GpuInfo {
        let devices: Vec<GpuDevice> = (0..count)
            .map(|i| GpuDevice {
                index: i,
                name: format!("Test GPU {}", i),
                memory_total: 16 * 1024 * 1024 * 1024,
                vendor: GpuVendor::Nvidia,
            })
            .collect();

        GpuInfo { devices }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            memory_fraction: 0.9,
            gpu_slots_per_device: 2,
            cpu_slots: 3,
        }
    }

    #[test]
    fn test_inventory_empty() {
        let inventory = DeviceInventory::empty();
        assert_eq!(inventory.gpu_count(), 0);
        assert_eq!(inventory.eligible(ResourceClass::Cpu), vec![DeviceId::Cpu]);
    }

    #[test]
    fn test_cpu_fallback() {
        let with_fallback = DeviceInventory::new(GpuInfo::empty(), true);
        assert_eq!(
            with_fallback.eligible(ResourceClass::Gpu),
            vec![DeviceId::Cpu]
        );

        let without = DeviceInventory::new(GpuInfo::empty(), false);
        assert!(without.eligible(ResourceClass::Gpu).is_empty());

        let with_gpus = DeviceInventory::new(create_test_gpu_info(2), true);
        assert_eq!(
            with_gpus.eligible(ResourceClass::Gpu),
            vec![DeviceId::Gpu(0), DeviceId::Gpu(1)]
        );
    }

    #[test]
    fn test_loads_come_from_registry() {
        let inventory = DeviceInventory::new(create_test_gpu_info(2), true);
        let mut registry = TaskRegistry::new();
        let job = Job::new(
            JobCategory::Chat,
            ResourceClass::Gpu,
            1,
            "ctx".to_string(),
            0,
        );
        let id = job.id;
        registry.insert(job, serde_json::Value::Null);
        registry.start(&id, DeviceId::Gpu(1)).unwrap();

        let loads = inventory.loads(ResourceClass::Gpu, &registry, &settings());
        assert_eq!(loads[0].running, 0);
        assert_eq!(loads[1].running, 1);
        assert_eq!(loads[1].slots, 2);

        let status = inventory.status(&registry, &settings());
        assert_eq!(status.len(), 3);
        assert_eq!(status[2].id, DeviceId::Cpu);
        assert_eq!(status[2].slots, 3);
    }

    #[test]
    fn test_refresh_replaces_gpus() {
        let mut inventory = DeviceInventory::new(create_test_gpu_info(1), false);
        inventory.refresh(create_test_gpu_info(3));
        assert_eq!(inventory.gpu_count(), 3);
        assert!(inventory
            .eligible(ResourceClass::Gpu)
            .contains(&DeviceId::Gpu(2)));
    }
}
