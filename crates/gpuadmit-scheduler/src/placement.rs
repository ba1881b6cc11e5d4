//! Device placement decisions

use gpuadmit_core::DeviceId;
use serde::Serialize;

/// Occupancy of one eligible device at decision time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceLoad {
    pub device: DeviceId,
    /// Jobs running or cancelling on the device
    pub running: u32,
    /// Configured slot count
    pub slots: u32,
}

impl DeviceLoad {
    pub fn has_capacity(&self) -> bool {
        self.running < self.slots
    }
}

/// Strategy for choosing the device a job starts on
pub trait PlacementStrategy: Send + Sync {
    /// Pick a device from the eligible candidates, `None` if all are full
    fn place(&self, candidates: &[DeviceLoad]) -> Option<DeviceId>;
}

/// Default placement: the device with the fewest running jobs
///
/// Ties go to the lowest device id so placement is deterministic.
pub struct LeastLoadedPlacement;

impl PlacementStrategy for LeastLoadedPlacement {
    fn place(&self, candidates: &[DeviceLoad]) -> Option<DeviceId> {
        candidates
            .iter()
            .filter(|load| load.has_capacity())
            .min_by_key(|load| (load.running, load.device))
            .map(|load| load.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(index: u32, running: u32, slots: u32) -> DeviceLoad {
        DeviceLoad {
            device: DeviceId::Gpu(index),
            running,
            slots,
        }
    }

    #[test]
    fn test_least_loaded_wins() {
        let strategy = LeastLoadedPlacement;
        let decision = strategy.place(&[load(0, 2, 4), load(1, 1, 4), load(2, 3, 4)]);
        assert_eq!(decision, Some(DeviceId::Gpu(1)));
    }

    #[test]
    fn test_tie_goes_to_lowest_index() {
        let strategy = LeastLoadedPlacement;
        let decision = strategy.place(&[load(1, 0, 1), load(0, 0, 1)]);
        assert_eq!(decision, Some(DeviceId::Gpu(0)));
    }

    #[test]
    fn test_full_devices_are_skipped() {
        let strategy = LeastLoadedPlacement;
        assert_eq!(
            strategy.place(&[load(0, 1, 1), load(1, 2, 3)]),
            Some(DeviceId::Gpu(1))
        );
        assert_eq!(strategy.place(&[load(0, 1, 1), load(1, 3, 3)]), None);
        assert_eq!(strategy.place(&[]), None);
    }
}
