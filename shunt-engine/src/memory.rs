// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Per-device memory occupancy tracking.
//!
//! Parameters are resident from time zero; activation tensors are charged
//! when their producing item completes and released when their last
//! consumer completes. Exceeding a device's capacity is a report-level
//! condition, never a crash.

use shunt_topology::DeviceId;

/// Peak/final occupancy per device at the end of a step.
#[derive(Clone, Debug)]
pub struct MemoryReport {
    /// Highest bytes ever live, per device.
    pub peak_bytes: Vec<u64>,
    /// Bytes still live at the end of the step, per device.
    pub final_bytes: Vec<u64>,
    /// Devices whose peak exceeded capacity.
    pub overflowed: Vec<DeviceId>,
}

/// Running per-device live-byte accounting.
#[derive(Clone, Debug)]
pub struct MemoryTracker {
    current: Vec<u64>,
    peak: Vec<u64>,
    capacity: Vec<u64>,
}

impl MemoryTracker {
    /// Start tracking with the resident parameter bytes already charged.
    #[must_use]
    pub fn new(param_bytes_per_device: &[u64], capacity: Vec<u64>) -> Self {
        let current = param_bytes_per_device.to_vec();
        Self {
            peak: current.clone(),
            current,
            capacity,
        }
    }

    /// Charge `bytes` to a device.
    pub fn alloc(&mut self, device: DeviceId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.current[device] += bytes;
        if self.current[device] > self.peak[device] {
            self.peak[device] = self.current[device];
        }
    }

    /// Release `bytes` from a device.
    ///
    /// Occupancy can never go negative; a release exceeding the live total
    /// indicates an accounting bug and saturates at zero.
    pub fn free(&mut self, device: DeviceId, bytes: u64) {
        debug_assert!(
            self.current[device] >= bytes,
            "device {device}: freeing {bytes} B with only {} B live",
            self.current[device]
        );
        self.current[device] = self.current[device].saturating_sub(bytes);
    }

    /// Current live bytes on a device.
    #[must_use]
    pub fn current(&self, device: DeviceId) -> u64 {
        self.current[device]
    }

    /// Close out the step.
    #[must_use]
    pub fn finish(self) -> MemoryReport {
        let overflowed = self
            .peak
            .iter()
            .zip(&self.capacity)
            .enumerate()
            .filter(|(_, (peak, cap))| peak > cap)
            .map(|(device, _)| device)
            .collect();
        MemoryReport {
            peak_bytes: self.peak,
            final_bytes: self.current,
            overflowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_count_from_time_zero() {
        let tracker = MemoryTracker::new(&[100, 200], vec![1000, 1000]);
        assert_eq!(tracker.current(0), 100);
        assert_eq!(tracker.current(1), 200);
    }

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let mut tracker = MemoryTracker::new(&[100, 0], vec![1000, 1000]);
        tracker.alloc(0, 500);
        tracker.free(0, 400);
        tracker.alloc(0, 100);
        let report = tracker.finish();
        assert_eq!(report.peak_bytes[0], 600);
        assert_eq!(report.final_bytes[0], 300);
        assert!(report.overflowed.is_empty());
    }

    #[test]
    fn overflow_is_reported_not_fatal() {
        let mut tracker = MemoryTracker::new(&[0, 0], vec![100, 1000]);
        tracker.alloc(0, 150);
        tracker.alloc(1, 150);
        let report = tracker.finish();
        assert_eq!(report.overflowed, vec![0]);
    }

    #[test]
    fn initial_params_alone_can_overflow() {
        let tracker = MemoryTracker::new(&[5000], vec![100]);
        let report = tracker.finish();
        assert_eq!(report.overflowed, vec![0]);
    }
}
