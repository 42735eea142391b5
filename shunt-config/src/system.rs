// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The system document: per-device specs and the interconnect hierarchy.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Per-SKU device numbers.
///
/// Peak rates are derated by the matching utilization factor before use;
/// the topology model only ever exposes the effective rates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Peak FP64 FLOPs/s.
    pub f64_flops: f64,
    /// Peak FP32/TF32 FLOPs/s.
    pub f32_flops: f64,
    /// Peak FP16/BF16 FLOPs/s.
    pub f16_flops: f64,
    /// Peak INT8 ops/s.
    pub i8_ops: f64,
    /// Achievable fraction of peak FLOPs, in (0, 1].
    pub flops_util: f64,
    /// Device memory capacity in bytes.
    pub mem_cap: u64,
    /// Peak memory bandwidth in bytes/s.
    pub mem_bw: f64,
    /// Achievable fraction of peak memory bandwidth, in (0, 1].
    pub mem_bw_util: f64,
}

/// One interconnect link description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Link bandwidth in bytes/s.
    pub bandwidth: f64,
    /// Fixed per-traversal latency in seconds.
    pub latency: f64,
}

/// One level of the topology hierarchy.
///
/// Level 0 groups devices into nodes around a shared intra-node fabric;
/// each higher level groups the previous level's groups and contributes one
/// up-link per child group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelSpec {
    /// Level name (`node`, `rack`, ...), used in reports and errors.
    pub name: String,
    /// Children per group at this level.
    pub size: usize,
    /// The link connecting children at this level.
    pub link: LinkSpec,
}

/// The interconnect hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    /// Hierarchy levels, innermost first. The device count is the product
    /// of all level sizes.
    pub levels: Vec<LevelSpec>,
}

/// The parsed system configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System name, used in reports.
    pub name: String,
    /// Spec shared by every device in the system.
    pub device: DeviceSpec,
    /// Interconnect hierarchy.
    pub topology: TopologySpec,
}

impl SystemConfig {
    /// Total number of devices described by the hierarchy.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.topology.levels.iter().map(|l| l.size).product()
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.levels.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }
        for level in &self.topology.levels {
            if level.size == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("topology.{}.size", level.name),
                    reason: "must be non-zero".to_string(),
                });
            }
            if level.link.bandwidth <= 0.0 {
                return Err(ConfigError::Invalid {
                    field: format!("topology.{}.link.bandwidth", level.name),
                    reason: "must be positive".to_string(),
                });
            }
            if level.link.latency < 0.0 {
                return Err(ConfigError::Invalid {
                    field: format!("topology.{}.link.latency", level.name),
                    reason: "must not be negative".to_string(),
                });
            }
        }
        for (field, util) in [
            ("device.flops_util", self.device.flops_util),
            ("device.mem_bw_util", self.device.mem_bw_util),
        ] {
            if util <= 0.0 || util > 1.0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be in (0, 1]".to_string(),
                });
            }
        }
        if self.device.mem_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "device.mem_cap".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.device.mem_bw <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "device.mem_bw".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
