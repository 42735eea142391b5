// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Hardware topology model.
//!
//! Represents the physical system a workload is mapped onto: accelerator
//! devices with their compute/memory specs, and the interconnect hierarchy
//! as an indexed link graph. Devices sit inside nested groups (node, rack,
//! ...); level 0 is the shared intra-node fabric, and each higher level
//! contributes one up-link per child group.
//!
//! The topology is constructed once per run from a
//! [`SystemConfig`](shunt_config::SystemConfig) and is purely queried
//! afterwards; nothing here mutates.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use shunt_config::{ConfigError, DeviceSpec, Precision, SystemConfig};

/// Index of a device within the topology.
pub type DeviceId = usize;

/// Index of a physical link within the topology.
///
/// Links are contention-bearing resources: the scheduler shares a link's
/// bandwidth between every transfer crossing it in the same time window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub usize);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "link{}", self.0)
    }
}

#[derive(Clone, Debug)]
struct Link {
    level: usize,
    bandwidth: f64,
    latency: f64,
}

/// The queryable topology model.
#[derive(Clone, Debug)]
pub struct Topology {
    name: String,
    device: DeviceSpec,
    /// Children per group, innermost level first.
    level_sizes: Vec<usize>,
    level_names: Vec<String>,
    device_count: usize,
    links: Vec<Link>,
    /// `link_base[l]` is the index of the first link belonging to level `l`.
    link_base: Vec<usize>,
}

impl Topology {
    /// Build the topology from a validated system document.
    pub fn from_config(config: &SystemConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let level_sizes: Vec<usize> = config.topology.levels.iter().map(|l| l.size).collect();
        let level_names: Vec<String> =
            config.topology.levels.iter().map(|l| l.name.clone()).collect();
        let device_count: usize = level_sizes.iter().product();

        // Level 0 has one fabric link per node; level l > 0 has one up-link
        // per level-(l-1) group.
        let mut links = Vec::new();
        let mut link_base = Vec::with_capacity(level_sizes.len());
        let mut groups_below = device_count;
        for (level, spec) in config.topology.levels.iter().enumerate() {
            groups_below /= spec.size;
            let count = if level == 0 {
                groups_below
            } else {
                // One up-link per child group.
                groups_below * spec.size
            };
            link_base.push(links.len());
            for _ in 0..count {
                links.push(Link {
                    level,
                    bandwidth: spec.link.bandwidth,
                    latency: spec.link.latency,
                });
            }
        }

        log::debug!(
            "topology '{}': {} devices, {} links over {} levels",
            config.name,
            device_count,
            links.len(),
            level_sizes.len()
        );

        Ok(Self {
            name: config.name.clone(),
            device: config.device.clone(),
            level_sizes,
            level_names,
            device_count,
            links,
            link_base,
        })
    }

    /// System name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of devices in the system.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Number of physical links in the system.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Name of the hierarchy level a link belongs to.
    #[must_use]
    pub fn link_level_name(&self, link: LinkId) -> &str {
        &self.level_names[self.links[link.0].level]
    }

    /// Link bandwidth in bytes/s.
    #[must_use]
    pub fn bandwidth(&self, link: LinkId) -> f64 {
        self.links[link.0].bandwidth
    }

    /// Fixed link latency in seconds.
    #[must_use]
    pub fn latency(&self, link: LinkId) -> f64 {
        self.links[link.0].latency
    }

    fn check_device(&self, device: DeviceId) -> Result<(), ConfigError> {
        if device >= self.device_count {
            return Err(ConfigError::UnknownDevice {
                device,
                device_count: self.device_count,
            });
        }
        Ok(())
    }

    /// Index of the group containing `device` at hierarchy level `level`.
    ///
    /// Level 0 groups are nodes.
    #[must_use]
    pub fn group_of(&self, device: DeviceId, level: usize) -> usize {
        let span: usize = self.level_sizes[..=level].iter().product();
        device / span
    }

    fn intra_link(&self, node: usize) -> LinkId {
        LinkId(self.link_base[0] + node)
    }

    fn uplink(&self, level: usize, child_group: usize) -> LinkId {
        LinkId(self.link_base[level] + child_group)
    }

    /// The ordered list of links a transfer from `a` to `b` crosses.
    ///
    /// The route climbs from `a`'s node fabric through per-level up-links to
    /// the lowest common group and back down to `b`. A device talking to
    /// itself crosses no links.
    pub fn route(&self, a: DeviceId, b: DeviceId) -> Result<Vec<LinkId>, ConfigError> {
        self.check_device(a)?;
        self.check_device(b)?;
        if a == b {
            return Ok(Vec::new());
        }

        let common = (0..self.level_sizes.len())
            .find(|&level| self.group_of(a, level) == self.group_of(b, level))
            .expect("topmost level always contains every device pair");

        if common == 0 {
            return Ok(vec![self.intra_link(self.group_of(a, 0))]);
        }

        let mut route = vec![self.intra_link(self.group_of(a, 0))];
        for level in 1..=common {
            route.push(self.uplink(level, self.group_of(a, level - 1)));
        }
        for level in (1..=common).rev() {
            route.push(self.uplink(level, self.group_of(b, level - 1)));
        }
        route.push(self.intra_link(self.group_of(b, 0)));
        Ok(route)
    }

    /// Peak compute rate of a device at the given precision, in FLOPs/s
    /// (ops/s for integer precisions).
    pub fn peak_compute(&self, device: DeviceId, precision: Precision) -> Result<f64, ConfigError> {
        self.check_device(device)?;
        Ok(match precision {
            Precision::F64 => self.device.f64_flops,
            Precision::F32 => self.device.f32_flops,
            Precision::F16 => self.device.f16_flops,
            Precision::I8 => self.device.i8_ops,
        })
    }

    /// Utilization-derated compute rate of a device at the given precision.
    pub fn eff_compute(&self, device: DeviceId, precision: Precision) -> Result<f64, ConfigError> {
        Ok(self.peak_compute(device, precision)? * self.device.flops_util)
    }

    /// Utilization-derated memory bandwidth of a device, in bytes/s.
    pub fn eff_mem_bw(&self, device: DeviceId) -> Result<f64, ConfigError> {
        self.check_device(device)?;
        Ok(self.device.mem_bw * self.device.mem_bw_util)
    }

    /// Memory capacity of a device, in bytes.
    pub fn mem_capacity(&self, device: DeviceId) -> Result<u64, ConfigError> {
        self.check_device(device)?;
        Ok(self.device.mem_cap)
    }

    /// The narrowest bandwidth over a set of links, in bytes/s.
    ///
    /// Returns `f64::INFINITY` for an empty set (on-device transfer).
    #[must_use]
    pub fn narrowest_bandwidth(&self, links: &[LinkId]) -> f64 {
        links
            .iter()
            .map(|&l| self.bandwidth(l))
            .fold(f64::INFINITY, f64::min)
    }

    /// Sum of fixed latencies over a set of links, in seconds.
    #[must_use]
    pub fn total_latency(&self, links: &[LinkId]) -> f64 {
        links.iter().map(|&l| self.latency(l)).sum()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use shunt_config::{DeviceSpec, LevelSpec, LinkSpec, TopologySpec};

    use super::*;

    fn two_level_system() -> SystemConfig {
        SystemConfig {
            name: "test-pod".to_string(),
            device: DeviceSpec {
                f64_flops: 10e12,
                f32_flops: 20e12,
                f16_flops: 40e12,
                i8_ops: 80e12,
                flops_util: 0.5,
                mem_cap: 16 << 30,
                mem_bw: 2e12,
                mem_bw_util: 0.8,
            },
            topology: TopologySpec {
                levels: vec![
                    LevelSpec {
                        name: "node".to_string(),
                        size: 4,
                        link: LinkSpec {
                            bandwidth: 300e9,
                            latency: 1e-6,
                        },
                    },
                    LevelSpec {
                        name: "cluster".to_string(),
                        size: 2,
                        link: LinkSpec {
                            bandwidth: 25e9,
                            latency: 5e-6,
                        },
                    },
                ],
            },
        }
    }

    #[test]
    fn link_counts_per_level() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        assert_eq!(topo.device_count(), 8);
        // 2 node fabrics + 2 node up-links.
        assert_eq!(topo.link_count(), 4);
    }

    #[test]
    fn intra_node_route_is_one_link() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        let route = topo.route(0, 3).unwrap();
        assert_eq!(route.len(), 1);
        assert_eq!(topo.link_level_name(route[0]), "node");
    }

    #[test]
    fn inter_node_route_climbs_both_sides() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        let route = topo.route(1, 6).unwrap();
        // fabric(a), uplink(a), uplink(b), fabric(b)
        assert_eq!(route.len(), 4);
        assert_eq!(topo.narrowest_bandwidth(&route), 25e9);
        assert_eq!(topo.total_latency(&route), 2.0 * 1e-6 + 2.0 * 5e-6);
    }

    #[test]
    fn self_route_is_empty() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        assert!(topo.route(5, 5).unwrap().is_empty());
        assert_eq!(topo.narrowest_bandwidth(&[]), f64::INFINITY);
    }

    #[test]
    fn unknown_device_is_config_error() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        assert!(matches!(
            topo.route(0, 8),
            Err(ConfigError::UnknownDevice { device: 8, .. })
        ));
        assert!(topo.peak_compute(99, Precision::F16).is_err());
    }

    #[test]
    fn effective_rates_are_derated() {
        let topo = Topology::from_config(&two_level_system()).unwrap();
        assert_eq!(topo.peak_compute(0, Precision::F16).unwrap(), 40e12);
        assert_eq!(topo.eff_compute(0, Precision::F16).unwrap(), 20e12);
        assert_relative_eq!(topo.eff_mem_bw(0).unwrap(), 1.6e12, max_relative = 1e-12);
    }
}
