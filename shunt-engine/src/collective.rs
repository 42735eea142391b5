// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Communication cost model.
//!
//! Prices one collective call from its payload size, participant count and
//! the topology's link graph. Each collective kind has a fixed cost formula
//! over the bottleneck bandwidth `B` (the narrowest link on the union of
//! routes the group uses) and the latency `L` of the longest member-to-member
//! route. The [`CollectiveModel`] is built once per run and queried
//! read-only by the scheduler.

use itertools::Itertools;
use shunt_config::{AllReduceAlgorithm, ConfigError};
use shunt_topology::{DeviceId, LinkId, Topology};
use shunt_workload::CollectiveKind;

/// The priced cost of one collective call.
#[derive(Clone, Debug)]
pub struct CollectiveCost {
    /// Contention-free duration, in seconds.
    pub duration_s: f64,
    /// The physical links the call occupies, deduplicated.
    pub links: Vec<LinkId>,
    /// The bandwidth the call can use when alone on those links, in
    /// bytes/s.
    pub bandwidth: f64,
}

impl CollectiveCost {
    fn free() -> Self {
        Self {
            duration_s: 0.0,
            links: Vec::new(),
            bandwidth: f64::INFINITY,
        }
    }
}

/// Read-only registry of per-collective-kind cost formulas.
#[derive(Clone, Debug)]
pub struct CollectiveModel {
    algorithm: AllReduceAlgorithm,
}

impl CollectiveModel {
    /// Create the model with the task's all-reduce algorithm selection.
    #[must_use]
    pub fn new(algorithm: AllReduceAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Price one collective call.
    ///
    /// Degenerate single-participant groups cost nothing and occupy no
    /// links; they only appear in single-device test configurations.
    pub fn cost(
        &self,
        kind: CollectiveKind,
        payload_bytes: u64,
        participants: &[DeviceId],
        topo: &Topology,
    ) -> Result<CollectiveCost, ConfigError> {
        if participants.len() < 2 {
            return Ok(CollectiveCost::free());
        }

        // The union of the routes around the group ring covers every link a
        // ring pass touches; point-to-point pairs reduce to their one route.
        let mut links: Vec<LinkId> = Vec::new();
        let mut worst_latency: f64 = 0.0;
        for (&a, &b) in participants.iter().circular_tuple_windows() {
            let route = topo.route(a, b)?;
            worst_latency = worst_latency.max(topo.total_latency(&route));
            links.extend(route);
        }
        links.sort_unstable();
        links.dedup();

        let bandwidth = topo.narrowest_bandwidth(&links);
        let p = participants.len() as f64;
        let s = payload_bytes as f64;
        let wire = s / bandwidth;
        let l = worst_latency;

        let duration_s = match kind {
            CollectiveKind::AllReduce => {
                let ring = 2.0 * (p - 1.0) / p * wire + (p - 1.0) * l;
                let tree = 2.0 * p.log2().ceil() * (wire + l);
                match self.algorithm {
                    AllReduceAlgorithm::Auto => ring.min(tree),
                    AllReduceAlgorithm::Ring => ring,
                    AllReduceAlgorithm::Tree => tree,
                }
            }
            CollectiveKind::AllGather | CollectiveKind::ReduceScatter => {
                (p - 1.0) / p * wire + (p - 1.0) * l
            }
            CollectiveKind::AllToAll => (p - 1.0) / p * wire + (p - 1.0) * l,
            CollectiveKind::Broadcast => p.log2().ceil() * (wire + l),
            CollectiveKind::SendRecv => wire + l,
        };

        Ok(CollectiveCost {
            duration_s,
            links,
            bandwidth,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use shunt_config::{DeviceSpec, LevelSpec, LinkSpec, SystemConfig, TopologySpec};

    use super::*;

    fn flat_system(devices: usize, bandwidth: f64, latency: f64) -> Topology {
        Topology::from_config(&SystemConfig {
            name: "flat".to_string(),
            device: DeviceSpec {
                f64_flops: 1e12,
                f32_flops: 1e12,
                f16_flops: 1e12,
                i8_ops: 1e12,
                flops_util: 1.0,
                mem_cap: 1 << 30,
                mem_bw: 1e12,
                mem_bw_util: 1.0,
            },
            topology: TopologySpec {
                levels: vec![LevelSpec {
                    name: "node".to_string(),
                    size: devices,
                    link: LinkSpec { bandwidth, latency },
                }],
            },
        })
        .unwrap()
    }

    #[test]
    fn ring_allreduce_matches_the_closed_form() {
        let topo = flat_system(4, 100e9, 1e-6);
        let model = CollectiveModel::new(AllReduceAlgorithm::Ring);
        let cost = model
            .cost(CollectiveKind::AllReduce, 1 << 30, &[0, 1, 2, 3], &topo)
            .unwrap();
        let wire = (1u64 << 30) as f64 / 100e9;
        assert_relative_eq!(
            cost.duration_s,
            2.0 * 3.0 / 4.0 * wire + 3.0 * 1e-6,
            max_relative = 1e-12
        );
        assert_eq!(cost.links.len(), 1);
        assert_eq!(cost.bandwidth, 100e9);
    }

    #[test]
    fn auto_prefers_tree_for_tiny_payloads() {
        let topo = flat_system(8, 100e9, 10e-6);
        let auto = CollectiveModel::new(AllReduceAlgorithm::Auto);
        let ring = CollectiveModel::new(AllReduceAlgorithm::Ring);
        // 64 bytes: latency dominates, tree's log2(P) steps win.
        let auto_cost = auto
            .cost(
                CollectiveKind::AllReduce,
                64,
                &[0, 1, 2, 3, 4, 5, 6, 7],
                &topo,
            )
            .unwrap();
        let ring_cost = ring
            .cost(
                CollectiveKind::AllReduce,
                64,
                &[0, 1, 2, 3, 4, 5, 6, 7],
                &topo,
            )
            .unwrap();
        assert!(auto_cost.duration_s < ring_cost.duration_s);
    }

    #[test]
    fn sendrecv_is_latency_plus_wire() {
        let topo = flat_system(2, 50e9, 2e-6);
        let model = CollectiveModel::new(AllReduceAlgorithm::Auto);
        let cost = model
            .cost(CollectiveKind::SendRecv, 1 << 20, &[0, 1], &topo)
            .unwrap();
        assert_relative_eq!(
            cost.duration_s,
            (1u64 << 20) as f64 / 50e9 + 2e-6,
            max_relative = 1e-12
        );
    }

    #[test]
    fn degenerate_single_participant_is_free() {
        let topo = flat_system(2, 50e9, 2e-6);
        let model = CollectiveModel::new(AllReduceAlgorithm::Auto);
        let cost = model
            .cost(CollectiveKind::AllReduce, 1 << 20, &[0], &topo)
            .unwrap();
        assert_eq!(cost.duration_s, 0.0);
        assert!(cost.links.is_empty());
    }

    #[test]
    fn reduce_scatter_is_half_an_allreduce() {
        let topo = flat_system(4, 100e9, 0.0);
        let model = CollectiveModel::new(AllReduceAlgorithm::Ring);
        let rs = model
            .cost(CollectiveKind::ReduceScatter, 1 << 30, &[0, 1, 2, 3], &topo)
            .unwrap();
        let ar = model
            .cost(CollectiveKind::AllReduce, 1 << 30, &[0, 1, 2, 3], &topo)
            .unwrap();
        assert_relative_eq!(ar.duration_s, 2.0 * rs.duration_s, max_relative = 1e-12);
    }
}
