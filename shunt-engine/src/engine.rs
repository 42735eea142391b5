// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The engine facade: one call simulating one configuration triple.

use shunt_config::{ModelConfig, SystemConfig, TaskConfig};
use shunt_topology::Topology;
use shunt_track::Tracker;
use shunt_track::tracker::dev_null_tracker;
use shunt_workload::{OpRegistry, WorkloadGraph, map_workload};

use crate::collective::CollectiveModel;
use crate::report::{Report, aggregate};
use crate::scheduler::Scheduler;
use crate::types::SimResult;

/// The SHUNT simulation engine.
///
/// A pure function of its three inputs: every call constructs its own
/// topology, graph and timeline state, so independent configuration runs
/// can be farmed out across threads by an external harness without sharing
/// anything but the engine value itself.
pub struct Engine {
    tracker: Tracker,
    registry: OpRegistry,
}

impl Engine {
    /// Create an engine emitting timeline spans to the given tracker.
    #[must_use]
    pub fn new(tracker: &Tracker) -> Self {
        Self {
            tracker: tracker.clone(),
            registry: OpRegistry::new(),
        }
    }

    /// Simulate one (model, system, task) configuration and aggregate the
    /// report.
    ///
    /// Fatal errors abort the run with the offending identifiers; degraded
    /// but complete runs return a report carrying
    /// [`Condition`](crate::types::Condition) flags instead.
    pub fn simulate(
        &self,
        model: &ModelConfig,
        system: &SystemConfig,
        task: &TaskConfig,
    ) -> SimResult<Report> {
        model.validate()?;
        task.validate()?;
        let topo = Topology::from_config(system)?;

        let graph = WorkloadGraph::build(model, &self.registry, task.precision)?;
        let mapped = map_workload(&graph, &self.registry, &topo, task)?;

        log::info!(
            "simulating '{}' on '{}' ({} devices, {} work items)",
            model.name,
            system.name,
            topo.device_count(),
            mapped.items.len()
        );

        let collective_model = CollectiveModel::new(task.allreduce);
        let scheduler = Scheduler::new(&topo, &collective_model, &self.tracker);
        let outcome = scheduler.run(&mapped)?;

        let report = aggregate(&graph.name, graph.seq_len, &topo, task, outcome);
        self.tracker.finish();

        log::info!(
            "'{}' step time {:.3} ms, {} condition(s)",
            model.name,
            report.step_time_s * 1e3,
            report.conditions.len()
        );
        Ok(report)
    }
}

/// Create a default engine that discards timeline spans.
///
/// This is provided to keep documentation examples simple with fewer
/// concepts to have to consider at once.
impl Default for Engine {
    fn default() -> Self {
        let tracker = dev_null_tracker();
        Self::new(&tracker)
    }
}
