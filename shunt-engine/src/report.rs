// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Result aggregation.
//!
//! Folds the scheduler's raw step outcome into the report handed to the
//! caller: multi-iteration totals with checkpoint overhead, throughput,
//! utilization percentages and the exposed-vs-overlapped communication
//! split.

use serde::Serialize;
use shunt_config::TaskConfig;
use shunt_topology::Topology;
use shunt_workload::CollectiveKind;

use crate::scheduler::StepOutcome;
use crate::types::Condition;

/// Aggregate wall time per collective kind over one step.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommTotals {
    /// All-reduce seconds.
    pub allreduce_s: f64,
    /// All-gather seconds.
    pub allgather_s: f64,
    /// Reduce-scatter seconds.
    pub reducescatter_s: f64,
    /// All-to-all seconds.
    pub alltoall_s: f64,
    /// Broadcast seconds.
    pub broadcast_s: f64,
    /// Point-to-point seconds.
    pub sendrecv_s: f64,
}

impl CommTotals {
    /// Accumulate one completed collective.
    pub fn add(&mut self, kind: CollectiveKind, duration_s: f64) {
        match kind {
            CollectiveKind::AllReduce => self.allreduce_s += duration_s,
            CollectiveKind::AllGather => self.allgather_s += duration_s,
            CollectiveKind::ReduceScatter => self.reducescatter_s += duration_s,
            CollectiveKind::AllToAll => self.alltoall_s += duration_s,
            CollectiveKind::Broadcast => self.broadcast_s += duration_s,
            CollectiveKind::SendRecv => self.sendrecv_s += duration_s,
        }
    }

    /// Total communication wall seconds across all kinds.
    #[must_use]
    pub fn total_s(&self) -> f64 {
        self.allreduce_s
            + self.allgather_s
            + self.reducescatter_s
            + self.alltoall_s
            + self.broadcast_s
            + self.sendrecv_s
    }
}

/// The complete estimate for one (model, system, task) configuration.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    /// Model name.
    pub model: String,
    /// System name.
    pub system: String,
    /// Task name.
    pub task: String,
    /// Steps aggregated over.
    pub iterations: u32,
    /// Simulated time of one step, in seconds.
    pub step_time_s: f64,
    /// All iterations plus checkpoint overheads, in seconds.
    pub total_time_s: f64,
    /// Samples per second at the mean step time.
    pub throughput_samples_per_s: f64,
    /// Tokens per second, when the model declares a sequence length.
    pub throughput_tokens_per_s: Option<f64>,
    /// Aggregate wall time of FLOP-bearing compute.
    pub gemm_time_s: f64,
    /// Aggregate wall time of bandwidth-bound lookups.
    pub lookup_time_s: f64,
    /// Aggregate communication wall time per collective kind.
    pub comm_time: CommTotals,
    /// Communication time not hidden behind compute, per step.
    pub exposed_comm_s: f64,
    /// Communication time overlapped with compute, per step.
    pub overlapped_comm_s: f64,
    /// Peak live bytes per device.
    pub device_peak_mem_bytes: Vec<u64>,
    /// Live bytes per device at step end.
    pub device_final_mem_bytes: Vec<u64>,
    /// Compute-lane busy fraction per device.
    pub device_compute_util: Vec<f64>,
    /// Busy fraction per physical link.
    pub link_util: Vec<f64>,
    /// Non-fatal conditions observed during the run.
    pub conditions: Vec<Condition>,
}

/// Fold a step outcome into the final report.
#[must_use]
pub fn aggregate(
    model_name: &str,
    seq_len: Option<u64>,
    topo: &Topology,
    task: &TaskConfig,
    outcome: StepOutcome,
) -> Report {
    let step = outcome.step_time_s;
    let iterations = task.iterations;

    let checkpoint_overhead_s = match &task.checkpoint {
        Some(checkpoint) => {
            let count = iterations / checkpoint.interval;
            f64::from(count) * checkpoint.overhead_s
        }
        None => 0.0,
    };
    let total_time_s = f64::from(iterations) * step + checkpoint_overhead_s;
    let mean_step_s = total_time_s / f64::from(iterations);

    let throughput_samples_per_s = if mean_step_s > 0.0 {
        task.global_batch_size as f64 / mean_step_s
    } else {
        0.0
    };
    let throughput_tokens_per_s =
        seq_len.map(|tokens| throughput_samples_per_s * tokens as f64);

    // The critical device's pure-compute time bounds how much of the
    // communication could have been hidden.
    let max_compute_busy = outcome
        .compute_busy_s
        .iter()
        .fold(0.0f64, |max, &busy| max.max(busy));
    let exposed_comm_s = (step - max_compute_busy).max(0.0);
    let overlapped_comm_s = (outcome.comm_time.total_s() - exposed_comm_s).max(0.0);

    let device_compute_util = outcome
        .compute_busy_s
        .iter()
        .map(|&busy| if step > 0.0 { busy / step } else { 0.0 })
        .collect();
    let link_util = outcome
        .link_busy_s
        .iter()
        .map(|&busy| if step > 0.0 { busy / step } else { 0.0 })
        .collect();

    Report {
        model: model_name.to_string(),
        system: topo.name().to_string(),
        task: task.name.clone(),
        iterations,
        step_time_s: step,
        total_time_s,
        throughput_samples_per_s,
        throughput_tokens_per_s,
        gemm_time_s: outcome.gemm_time_s,
        lookup_time_s: outcome.lookup_time_s,
        comm_time: outcome.comm_time,
        exposed_comm_s,
        overlapped_comm_s,
        device_peak_mem_bytes: outcome.memory.peak_bytes,
        device_final_mem_bytes: outcome.memory.final_bytes,
        device_compute_util,
        link_util,
        conditions: outcome.conditions,
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "**************************************************")?;
        writeln!(
            f,
            "Model: {} | System: {} | Task: {}",
            self.model, self.system, self.task
        )?;
        writeln!(f, "Step Time [ms]: {:.3}", self.step_time_s * 1e3)?;
        writeln!(
            f,
            "Total Time [ms] ({} iterations): {:.3}",
            self.iterations,
            self.total_time_s * 1e3
        )?;
        writeln!(f, "Aggregate Compute Times [ms]:")?;
        writeln!(f, "\tGEMM: {:.3}", self.gemm_time_s * 1e3)?;
        writeln!(f, "\tEMB: {:.3}", self.lookup_time_s * 1e3)?;
        writeln!(f, "Aggregate Communication Times [ms]:")?;
        writeln!(f, "\tAllReduce: {:.3}", self.comm_time.allreduce_s * 1e3)?;
        writeln!(f, "\tAllGather: {:.3}", self.comm_time.allgather_s * 1e3)?;
        writeln!(
            f,
            "\tReduceScatter: {:.3}",
            self.comm_time.reducescatter_s * 1e3
        )?;
        writeln!(f, "\tAll-to-All: {:.3}", self.comm_time.alltoall_s * 1e3)?;
        writeln!(f, "\tBroadcast: {:.3}", self.comm_time.broadcast_s * 1e3)?;
        writeln!(f, "\tSend/Recv: {:.3}", self.comm_time.sendrecv_s * 1e3)?;
        writeln!(f, "Communication Overlap Breakdown [ms]:")?;
        let total_comm = self.exposed_comm_s + self.overlapped_comm_s;
        if total_comm > 0.0 {
            writeln!(
                f,
                "\tExposed: {:.3} ({:.2} %)",
                self.exposed_comm_s * 1e3,
                100.0 * self.exposed_comm_s / total_comm
            )?;
            writeln!(
                f,
                "\tOverlapped: {:.3} ({:.2} %)",
                self.overlapped_comm_s * 1e3,
                100.0 * self.overlapped_comm_s / total_comm
            )?;
        } else {
            writeln!(f, "\tExposed: 0 (0 %)")?;
            writeln!(f, "\tOverlapped: 0 (0 %)")?;
        }
        let peak = self.device_peak_mem_bytes.iter().max().copied().unwrap_or(0);
        writeln!(f, "Peak Device Memory [GB]: {:.3}", peak as f64 / 1e9)?;
        if self.throughput_samples_per_s / 1e6 > 0.1 {
            writeln!(
                f,
                "Throughput: {:.2} MQPS",
                self.throughput_samples_per_s / 1e6
            )?;
        } else {
            writeln!(f, "Throughput: {:.2} QPS", self.throughput_samples_per_s)?;
        }
        if let Some(tokens) = self.throughput_tokens_per_s {
            writeln!(f, "Throughput: {tokens:.2} tokens/s")?;
        }
        for condition in &self.conditions {
            writeln!(f, "Condition: {condition}")?;
        }
        write!(f, "**************************************************")
    }
}
