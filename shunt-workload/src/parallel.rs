// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Parallelism mapper.
//!
//! Applies a task's parallelism strategy to a [`WorkloadGraph`], producing
//! the flat list of [`WorkItem`]s the scheduler executes: one local compute
//! item per shard-holding device, plus the collectives that reconcile the
//! sharded computation.
//!
//! Device grid: tensor-parallel ranks are innermost (they sit on the fastest
//! links), then pipeline stages, then data-parallel replicas outermost.
//! Expert-parallel groups are blocks of consecutive data-parallel ranks.
//!
//! Emission order fixes the scheduler's deterministic tie-break, and is
//! arranged so that tensor-parallel collectives are always created before
//! any data-parallel gradient collective due at the same logical point.

use std::collections::HashMap;
use std::ops::Range;

use shunt_config::{Precision, ShardRule, TaskConfig, TaskKind};
use shunt_topology::{DeviceId, Topology};

use crate::StrategyError;
use crate::graph::{OpId, Operator, WorkloadGraph};
use crate::ops::{OpClass, OpRegistry};

/// Index of a work item within its [`MappedWorkload`].
pub type WorkId = usize;

/// The closed set of collective operations the cost model prices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    /// Every participant ends with the element-wise reduction of all inputs.
    AllReduce,
    /// Every participant ends with the concatenation of all inputs.
    AllGather,
    /// Each participant ends with one reduced shard.
    ReduceScatter,
    /// Personalized exchange: each participant sends a distinct shard to
    /// every other.
    AllToAll,
    /// One participant's data is replicated to all others.
    Broadcast,
    /// Point-to-point transfer between exactly two participants.
    SendRecv,
}

impl std::fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CollectiveKind::AllReduce => write!(f, "allreduce"),
            CollectiveKind::AllGather => write!(f, "allgather"),
            CollectiveKind::ReduceScatter => write!(f, "reducescatter"),
            CollectiveKind::AllToAll => write!(f, "alltoall"),
            CollectiveKind::Broadcast => write!(f, "broadcast"),
            CollectiveKind::SendRecv => write!(f, "sendrecv"),
        }
    }
}

/// What one work item does.
#[derive(Clone, Debug)]
pub enum WorkKind {
    /// Local compute on one device.
    Compute {
        /// Executing device.
        device: DeviceId,
        /// FLOPs after shard scaling and batch scaling.
        flops: f64,
        /// Bytes through device memory, for roofline costing.
        moved_bytes: u64,
        /// Activation bytes materialized on the device at completion.
        output_bytes: u64,
        /// Numeric precision the work runs at.
        precision: Precision,
    },
    /// A collective call over a device group.
    Collective {
        /// Which collective.
        collective: CollectiveKind,
        /// Participating devices. Always at least two outside degenerate
        /// single-device configurations.
        participants: Vec<DeviceId>,
        /// Payload bytes.
        payload_bytes: u64,
        /// Activation bytes materialized per receiving device at completion
        /// (on the destination only for [`CollectiveKind::SendRecv`]).
        output_bytes: u64,
    },
}

/// One schedulable unit with its dependency edges.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Creation-order index, also the scheduler's tie-break key.
    pub id: WorkId,
    /// Human-readable name used in timeline spans.
    pub name: String,
    /// What the item does.
    pub kind: WorkKind,
    /// Items that must complete before this one starts.
    pub wait_for: Vec<WorkId>,
}

/// Placement arithmetic for the parallelism degrees.
#[derive(Copy, Clone, Debug)]
pub struct DeviceGrid {
    /// Data-parallel degree.
    pub data: usize,
    /// Tensor-parallel degree.
    pub tensor: usize,
    /// Pipeline-parallel degree.
    pub pipeline: usize,
    /// Expert-parallel degree.
    pub expert: usize,
}

impl DeviceGrid {
    /// Validate the degrees against the device count.
    pub fn new(task: &TaskConfig, device_count: usize) -> Result<Self, StrategyError> {
        let p = task.parallelism;
        let required = p.data * p.tensor * p.pipeline;
        if required != device_count {
            return Err(StrategyError::DegreeMismatch {
                required,
                devices: device_count,
            });
        }
        if p.data % p.expert != 0 {
            return Err(StrategyError::ExpertDegree {
                expert: p.expert,
                data: p.data,
            });
        }
        Ok(Self {
            data: p.data,
            tensor: p.tensor,
            pipeline: p.pipeline,
            expert: p.expert,
        })
    }

    /// The device at a grid coordinate.
    #[must_use]
    pub fn device(&self, dp: usize, stage: usize, tp: usize) -> DeviceId {
        (dp * self.pipeline + stage) * self.tensor + tp
    }

    /// The tensor-parallel group of one replica/stage.
    #[must_use]
    pub fn tensor_group(&self, dp: usize, stage: usize) -> Vec<DeviceId> {
        (0..self.tensor).map(|tp| self.device(dp, stage, tp)).collect()
    }

    /// The data-parallel group holding one (stage, tensor-rank) shard.
    #[must_use]
    pub fn data_group(&self, stage: usize, tp: usize) -> Vec<DeviceId> {
        (0..self.data).map(|dp| self.device(dp, stage, tp)).collect()
    }

    /// The expert-parallel group containing data-parallel rank `dp`.
    #[must_use]
    pub fn expert_group(&self, dp: usize, stage: usize, tp: usize) -> Vec<DeviceId> {
        let base = (dp / self.expert) * self.expert;
        (base..base + self.expert)
            .map(|r| self.device(r, stage, tp))
            .collect()
    }

    /// The replicas of expert shard `shard` at one (stage, tensor-rank).
    #[must_use]
    pub fn expert_replica_group(&self, shard: usize, stage: usize, tp: usize) -> Vec<DeviceId> {
        (0..self.data)
            .filter(|r| r % self.expert == shard)
            .map(|r| self.device(r, stage, tp))
            .collect()
    }
}

/// The mapper's output: per-device work plus placement metadata.
#[derive(Clone, Debug)]
pub struct MappedWorkload {
    /// All work items, in creation order.
    pub items: Vec<WorkItem>,
    /// Resident parameter bytes per device (weights and, for training
    /// setups, the gradient/optimizer state folded into the model's
    /// per-parameter byte widths).
    pub param_bytes_per_device: Vec<u64>,
    /// Samples each data-parallel replica processes per step.
    pub local_batch: u64,
    /// The validated device grid.
    pub grid: DeviceGrid,
}

/// How one operator is laid out across the tensor/expert groups.
struct ShardInfo {
    /// Divisor applied to FLOPs, moved bytes and parameter bytes.
    factor: u64,
    /// Collective materializing the forward output, if the layout needs one.
    fwd_collective: Option<CollectiveKind>,
    /// Collective reconciling the grad-wrt-input in the backward pass.
    bwd_collective: Option<CollectiveKind>,
    /// Whether the operator runs under expert parallelism.
    expert_parallel: bool,
}

struct Mapper<'a> {
    graph: &'a WorkloadGraph,
    task: &'a TaskConfig,
    grid: DeviceGrid,
    local_batch: u64,
    stages: Vec<Range<OpId>>,
    stage_of: Vec<usize>,
    items: Vec<WorkItem>,
    /// Per (op, dp): the item (per tensor rank) whose completion makes the
    /// op's forward output available on its stage's devices.
    avail: HashMap<(OpId, usize), Vec<WorkId>>,
    /// Per (op, dp): the item (per tensor rank) whose completion makes the
    /// grad-wrt-input of the op available.
    bwd_avail: HashMap<(OpId, usize), Vec<WorkId>>,
    /// Cross-stage activation transfers, keyed by (producer, consumer
    /// stage, dp).
    fwd_transfers: HashMap<(OpId, usize, usize), Vec<WorkId>>,
    /// Cross-stage gradient transfers, keyed by (producer, consumer, dp).
    bwd_transfers: HashMap<(OpId, OpId, usize), Vec<WorkId>>,
    /// Backward compute items per device, for the gradient exchange.
    bwd_items_by_device: Vec<Vec<WorkId>>,
}

/// Apply the task's parallelism strategy to the workload graph.
pub fn map_workload(
    graph: &WorkloadGraph,
    registry: &OpRegistry,
    topo: &Topology,
    task: &TaskConfig,
) -> Result<MappedWorkload, StrategyError> {
    let grid = DeviceGrid::new(task, topo.device_count())?;

    if task.global_batch_size % grid.data as u64 != 0 {
        return Err(StrategyError::IndivisibleBatch {
            batch: task.global_batch_size,
            data: grid.data,
        });
    }
    let local_batch = task.global_batch_size / grid.data as u64;

    let stages = partition_stages(graph, grid.pipeline)?;
    let mut stage_of = vec![0; graph.ops().len()];
    for (stage, range) in stages.iter().enumerate() {
        for op_id in range.clone() {
            stage_of[op_id] = stage;
        }
    }

    let mut mapper = Mapper {
        graph,
        task,
        grid,
        local_batch,
        stages,
        stage_of,
        items: Vec::new(),
        avail: HashMap::new(),
        bwd_avail: HashMap::new(),
        fwd_transfers: HashMap::new(),
        bwd_transfers: HashMap::new(),
        bwd_items_by_device: vec![Vec::new(); topo.device_count()],
    };

    mapper.emit_forward(registry)?;
    if task.kind == TaskKind::Train {
        mapper.emit_backward(registry)?;
        mapper.emit_gradient_exchange(registry);
    }

    let param_bytes_per_device = mapper.param_bytes_per_device(registry)?;

    log::debug!(
        "mapped '{}' onto {} devices: {} work items, local batch {}",
        graph.name,
        topo.device_count(),
        mapper.items.len(),
        local_batch
    );

    Ok(MappedWorkload {
        items: mapper.items,
        param_bytes_per_device,
        local_batch,
        grid,
    })
}

/// Split the operator list into contiguous, FLOP-balanced pipeline stages.
fn partition_stages(graph: &WorkloadGraph, stages: usize) -> Result<Vec<Range<OpId>>, StrategyError> {
    let n = graph.ops().len();
    if stages > n {
        return Err(StrategyError::TooManyStages { stages, ops: n });
    }

    // prefix[i] = FLOPs of ops[..i]
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for op in graph.ops() {
        prefix.push(prefix.last().unwrap() + op.cost.flops);
    }
    let total = prefix[n].max(1.0);

    let mut ranges = Vec::with_capacity(stages);
    let mut start = 0;
    for s in 0..stages {
        let end = if s == stages - 1 {
            n
        } else {
            let target = total * (s + 1) as f64 / stages as f64;
            let mut end = start + 1;
            while end < n && prefix[end] < target {
                end += 1;
            }
            // Leave at least one op for every remaining stage.
            end.min(n - (stages - s - 1)).max(start + 1)
        };
        ranges.push(start..end);
        start = end;
    }
    Ok(ranges)
}

impl Mapper<'_> {
    fn push(&mut self, name: String, kind: WorkKind, wait_for: Vec<WorkId>) -> WorkId {
        let id = self.items.len();
        self.items.push(WorkItem {
            id,
            name,
            kind,
            wait_for,
        });
        id
    }

    fn shard_info(&self, registry: &OpRegistry, op: &Operator) -> Result<ShardInfo, StrategyError> {
        let tp = self.grid.tensor as u64;
        let ep = self.grid.expert as u64;
        let none = ShardInfo {
            factor: 1,
            fwd_collective: None,
            bwd_collective: None,
            expert_parallel: false,
        };

        let class = registry.class(&op.spec);
        let rule = match class {
            OpClass::MatMul => self.task.sharding.matmul,
            OpClass::Attention => self.task.sharding.attention,
            OpClass::Embedding => self.task.sharding.embedding,
            OpClass::Elementwise => self.task.sharding.elementwise,
            OpClass::ExpertFfn => self.task.sharding.expert_ffn,
        };
        if rule == ShardRule::Replicate {
            return Ok(none);
        }

        match (&op.spec, class) {
            (shunt_config::OpSpec::MatMul { n, .. }, OpClass::MatMul) if tp > 1 => {
                if n % tp != 0 {
                    return Err(StrategyError::IndivisibleDim {
                        op: op.name.clone(),
                        dim: "n",
                        size: *n,
                        degree: self.grid.tensor,
                    });
                }
                Ok(ShardInfo {
                    factor: tp,
                    fwd_collective: Some(CollectiveKind::AllReduce),
                    bwd_collective: Some(CollectiveKind::AllReduce),
                    expert_parallel: false,
                })
            }
            (shunt_config::OpSpec::Attention { heads, .. }, OpClass::Attention) if tp > 1 => {
                if heads % tp != 0 {
                    return Err(StrategyError::IndivisibleDim {
                        op: op.name.clone(),
                        dim: "heads",
                        size: *heads,
                        degree: self.grid.tensor,
                    });
                }
                Ok(ShardInfo {
                    factor: tp,
                    fwd_collective: Some(CollectiveKind::AllReduce),
                    bwd_collective: Some(CollectiveKind::AllReduce),
                    expert_parallel: false,
                })
            }
            (shunt_config::OpSpec::EmbeddingLookup { entries, .. }, OpClass::Embedding)
                if tp > 1 =>
            {
                if entries % tp != 0 {
                    return Err(StrategyError::IndivisibleDim {
                        op: op.name.clone(),
                        dim: "entries",
                        size: *entries,
                        degree: self.grid.tensor,
                    });
                }
                Ok(ShardInfo {
                    factor: tp,
                    fwd_collective: Some(CollectiveKind::AllGather),
                    bwd_collective: None,
                    expert_parallel: false,
                })
            }
            (shunt_config::OpSpec::Elementwise { elems }, OpClass::Elementwise) if tp > 1 => {
                if elems % tp != 0 {
                    return Err(StrategyError::IndivisibleDim {
                        op: op.name.clone(),
                        dim: "elems",
                        size: *elems,
                        degree: self.grid.tensor,
                    });
                }
                Ok(ShardInfo {
                    factor: tp,
                    fwd_collective: Some(CollectiveKind::AllGather),
                    bwd_collective: None,
                    expert_parallel: false,
                })
            }
            (shunt_config::OpSpec::ExpertFfn { experts, .. }, OpClass::ExpertFfn) if ep > 1 => {
                if experts % ep != 0 {
                    return Err(StrategyError::IndivisibleExperts {
                        op: op.name.clone(),
                        experts: *experts,
                        degree: self.grid.expert,
                    });
                }
                Ok(ShardInfo {
                    factor: ep,
                    fwd_collective: None,
                    bwd_collective: None,
                    expert_parallel: true,
                })
            }
            _ => Ok(none),
        }
    }

    /// Forward dependencies of `op` for one (dp, tp) coordinate, inserting
    /// cross-stage activation transfers as needed.
    fn fwd_deps(&mut self, op: &Operator, dp: usize, tp: usize) -> Vec<WorkId> {
        let stage = self.stage_of[op.id];
        let mut deps = Vec::with_capacity(op.inputs.len());
        for &producer in &op.inputs {
            let producer_stage = self.stage_of[producer];
            if producer_stage == stage {
                deps.push(self.avail[&(producer, dp)][tp]);
            } else {
                let key = (producer, stage, dp);
                if !self.fwd_transfers.contains_key(&key) {
                    let payload =
                        self.graph.op(producer).cost.output_bytes * self.local_batch;
                    let name = format!("{}.act.sendrecv", self.graph.op(producer).name);
                    let ids: Vec<WorkId> = (0..self.grid.tensor)
                        .map(|t| {
                            let src = self.grid.device(dp, producer_stage, t);
                            let dst = self.grid.device(dp, stage, t);
                            let wait = vec![self.avail[&(producer, dp)][t]];
                            self.push(
                                name.clone(),
                                WorkKind::Collective {
                                    collective: CollectiveKind::SendRecv,
                                    participants: vec![src, dst],
                                    payload_bytes: payload,
                                    output_bytes: payload,
                                },
                                wait,
                            )
                        })
                        .collect();
                    self.fwd_transfers.insert(key, ids);
                }
                deps.push(self.fwd_transfers[&key][tp]);
            }
        }
        deps
    }

    fn emit_forward(&mut self, registry: &OpRegistry) -> Result<(), StrategyError> {
        for stage in 0..self.stages.len() {
            for op_id in self.stages[stage].clone() {
                let op = self.graph.op(op_id).clone();
                let shard = self.shard_info(registry, &op)?;
                if shard.expert_parallel {
                    self.emit_forward_expert(&op, &shard);
                } else {
                    self.emit_forward_dense(&op, &shard, stage);
                }
            }
        }
        Ok(())
    }

    fn emit_forward_dense(&mut self, op: &Operator, shard: &ShardInfo, stage: usize) {
        let lb = self.local_batch;
        let full_output = op.cost.output_bytes * lb;
        for dp in 0..self.grid.data {
            let compute_ids: Vec<WorkId> = (0..self.grid.tensor)
                .map(|tp| {
                    let wait = self.fwd_deps(op, dp, tp);
                    self.push(
                        format!("{}.fwd", op.name),
                        WorkKind::Compute {
                            device: self.grid.device(dp, stage, tp),
                            flops: op.cost.flops * lb as f64 / shard.factor as f64,
                            moved_bytes: op.cost.moved_bytes * lb / shard.factor,
                            // Partial shards are materialized by the
                            // collective below, not by the compute itself.
                            output_bytes: if shard.fwd_collective.is_some() {
                                0
                            } else {
                                full_output
                            },
                            precision: op.precision,
                        },
                        wait,
                    )
                })
                .collect();

            let avail_ids = match shard.fwd_collective {
                Some(kind) => {
                    let id = self.push(
                        format!("{}.fwd.{kind}", op.name),
                        WorkKind::Collective {
                            collective: kind,
                            participants: self.grid.tensor_group(dp, stage),
                            payload_bytes: full_output,
                            output_bytes: full_output,
                        },
                        compute_ids,
                    );
                    vec![id; self.grid.tensor]
                }
                None => compute_ids,
            };
            self.avail.insert((op.id, dp), avail_ids);
        }
    }

    fn emit_forward_expert(&mut self, op: &Operator, shard: &ShardInfo) {
        let lb = self.local_batch;
        let stage = self.stage_of[op.id];
        let input_payload = op.cost.input_bytes * lb;
        let output_payload = op.cost.output_bytes * lb;
        for group in 0..self.grid.data / self.grid.expert {
            let members: Vec<usize> =
                (group * self.grid.expert..(group + 1) * self.grid.expert).collect();
            for tp in 0..self.grid.tensor {
                let dispatch_wait: Vec<WorkId> = members
                    .iter()
                    .flat_map(|&dp| self.fwd_deps(op, dp, tp))
                    .collect();
                let participants = self.grid.expert_group(members[0], stage, tp);
                let dispatch = self.push(
                    format!("{}.dispatch.alltoall", op.name),
                    WorkKind::Collective {
                        collective: CollectiveKind::AllToAll,
                        participants: participants.clone(),
                        payload_bytes: input_payload,
                        output_bytes: 0,
                    },
                    dispatch_wait,
                );
                let compute_ids: Vec<WorkId> = members
                    .iter()
                    .map(|&dp| {
                        self.push(
                            format!("{}.fwd", op.name),
                            WorkKind::Compute {
                                device: self.grid.device(dp, stage, tp),
                                flops: op.cost.flops * lb as f64 / shard.factor as f64,
                                moved_bytes: op.cost.moved_bytes * lb / shard.factor,
                                output_bytes: 0,
                                precision: op.precision,
                            },
                            vec![dispatch],
                        )
                    })
                    .collect();
                let combine = self.push(
                    format!("{}.combine.alltoall", op.name),
                    WorkKind::Collective {
                        collective: CollectiveKind::AllToAll,
                        participants,
                        payload_bytes: output_payload,
                        output_bytes: output_payload,
                    },
                    compute_ids,
                );
                for &dp in &members {
                    self.avail
                        .entry((op.id, dp))
                        .or_insert_with(|| vec![0; self.grid.tensor])[tp] = combine;
                }
            }
        }
    }

    /// Backward dependencies of `op` for one (dp, tp) coordinate: the
    /// forward activation plus the gradients flowing back from consumers.
    fn bwd_deps(&mut self, op: &Operator, dp: usize, tp: usize) -> Vec<WorkId> {
        let stage = self.stage_of[op.id];
        let mut deps = vec![self.avail[&(op.id, dp)][tp]];
        for consumer in self.graph.consumers(op.id) {
            let consumer_stage = self.stage_of[consumer];
            if consumer_stage == stage {
                deps.push(self.bwd_avail[&(consumer, dp)][tp]);
            } else {
                let key = (op.id, consumer, dp);
                if !self.bwd_transfers.contains_key(&key) {
                    let payload = op.cost.output_bytes * self.local_batch;
                    let name = format!("{}.grad.sendrecv", op.name);
                    let ids: Vec<WorkId> = (0..self.grid.tensor)
                        .map(|t| {
                            let src = self.grid.device(dp, consumer_stage, t);
                            let dst = self.grid.device(dp, stage, t);
                            let wait = vec![self.bwd_avail[&(consumer, dp)][t]];
                            self.push(
                                name.clone(),
                                WorkKind::Collective {
                                    collective: CollectiveKind::SendRecv,
                                    participants: vec![src, dst],
                                    payload_bytes: payload,
                                    output_bytes: payload,
                                },
                                wait,
                            )
                        })
                        .collect();
                    self.bwd_transfers.insert(key, ids);
                }
                deps.push(self.bwd_transfers[&key][tp]);
            }
        }
        deps
    }

    fn emit_backward(&mut self, registry: &OpRegistry) -> Result<(), StrategyError> {
        for stage in (0..self.stages.len()).rev() {
            for op_id in self.stages[stage].clone().rev() {
                let op = self.graph.op(op_id).clone();
                let shard = self.shard_info(registry, &op)?;
                if shard.expert_parallel {
                    self.emit_backward_expert(&op, &shard);
                } else {
                    self.emit_backward_dense(&op, &shard, stage);
                }
            }
        }
        Ok(())
    }

    fn emit_backward_dense(&mut self, op: &Operator, shard: &ShardInfo, stage: usize) {
        let lb = self.local_batch;
        let grad_output = op.cost.input_bytes * lb;
        for dp in 0..self.grid.data {
            let compute_ids: Vec<WorkId> = (0..self.grid.tensor)
                .map(|tp| {
                    let wait = self.bwd_deps(op, dp, tp);
                    let device = self.grid.device(dp, stage, tp);
                    let id = self.push(
                        format!("{}.bwd", op.name),
                        WorkKind::Compute {
                            device,
                            // Grad-wrt-input and grad-wrt-weight each redo
                            // roughly the forward work.
                            flops: 2.0 * op.cost.flops * lb as f64 / shard.factor as f64,
                            moved_bytes: 2 * op.cost.moved_bytes * lb / shard.factor,
                            output_bytes: if shard.bwd_collective.is_some() {
                                0
                            } else {
                                grad_output
                            },
                            precision: op.precision,
                        },
                        wait,
                    );
                    self.bwd_items_by_device[device].push(id);
                    id
                })
                .collect();

            let avail_ids = match shard.bwd_collective {
                Some(kind) => {
                    let id = self.push(
                        format!("{}.bwd.{kind}", op.name),
                        WorkKind::Collective {
                            collective: kind,
                            participants: self.grid.tensor_group(dp, stage),
                            payload_bytes: grad_output,
                            output_bytes: grad_output,
                        },
                        compute_ids,
                    );
                    vec![id; self.grid.tensor]
                }
                None => compute_ids,
            };
            self.bwd_avail.insert((op.id, dp), avail_ids);
        }
    }

    fn emit_backward_expert(&mut self, op: &Operator, shard: &ShardInfo) {
        let lb = self.local_batch;
        let stage = self.stage_of[op.id];
        let grad_in_payload = op.cost.output_bytes * lb;
        let grad_out_payload = op.cost.input_bytes * lb;
        for group in 0..self.grid.data / self.grid.expert {
            let members: Vec<usize> =
                (group * self.grid.expert..(group + 1) * self.grid.expert).collect();
            for tp in 0..self.grid.tensor {
                let combine_wait: Vec<WorkId> = members
                    .iter()
                    .flat_map(|&dp| self.bwd_deps(op, dp, tp))
                    .collect();
                let participants = self.grid.expert_group(members[0], stage, tp);
                let grad_combine = self.push(
                    format!("{}.grad_combine.alltoall", op.name),
                    WorkKind::Collective {
                        collective: CollectiveKind::AllToAll,
                        participants: participants.clone(),
                        payload_bytes: grad_in_payload,
                        output_bytes: 0,
                    },
                    combine_wait,
                );
                let compute_ids: Vec<WorkId> = members
                    .iter()
                    .map(|&dp| {
                        let device = self.grid.device(dp, stage, tp);
                        let id = self.push(
                            format!("{}.bwd", op.name),
                            WorkKind::Compute {
                                device,
                                flops: 2.0 * op.cost.flops * lb as f64 / shard.factor as f64,
                                moved_bytes: 2 * op.cost.moved_bytes * lb / shard.factor,
                                output_bytes: 0,
                                precision: op.precision,
                            },
                            vec![grad_combine],
                        );
                        self.bwd_items_by_device[device].push(id);
                        id
                    })
                    .collect();
                let grad_dispatch = self.push(
                    format!("{}.grad_dispatch.alltoall", op.name),
                    WorkKind::Collective {
                        collective: CollectiveKind::AllToAll,
                        participants,
                        payload_bytes: grad_out_payload,
                        output_bytes: grad_out_payload,
                    },
                    compute_ids,
                );
                for &dp in &members {
                    self.bwd_avail
                        .entry((op.id, dp))
                        .or_insert_with(|| vec![0; self.grid.tensor])[tp] = grad_dispatch;
                }
            }
        }
    }

    /// Emit the step-end gradient collectives: one all-reduce per
    /// data-parallel group for the dense parameters, plus one per expert
    /// shard over the replicas holding that shard.
    ///
    /// These are created after every backward tensor-parallel collective,
    /// so the creation-order tie-break schedules tensor-parallel traffic
    /// first whenever both are ready at once.
    fn emit_gradient_exchange(&mut self, registry: &OpRegistry) {
        if self.grid.data == 1 {
            return;
        }
        for stage in 0..self.stages.len() {
            let (dense_grad, expert_grad) = self.stage_grad_bytes(registry, stage);
            for tp in 0..self.grid.tensor {
                let members = self.grid.data_group(stage, tp);
                let wait: Vec<WorkId> = members
                    .iter()
                    .flat_map(|&d| self.bwd_items_by_device[d].iter().copied())
                    .collect();
                if dense_grad > 0 {
                    self.push(
                        format!("stage{stage}.grad.allreduce"),
                        WorkKind::Collective {
                            collective: CollectiveKind::AllReduce,
                            participants: members,
                            payload_bytes: dense_grad,
                            output_bytes: 0,
                        },
                        wait.clone(),
                    );
                }
                if expert_grad > 0 {
                    for shard in 0..self.grid.expert {
                        let replicas = self.grid.expert_replica_group(shard, stage, tp);
                        if replicas.len() < 2 {
                            continue;
                        }
                        let wait: Vec<WorkId> = replicas
                            .iter()
                            .flat_map(|&d| self.bwd_items_by_device[d].iter().copied())
                            .collect();
                        self.push(
                            format!("stage{stage}.expert{shard}.grad.allreduce"),
                            WorkKind::Collective {
                                collective: CollectiveKind::AllReduce,
                                participants: replicas,
                                payload_bytes: expert_grad,
                                output_bytes: 0,
                            },
                            wait,
                        );
                    }
                }
            }
        }
    }

    /// Per-device gradient payloads for one stage: (dense, per-expert-shard)
    /// bytes at each operator's compute precision.
    fn stage_grad_bytes(&self, registry: &OpRegistry, stage: usize) -> (u64, u64) {
        let mut dense = 0;
        let mut expert = 0;
        for op_id in self.stages[stage].clone() {
            let op = self.graph.op(op_id);
            let shard = self
                .shard_info(registry, op)
                .expect("shard info already validated during emission");
            let grad_bytes = op.cost.param_count * op.precision.bytes() / shard.factor;
            if shard.expert_parallel {
                expert += grad_bytes;
            } else {
                dense += grad_bytes;
            }
        }
        (dense, expert)
    }

    /// Resident parameter bytes per device.
    fn param_bytes_per_device(&self, registry: &OpRegistry) -> Result<Vec<u64>, StrategyError> {
        let device_count = self.grid.data * self.grid.pipeline * self.grid.tensor;
        let mut bytes = vec![0u64; device_count];
        for stage in 0..self.stages.len() {
            let mut per_device = 0;
            for op_id in self.stages[stage].clone() {
                let op = self.graph.op(op_id);
                let shard = self.shard_info(registry, op)?;
                per_device += op.cost.param_bytes / shard.factor;
            }
            for dp in 0..self.grid.data {
                for tp in 0..self.grid.tensor {
                    bytes[self.grid.device(dp, stage, tp)] = per_device;
                }
            }
        }
        Ok(bytes)
    }
}
