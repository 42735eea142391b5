// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The task document: what is run, with which parallelism strategy.

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Precision};

/// Kind of workload being modelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Forward + backward pass and a gradient exchange per step.
    Train,
    /// Forward pass only.
    Inference,
}

/// Parallelism degrees. All default to 1.
///
/// `data * tensor * pipeline` must equal the device count; `expert` must
/// divide `data` (experts are sharded across data-parallel ranks).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelismConfig {
    /// Data-parallel replica count.
    #[serde(default = "one")]
    pub data: usize,
    /// Tensor-parallel group size.
    #[serde(default = "one")]
    pub tensor: usize,
    /// Pipeline stage count.
    #[serde(default = "one")]
    pub pipeline: usize,
    /// Expert-parallel group size.
    #[serde(default = "one")]
    pub expert: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            data: 1,
            tensor: 1,
            pipeline: 1,
            expert: 1,
        }
    }
}

fn one() -> usize {
    1
}

/// How operators of one class are laid out across the tensor-parallel group.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRule {
    /// Every rank holds the full operator.
    Replicate,
    /// The operator's output features (or experts) are split across ranks.
    #[default]
    Shard,
}

/// Sharding rule per operator class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Rule for matmul operators.
    #[serde(default)]
    pub matmul: ShardRule,
    /// Rule for attention operators.
    #[serde(default)]
    pub attention: ShardRule,
    /// Rule for embedding lookups.
    #[serde(default = "replicate")]
    pub embedding: ShardRule,
    /// Rule for elementwise operators.
    #[serde(default = "replicate")]
    pub elementwise: ShardRule,
    /// Rule for expert feed-forward blocks.
    #[serde(default)]
    pub expert_ffn: ShardRule,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            matmul: ShardRule::Shard,
            attention: ShardRule::Shard,
            embedding: ShardRule::Replicate,
            elementwise: ShardRule::Replicate,
            expert_ffn: ShardRule::Shard,
        }
    }
}

fn replicate() -> ShardRule {
    ShardRule::Replicate
}

/// Which all-reduce cost formula the communication model uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllReduceAlgorithm {
    /// Pick the cheaper of ring and tree per call.
    #[default]
    Auto,
    /// Ring reduce-scatter + all-gather; bandwidth-optimal.
    Ring,
    /// Recursive halving/doubling; latency-optimal.
    Tree,
}

/// Fixed overhead applied every `interval` steps (checkpoint writes).
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Steps between checkpoints.
    pub interval: u32,
    /// Overhead per checkpoint in seconds.
    pub overhead_s: f64,
}

/// The parsed task configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name, used in reports.
    pub name: String,
    /// Train or inference.
    pub kind: TaskKind,
    /// Samples per step across the whole system.
    pub global_batch_size: u64,
    /// Steps to aggregate over.
    #[serde(default = "one_u32")]
    pub iterations: u32,
    /// Parallelism degrees.
    #[serde(default)]
    pub parallelism: ParallelismConfig,
    /// Compute precision policy for operators without their own override.
    #[serde(default)]
    pub precision: Precision,
    /// Sharding rule per operator class.
    #[serde(default)]
    pub sharding: ShardingConfig,
    /// All-reduce algorithm selection.
    #[serde(default)]
    pub allreduce: AllReduceAlgorithm,
    /// Optional periodic checkpoint overhead.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

fn one_u32() -> u32 {
    1
}

impl TaskConfig {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "global_batch_size".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "iterations".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        let p = &self.parallelism;
        for (field, degree) in [
            ("parallelism.data", p.data),
            ("parallelism.tensor", p.tensor),
            ("parallelism.pipeline", p.pipeline),
            ("parallelism.expert", p.expert),
        ] {
            if degree == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be non-zero".to_string(),
                });
            }
        }
        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.interval == 0 {
                return Err(ConfigError::Invalid {
                    field: "checkpoint.interval".to_string(),
                    reason: "must be non-zero".to_string(),
                });
            }
            if checkpoint.overhead_s < 0.0 {
                return Err(ConfigError::Invalid {
                    field: "checkpoint.overhead_s".to_string(),
                    reason: "must not be negative".to_string(),
                });
            }
        }
        Ok(())
    }
}
