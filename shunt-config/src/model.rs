// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The model document: the operator list describing one sample's computation.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Numeric precision of an operator or of the task's compute policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// IEEE double precision.
    F64,
    /// IEEE single precision (or TF32 on hardware that maps it there).
    F32,
    /// Half precision (FP16/BF16).
    #[default]
    F16,
    /// 8-bit integer.
    I8,
}

impl Precision {
    /// Bytes per element at this precision.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        match self {
            Precision::F64 => 8,
            Precision::F32 => 4,
            Precision::F16 => 2,
            Precision::I8 => 1,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Precision::F64 => write!(f, "fp64"),
            Precision::F32 => write!(f, "fp32"),
            Precision::F16 => write!(f, "fp16"),
            Precision::I8 => write!(f, "int8"),
        }
    }
}

/// The closed set of operator shapes the graph builder understands.
///
/// All sizes describe the computation for a single sample; the parallelism
/// mapper scales by the per-replica batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpSpec {
    /// Dense `m x k` by `k x n` matrix multiply against a weight matrix.
    #[serde(rename = "matmul")]
    MatMul {
        /// Rows of the activation operand.
        m: u64,
        /// Columns of the weight operand (output features).
        n: u64,
        /// Shared inner dimension (input features).
        k: u64,
    },
    /// One multi-head self-attention layer (QKV + output projections plus
    /// the score/context batched products).
    Attention {
        /// Sequence length.
        seq: u64,
        /// Number of attention heads.
        heads: u64,
        /// Feature dimension per head.
        head_dim: u64,
    },
    /// Sparse embedding-table lookup; bandwidth-bound, zero FLOPs.
    EmbeddingLookup {
        /// Rows in the embedding table.
        entries: u64,
        /// Feature dimension of each row.
        dim: u64,
        /// Rows gathered per sample.
        lookups: u64,
    },
    /// Pointwise work (activations, residual adds, norms).
    Elementwise {
        /// Elements touched per sample.
        elems: u64,
    },
    /// Mixture-of-experts feed-forward block.
    ExpertFfn {
        /// Total experts in the layer.
        experts: u64,
        /// Experts active per token.
        active: u64,
        /// Model feature dimension.
        dim: u64,
        /// Hidden dimension of each expert.
        ffn_dim: u64,
        /// Sequence length (tokens routed per sample).
        seq: u64,
    },
}

impl OpSpec {
    /// Short kind name used in logs and span names.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpSpec::MatMul { .. } => "matmul",
            OpSpec::Attention { .. } => "attention",
            OpSpec::EmbeddingLookup { .. } => "embedding_lookup",
            OpSpec::Elementwise { .. } => "elementwise",
            OpSpec::ExpertFfn { .. } => "expert_ffn",
        }
    }
}

/// One operator entry of the model document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpConfig {
    /// Unique operator name.
    pub name: String,
    /// Shape description.
    #[serde(flatten)]
    pub spec: OpSpec,
    /// Per-operator precision override; the task precision policy applies
    /// when absent.
    #[serde(default)]
    pub precision: Option<Precision>,
    /// Names of producing operators. Defaults to the previous operator in
    /// document order.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
}

/// The parsed model configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name, used in reports.
    pub name: String,
    /// Bytes held per dense parameter (weight plus gradient/optimizer state
    /// for training setups).
    pub bytes_per_nonemb_param: u64,
    /// Bytes held per embedding-table parameter.
    pub bytes_per_emb_param: u64,
    /// Tokens per sample; enables tokens/s in the report when present.
    #[serde(default)]
    pub seq_len: Option<u64>,
    /// Operator list in topological source order.
    pub ops: Vec<OpConfig>,
}

impl ModelConfig {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bytes_per_nonemb_param == 0 {
            return Err(ConfigError::Invalid {
                field: "bytes_per_nonemb_param".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.bytes_per_emb_param == 0 {
            return Err(ConfigError::Invalid {
                field: "bytes_per_emb_param".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
