// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Per-operator-kind cost formulas.
//!
//! The operator set is closed; each kind has one entry here computing its
//! FLOPs, parameter bytes and tensor sizes from the shape description. The
//! [`OpRegistry`] is constructed once per process and passed read-only into
//! the graph builder, so all cost knowledge lives in a single place.

use shunt_config::{OpSpec, Precision};

/// Classes the sharding rules of a task are keyed by.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// Dense matrix multiplies.
    MatMul,
    /// Self-attention layers.
    Attention,
    /// Embedding-table lookups.
    Embedding,
    /// Pointwise work.
    Elementwise,
    /// Mixture-of-experts feed-forward blocks.
    ExpertFfn,
}

/// Parameter byte widths taken from the model document.
#[derive(Copy, Clone, Debug)]
pub struct ParamBytes {
    /// Bytes per dense parameter (weight + gradient/optimizer state).
    pub nonemb: u64,
    /// Bytes per embedding-table parameter.
    pub emb: u64,
}

/// Cost annotations for one operator, per sample.
#[derive(Copy, Clone, Debug, Default)]
pub struct OpCost {
    /// Multiply-accumulate work, counted as 2 FLOPs per MAC.
    pub flops: f64,
    /// Parameters held by the operator.
    pub param_count: u64,
    /// Resident parameter bytes (weights scaled by the model's per-parameter
    /// byte width).
    pub param_bytes: u64,
    /// Bytes of the input activation.
    pub input_bytes: u64,
    /// Bytes of the produced activation.
    pub output_bytes: u64,
    /// Bytes moved through device memory, for roofline costing.
    pub moved_bytes: u64,
}

/// The read-only registry of per-kind cost formulas.
#[derive(Clone, Debug, Default)]
pub struct OpRegistry {}

impl OpRegistry {
    /// Create the registry.
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// The sharding class of an operator.
    #[must_use]
    pub fn class(&self, spec: &OpSpec) -> OpClass {
        match spec {
            OpSpec::MatMul { .. } => OpClass::MatMul,
            OpSpec::Attention { .. } => OpClass::Attention,
            OpSpec::EmbeddingLookup { .. } => OpClass::Embedding,
            OpSpec::Elementwise { .. } => OpClass::Elementwise,
            OpSpec::ExpertFfn { .. } => OpClass::ExpertFfn,
        }
    }

    /// Feature dimension the operator consumes, where defined.
    ///
    /// Used for producer/consumer shape checking; `None` means the operator
    /// passes shapes through unchecked (elementwise work).
    #[must_use]
    pub fn input_dim(&self, spec: &OpSpec) -> Option<u64> {
        match spec {
            OpSpec::MatMul { k, .. } => Some(*k),
            OpSpec::Attention {
                heads, head_dim, ..
            } => Some(heads * head_dim),
            OpSpec::EmbeddingLookup { .. } => None,
            OpSpec::Elementwise { .. } => None,
            OpSpec::ExpertFfn { dim, .. } => Some(*dim),
        }
    }

    /// Feature dimension the operator produces, where defined.
    #[must_use]
    pub fn output_dim(&self, spec: &OpSpec) -> Option<u64> {
        match spec {
            OpSpec::MatMul { n, .. } => Some(*n),
            OpSpec::Attention {
                heads, head_dim, ..
            } => Some(heads * head_dim),
            OpSpec::EmbeddingLookup { dim, .. } => Some(*dim),
            OpSpec::Elementwise { .. } => None,
            OpSpec::ExpertFfn { dim, .. } => Some(*dim),
        }
    }

    /// Per-sample cost of one operator at the given precision.
    #[must_use]
    pub fn cost(&self, spec: &OpSpec, precision: Precision, params: &ParamBytes) -> OpCost {
        let pb = precision.bytes();
        match *spec {
            OpSpec::MatMul { m, n, k } => OpCost {
                flops: 2.0 * m as f64 * n as f64 * k as f64,
                param_count: n * k,
                param_bytes: n * k * params.nonemb,
                input_bytes: m * k * pb,
                output_bytes: m * n * pb,
                moved_bytes: (m * k + k * n + m * n) * pb,
            },
            OpSpec::Attention {
                seq,
                heads,
                head_dim,
            } => {
                let d = heads * head_dim;
                // QKV + output projections, then the score and context
                // batched products.
                let proj_flops = 2.0 * (4 * d * d) as f64 * seq as f64;
                let attn_flops = 4.0 * (seq * seq) as f64 * d as f64;
                OpCost {
                    flops: proj_flops + attn_flops,
                    param_count: 4 * d * d,
                    param_bytes: 4 * d * d * params.nonemb,
                    input_bytes: seq * d * pb,
                    output_bytes: seq * d * pb,
                    moved_bytes: (4 * d * d + 4 * seq * d) * pb,
                }
            }
            OpSpec::EmbeddingLookup {
                entries,
                dim,
                lookups,
            } => OpCost {
                flops: 0.0,
                param_count: entries * dim,
                param_bytes: entries * dim * params.emb,
                input_bytes: 0,
                output_bytes: lookups * dim * pb,
                // Gather reads plus activation write-back.
                moved_bytes: 2 * lookups * dim * params.emb,
            },
            OpSpec::Elementwise { elems } => OpCost {
                flops: elems as f64,
                param_count: 0,
                param_bytes: 0,
                input_bytes: elems * pb,
                output_bytes: elems * pb,
                moved_bytes: 2 * elems * pb,
            },
            OpSpec::ExpertFfn {
                experts,
                active,
                dim,
                ffn_dim,
                seq,
            } => {
                let expert_params = 2 * dim * ffn_dim;
                OpCost {
                    flops: 2.0 * (active * expert_params) as f64 * seq as f64,
                    param_count: experts * expert_params,
                    param_bytes: experts * expert_params * params.nonemb,
                    input_bytes: seq * dim * pb,
                    output_bytes: seq * dim * pb,
                    moved_bytes: (active * expert_params + 2 * seq * dim) * pb,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: ParamBytes = ParamBytes { nonemb: 6, emb: 2 };

    #[test]
    fn matmul_cost_is_two_mnk() {
        let registry = OpRegistry::new();
        let cost = registry.cost(
            &OpSpec::MatMul {
                m: 1024,
                n: 1024,
                k: 1024,
            },
            Precision::F16,
            &PARAMS,
        );
        assert_eq!(cost.flops, 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(cost.output_bytes, 1024 * 1024 * 2);
        assert_eq!(cost.param_bytes, 1024 * 1024 * 6);
    }

    #[test]
    fn embedding_is_bandwidth_bound() {
        let registry = OpRegistry::new();
        let cost = registry.cost(
            &OpSpec::EmbeddingLookup {
                entries: 1 << 20,
                dim: 64,
                lookups: 128,
            },
            Precision::F16,
            &PARAMS,
        );
        assert_eq!(cost.flops, 0.0);
        assert_eq!(cost.moved_bytes, 2 * 128 * 64 * 2);
        assert_eq!(cost.param_bytes, (1 << 20) * 64 * 2);
    }

    #[test]
    fn expert_ffn_scales_with_active_experts() {
        let registry = OpRegistry::new();
        let active = registry.cost(
            &OpSpec::ExpertFfn {
                experts: 8,
                active: 2,
                dim: 16,
                ffn_dim: 64,
                seq: 4,
            },
            Precision::F16,
            &PARAMS,
        );
        let dense_equivalent = 2.0 * (2 * 2 * 16 * 64) as f64 * 4.0;
        assert_eq!(active.flops, dense_equivalent);
        // All experts stay resident even when only some are active.
        assert_eq!(active.param_bytes, 8 * 2 * 16 * 64 * 6);
    }

    #[test]
    fn attention_dims_come_from_heads() {
        let registry = OpRegistry::new();
        let spec = OpSpec::Attention {
            seq: 32,
            heads: 4,
            head_dim: 8,
        };
        assert_eq!(registry.input_dim(&spec), Some(32));
        assert_eq!(registry.output_dim(&spec), Some(32));
        assert_eq!(registry.class(&spec), OpClass::Attention);
    }
}
