// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Workload graph builder.
//!
//! Turns the model document's operator list into a directed acyclic graph of
//! cost-annotated operators. Document order is the default dependency order:
//! an operator with no explicit `inputs` consumes its predecessor. Explicit
//! inputs may only name operators declared earlier, which keeps the graph
//! acyclic by construction and preserves the source's topological order.

use std::collections::HashMap;

use shunt_config::{ModelConfig, OpSpec, Precision};

use crate::ModelSpecError;
use crate::ops::{OpCost, OpRegistry, ParamBytes};

/// Index of an operator within its [`WorkloadGraph`].
pub type OpId = usize;

/// One cost-annotated compute operator.
#[derive(Clone, Debug)]
pub struct Operator {
    /// Graph index.
    pub id: OpId,
    /// Operator name from the model document.
    pub name: String,
    /// Shape description.
    pub spec: OpSpec,
    /// Resolved numeric precision.
    pub precision: Precision,
    /// Per-sample cost annotations.
    pub cost: OpCost,
    /// Producing operators.
    pub inputs: Vec<OpId>,
}

/// The directed acyclic operator graph for one model.
#[derive(Clone, Debug)]
pub struct WorkloadGraph {
    /// Model name.
    pub name: String,
    /// Tokens per sample, when the model declares it.
    pub seq_len: Option<u64>,
    ops: Vec<Operator>,
}

impl WorkloadGraph {
    /// Build the graph from a model document.
    ///
    /// `default_precision` is the task's compute precision policy, applied
    /// to operators without their own override.
    pub fn build(
        model: &ModelConfig,
        registry: &OpRegistry,
        default_precision: Precision,
    ) -> Result<Self, ModelSpecError> {
        if model.ops.is_empty() {
            return Err(ModelSpecError::EmptyModel);
        }

        let params = ParamBytes {
            nonemb: model.bytes_per_nonemb_param,
            emb: model.bytes_per_emb_param,
        };

        let mut ops: Vec<Operator> = Vec::with_capacity(model.ops.len());
        let mut name_to_id: HashMap<String, OpId> = HashMap::with_capacity(model.ops.len());

        for (id, op_config) in model.ops.iter().enumerate() {
            if name_to_id.contains_key(op_config.name.as_str()) {
                return Err(ModelSpecError::DuplicateOperator {
                    name: op_config.name.clone(),
                });
            }

            validate_spec(&op_config.name, &op_config.spec)?;

            let inputs = match &op_config.inputs {
                Some(names) => {
                    let mut inputs = Vec::with_capacity(names.len());
                    for input_name in names {
                        // Only already-declared operators may be named, so
                        // cycles and forward references are both caught here.
                        let producer_id = *name_to_id.get(input_name.as_str()).ok_or_else(|| {
                            ModelSpecError::UnknownInput {
                                op: op_config.name.clone(),
                                input: input_name.clone(),
                            }
                        })?;
                        inputs.push(producer_id);
                    }
                    inputs
                }
                None if id > 0 => vec![id - 1],
                None => Vec::new(),
            };

            for &producer_id in &inputs {
                check_shapes(registry, &ops[producer_id], op_config)?;
            }

            let precision = op_config.precision.unwrap_or(default_precision);
            ops.push(Operator {
                id,
                name: op_config.name.clone(),
                spec: op_config.spec.clone(),
                precision,
                cost: registry.cost(&op_config.spec, precision, &params),
                inputs,
            });
            name_to_id.insert(op_config.name.clone(), id);
        }

        log::debug!(
            "built graph '{}': {} ops, {:.3} GFLOPs/sample",
            model.name,
            ops.len(),
            ops.iter().map(|o| o.cost.flops).sum::<f64>() / 1e9
        );

        Ok(Self {
            name: model.name.clone(),
            seq_len: model.seq_len,
            ops,
        })
    }

    /// All operators, in topological (document) order.
    #[must_use]
    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    /// The operator with the given id.
    #[must_use]
    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id]
    }

    /// Ids of the operators that consume `id`'s output.
    #[must_use]
    pub fn consumers(&self, id: OpId) -> Vec<OpId> {
        self.ops
            .iter()
            .filter(|op| op.inputs.contains(&id))
            .map(|op| op.id)
            .collect()
    }

    /// Total per-sample FLOPs over the whole graph.
    #[must_use]
    pub fn total_flops(&self) -> f64 {
        self.ops.iter().map(|o| o.cost.flops).sum()
    }

    /// Total parameter bytes over the whole graph.
    #[must_use]
    pub fn total_param_bytes(&self) -> u64 {
        self.ops.iter().map(|o| o.cost.param_bytes).sum()
    }
}

fn validate_spec(name: &str, spec: &OpSpec) -> Result<(), ModelSpecError> {
    let bad = |reason: &str| {
        Err(ModelSpecError::InvalidOperator {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    match *spec {
        OpSpec::MatMul { m, n, k } => {
            if m == 0 || n == 0 || k == 0 {
                return bad("matmul dimensions must be non-zero");
            }
        }
        OpSpec::Attention {
            seq,
            heads,
            head_dim,
        } => {
            if seq == 0 || heads == 0 || head_dim == 0 {
                return bad("attention dimensions must be non-zero");
            }
        }
        OpSpec::EmbeddingLookup {
            entries,
            dim,
            lookups,
        } => {
            if entries == 0 || dim == 0 || lookups == 0 {
                return bad("embedding dimensions must be non-zero");
            }
        }
        OpSpec::Elementwise { elems } => {
            if elems == 0 {
                return bad("elementwise size must be non-zero");
            }
        }
        OpSpec::ExpertFfn {
            experts,
            active,
            dim,
            ffn_dim,
            seq,
        } => {
            if experts == 0 || dim == 0 || ffn_dim == 0 || seq == 0 {
                return bad("expert ffn dimensions must be non-zero");
            }
            if active == 0 || active > experts {
                return bad("active experts must be in 1..=experts");
            }
        }
    }
    Ok(())
}

fn check_shapes(
    registry: &OpRegistry,
    producer: &Operator,
    consumer: &shunt_config::OpConfig,
) -> Result<(), ModelSpecError> {
    let (Some(produced), Some(expected)) = (
        registry.output_dim(&producer.spec),
        registry.input_dim(&consumer.spec),
    ) else {
        return Ok(());
    };
    if produced != expected {
        return Err(ModelSpecError::ShapeMismatch {
            producer: producer.name.clone(),
            consumer: consumer.name.clone(),
            produced,
            expected,
        });
    }
    Ok(())
}
