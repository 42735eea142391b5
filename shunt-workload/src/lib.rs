// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Workload graph construction and parallelism mapping.
//!
//! Two stages live here. The [graph builder](crate::graph) converts a model
//! document into a DAG of cost-annotated operators. The
//! [parallelism mapper](crate::parallel) then applies a task's parallelism
//! strategy to that DAG, producing per-device work streams plus the
//! collective operations required to keep the sharded computation
//! consistent. The simulation engine consumes the mapped workload without
//! ever looking back at the model document.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use std::error::Error;
use std::fmt;

pub mod graph;
pub mod ops;
pub mod parallel;

pub use graph::{OpId, Operator, WorkloadGraph};
pub use ops::{OpClass, OpCost, OpRegistry, ParamBytes};
pub use parallel::{
    CollectiveKind, DeviceGrid, MappedWorkload, WorkId, WorkItem, WorkKind, map_workload,
};

/// Errors raised while building the workload graph.
#[derive(Debug)]
pub enum ModelSpecError {
    /// The model declares no operators.
    EmptyModel,
    /// Two operators share a name.
    DuplicateOperator {
        /// The repeated name.
        name: String,
    },
    /// An operator names an input that is not declared before it.
    UnknownInput {
        /// The consuming operator.
        op: String,
        /// The name it asked for.
        input: String,
    },
    /// A producer's output dimension does not match a consumer's input
    /// dimension.
    ShapeMismatch {
        /// Producing operator.
        producer: String,
        /// Consuming operator.
        consumer: String,
        /// Dimension the producer emits.
        produced: u64,
        /// Dimension the consumer expects.
        expected: u64,
    },
    /// An operator's shape description is internally inconsistent.
    InvalidOperator {
        /// The offending operator.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl fmt::Display for ModelSpecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelSpecError::EmptyModel => {
                write!(f, "model declares no operators")
            }
            ModelSpecError::DuplicateOperator { name } => {
                write!(f, "operator '{name}' is declared more than once")
            }
            ModelSpecError::UnknownInput { op, input } => {
                write!(
                    f,
                    "operator '{op}' consumes '{input}', which is not declared before it"
                )
            }
            ModelSpecError::ShapeMismatch {
                producer,
                consumer,
                produced,
                expected,
            } => write!(
                f,
                "operator '{consumer}' expects input dimension {expected} but '{producer}' produces {produced}"
            ),
            ModelSpecError::InvalidOperator { name, reason } => {
                write!(f, "operator '{name}': {reason}")
            }
        }
    }
}

impl Error for ModelSpecError {}

/// Errors raised while applying a parallelism strategy.
#[derive(Debug)]
pub enum StrategyError {
    /// The product of data/tensor/pipeline degrees does not match the
    /// device count.
    DegreeMismatch {
        /// `data * tensor * pipeline`.
        required: usize,
        /// Devices the topology declares.
        devices: usize,
    },
    /// The global batch does not divide across the data-parallel replicas.
    IndivisibleBatch {
        /// Global batch size.
        batch: u64,
        /// Data-parallel degree.
        data: usize,
    },
    /// A sharded dimension does not divide by the tensor-parallel degree.
    IndivisibleDim {
        /// The offending operator.
        op: String,
        /// Which dimension failed.
        dim: &'static str,
        /// Its size.
        size: u64,
        /// The tensor-parallel degree.
        degree: usize,
    },
    /// An expert count does not divide by the expert-parallel degree.
    IndivisibleExperts {
        /// The offending operator.
        op: String,
        /// Experts in the layer.
        experts: u64,
        /// The expert-parallel degree.
        degree: usize,
    },
    /// The expert-parallel degree does not divide the data-parallel degree.
    ExpertDegree {
        /// Expert-parallel degree.
        expert: usize,
        /// Data-parallel degree.
        data: usize,
    },
    /// More pipeline stages than operators.
    TooManyStages {
        /// Requested stages.
        stages: usize,
        /// Operators available.
        ops: usize,
    },
}

impl fmt::Display for StrategyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrategyError::DegreeMismatch { required, devices } => write!(
                f,
                "parallelism degrees require {required} devices but the topology declares {devices}"
            ),
            StrategyError::IndivisibleBatch { batch, data } => write!(
                f,
                "global batch {batch} does not divide across {data} data-parallel replicas"
            ),
            StrategyError::IndivisibleDim {
                op,
                dim,
                size,
                degree,
            } => write!(
                f,
                "operator '{op}': {dim}={size} does not divide by tensor-parallel degree {degree}"
            ),
            StrategyError::IndivisibleExperts {
                op,
                experts,
                degree,
            } => write!(
                f,
                "operator '{op}': {experts} experts do not divide by expert-parallel degree {degree}"
            ),
            StrategyError::ExpertDegree { expert, data } => write!(
                f,
                "expert-parallel degree {expert} does not divide data-parallel degree {data}"
            ),
            StrategyError::TooManyStages { stages, ops } => {
                write!(f, "{stages} pipeline stages requested for {ops} operators")
            }
        }
    }
}

impl Error for StrategyError {}
