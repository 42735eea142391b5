// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Shared types.

use std::error::Error;
use std::fmt;

use serde::Serialize;
use shunt_config::ConfigError;
use shunt_topology::DeviceId;
use shunt_workload::{ModelSpecError, StrategyError};

/// A fatal simulation error. One of these aborts the run for its
/// configuration; the offending identifiers travel inside the wrapped error.
#[derive(Debug)]
pub enum SimError {
    /// Malformed or inconsistent topology/configuration.
    Config(ConfigError),
    /// Malformed operator graph.
    ModelSpec(ModelSpecError),
    /// Parallelism degrees incompatible with the model or topology.
    Strategy(StrategyError),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SimError::Config(e) => write!(f, "config error: {e}"),
            SimError::ModelSpec(e) => write!(f, "model spec error: {e}"),
            SimError::Strategy(e) => write!(f, "strategy error: {e}"),
        }
    }
}

impl Error for SimError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SimError::Config(e) => Some(e),
            SimError::ModelSpec(e) => Some(e),
            SimError::Strategy(e) => Some(e),
        }
    }
}

impl From<ConfigError> for SimError {
    fn from(e: ConfigError) -> Self {
        SimError::Config(e)
    }
}

impl From<ModelSpecError> for SimError {
    fn from(e: ModelSpecError) -> Self {
        SimError::ModelSpec(e)
    }
}

impl From<StrategyError> for SimError {
    fn from(e: StrategyError) -> Self {
        SimError::Strategy(e)
    }
}

/// The return type for fallible simulation functions.
pub type SimResult<T = ()> = Result<T, SimError>;

/// Non-fatal conditions attached to a completed report.
///
/// The run still yields a full estimate; these flag that part of it is
/// degraded so exploration tooling can compare the configuration anyway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Condition {
    /// The link-contention fixed point did not converge within its pass
    /// bound; the last computed bandwidth shares were used as-is.
    ContentionUnresolved,
    /// Peak memory on a device exceeded its capacity.
    MemoryOverflow {
        /// The overcommitted device.
        device: DeviceId,
    },
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Condition::ContentionUnresolved => {
                write!(f, "link contention resolution did not converge")
            }
            Condition::MemoryOverflow { device } => {
                write!(f, "device {device} exceeds its memory capacity")
            }
        }
    }
}
