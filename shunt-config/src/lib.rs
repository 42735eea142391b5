// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Parsed configuration data model for SHUNT.
//!
//! A simulation run is described by three documents: the **model** (operator
//! list and shapes), the **system** (device specs and interconnect
//! hierarchy) and the **task** (parallelism strategy, batch, iterations).
//! This crate defines the serde structs for all three and loads them from
//! TOML or JSON files via [Figment](https://docs.rs/figment), with
//! `SHUNT_`-prefixed environment variables taking priority over file values.
//!
//! The simulation engine only ever consumes the parsed structs; no other
//! crate touches file syntax.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Toml};

mod model;
mod system;
mod task;

pub use model::{ModelConfig, OpConfig, OpSpec, Precision};
pub use system::{DeviceSpec, LevelSpec, LinkSpec, SystemConfig, TopologySpec};
pub use task::{
    AllReduceAlgorithm, CheckpointConfig, ParallelismConfig, ShardRule, ShardingConfig, TaskConfig,
    TaskKind,
};

/// Errors raised while loading or validating configuration, or when a
/// topology query names entities outside the declared system.
#[derive(Debug)]
pub enum ConfigError {
    /// The file extension is not one of the supported formats.
    UnknownFormat {
        /// Offending path.
        path: PathBuf,
    },
    /// The file could not be read or deserialized.
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying figment/serde message.
        reason: String,
    },
    /// A field value fails structural validation.
    Invalid {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A query named a device outside the declared topology.
    UnknownDevice {
        /// Requested device index.
        device: usize,
        /// Number of devices the topology declares.
        device_count: usize,
    },
    /// The topology declares no levels at all.
    EmptyTopology,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::UnknownFormat { path } => {
                write!(
                    f,
                    "unsupported config format for '{}' (expected .toml or .json)",
                    path.display()
                )
            }
            ConfigError::Parse { path, reason } => {
                write!(f, "failed to load '{}': {reason}", path.display())
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config field '{field}': {reason}")
            }
            ConfigError::UnknownDevice {
                device,
                device_count,
            } => {
                write!(
                    f,
                    "device {device} is not part of the declared topology ({device_count} devices)"
                )
            }
            ConfigError::EmptyTopology => {
                write!(f, "topology declares no levels")
            }
        }
    }
}

impl Error for ConfigError {}

fn figment_for(path: &Path, env_prefix: &str) -> Result<Figment, ConfigError> {
    let base = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::from(Toml::file_exact(path)),
        Some("json") => Figment::from(Json::file_exact(path)),
        _ => {
            return Err(ConfigError::UnknownFormat {
                path: path.to_path_buf(),
            });
        }
    };
    Ok(base.merge(Env::prefixed(env_prefix).split("__")))
}

fn extract<T: serde::de::DeserializeOwned>(
    path: &Path,
    env_prefix: &str,
) -> Result<T, ConfigError> {
    figment_for(path, env_prefix)?
        .extract()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Load and validate a model document.
///
/// Values can be overridden with `SHUNT_MODEL_`-prefixed environment
/// variables, nested fields separated by `__`.
pub fn load_model(path: &Path) -> Result<ModelConfig, ConfigError> {
    let config: ModelConfig = extract(path, "SHUNT_MODEL_")?;
    config.validate()?;
    log::debug!("loaded model '{}' ({} ops)", config.name, config.ops.len());
    Ok(config)
}

/// Load and validate a system document.
///
/// Values can be overridden with `SHUNT_SYSTEM_`-prefixed environment
/// variables, nested fields separated by `__`.
pub fn load_system(path: &Path) -> Result<SystemConfig, ConfigError> {
    let config: SystemConfig = extract(path, "SHUNT_SYSTEM_")?;
    config.validate()?;
    log::debug!(
        "loaded system '{}' ({} devices)",
        config.name,
        config.device_count()
    );
    Ok(config)
}

/// Load and validate a task document.
///
/// Values can be overridden with `SHUNT_TASK_`-prefixed environment
/// variables, nested fields separated by `__`.
pub fn load_task(path: &Path) -> Result<TaskConfig, ConfigError> {
    let config: TaskConfig = extract(path, "SHUNT_TASK_")?;
    config.validate()?;
    log::debug!("loaded task '{}'", config.name);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_defaults_to_ones() {
        let p: ParallelismConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(p, ParallelismConfig::default());
        assert_eq!(p.data * p.tensor * p.pipeline * p.expert, 1);
    }

    #[test]
    fn op_spec_rejects_unknown_type() {
        let parsed: Result<OpSpec, _> =
            serde_json::from_str(r#"{"type": "convolution", "m": 1, "n": 1, "k": 1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn op_spec_parses_matmul() {
        let parsed: OpSpec =
            serde_json::from_str(r#"{"type": "matmul", "m": 4, "n": 8, "k": 16}"#).unwrap();
        assert_eq!(parsed, OpSpec::MatMul { m: 4, n: 8, k: 16 });
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load_model(Path::new("model.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFormat { .. }));
    }

    #[test]
    fn sharding_defaults_replicate_memory_bound_classes() {
        let sharding = ShardingConfig::default();
        assert_eq!(sharding.matmul, ShardRule::Shard);
        assert_eq!(sharding.embedding, ShardRule::Replicate);
        assert_eq!(sharding.elementwise, ShardRule::Replicate);
    }
}
