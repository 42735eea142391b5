// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! `SHUNT` - Simulation of Hardware Utilisation, Networking and Timing
//!
//! This library provides the core of the [SHUNT Engine](crate::engine):
//! an analytical discrete-event simulator predicting step time, per-device
//! memory footprint and network utilization for a machine-learning workload
//! mapped across a distributed system, without executing the workload.
//!
//! A run is a pure function of three parsed documents — model, system and
//! task — and proceeds through the
//! [topology model](../shunt_topology/index.html), the
//! [graph builder and parallelism mapper](../shunt_workload/index.html),
//! the [communication cost model](crate::collective), the
//! [scheduler](crate::scheduler), the [memory tracker](crate::memory) and
//! finally the [aggregator](crate::report).
//!
//! # Simple Application
//!
//! ```rust,no_run
//! use shunt_config::{load_model, load_system, load_task};
//! use shunt_engine::engine::Engine;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = load_model("model.toml".as_ref())?;
//! let system = load_system("system.toml".as_ref())?;
//! let task = load_task("task.toml".as_ref())?;
//!
//! let engine = Engine::default();
//! let report = engine.simulate(&model, &system, &task)?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! The simulation is logically single-threaded: "concurrency" is the
//! simulated overlap of compute and communication across devices, modelled
//! by the event loop's ordering, never actual threading. Runs either yield
//! a complete, fully annotated [`Report`](crate::report::Report) or a fatal
//! [`SimError`](crate::types::SimError); degraded-but-complete runs attach
//! [`Condition`](crate::types::Condition) flags instead of failing.

// Enable warnings for missing documentation
#![warn(missing_docs)]

pub mod collective;
pub mod engine;
pub mod memory;
pub mod report;
pub mod scheduler;
pub mod types;

pub use engine::Engine;
pub use report::Report;
pub use types::{Condition, SimError, SimResult};
