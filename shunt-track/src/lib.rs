// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! This crate provides _track_ capabilities for the SHUNT project.
//!
//! _Track_ means the combination of _log_ and _trace_ where:
//!
//!   - _log_ are text-based human-readable messages emitted at various levels
//!     of verbosity (from `Trace` through to `Error`).
//!   - _trace_ is the stream of timeline [`Span`]s produced by the scheduler
//!     as it assigns start/end times to compute and communication work.
//!
//! Three sinks are provided: an in-memory store that can be queried after a
//! run (used heavily by tests), a text sink writing to any
//! [`Write`](std::io::Write), and a /dev/null sink that discards everything.

// Enable warnings for missing documentation
#![warn(missing_docs)]

use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub use log;

pub mod tracker;
pub use tracker::{Track, Tracker};

/// A type alias for objects that receive _log_ / _trace_ events.
///
/// The writer must implement Send in order to be shared between threads.
pub type Writer = Box<dyn std::io::Write + Send>;
type SharedWriter = Arc<Mutex<Writer>>;

/// Take the command-line string and convert it to a Level
#[must_use]
pub fn str_to_level(lvl: &str) -> log::Level {
    match log::Level::from_str(lvl) {
        Ok(level) => level,
        Err(_) => panic!("Unable to parse level string '{lvl}'"),
    }
}

/// The execution lane a [`Span`] occupied on its device.
///
/// Each device owns one lane per resource class; spans on different lanes of
/// the same device may overlap in time, spans on one lane never do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaneKind {
    /// The compute engine of a device.
    Compute,
    /// The communication engine of a device.
    Comm,
}

impl std::fmt::Display for LaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LaneKind::Compute => write!(f, "compute"),
            LaneKind::Comm => write!(f, "comm"),
        }
    }
}

/// One timeline entry: a named piece of work occupying a device lane for
/// `[start_s, end_s]` simulated seconds.
#[derive(Clone, Debug)]
pub struct Span {
    /// Name of the work item (operator or collective).
    pub name: String,
    /// The device the span executed on.
    pub device: usize,
    /// Which of the device's lanes the span occupied.
    pub lane: LaneKind,
    /// Simulated start time in seconds.
    pub start_s: f64,
    /// Simulated end time in seconds.
    pub end_s: f64,
    /// Payload bytes for communication spans, bytes moved for compute spans.
    pub bytes: u64,
}

impl Span {
    /// Span duration in simulated seconds.
    #[must_use]
    pub fn duration_s(&self) -> f64 {
        self.end_s - self.start_s
    }
}
