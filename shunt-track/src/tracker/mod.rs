// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Define the [`Track`] trait and a number of [`Tracker`]s.

/// Include the /dev/null tracker.
pub mod dev_null;
/// Include the in-memory tracker.
pub mod in_memory;
/// Include the text-based tracker.
pub mod text;

use std::io;
use std::sync::{Arc, Mutex};

pub use dev_null::DevNullTracker;
pub use in_memory::InMemoryTracker;
use regex::Regex;
pub use text::TextTracker;

use crate::Span;

/// This is the interface that is supported by all [`Tracker`]s.
pub trait Track {
    /// Record one timeline span.
    fn span(&self, span: &Span);

    /// Record a free-form log message of the given level.
    fn message(&self, level: log::Level, msg: std::fmt::Arguments);

    /// Flush any buffered output. Called once at the end of a run.
    fn finish(&self);
}

/// The type of a [`Tracker`] that is shared across simulation components.
pub type Tracker = Arc<dyn Track + Send + Sync>;

/// Create a [`Tracker`] that prints all track events to `stdout`.
pub fn stdout_tracker() -> Tracker {
    let filter = Arc::new(SpanFilter::all());
    let stdout_writer = Box::new(io::BufWriter::new(io::stdout()));
    let tracker: Tracker = Arc::new(TextTracker::new(filter, stdout_writer));
    tracker
}

/// Create a [`Tracker`] that suppresses all track events.
pub fn dev_null_tracker() -> Tracker {
    let tracker: Tracker = Arc::new(DevNullTracker {});
    tracker
}

/// The [`SpanFilter`] decides which spans a tracker records.
///
/// Filters are matched against the span name in order; the first matching
/// regular expression wins. Names that match no filter fall back to the
/// default state.
pub struct SpanFilter {
    default_enabled: bool,
    regex_to_enabled: Vec<(Regex, bool)>,
}

impl SpanFilter {
    /// A filter that records every span.
    #[must_use]
    pub fn all() -> Self {
        Self {
            default_enabled: true,
            regex_to_enabled: Vec::new(),
        }
    }

    /// A filter that records no spans until patterns are added.
    #[must_use]
    pub fn none() -> Self {
        Self {
            default_enabled: false,
            regex_to_enabled: Vec::new(),
        }
    }

    /// Add a span filter regular expression.
    ///
    /// # Example
    ///
    /// ```rust
    /// use shunt_track::tracker::SpanFilter;
    /// let mut filter = SpanFilter::none();
    /// filter.add_filter(".*allreduce.*", true);
    /// assert!(filter.is_enabled("grad.allreduce"));
    /// ```
    pub fn add_filter(&mut self, regex_str: &str, enabled: bool) {
        let regex = Regex::new(regex_str)
            .unwrap_or_else(|e| panic!("Invalid span filter regex '{regex_str}': {e}"));
        self.regex_to_enabled.push((regex, enabled));
    }

    /// Whether spans with this name are recorded.
    #[must_use]
    pub fn is_enabled(&self, span_name: &str) -> bool {
        for (regex, enabled) in &self.regex_to_enabled {
            if regex.is_match(span_name) {
                return *enabled;
            }
        }
        self.default_enabled
    }
}

impl Default for SpanFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// A [`SpanFilter`] shared between a tracker and its owner.
pub type SharedFilter = Arc<SpanFilter>;

pub(crate) fn lock_writer(writer: &Mutex<crate::Writer>) -> std::sync::MutexGuard<'_, crate::Writer> {
    writer.lock().unwrap()
}
