// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A tracker that stores all spans in memory for later inspection.

use std::sync::Mutex;

use crate::tracker::{SharedFilter, Track};
use crate::{LaneKind, Span};

const INITIAL_CAPACITY: usize = 10000;

struct TrackedState {
    spans: Vec<Span>,
    messages: Vec<(log::Level, String)>,
}

impl TrackedState {
    fn new() -> Self {
        Self {
            spans: Vec::with_capacity(INITIAL_CAPACITY),
            messages: Vec::new(),
        }
    }

    fn busy_time_s(&self, device: usize, lane: LaneKind) -> f64 {
        self.spans
            .iter()
            .filter(|s| s.device == device && s.lane == lane)
            .map(Span::duration_s)
            .sum()
    }

    fn count_matching(&self, fragment: &str) -> usize {
        self.spans
            .iter()
            .filter(|s| s.name.contains(fragment))
            .count()
    }

    fn last_end_s(&self) -> f64 {
        self.spans.iter().fold(0.0, |max, s| s.end_s.max(max))
    }
}

/// A tracker keeping every recorded [`Span`] in a queryable in-memory store.
pub struct InMemoryTracker {
    filter: SharedFilter,
    state: Mutex<TrackedState>,
}

impl InMemoryTracker {
    /// Create a new [`InMemoryTracker`] with a [`SpanFilter`](crate::tracker::SpanFilter).
    pub fn new(filter: SharedFilter) -> Self {
        Self {
            filter,
            state: Mutex::new(TrackedState::new()),
        }
    }

    /// Return a copy of every recorded span, in recording order.
    ///
    /// Recording order is deterministic for a deterministic scheduler, so
    /// tests can compare whole timelines between runs.
    pub fn spans(&self) -> Vec<Span> {
        let state_guard = self.state.lock().unwrap();
        state_guard.spans.clone()
    }

    /// Total busy time of one device lane, in simulated seconds.
    pub fn busy_time_s(&self, device: usize, lane: LaneKind) -> f64 {
        let state_guard = self.state.lock().unwrap();
        state_guard.busy_time_s(device, lane)
    }

    /// Number of spans whose name contains `fragment`.
    pub fn count_matching(&self, fragment: &str) -> usize {
        let state_guard = self.state.lock().unwrap();
        state_guard.count_matching(fragment)
    }

    /// The latest end time over all recorded spans, in simulated seconds.
    pub fn last_end_s(&self) -> f64 {
        let state_guard = self.state.lock().unwrap();
        state_guard.last_end_s()
    }

    /// Return a copy of every recorded log message, in recording order.
    pub fn messages(&self) -> Vec<(log::Level, String)> {
        let state_guard = self.state.lock().unwrap();
        state_guard.messages.clone()
    }
}

impl Track for InMemoryTracker {
    fn span(&self, span: &Span) {
        if !self.filter.is_enabled(&span.name) {
            return;
        }
        let mut state_guard = self.state.lock().unwrap();
        state_guard.spans.push(span.clone());
    }

    fn message(&self, level: log::Level, msg: std::fmt::Arguments) {
        let mut state_guard = self.state.lock().unwrap();
        state_guard.messages.push((level, format!("{msg}")));
    }

    fn finish(&self) {
        // Nothing to flush
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tracker::SpanFilter;

    fn span(name: &str, device: usize, lane: LaneKind, start_s: f64, end_s: f64) -> Span {
        Span {
            name: name.to_string(),
            device,
            lane,
            start_s,
            end_s,
            bytes: 0,
        }
    }

    #[test]
    fn busy_time_sums_one_lane_only() {
        let tracker = InMemoryTracker::new(Arc::new(SpanFilter::all()));
        tracker.span(&span("a", 0, LaneKind::Compute, 0.0, 1.0));
        tracker.span(&span("b", 0, LaneKind::Comm, 0.0, 4.0));
        tracker.span(&span("c", 1, LaneKind::Compute, 0.0, 8.0));

        assert_eq!(tracker.busy_time_s(0, LaneKind::Compute), 1.0);
        assert_eq!(tracker.busy_time_s(0, LaneKind::Comm), 4.0);
        assert_eq!(tracker.busy_time_s(1, LaneKind::Compute), 8.0);
    }

    #[test]
    fn filtered_spans_are_dropped() {
        let mut filter = SpanFilter::all();
        filter.add_filter("noise", false);
        let tracker = InMemoryTracker::new(Arc::new(filter));
        tracker.span(&span("noise.op", 0, LaneKind::Compute, 0.0, 1.0));
        tracker.span(&span("signal.op", 0, LaneKind::Compute, 1.0, 2.0));

        assert_eq!(tracker.count_matching("op"), 1);
        assert_eq!(tracker.last_end_s(), 2.0);
    }
}
