// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! A tracker that renders track events as one text line each.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::tracker::{SharedFilter, Track, lock_writer};
use crate::{SharedWriter, Span, Writer};

/// A tracker that writes human-readable lines to a [`Writer`].
///
/// Span lines carry start/end in microseconds so a timeline can be eyeballed
/// or diffed without further tooling.
pub struct TextTracker {
    filter: SharedFilter,
    writer: SharedWriter,
}

impl TextTracker {
    /// Create a new [`TextTracker`] with a [`SpanFilter`](crate::tracker::SpanFilter).
    pub fn new(filter: SharedFilter, writer: Writer) -> Self {
        Self {
            filter,
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl Track for TextTracker {
    fn span(&self, span: &Span) {
        if !self.filter.is_enabled(&span.name) {
            return;
        }
        let mut writer = lock_writer(&self.writer);
        writeln!(
            writer,
            "[{:>14.3}us .. {:>14.3}us] dev{:<4} {:<7} {} ({} B)",
            span.start_s * 1e6,
            span.end_s * 1e6,
            span.device,
            span.lane,
            span.name,
            span.bytes,
        )
        .expect("failed to write span");
    }

    fn message(&self, level: log::Level, msg: std::fmt::Arguments) {
        let mut writer = lock_writer(&self.writer);
        writeln!(writer, "{level}: {msg}").expect("failed to write message");
    }

    fn finish(&self) {
        let mut writer = lock_writer(&self.writer);
        writer.flush().expect("failed to flush tracker output");
    }
}
