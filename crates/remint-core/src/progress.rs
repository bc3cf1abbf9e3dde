//! Progress reporting for the apply phase.
//!
//! A [`ProgressSink`] is called once per successfully applied batch, from the
//! single task that owns the counters, so observed values never go backwards.
//! Sink failures (errors or panics) are logged and swallowed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

/// Snapshot handed to a sink after a batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Operations applied so far.
    pub applied: u64,
    /// Operations in the whole run.
    pub total: u64,
    pub batches_applied: usize,
    pub batches_total: usize,
    /// Time since the run started.
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Progress {
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    /// Share of operations applied, in percent.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.applied as f64 / self.total as f64;
        ratio * 100.0
    }
}

/// A sink rejected a progress update.
#[derive(Debug, thiserror::Error)]
#[error("progress sink failed: {0}")]
pub struct SinkError(pub String);

/// Receives progress after each applied batch.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError>;
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress) -> Result<(), SinkError> + Send + Sync,
{
    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError> {
        self(progress)
    }
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _progress: &Progress) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Emits an `info` event per batch.
#[derive(Debug, Clone, Default)]
pub struct LogProgressSink {
    migration: String,
}

impl LogProgressSink {
    #[must_use]
    pub fn new(migration: impl Into<String>) -> Self {
        Self {
            migration: migration.into(),
        }
    }
}

impl ProgressSink for LogProgressSink {
    fn on_progress(&self, progress: &Progress) -> Result<(), SinkError> {
        info!(
            migration = %self.migration,
            applied = progress.applied,
            total = progress.total,
            batches_applied = progress.batches_applied,
            batches_total = progress.batches_total,
            elapsed_ms = progress.elapsed_ms(),
            "migration progress {:.1}%",
            progress.percent()
        );
        Ok(())
    }
}

/// Deliver `progress` to `sink`, logging and swallowing any failure.
pub fn notify(sink: &dyn ProgressSink, progress: &Progress) {
    match catch_unwind(AssertUnwindSafe(|| sink.on_progress(progress))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(applied = progress.applied, error = %err, "progress sink failed"),
        Err(_) => warn!(applied = progress.applied, "progress sink panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn progress(applied: u64) -> Progress {
        Progress {
            applied,
            total: 120,
            batches_applied: 1,
            batches_total: 3,
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: &Progress| -> Result<(), SinkError> {
            seen.lock().unwrap().push(p.applied);
            Ok(())
        };
        notify(&sink, &progress(50));
        notify(&sink, &progress(100));
        assert_eq!(*seen.lock().unwrap(), [50, 100]);
    }

    #[test]
    fn sink_errors_are_swallowed() {
        let sink = |_: &Progress| -> Result<(), SinkError> { Err(SinkError("down".into())) };
        notify(&sink, &progress(50));
    }

    #[test]
    fn sink_panics_are_swallowed() {
        let sink = |_: &Progress| -> Result<(), SinkError> { panic!("boom") };
        notify(&sink, &progress(50));
    }

    #[test]
    fn percent_and_millis() {
        let p = progress(60);
        assert!((p.percent() - 50.0).abs() < f64::EPSILON);
        assert_eq!(p.elapsed_ms(), 1500);
        let empty = Progress {
            total: 0,
            applied: 0,
            ..p
        };
        assert!((empty.percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serializes_elapsed_as_millis() {
        let json = serde_json::to_value(progress(50)).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["applied"], 50);
    }

    #[test]
    fn log_sink_never_fails() {
        assert!(LogProgressSink::new("m").on_progress(&progress(1)).is_ok());
        assert!(NoopProgressSink.on_progress(&progress(1)).is_ok());
    }
}
