//! Optional call instrumentation passed explicitly into the channel client.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::retry::ErrorCode;

/// Client operation being measured.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CallKind {
    /// Read-only query.
    Query,
    /// State-changing execute.
    Execute,
    /// Caller-supplied handler chain.
    Custom,
}

/// Receives per-call measurements.
pub trait MetricsRecorder: Send + Sync {
    /// Records one finished call; `failure` is `None` on success.
    fn record_call(&self, kind: CallKind, elapsed: Duration, failure: Option<ErrorCode>);

    /// Records that a call is about to be retried.
    fn record_retry(&self, _kind: CallKind, _attempt: u32) {}
}

/// Recorder that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_call(&self, _kind: CallKind, _elapsed: Duration, _failure: Option<ErrorCode>) {}
}

/// Counter values for one [`CallKind`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CallStats {
    /// Finished calls.
    pub calls: u64,
    /// Finished calls that failed.
    pub failures: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Sum of call durations in microseconds.
    pub total_micros: u64,
}

/// Atomic counters for one kind.
#[derive(Debug, Default)]
struct KindCounters {
    /// Finished calls.
    calls: AtomicU64,
    /// Failed calls.
    failures: AtomicU64,
    /// Scheduled retries.
    retries: AtomicU64,
    /// Duration sum in microseconds.
    total_micros: AtomicU64,
}

impl KindCounters {
    fn snapshot(&self) -> CallStats {
        CallStats {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

/// Lock-free in-memory recorder.
#[derive(Debug, Default)]
pub struct CallCounters {
    /// Query counters.
    query: KindCounters,
    /// Execute counters.
    execute: KindCounters,
    /// Custom-chain counters.
    custom: KindCounters,
}

impl CallCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn counters(&self, kind: CallKind) -> &KindCounters {
        match kind {
            CallKind::Query => &self.query,
            CallKind::Execute => &self.execute,
            CallKind::Custom => &self.custom,
        }
    }

    /// Returns current values for `kind`.
    #[must_use]
    pub fn stats(&self, kind: CallKind) -> CallStats {
        self.counters(kind).snapshot()
    }
}

impl MetricsRecorder for CallCounters {
    fn record_call(&self, kind: CallKind, elapsed: Duration, failure: Option<ErrorCode>) {
        let counters = self.counters(kind);
        let _ = counters.calls.fetch_add(1, Ordering::Relaxed);
        if failure.is_some() {
            let _ = counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let _ = counters.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn record_retry(&self, kind: CallKind, _attempt: u32) {
        let _ = self.counters(kind).retries.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_each_kind_separately() {
        let counters = CallCounters::new();
        counters.record_call(CallKind::Query, Duration::from_micros(40), None);
        counters.record_call(
            CallKind::Execute,
            Duration::from_micros(100),
            Some(ErrorCode::EndorsementMismatch),
        );
        counters.record_retry(CallKind::Execute, 1);
        counters.record_call(CallKind::Execute, Duration::from_micros(60), None);

        assert_eq!(
            counters.stats(CallKind::Query),
            CallStats {
                calls: 1,
                failures: 0,
                retries: 0,
                total_micros: 40,
            }
        );
        assert_eq!(
            counters.stats(CallKind::Execute),
            CallStats {
                calls: 2,
                failures: 1,
                retries: 1,
                total_micros: 160,
            }
        );
        assert_eq!(counters.stats(CallKind::Custom), CallStats::default());
    }
}
