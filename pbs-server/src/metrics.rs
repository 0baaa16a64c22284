//! Metrics collection surface, analogous to the teacher's
//! `SchedulerMetricsCollector` (`ballista/scheduler/src/metrics/mod.rs`):
//! a small trait so the reactor and gRPC layer never depend on a
//! concrete backend, plus a no-op default and an atomic-counter test
//! double (`ballista/scheduler/src/test_utils.rs` uses the equivalent
//! pattern for its own test metrics collector).

use std::sync::atomic::{AtomicU64, Ordering};

pub trait ServerMetricsCollector: Send + Sync {
    fn job_submitted(&self) {}
    fn job_dispatched(&self) {}
    fn job_completed(&self) {}
    fn scheduler_cycle_started(&self, _partition: &str) {}
    fn scheduler_cycle_ended(&self, _partition: &str, _duration_ms: u64) {}
    fn peer_update_sent(&self, _peer: &str, _deltas: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopMetricsCollector;

impl ServerMetricsCollector for NoopMetricsCollector {}

/// A counting test double: every method just bumps an atomic so tests
/// can assert on call counts without pulling in a real metrics backend.
#[derive(Debug, Default)]
pub struct CountingMetricsCollector {
    pub jobs_submitted: AtomicU64,
    pub jobs_dispatched: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub cycles_started: AtomicU64,
    pub cycles_ended: AtomicU64,
}

impl ServerMetricsCollector for CountingMetricsCollector {
    fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn job_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn scheduler_cycle_started(&self, _partition: &str) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    fn scheduler_cycle_ended(&self, _partition: &str, _duration_ms: u64) {
        self.cycles_ended.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn counting_collector_tracks_submissions() {
        let collector = CountingMetricsCollector::default();
        collector.job_submitted();
        collector.job_submitted();
        assert_eq!(collector.jobs_submitted.load(Ordering::Relaxed), 2);
    }
}
