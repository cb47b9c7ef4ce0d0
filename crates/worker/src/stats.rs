use browserpool_common::epoch_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::ActiveSessions;

/// Process-wide task counters with a live view of the active-sessions
/// registry.
///
/// Counters only ever increase. The registry reference is shared with the
/// pool, not copied, so `active_sessions()` always reflects current load.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    pending_millis_total: AtomicU64,
    processing_millis_total: AtomicU64,
    settled: AtomicU64,
    started_at: u64,
    active: std::sync::RwLock<Option<ActiveSessions>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                submitted: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                pending_millis_total: AtomicU64::new(0),
                processing_millis_total: AtomicU64::new(0),
                settled: AtomicU64::new(0),
                started_at: epoch_millis(),
                active: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Attach the pool's live active-sessions registry. Called once by the
    /// pool constructor.
    pub fn register_active_sessions(&self, registry: ActiveSessions) {
        if let Ok(mut slot) = self.inner.active.write() {
            *slot = Some(registry);
        }
    }

    pub fn add_submitted(&self) {
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_success(&self, timing: &browserpool_common::TaskTiming) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_settled(timing);
    }

    pub fn add_fail(&self, timing: &browserpool_common::TaskTiming) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        self.record_settled(timing);
    }

    pub fn add_timeout(&self, timing: &browserpool_common::TaskTiming) {
        self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
        self.record_settled(timing);
    }

    fn record_settled(&self, timing: &browserpool_common::TaskTiming) {
        if let Some(pending) = timing.pending_millis() {
            self.inner
                .pending_millis_total
                .fetch_add(pending, Ordering::Relaxed);
        }
        if let Some(processing) = timing.processing_millis() {
            self.inner
                .processing_millis_total
                .fetch_add(processing, Ordering::Relaxed);
        }
        self.inner.settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.inner.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.inner.timed_out.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner
            .active
            .read()
            .ok()
            .and_then(|slot| {
                slot.as_ref()
                    .and_then(|registry| registry.read().ok().map(|list| list.len()))
            })
            .unwrap_or(0)
    }

    pub fn started_at(&self) -> u64 {
        self.inner.started_at
    }

    pub fn snapshot(&self, queue: usize, max_workers: usize) -> StatsSnapshot {
        let settled = self.inner.settled.load(Ordering::Relaxed);
        let avg = |total: u64| if settled > 0 { total / settled } else { 0 };

        StatsSnapshot {
            tasks: TaskCounters {
                total: self.submitted(),
                successful: self.succeeded(),
                failed: self.failed(),
                timeout: self.timed_out(),
            },
            queue,
            active_sessions: self.active_sessions(),
            max_workers,
            avg_pending_millis: avg(self.inner.pending_millis_total.load(Ordering::Relaxed)),
            avg_processing_millis: avg(self.inner.processing_millis_total.load(Ordering::Relaxed)),
            uptime_seconds: (epoch_millis().saturating_sub(self.inner.started_at)) / 1000,
            started_at: self.inner.started_at,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub tasks: TaskCounters,
    pub queue: usize,
    pub active_sessions: usize,
    pub max_workers: usize,
    pub avg_pending_millis: u64,
    pub avg_processing_millis: u64,
    pub uptime_seconds: u64,
    pub started_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use browserpool_common::TaskTiming;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.add_submitted();
        stats.add_submitted();

        let mut timing = TaskTiming::new();
        timing.mark_started();
        timing.mark_completed();

        stats.add_success(&timing);
        stats.add_timeout(&timing);

        let snapshot = stats.snapshot(5, 4);
        assert_eq!(snapshot.tasks.total, 2);
        assert_eq!(snapshot.tasks.successful, 1);
        assert_eq!(snapshot.tasks.timeout, 1);
        assert_eq!(snapshot.tasks.failed, 0);
        assert_eq!(snapshot.queue, 5);
        assert_eq!(snapshot.max_workers, 4);
    }

    #[test]
    fn active_sessions_reflects_live_registry() {
        let stats = Stats::new();
        assert_eq!(stats.active_sessions(), 0);

        let registry: ActiveSessions = Arc::new(std::sync::RwLock::new(Vec::new()));
        stats.register_active_sessions(registry.clone());
        assert_eq!(stats.active_sessions(), 0);

        registry
            .write()
            .unwrap()
            .push(Arc::new(crate::session::SessionHandle::new()));
        assert_eq!(stats.active_sessions(), 1);

        registry.write().unwrap().clear();
        assert_eq!(stats.active_sessions(), 0);
    }
}
