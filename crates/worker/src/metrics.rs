use axum::{http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::pool::BrowserWorkerPool;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub queued_tasks: IntGaugeVec,
    pub active_sessions: IntGaugeVec,
    pub max_workers: IntGaugeVec,
    pub tasks_total: IntGaugeVec,
    pub tasks_failed: IntGaugeVec,
    pub tasks_timed_out: IntGaugeVec,
    scope: String,
}

impl Metrics {
    pub fn new(scope_name: &str) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Tasks waiting in the queue
        let queued_tasks = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_queued_tasks",
                "Number of tasks waiting in the queue",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(queued_tasks.clone()))?;

        // Sessions currently executing tasks
        let active_sessions = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_active_sessions",
                "Number of browser sessions currently executing tasks",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        // Concurrency ceiling
        let max_workers = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_max_workers",
                "Maximum number of concurrent browser sessions",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(max_workers.clone()))?;

        // Total tasks submitted
        let tasks_total = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_tasks_total",
                "Total number of tasks submitted",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        // Failed tasks
        let tasks_failed = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_tasks_failed",
                "Total number of failed tasks",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(tasks_failed.clone()))?;

        // Timed-out tasks
        let tasks_timed_out = IntGaugeVec::new(
            Opts::new(
                "browserpool_worker_tasks_timed_out",
                "Total number of tasks abandoned at the deadline",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(tasks_timed_out.clone()))?;

        // Initialize all metrics with scope label
        queued_tasks.with_label_values(&[scope_name]).set(0);
        active_sessions.with_label_values(&[scope_name]).set(0);
        max_workers.with_label_values(&[scope_name]).set(0);
        tasks_total.with_label_values(&[scope_name]).set(0);
        tasks_failed.with_label_values(&[scope_name]).set(0);
        tasks_timed_out.with_label_values(&[scope_name]).set(0);

        Ok(Self {
            registry,
            queued_tasks,
            active_sessions,
            max_workers,
            tasks_total,
            tasks_failed,
            tasks_timed_out,
            scope: scope_name.to_string(),
        })
    }

    /// Refresh every gauge from the pool's current state. Called on each
    /// scrape so the gauges never drift from the counters.
    pub fn refresh(&self, pool: &BrowserWorkerPool) {
        let snapshot = pool
            .stats()
            .snapshot(pool.queue_length(), pool.max_workers());
        let scope = [self.scope.as_str()];

        self.queued_tasks
            .with_label_values(&scope)
            .set(snapshot.queue as i64);
        self.active_sessions
            .with_label_values(&scope)
            .set(snapshot.active_sessions as i64);
        self.max_workers
            .with_label_values(&scope)
            .set(snapshot.max_workers as i64);
        self.tasks_total
            .with_label_values(&scope)
            .set(snapshot.tasks.total as i64);
        self.tasks_failed
            .with_label_values(&scope)
            .set(snapshot.tasks.failed as i64);
        self.tasks_timed_out
            .with_label_values(&scope)
            .set(snapshot.tasks.timeout as i64);
    }

    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub async fn metrics_response(metrics: &Metrics, pool: &BrowserWorkerPool) -> impl IntoResponse {
    metrics.refresh(pool);
    match metrics.encode() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_register_and_encode() {
        let metrics = Metrics::new("test").unwrap();
        metrics.queued_tasks.with_label_values(&["test"]).set(3);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("browserpool_worker_queued_tasks"));
        assert!(text.contains("browserpool_worker_active_sessions"));
        assert!(text.contains("scope=\"test\""));
    }
}
