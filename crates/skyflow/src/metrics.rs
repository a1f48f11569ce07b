use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide runtime counters. Incremented directly at the call sites,
/// snapshotted by the admin API.
#[derive(Default)]
pub struct RuntimeMetrics {
    pub leases_acquired: AtomicI64,
    pub leases_reclaimed: AtomicI64,
    pub leases_expired: AtomicI64,
    pub heartbeats_lost: AtomicI64,

    pub tasks_succeeded: AtomicI64,
    pub tasks_failed_retryable: AtomicI64,
    pub tasks_failed_terminal: AtomicI64,
    pub tasks_cancelled: AtomicI64,

    pub handler_errors_retryable: AtomicI64,
    pub handler_errors_terminal: AtomicI64,
    pub handler_panics: AtomicI64,

    pub rate_limit_waits: AtomicI64,
    pub rate_limit_wait_ms: AtomicI64,

    pub retry_phases_planned: AtomicI64,
    pub aggregation_merges: AtomicI64,
    pub aggregation_rows: AtomicI64,
    pub aggregation_ms: AtomicI64,
}

impl RuntimeMetrics {
    pub fn add(counter: &AtomicI64, n: i64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(counter: &AtomicI64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self, queue_depth: i64, at: DateTime<Utc>) -> MetricsSnapshot {
        let get = |c: &AtomicI64| c.load(Ordering::Relaxed);
        let agg_rows = get(&self.aggregation_rows);
        let agg_ms = get(&self.aggregation_ms);
        MetricsSnapshot {
            at,
            queue_depth,
            leases_acquired: get(&self.leases_acquired),
            leases_reclaimed: get(&self.leases_reclaimed),
            leases_expired: get(&self.leases_expired),
            heartbeats_lost: get(&self.heartbeats_lost),
            tasks_succeeded: get(&self.tasks_succeeded),
            tasks_failed_retryable: get(&self.tasks_failed_retryable),
            tasks_failed_terminal: get(&self.tasks_failed_terminal),
            tasks_cancelled: get(&self.tasks_cancelled),
            handler_errors_retryable: get(&self.handler_errors_retryable),
            handler_errors_terminal: get(&self.handler_errors_terminal),
            handler_panics: get(&self.handler_panics),
            rate_limit_waits: get(&self.rate_limit_waits),
            rate_limit_wait_ms: get(&self.rate_limit_wait_ms),
            retry_phases_planned: get(&self.retry_phases_planned),
            aggregation_merges: get(&self.aggregation_merges),
            aggregation_rows: agg_rows,
            aggregation_rows_per_sec: if agg_ms > 0 {
                agg_rows as f64 * 1000.0 / agg_ms as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub queue_depth: i64,

    pub leases_acquired: i64,
    pub leases_reclaimed: i64,
    pub leases_expired: i64,
    pub heartbeats_lost: i64,

    pub tasks_succeeded: i64,
    pub tasks_failed_retryable: i64,
    pub tasks_failed_terminal: i64,
    pub tasks_cancelled: i64,

    pub handler_errors_retryable: i64,
    pub handler_errors_terminal: i64,
    pub handler_panics: i64,

    pub rate_limit_waits: i64,
    pub rate_limit_wait_ms: i64,

    pub retry_phases_planned: i64,
    pub aggregation_merges: i64,
    pub aggregation_rows: i64,
    pub aggregation_rows_per_sec: f64,
}

impl MetricsSnapshot {
    /// Prometheus exposition format for /metrics/prom.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, value: f64| {
            out.push_str(&format!("# TYPE skyflow_{name} gauge\nskyflow_{name} {value}\n"));
        };
        gauge("queue_depth", self.queue_depth as f64);
        gauge("leases_acquired_total", self.leases_acquired as f64);
        gauge("leases_reclaimed_total", self.leases_reclaimed as f64);
        gauge("leases_expired_total", self.leases_expired as f64);
        gauge("heartbeats_lost_total", self.heartbeats_lost as f64);
        gauge("tasks_succeeded_total", self.tasks_succeeded as f64);
        gauge(
            "tasks_failed_retryable_total",
            self.tasks_failed_retryable as f64,
        );
        gauge(
            "tasks_failed_terminal_total",
            self.tasks_failed_terminal as f64,
        );
        gauge("tasks_cancelled_total", self.tasks_cancelled as f64);
        gauge(
            "handler_errors_retryable_total",
            self.handler_errors_retryable as f64,
        );
        gauge(
            "handler_errors_terminal_total",
            self.handler_errors_terminal as f64,
        );
        gauge("handler_panics_total", self.handler_panics as f64);
        gauge("rate_limit_waits_total", self.rate_limit_waits as f64);
        gauge("rate_limit_wait_ms_total", self.rate_limit_wait_ms as f64);
        gauge("retry_phases_planned_total", self.retry_phases_planned as f64);
        gauge("aggregation_merges_total", self.aggregation_merges as f64);
        gauge("aggregation_rows_total", self.aggregation_rows as f64);
        gauge("aggregation_rows_per_sec", self.aggregation_rows_per_sec);
        out
    }
}
