//! Metrics instrumentation for etcdhosts-dns.
//!
//! All metrics are prefixed with `etcdhosts_`.

use metrics::{counter, gauge, histogram};
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Query result for the `queries_total` counter.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// The store produced answers.
    Hit,
    /// The store had nothing for this question.
    Miss,
}

/// Record one handled DNS query.
pub fn record_query(qtype: &str, result: QueryResult) {
    let result_str = match result {
        QueryResult::Hit => "hit",
        QueryResult::Miss => "miss",
    };
    counter!("etcdhosts_queries_total", "qtype" => qtype.to_string(), "result" => result_str)
        .increment(1);
}

/// Record how long handling a query took.
pub fn record_query_duration(qtype: &str, duration: Duration) {
    histogram!("etcdhosts_query_duration_seconds", "qtype" => qtype.to_string())
        .record(duration.as_secs_f64());
}

/// Record a successful etcd sync and the resulting entry count.
pub fn record_sync_success(entries: usize) {
    counter!("etcdhosts_etcd_sync_total", "status" => "success").increment(1);
    gauge!("etcdhosts_entries_total").set(entries as f64);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    gauge!("etcdhosts_etcd_last_sync_timestamp_seconds").set(now);
}

/// Record a failed etcd sync.
pub fn record_sync_error() {
    counter!("etcdhosts_etcd_sync_total", "status" => "error").increment(1);
}

/// Record the health verdict for one hostname/address pair.
pub fn record_health_status(hostname: &str, ip: IpAddr, healthy: bool) {
    gauge!(
        "etcdhosts_healthcheck_status",
        "hostname" => hostname.to_string(),
        "ip" => ip.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
