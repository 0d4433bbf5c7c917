//! Server metrics.

use metriken::{Counter, Gauge, metric};

#[metric(name = "server_requests", description = "Application packets received")]
pub static REQUESTS: Counter = Counter::new();

#[metric(name = "server_replies", description = "Application packets echoed back")]
pub static REPLIES: Counter = Counter::new();

#[metric(name = "server_sessions", description = "Sessions that completed the handshake")]
pub static SESSIONS: Counter = Counter::new();

#[metric(name = "server_sessions_active", description = "Open sessions past the handshake")]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

/// Counter and gauge values of every registered metric, sorted by name.
/// Covers the engine, buffer and protocol metrics as well.
pub fn snapshot() -> Vec<(String, i64)> {
    let mut values: Vec<(String, i64)> = metriken::metrics()
        .iter()
        .filter_map(|metric| {
            let name = metric.name();
            if name.is_empty() {
                return None;
            }
            match metric.value()? {
                metriken::Value::Counter(v) => Some((name.to_string(), v as i64)),
                metriken::Value::Gauge(v) => Some((name.to_string(), v)),
                _ => None,
            }
        })
        .collect();
    values.sort();
    values
}

/// Log every counter and gauge at debug level.
pub fn log_snapshot() {
    for (name, value) in snapshot() {
        tracing::debug!(metric = %name, value, "final");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_includes_server_metrics() {
        REQUESTS.increment();
        let names: Vec<String> = snapshot().into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().any(|n| n == "server_requests"));
        assert!(names.iter().any(|n| n == "server_sessions_active"));
    }
}
