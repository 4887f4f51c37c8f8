//! Connection and query metrics.
//!
//! Counters and gauges go through the `metrics` crate's facade
//! (`counter!`/`gauge!`, with label pairs as trailing key/value args) so
//! the recorder is pluggable: nothing here asserts a specific exporter.
//! Wiring an actual recorder (e.g. `metrics-exporter-prometheus`, gated
//! behind the `prometheus` feature) is left to the binary.

use metrics::{counter, gauge};

pub fn connection_opened() {
    counter!("connections_total").increment(1);
    gauge!("connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("connections_active").decrement(1.0);
}

pub fn auth_failure(kind: &'static str) {
    counter!("auth_failures_total", "kind" => kind).increment(1);
}

pub fn query_started() {
    counter!("queries_total").increment(1);
    gauge!("queries_inflight").increment(1.0);
}

pub fn query_finished(outcome: &'static str) {
    gauge!("queries_inflight").decrement(1.0);
    counter!("queries_total", "outcome" => outcome).increment(1);
}

/// Install a Prometheus recorder and start its HTTP exporter on `addr`.
/// Only available when the `prometheus` feature is enabled; callers that
/// don't need a scrape endpoint can leave the default no-op recorder in
/// place.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smoke test only: these calls register+record against whatever
    /// recorder is installed (the default no-op one in tests) and must not
    /// panic.
    #[test]
    fn metric_calls_do_not_panic() {
        connection_opened();
        auth_failure("bad_credentials");
        query_started();
        query_finished("success");
        connection_closed();
    }
}
