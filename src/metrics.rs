use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own scrape listener and register
/// all application metrics.
pub fn init_metrics(listen: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .expect("failed to install Prometheus exporter");

    // Pre-register counters so they appear even before the first increment.
    counter!("trade_events_total").absolute(0);
    counter!("duplicate_signals_total").absolute(0);
    counter!("budget_rejections_total").absolute(0);
    counter!("plans_started").absolute(0);
    counter!("plans_completed").absolute(0);
    counter!("plans_stalled").absolute(0);
    counter!("chunks_filled").absolute(0);
    counter!("chunks_failed").absolute(0);
    counter!("exit_directives_total").absolute(0);
    counter!("stale_market_data_total").absolute(0);
    counter!("positions_flagged_total").absolute(0);

    // Pre-register gauges at zero.
    gauge!("open_positions").set(0.0);
    gauge!("budget_committed").set(0.0);
    gauge!("exchange_balance").set(0.0);

    // Histogram is lazily created on first record; force creation.
    histogram!("plan_duration_seconds").record(0.0);
}
