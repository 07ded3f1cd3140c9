use crate::models::Summary;
use tracing::trace;

// Metric events go to the installed `metrics` recorder and are mirrored as
// trace records under `vsync.metrics`.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("vsync_requests_total", "route" => route).increment(1);
    trace!(target = "vsync.metrics", route = route, "requests_total_inc");
}

pub fn reconcile_summary(summary: &Summary, elapsed_ms: u128) {
    for (outcome, count) in [
        ("updated", summary.updated),
        ("deleted", summary.deleted),
        ("skipped", summary.skipped),
        ("errors", summary.errors),
    ] {
        ::metrics::counter!("vsync_variants_total", "outcome" => outcome).increment(u64::from(count));
    }
    ::metrics::histogram!("vsync_reconcile_duration_ms").record(elapsed_ms as f64);
    trace!(
        target = "vsync.metrics",
        updated = summary.updated,
        deleted = summary.deleted,
        skipped = summary.skipped,
        errors = summary.errors,
        elapsed_ms = elapsed_ms as u64,
        "reconcile_summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn events_reach_the_prometheus_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            inc_requests("/webhook");
            reconcile_summary(
                &Summary {
                    updated: 2,
                    deleted: 1,
                    skipped: 0,
                    errors: 0,
                },
                12,
            );
        });
        let rendered = handle.render();
        assert!(rendered.contains(r#"vsync_requests_total{route="/webhook"} 1"#));
        assert!(rendered.contains(r#"vsync_variants_total{outcome="updated"} 2"#));
        assert!(rendered.contains(r#"vsync_variants_total{outcome="deleted"} 1"#));
        assert!(rendered.contains("vsync_reconcile_duration_ms"));
    }
}
