//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot plus per-status execution gauges into the
//! Prometheus text exposition format for scraping.

use crate::collector::MetricsSnapshot;

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

/// Render counters, the dispatch latency summary, and gauges.
///
/// `executions_by_status` is a list of `(status, count)` pairs;
/// `dispatch_enabled` reflects the admin toggle.
pub fn render_prometheus(
    snapshot: &MetricsSnapshot,
    executions_by_status: &[(String, u64)],
    dispatch_enabled: bool,
) -> String {
    let mut out = String::new();

    counter(&mut out, "flowgrid_executions_claimed_total", "Executions claimed from the queue.", snapshot.claimed);
    counter(&mut out, "flowgrid_dispatch_success_total", "Flow containers created.", snapshot.dispatch_success);
    counter(&mut out, "flowgrid_dispatch_failure_total", "Dispatch attempts that failed.", snapshot.dispatch_failure);
    counter(&mut out, "flowgrid_executions_requeued_total", "Executions put back to READY after a failure.", snapshot.requeued);
    counter(&mut out, "flowgrid_executions_finalized_total", "Executions finalized as failed by the engine.", snapshot.finalized);
    counter(&mut out, "flowgrid_executions_restarted_total", "Replacement executions submitted.", snapshot.restarted);
    counter(&mut out, "flowgrid_reaper_cancelled_total", "Stale executions cancelled by the reaper.", snapshot.reaper_cancelled);
    counter(&mut out, "flowgrid_reaper_deleted_total", "Containers deleted by the reaper.", snapshot.reaper_deleted);
    counter(&mut out, "flowgrid_reaper_skipped_total", "Stale executions skipped by ignore rules.", snapshot.reaper_skipped);
    counter(&mut out, "flowgrid_reaper_errors_total", "Reaper steps that failed.", snapshot.reaper_errors);
    counter(&mut out, "flowgrid_stale_containers_deleted_total", "Aged containers removed.", snapshot.stale_containers_deleted);

    out.push_str("# HELP flowgrid_dispatch_latency_ms Time from claim to container creation.\n");
    out.push_str("# TYPE flowgrid_dispatch_latency_ms summary\n");
    out.push_str(&format!(
        "flowgrid_dispatch_latency_ms_sum {}\n",
        snapshot.dispatch_latency_sum_ms
    ));
    out.push_str(&format!(
        "flowgrid_dispatch_latency_ms_count {}\n",
        snapshot.dispatch_latency_count
    ));

    out.push_str("# HELP flowgrid_dispatch_latency_max_ms Slowest dispatch seen.\n");
    out.push_str("# TYPE flowgrid_dispatch_latency_max_ms gauge\n");
    out.push_str(&format!(
        "flowgrid_dispatch_latency_max_ms {}\n",
        snapshot.dispatch_latency_max_ms
    ));

    out.push_str("# HELP flowgrid_executions Executions by status.\n");
    out.push_str("# TYPE flowgrid_executions gauge\n");
    for (status, count) in executions_by_status {
        out.push_str(&format!("flowgrid_executions{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP flowgrid_dispatch_enabled Whether the queue processor claims work.\n");
    out.push_str("# TYPE flowgrid_dispatch_enabled gauge\n");
    out.push_str(&format!(
        "flowgrid_dispatch_enabled {}\n",
        u8::from(dispatch_enabled)
    ));

    out
}
