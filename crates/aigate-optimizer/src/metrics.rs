use std::fmt::Write;

use aigate_scheduler::QueueStats;

use crate::stats::OptimizationStats;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render both snapshots in Prometheus text exposition format.
pub fn render_metrics(queue: &QueueStats, opt: &OptimizationStats) -> String {
    let mut out = String::with_capacity(2048);

    let _ = writeln!(out, "# HELP aigate_queue_pending Requests waiting for admission, by lane.");
    let _ = writeln!(out, "# TYPE aigate_queue_pending gauge");
    for (lane, n) in [
        ("high", queue.pending_high),
        ("normal", queue.pending_normal),
        ("low", queue.pending_low),
    ] {
        let _ = writeln!(out, "aigate_queue_pending{{lane=\"{lane}\"}} {n}");
    }

    metric(&mut out, "aigate_queue_in_flight", "gauge", "Executions currently running.", queue.in_flight);
    metric(&mut out, "aigate_queue_enqueued_total", "counter", "Requests accepted into the admission queue.", queue.enqueued);
    metric(&mut out, "aigate_queue_completed_total", "counter", "Executions that finished successfully.", queue.completed);
    metric(&mut out, "aigate_queue_failed_total", "counter", "Executions whose executor returned an error.", queue.failed);
    metric(&mut out, "aigate_queue_timed_out_total", "counter", "Requests that timed out before admission.", queue.timed_out);
    metric(&mut out, "aigate_queue_rate_limited_total", "counter", "Admissions deferred by a provider rate limit.", queue.rate_limited);
    metric(&mut out, "aigate_queue_wait_ms_avg", "gauge", "Moving average of queue wait time in milliseconds.", queue.avg_wait_ms);
    metric(&mut out, "aigate_queue_processing_ms_avg", "gauge", "Moving average of execution time in milliseconds.", queue.avg_processing_ms);

    metric(&mut out, "aigate_requests_total", "counter", "Requests submitted to the optimizer.", opt.total);
    metric(&mut out, "aigate_cache_hits_total", "counter", "Requests answered from the response cache.", opt.cached);
    metric(&mut out, "aigate_dedup_hits_total", "counter", "Requests that joined an in-flight execution.", opt.deduplicated);
    metric(&mut out, "aigate_cache_errors_total", "counter", "Cache store failures absorbed as misses.", opt.cache_errors);
    metric(&mut out, "aigate_cache_hit_rate", "gauge", "Cache hits over total requests.", opt.cache_hit_rate);
    metric(&mut out, "aigate_dedup_rate", "gauge", "Dedup joins over total requests.", opt.dedup_rate);
    metric(&mut out, "aigate_tokens_saved_total", "counter", "Provider tokens avoided.", opt.tokens_saved);
    metric(&mut out, "aigate_cost_saved_usd_total", "counter", "Provider cost avoided in USD.", opt.cost_saved);
    metric(&mut out, "aigate_pending_executions", "gauge", "Shared executions currently in flight.", opt.pending_executions);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics() {
        let queue = QueueStats {
            pending_high: 1,
            pending_low: 3,
            in_flight: 2,
            completed: 7,
            avg_wait_ms: 12.5,
            ..Default::default()
        };
        let opt = OptimizationStats {
            total: 10,
            cached: 4,
            cache_hit_rate: 0.4,
            cost_saved: 0.125,
            ..Default::default()
        };

        let body = render_metrics(&queue, &opt);
        assert!(body.contains("aigate_queue_pending{lane=\"high\"} 1\n"));
        assert!(body.contains("aigate_queue_pending{lane=\"normal\"} 0\n"));
        assert!(body.contains("aigate_queue_pending{lane=\"low\"} 3\n"));
        assert!(body.contains("# TYPE aigate_queue_completed_total counter\naigate_queue_completed_total 7\n"));
        assert!(body.contains("aigate_queue_wait_ms_avg 12.5\n"));
        assert!(body.contains("aigate_cache_hit_rate 0.4\n"));
        assert!(body.contains("aigate_cost_saved_usd_total 0.125\n"));

        let helps = body.lines().filter(|l| l.starts_with("# HELP")).count();
        let types = body.lines().filter(|l| l.starts_with("# TYPE")).count();
        assert_eq!(helps, types);
        assert_eq!(helps, 18);
    }
}
