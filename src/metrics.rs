use tracing::trace;

// Counters are trace events; the Prometheus exporter only serves what the
// recorder has seen, so these stay cheap when nobody scrapes.

pub fn inc_requests(route: &'static str) {
    trace!(target = "pim_sync.metrics", route = route, "requests_total_inc");
}

pub fn sync_scheduled(event: &'static str, targets: usize) {
    trace!(
        target = "pim_sync.metrics",
        event = event,
        targets = targets as u64,
        "sync_request_scheduled"
    );
}

pub fn sync_dispatched(task: &str, ok: bool, elapsed_ms: u128) {
    trace!(
        target = "pim_sync.metrics",
        task = task,
        ok = ok,
        elapsed_ms = elapsed_ms as u64,
        "sync_request_dispatched"
    );
}
