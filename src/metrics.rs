use tracing::trace;

// Lightweight metrics helpers; the prometheus recorder in main picks these
// counters up from the trace layer in demo deployments.

pub fn inc_requests(route: &'static str) {
    trace!(target = "carta.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "carta.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
