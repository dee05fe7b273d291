use metrics::{counter, gauge};

const EVENTS_PUBLISHED_TOTAL: &str = "lapor_realtime_events_published_total";
const DELIVERY_FAILURES_TOTAL: &str = "lapor_realtime_delivery_failures_total";
const CONNECTIONS_SWEPT_TOTAL: &str = "lapor_realtime_connections_swept_total";
pub(crate) const CONNECTIONS_OPEN: &str = "lapor_realtime_connections";
const UNIT_OUTCOMES_TOTAL: &str = "lapor_pipeline_unit_outcomes_total";
const CATCHUP_REQUESTS_TOTAL: &str = "lapor_catchup_requests_total";

pub(crate) fn record_published(kind: &'static str, deliveries: usize) {
    let fanout = if deliveries == 0 { "none" } else { "delivered" };
    counter!(EVENTS_PUBLISHED_TOTAL, "type" => kind, "fanout" => fanout).increment(1);
}

pub(crate) fn record_delivery_failure(reason: &'static str) {
    counter!(DELIVERY_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn record_swept(count: usize) {
    counter!(CONNECTIONS_SWEPT_TOTAL).increment(count as u64);
}

pub(crate) fn record_open_connections(count: usize) {
    gauge!(CONNECTIONS_OPEN).set(count as f64);
}

pub(crate) fn record_unit_outcome(outcome: &'static str) {
    counter!(UNIT_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn record_catchup(gap: bool) {
    counter!(CATCHUP_REQUESTS_TOTAL, "gap" => if gap { "true" } else { "false" }).increment(1);
}
