//! Prometheus-style counters for event monitoring.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host process installs a recorder (`gatewatch serve --metrics-addr`).

const COUNTER_EVENTS_DELIVERED: &str = "gatewatch_events_delivered_total";
const COUNTER_PARSE_ERRORS: &str = "gatewatch_event_parse_errors_total";
const COUNTER_TRANSPORT_FAILURES: &str = "gatewatch_transport_failures_total";
const GAUGE_ACTIVE_SUBSCRIPTIONS: &str = "gatewatch_active_subscriptions";

pub(crate) fn record_event_delivered(device_id: &str, event_type: &str) {
    metrics::counter!(
        COUNTER_EVENTS_DELIVERED,
        "device" => device_id.to_owned(),
        "type" => event_type.to_owned()
    )
    .increment(1);
}

pub(crate) fn record_parse_error(device_id: &str) {
    metrics::counter!(COUNTER_PARSE_ERRORS, "device" => device_id.to_owned()).increment(1);
}

pub(crate) fn record_transport_failure(device_id: &str) {
    metrics::counter!(COUNTER_TRANSPORT_FAILURES, "device" => device_id.to_owned()).increment(1);
}

pub(crate) fn record_subscription_opened() {
    metrics::gauge!(GAUGE_ACTIVE_SUBSCRIPTIONS).increment(1.0);
}

pub(crate) fn record_subscription_closed() {
    metrics::gauge!(GAUGE_ACTIVE_SUBSCRIPTIONS).decrement(1.0);
}
