//! Prometheus metrics endpoint and metric descriptions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers help text for every metric the checkout engine emits.
pub fn describe() {
    describe_counter!(
        "checkout_reserve_total",
        "Reserve attempts by outcome (reserved, rejected)"
    );
    describe_histogram!(
        "checkout_reserve_duration_seconds",
        "Wall time of a reserve call"
    );
    describe_counter!("checkout_confirm_total", "Confirm calls by outcome");
    describe_counter!("checkout_release_total", "Checkouts released");
    describe_counter!(
        "checkout_reconciliation_required_total",
        "Confirms that deducted only part of a checkout"
    );
    describe_counter!(
        "sweeper_released_total",
        "Expired checkouts released by the sweeper"
    );
    describe_counter!("sweeper_errors_total", "Sweeper listing, release and hook failures");
    describe_counter!(
        "payment_signature_mismatch_total",
        "Payment callbacks rejected for a bad signature, by path"
    );
    describe_counter!(
        "payment_duplicate_total",
        "Payment callbacks answered from the idempotency ledger, by path"
    );
}

/// GET /metrics — returns Prometheus-formatted metrics.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
