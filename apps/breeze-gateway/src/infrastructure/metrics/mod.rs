//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Gateway**: Broker requests by endpoint and outcome, retries, local
//!   rate-limit denials
//! - **Resilience**: Circuit breaker state
//! - **Sessions**: FSM transitions
//! - **Streaming**: Active user streams, reconnects, ticks delivered and
//!   malformed ticks dropped
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::session::SessionState;
use crate::infrastructure::resilience::CircuitBreakerState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "breeze_gateway_requests_total",
        "Broker HTTP requests by endpoint and outcome"
    );
    describe_counter!(
        "breeze_gateway_rate_limited_total",
        "Requests denied by the local per-user rate limiter"
    );
    describe_counter!(
        "breeze_gateway_retries_total",
        "Retry attempts after transient broker failures"
    );
    describe_gauge!(
        "breeze_gateway_circuit_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        "breeze_gateway_session_transitions_total",
        "Session FSM transitions by source and target state"
    );
    describe_gauge!(
        "breeze_gateway_active_streams",
        "Number of registered user tick streams"
    );
    describe_counter!(
        "breeze_gateway_stream_reconnects_total",
        "Tick stream reconnection attempts"
    );
    describe_counter!(
        "breeze_gateway_ticks_delivered_total",
        "Ticks delivered to registered sinks"
    );
    describe_counter!(
        "breeze_gateway_malformed_ticks_total",
        "Tick payloads dropped because they failed to parse"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record the outcome of one gateway request (`ok` or an error kind code).
pub fn record_request(endpoint: &str, outcome: &str) {
    counter!(
        "breeze_gateway_requests_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a local rate-limit denial.
pub fn record_rate_limited() {
    counter!("breeze_gateway_rate_limited_total").increment(1);
}

/// Record a retry of a transient failure.
pub fn record_retry() {
    counter!("breeze_gateway_retries_total").increment(1);
}

/// Publish the breaker state for a named breaker.
pub fn set_circuit_state(name: &str, state: CircuitBreakerState) {
    gauge!(
        "breeze_gateway_circuit_state",
        "breaker" => name.to_string()
    )
    .set(state.gauge_value());
}

/// Record a session FSM transition.
pub fn record_session_transition(from: SessionState, to: SessionState) {
    counter!(
        "breeze_gateway_session_transitions_total",
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Update the number of registered user streams.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_streams(count: usize) {
    gauge!("breeze_gateway_active_streams").set(count as f64);
}

/// Record a stream reconnection attempt.
pub fn record_stream_reconnect() {
    counter!("breeze_gateway_stream_reconnects_total").increment(1);
}

/// Record ticks delivered to sinks.
pub fn record_ticks_delivered(count: u64) {
    counter!("breeze_gateway_ticks_delivered_total").increment(count);
}

/// Record a malformed tick payload that was dropped.
pub fn record_malformed_tick() {
    counter!("breeze_gateway_malformed_ticks_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_request("funds", "ok");
        record_rate_limited();
        record_session_transition(SessionState::None, SessionState::CredentialsSaved);
        set_circuit_state("breeze", CircuitBreakerState::Open);
        set_active_streams(2);
    }

    #[test]
    fn circuit_gauge_values() {
        assert!((CircuitBreakerState::Closed.gauge_value() - 0.0).abs() < f64::EPSILON);
        assert!((CircuitBreakerState::HalfOpen.gauge_value() - 1.0).abs() < f64::EPSILON);
        assert!((CircuitBreakerState::Open.gauge_value() - 2.0).abs() < f64::EPSILON);
    }
}
