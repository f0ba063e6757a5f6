//! Client metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered with the default prometheus registry. Registration failures are
//! fatal: they mean two metrics share a name, which is a programming error.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// Gauge: current connection state
    /// (0=disconnected, 1=connecting, 2=authenticating, 3=ready, 4=reconnecting, 5=closed)
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        "nats_client_connection_state",
        "current connection state (0=disconnected 1=connecting 2=authenticating 3=ready 4=reconnecting 5=closed)"
    ).unwrap();

    /// Count of TCP connection attempts
    pub static ref CONNECT_ATTEMPTS: IntCounter = register_int_counter!(
        "nats_client_connect_attempts",
        "count of connection attempts to any server"
    ).unwrap();

    /// Count of successful reconnections after a lost connection
    pub static ref RECONNECTS: IntCounter = register_int_counter!(
        "nats_client_reconnects",
        "count of successful reconnections"
    ).unwrap();

    /// Count of handshakes rejected by the server
    pub static ref AUTH_FAILURES: IntCounter = register_int_counter!(
        "nats_client_auth_failures",
        "count of handshakes rejected with an authorization error"
    ).unwrap();

    /// Errors delivered to the error observer, by kind
    pub static ref ERRORS: IntCounterVec = register_int_counter_vec!(
        "nats_client_errors",
        "count of errors reported to the error observer",
        &["kind"]
    ).unwrap();

    /// Messages published
    pub static ref MSGS_OUT: IntCounter = register_int_counter!(
        "nats_client_msgs_out",
        "count of messages published"
    ).unwrap();

    /// Messages delivered by the server
    pub static ref MSGS_IN: IntCounter = register_int_counter!(
        "nats_client_msgs_in",
        "count of messages received"
    ).unwrap();

    /// Messages dropped because a subscriber fell behind
    pub static ref SLOW_CONSUMER_DROPS: IntCounter = register_int_counter!(
        "nats_client_slow_consumer_drops",
        "count of messages dropped because a subscriber queue was full"
    ).unwrap();

    /// Requests that timed out waiting on a reply
    pub static ref REQUEST_TIMEOUTS: IntCounter = register_int_counter!(
        "nats_client_request_timeouts",
        "count of requests that timed out"
    ).unwrap();

    /// Request round trip latency in seconds
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "nats_client_request_latency",
        "request/reply round trip latency in seconds"
    ).unwrap();
}

/// Label for the `ERRORS` counter.
pub(crate) fn error_kind(err: &crate::error::ClientError) -> &'static str {
    use crate::error::ClientError::*;
    match err {
        Credential(_) => "credential",
        Protocol(_) => "protocol",
        Auth(_) => "auth",
        Io(_) => "io",
        Timeout(_) => "timeout",
        NotConnected(_) => "not_connected",
        Closed => "closed",
        Config(_) => "config",
        Server(_) => "server",
        InvalidSubject(_) => "invalid_subject",
        SlowConsumer { .. } => "slow_consumer",
    }
}
