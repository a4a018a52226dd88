//! Metrics definitions for the admin server.
//!
//! This module defines all metrics keys used by the server and provides
//! a helper [`describe_metrics`] to set metadata for each metric using
//! the `metrics` crate.

/// Metrics key for currently open sessions.
pub const METRICS_ID_SESSIONS_OPEN: &str = "cardlink.server.sessions.open";
/// Metrics key for sessions created since start.
pub const METRICS_ID_SESSIONS_TOTAL: &str = "cardlink.server.sessions.total";
/// Metrics key for completed PSK handshakes.
pub const METRICS_ID_HANDSHAKES_COMPLETED: &str = "cardlink.server.handshakes.completed";
/// Metrics key for failed PSK handshakes.
pub const METRICS_ID_HANDSHAKES_FAILED: &str = "cardlink.server.handshakes.failed";
/// Metrics key for the PSK handshake duration.
pub const METRICS_ID_HANDSHAKE_DURATION: &str = "cardlink.server.handshake.duration";
/// Metrics key for C-APDUs handed to cards.
pub const METRICS_ID_APDUS_SENT: &str = "cardlink.server.apdus.sent";
/// Metrics key for R-APDUs received from cards.
pub const METRICS_ID_APDUS_RECEIVED: &str = "cardlink.server.apdus.received";
/// Metrics key for the command round-trip duration.
pub const METRICS_ID_APDU_RTT: &str = "cardlink.server.apdu.rtt";
/// Metrics key for events dropped at lagging subscribers.
pub const METRICS_ID_EVENTS_DROPPED: &str = "cardlink.server.events.dropped";
/// Metrics key for connections refused by the flood guard.
pub const METRICS_ID_FLOOD_REJECTED: &str = "cardlink.server.flood.rejected";
/// Metrics key for invariant violations inside the server.
pub const METRICS_ID_INTERNAL_ERRORS: &str = "cardlink.server.internal_errors";

/// Describe all metrics used by the server.
///
/// This calls the `describe_*` functions from the `metrics` crate to set
/// metadata on the different metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_SESSIONS_OPEN,
        metrics::Unit::Count,
        "Number of currently open admin sessions"
    );

    metrics::describe_counter!(
        METRICS_ID_SESSIONS_TOTAL,
        metrics::Unit::Count,
        "Number of admin sessions created since server start"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKES_COMPLETED,
        metrics::Unit::Count,
        "Number of successful PSK-TLS handshakes"
    );

    metrics::describe_counter!(
        METRICS_ID_HANDSHAKES_FAILED,
        metrics::Unit::Count,
        "Number of failed PSK-TLS handshakes"
    );

    metrics::describe_histogram!(
        METRICS_ID_HANDSHAKE_DURATION,
        metrics::Unit::Milliseconds,
        "Duration of PSK-TLS handshakes"
    );

    metrics::describe_counter!(
        METRICS_ID_APDUS_SENT,
        metrics::Unit::Count,
        "Number of C-APDUs handed to cards"
    );

    metrics::describe_counter!(
        METRICS_ID_APDUS_RECEIVED,
        metrics::Unit::Count,
        "Number of R-APDUs received from cards"
    );

    metrics::describe_histogram!(
        METRICS_ID_APDU_RTT,
        metrics::Unit::Milliseconds,
        "Round-trip between handing out a command and receiving its response"
    );

    metrics::describe_counter!(
        METRICS_ID_EVENTS_DROPPED,
        metrics::Unit::Count,
        "Number of events dropped because a subscriber lagged"
    );

    metrics::describe_counter!(
        METRICS_ID_FLOOD_REJECTED,
        metrics::Unit::Count,
        "Number of connections refused by the PSK mismatch flood guard"
    );

    metrics::describe_counter!(
        METRICS_ID_INTERNAL_ERRORS,
        metrics::Unit::Count,
        "Number of invariant violations encountered by the server"
    )
}
