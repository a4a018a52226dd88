#![deny(missing_docs)]
//! Shared protocol and domain types for the CardLink test platform.
//!
//! This crate groups together the strongly-typed values and wire formats
//! used across the CardLink system. It provides:
//!
//! * The ISO 7816-4 APDU codec and status-word classification (see
//!   [`apdu`] module).
//! * The GlobalPlatform Amendment B HTTP admin wire codec shared by the
//!   admin server and the mobile simulator (see [`admin`] module).
//! * The event type published on the server's event bus (see [`event`]
//!   module).
//! * Pre-shared-key store types with redacting debug output (see
//!   [`keystore`] module).
//! * Session identifiers, lifecycle states and end reasons.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod admin;
pub mod apdu;
pub mod event;
pub mod keystore;

/// Identifier of one admin session.
///
/// Backed by a UUIDv7, so ids created on the same host sort by creation
/// time, which keeps session listings and persisted rows in arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a fresh, time-ordered session id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the wrapped [`Uuid`].
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of an admin session.
///
/// Transitions are monotonic: a session never moves back to an earlier
/// state. [`SessionState::Closed`] and [`SessionState::Failed`] are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// TLS handshake in progress.
    Handshaking,
    /// Handshake done, waiting for the first pull of the card.
    Connected,
    /// At least one admin request was received.
    Active,
    /// Queue drained, final `204 No Content` sent or pending.
    Closing,
    /// Session over, connection closed.
    Closed,
    /// Session aborted because of an error or timeout.
    Failed,
}

impl SessionState {
    /// Returns `true` if `self -> to` is a legal state transition.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Handshaking, Connected)
                | (Handshaking, Failed)
                | (Connected, Active)
                | (Connected, Closed)
                | (Connected, Failed)
                | (Active, Closing)
                | (Active, Closed)
                | (Active, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }

    /// Returns `true` for [`SessionState::Closed`] and [`SessionState::Failed`].
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Connected => "CONNECTED",
            SessionState::Active => "ACTIVE",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Direction of one APDU history entry, seen from the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// C-APDU handed to the card.
    Sent,
    /// R-APDU returned by the card.
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("sent"),
            Direction::Received => f.write_str("received"),
        }
    }
}

/// Stable reason attached to `session_ended` events and persisted rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Queue drained, session completed normally.
    Normal,
    /// Server shutdown cancelled the session.
    Shutdown,
    /// TCP/TLS read or write failure.
    Transport,
    /// Malformed HTTP or APDU traffic.
    Protocol,
    /// Card never pulled after the handshake.
    TimeoutInit,
    /// Card stalled mid-session.
    TimeoutActiveIdle,
    /// Session exceeded its maximum lifetime.
    TimeoutSessionMax,
    /// Invariant violation inside the server.
    Internal,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Normal => "normal",
            EndReason::Shutdown => "shutdown",
            EndReason::Transport => "transport",
            EndReason::Protocol => "protocol",
            EndReason::TimeoutInit => "timeout_init",
            EndReason::TimeoutActiveIdle => "timeout_active_idle",
            EndReason::TimeoutSessionMax => "timeout_session_max",
            EndReason::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_time_ordered() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a < b || a.into_inner().get_timestamp() == b.into_inner().get_timestamp());
    }

    #[test]
    fn state_machine_is_monotonic() {
        use SessionState::*;
        assert!(Handshaking.can_transition(Connected));
        assert!(Connected.can_transition(Active));
        assert!(Active.can_transition(Closing));
        assert!(Closing.can_transition(Closed));
        // no regressions
        assert!(!Active.can_transition(Connected));
        assert!(!Closed.can_transition(Active));
        assert!(!Failed.can_transition(Connected));
        assert!(Closed.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn end_reason_strings_are_stable() {
        assert_eq!(EndReason::TimeoutActiveIdle.to_string(), "timeout_active_idle");
        assert_eq!(
            serde_json::to_string(&EndReason::Normal).expect("serializes"),
            "\"normal\""
        );
    }
}
