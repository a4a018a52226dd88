//! Events published on the admin server's event bus.
//!
//! Events reference sessions by id only; observers resolve the id against
//! the session manager. Payloads never contain key material.

use serde::{Deserialize, Serialize};

use crate::{EndReason, SessionId, SessionState};

/// Placeholder identity on handshake failures where the peer never sent
/// a PSK identity.
pub const UNKNOWN_IDENTITY: &str = "<unknown>";
/// Placeholder cipher on handshake failures before negotiation finished.
pub const NO_CIPHER: &str = "<none negotiated>";

/// One event, tagged for JSON consumers of the `/ws` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The listener is up and accepting connections.
    ServerStarted {
        /// Bound host.
        host: String,
        /// Bound port.
        port: u16,
        /// Configured cipher-suite tier.
        cipher_tier: String,
        /// Whether NULL ciphers were explicitly enabled.
        null_ciphers: bool,
    },
    /// The listener stopped accepting connections.
    ServerStopped {},
    /// A PSK handshake finished successfully.
    HandshakeCompleted {
        /// Peer socket address.
        peer_addr: String,
        /// PSK identity presented by the peer.
        identity: String,
        /// Negotiated cipher suite.
        cipher: String,
        /// Handshake duration in microseconds.
        duration_us: u64,
    },
    /// A PSK handshake failed.
    HandshakeFailed {
        /// Peer socket address.
        peer_addr: String,
        /// Presented identity, or [`UNKNOWN_IDENTITY`].
        identity: String,
        /// Negotiated cipher, or [`NO_CIPHER`].
        cipher: String,
        /// Stable reason string, e.g. `unknown_psk_identity`.
        reason: String,
        /// Handshake duration in microseconds.
        duration_us: u64,
    },
    /// A session was created after a successful handshake.
    SessionStarted {
        /// Session id.
        session_id: SessionId,
        /// PSK identity of the card.
        identity: String,
        /// Peer socket address.
        peer_addr: String,
    },
    /// A session reached a terminal state.
    SessionEnded {
        /// Session id.
        session_id: SessionId,
        /// Final state, [`SessionState::Closed`] or [`SessionState::Failed`].
        state: SessionState,
        /// Why the session ended.
        reason: EndReason,
    },
    /// A C-APDU was handed to the card.
    ApduSent {
        /// Session id.
        session_id: SessionId,
        /// Hex encoding of the command.
        apdu_hex: String,
    },
    /// An R-APDU arrived and was paired with its command.
    ApduReceived {
        /// Session id.
        session_id: SessionId,
        /// Hex encoding of the response.
        apdu_hex: String,
        /// Status word of the response.
        sw: u16,
        /// Command round-trip in microseconds.
        duration_us: u64,
    },
    /// One peer accumulated too many handshake failures and is being
    /// rejected for a cool-down window.
    PskMismatchFlood {
        /// Offending peer IP.
        peer_addr: String,
        /// Failures inside the observation window.
        failures: u32,
    },
    /// A session saw more error-class status words than the configured
    /// threshold. Emitted at most once per session.
    ErrorRateExceeded {
        /// Session id.
        session_id: SessionId,
        /// Error-class responses observed so far.
        errors: u32,
    },
}

/// An [`Event`] as delivered to subscribers, with its process-wide
/// monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    /// Monotonic sequence number assigned at publish time.
    pub seq: u64,
    /// The event payload.
    #[serde(flatten)]
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_tagged_json_lines() {
        let event = SequencedEvent {
            seq: 7,
            event: Event::SessionEnded {
                session_id: SessionId::new(),
                state: SessionState::Closed,
                reason: EndReason::Normal,
            },
        };
        let json = serde_json::to_value(&event).expect("serializes");
        assert_eq!(json["type"], "session_ended");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["reason"], "normal");
        assert_eq!(json["state"], "CLOSED");
    }

    #[test]
    fn roundtrips_through_json() {
        let event = SequencedEvent {
            seq: 1,
            event: Event::HandshakeFailed {
                peer_addr: "127.0.0.1:5555".to_owned(),
                identity: UNKNOWN_IDENTITY.to_owned(),
                cipher: NO_CIPHER.to_owned(),
                reason: "unknown_psk_identity".to_owned(),
                duration_us: 1200,
            },
        };
        let json = serde_json::to_string(&event).expect("serializes");
        let back: SequencedEvent = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back, event);
    }
}
