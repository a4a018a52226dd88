//! Error taxonomy of the server core.
//!
//! Errors are classified where they occur and travel across tasks as
//! events or typed results; no worker panics on a peer's behaviour.

use cardlink_types::EndReason;
use cardlink_types::admin::AdminCodecError;
use cardlink_types::apdu::ApduError;

/// Failure that ends a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// TCP/TLS read or write failure.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// Malformed HTTP traffic from the card.
    #[error("protocol: {0}")]
    Protocol(#[from] AdminCodecError),
    /// The card sent an admin protocol revision the server does not speak.
    #[error("unsupported admin protocol {0}")]
    UnsupportedProtocol(String),
    /// The card POSTed to something other than the admin path.
    #[error("unknown request path {0}")]
    UnknownPath(String),
    /// The card's R-APDU failed to decode.
    #[error("malformed response apdu: {0}")]
    MalformedResponse(#[from] ApduError),
    /// The card returned a response while no command was outstanding.
    #[error("response received with no outstanding command")]
    UnexpectedResponse,
    /// Peer closed the connection mid-session.
    #[error("peer closed the connection")]
    ConnectionClosed,
    /// An invariant inside the session broke.
    #[error("internal: {0}")]
    Internal(String),
}

impl SessionError {
    /// The end reason recorded when this error terminates a session.
    pub fn end_reason(&self) -> EndReason {
        match self {
            SessionError::Transport(_) | SessionError::ConnectionClosed => EndReason::Transport,
            SessionError::Protocol(_)
            | SessionError::UnsupportedProtocol(_)
            | SessionError::UnknownPath(_)
            | SessionError::MalformedResponse(_)
            | SessionError::UnexpectedResponse => EndReason::Protocol,
            SessionError::Internal(_) => EndReason::Internal,
        }
    }
}

/// Failure to bring the server up. Drivers map these onto exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The listener or façade socket could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: std::net::SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// The TLS context could not be built.
    #[error("cannot build TLS context: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    /// The key store is unusable (empty or failed to load).
    #[error("keystore: {0}")]
    Keystore(String),
    /// A configuration value combination is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StartError {
    /// Process exit code a driver should terminate with.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartError::Bind { .. } => 2,
            StartError::Keystore(_) => 3,
            StartError::Tls(_) | StartError::InvalidConfig(_) => 4,
        }
    }
}
