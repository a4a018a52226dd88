//! Configuration for the admin server.
//!
//! Everything can be set via environment variables or command line
//! arguments using `clap`. Binaries embed [`AdminServerConfig`] with
//! `#[clap(flatten)]`. The defaults match the thresholds the admin
//! protocol was tuned for on high-latency mobile bearers; integration
//! tests shrink them.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Cipher-suite tier offered by the PSK-TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CipherTier {
    /// `TLS_PSK_WITH_AES_128_CBC_SHA256` and `TLS_PSK_WITH_AES_256_CBC_SHA384`.
    Production,
    /// Production plus the SHA-1 CBC suites for old card profiles.
    Legacy,
    /// Legacy plus the NULL-encryption suites. Plaintext on the wire;
    /// only for debugging card stacks with a trace probe.
    DebugNull,
}

impl CipherTier {
    /// OpenSSL cipher-list string for this tier.
    ///
    /// The legacy and debug tiers drop the security level so OpenSSL
    /// builds that default to `SECLEVEL=2` still offer SHA-1 and NULL
    /// suites.
    pub fn cipher_list(self) -> &'static str {
        match self {
            CipherTier::Production => "PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384",
            CipherTier::Legacy => {
                "PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384:\
                 PSK-AES128-CBC-SHA:PSK-AES256-CBC-SHA:@SECLEVEL=0"
            }
            CipherTier::DebugNull => {
                "PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384:\
                 PSK-AES128-CBC-SHA:PSK-AES256-CBC-SHA:\
                 PSK-NULL-SHA256:PSK-NULL-SHA384:@SECLEVEL=0"
            }
        }
    }

    /// `true` if the tier offers NULL-encryption suites.
    pub fn allows_null(self) -> bool {
        matches!(self, CipherTier::DebugNull)
    }

    /// Stable name used in events and logs.
    pub fn name(self) -> &'static str {
        match self {
            CipherTier::Production => "production",
            CipherTier::Legacy => "legacy",
            CipherTier::DebugNull => "debug-null",
        }
    }
}

/// The configuration of the admin server core.
#[derive(Parser, Debug, Clone)]
pub struct AdminServerConfig {
    /// Interface and port of the PSK-TLS listener.
    #[clap(long, env = "CARDLINK_SERVER_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub bind_addr: SocketAddr,

    /// Loopback bind of the REST/WebSocket façade.
    #[clap(long, env = "CARDLINK_SERVER_API_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub api_bind_addr: SocketAddr,

    /// Path the cards POST their pulls to.
    #[clap(long, env = "CARDLINK_SERVER_ADMIN_PATH", default_value = "/admin")]
    pub admin_path: String,

    /// Cipher-suite tier offered to cards.
    #[clap(long, env = "CARDLINK_SERVER_CIPHER_TIER", default_value = "production")]
    pub cipher_tier: CipherTier,

    /// Admin protocol revisions the server accepts.
    #[clap(
        long,
        env = "CARDLINK_SERVER_ADMIN_PROTOCOLS",
        value_delimiter = ',',
        default_value = "globalPlatform.v1.0"
    )]
    pub admin_protocols: Vec<String>,

    /// Max time the TLS handshake may take.
    #[clap(
        long,
        env = "CARDLINK_SERVER_HANDSHAKE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub handshake_timeout: Duration,

    /// Max time between the handshake and the card's first pull.
    #[clap(
        long,
        env = "CARDLINK_SERVER_INIT_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub init_timeout: Duration,

    /// Max idle time between pulls of an active session.
    #[clap(
        long,
        env = "CARDLINK_SERVER_ACTIVE_IDLE_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub active_idle_timeout: Duration,

    /// Max total lifetime of a session.
    #[clap(
        long,
        env = "CARDLINK_SERVER_SESSION_MAX_LIFETIME",
        default_value = "300s",
        value_parser = humantime::parse_duration
    )]
    pub session_max_lifetime: Duration,

    /// Max time one TLS write may take.
    #[clap(
        long,
        env = "CARDLINK_SERVER_WRITE_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub write_timeout: Duration,

    /// Grace given to in-flight responses during shutdown.
    #[clap(
        long,
        env = "CARDLINK_SERVER_SHUTDOWN_GRACE",
        default_value = "2s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_grace: Duration,

    /// Handshake failures per peer IP that trigger the flood guard.
    #[clap(long, env = "CARDLINK_SERVER_FLOOD_THRESHOLD", default_value = "5")]
    pub flood_threshold: u32,

    /// Observation window of the flood guard.
    #[clap(
        long,
        env = "CARDLINK_SERVER_FLOOD_WINDOW",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub flood_window: Duration,

    /// How long a flooding peer is rejected with RST.
    #[clap(
        long,
        env = "CARDLINK_SERVER_FLOOD_BAN",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub flood_ban: Duration,

    /// Error-class status words per session before `error_rate_exceeded`
    /// is emitted.
    #[clap(long, env = "CARDLINK_SERVER_ERROR_SW_THRESHOLD", default_value = "10")]
    pub error_sw_threshold: u32,

    /// Capacity of the event-bus fan-out buffer per subscriber.
    #[clap(long, env = "CARDLINK_SERVER_EVENT_CAPACITY", default_value = "256")]
    pub event_capacity: usize,

    /// Ended-session snapshots kept for the REST façade.
    #[clap(long, env = "CARDLINK_SERVER_ENDED_RETENTION", default_value = "256")]
    pub ended_retention: usize,
}

impl AdminServerConfig {
    /// Rejects value combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if !self.admin_path.starts_with('/') {
            return Err(format!("admin path {:?} must start with '/'", self.admin_path));
        }
        if self.admin_protocols.is_empty() {
            return Err("at least one admin protocol revision is required".to_owned());
        }
        if self.event_capacity == 0 {
            return Err("event capacity must be non-zero".to_owned());
        }
        if self.flood_threshold == 0 {
            return Err("flood threshold must be non-zero".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> AdminServerConfig {
        AdminServerConfig::parse_from(["cardlink-server"])
    }

    #[test]
    fn defaults_match_protocol_thresholds() {
        let config = default_config();
        assert_eq!(config.bind_addr.port(), 8443);
        assert_eq!(config.init_timeout, Duration::from_secs(30));
        assert_eq!(config.active_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.session_max_lifetime, Duration::from_secs(300));
        assert_eq!(config.flood_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_admin_path() {
        let mut config = default_config();
        config.admin_path = "admin".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn null_suites_only_in_debug_tier() {
        assert!(!CipherTier::Production.cipher_list().contains("NULL"));
        assert!(!CipherTier::Legacy.cipher_list().contains("NULL"));
        assert!(CipherTier::DebugNull.cipher_list().contains("PSK-NULL-SHA256"));
        assert!(CipherTier::DebugNull.allows_null());
    }
}
