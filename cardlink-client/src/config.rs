//! Configuration of the mobile simulator.
//!
//! Everything can be set via environment variables or command line
//! arguments using `clap`; binaries embed [`SimulatorConfig`] with
//! `#[clap(flatten)]`, tests build it with [`SimulatorConfig::for_server`].

use std::time::Duration;

use clap::Parser;
use secrecy::{ExposeSecret as _, SecretString};

use crate::ClientError;
use crate::behaviour::BehaviourMode;

/// The configuration of the simulator.
#[derive(Parser, Debug, Clone)]
pub struct SimulatorConfig {
    /// Host and port of the admin server.
    #[clap(long, env = "CARDLINK_SIM_SERVER_ADDR", default_value = "127.0.0.1:8443")]
    pub server_addr: String,

    /// Admin path the pull loop POSTs to.
    #[clap(long, env = "CARDLINK_SIM_ADMIN_PATH", default_value = "/admin")]
    pub admin_path: String,

    /// PSK identity presented to the server.
    #[clap(long, env = "CARDLINK_SIM_PSK_IDENTITY", default_value = "TEST_UICC_001")]
    pub psk_identity: String,

    /// PSK key as hex (16 or 32 bytes).
    #[clap(
        long,
        env = "CARDLINK_SIM_PSK_KEY",
        default_value = "000102030405060708090a0b0c0d0e0f"
    )]
    pub psk_key_hex: SecretString,

    /// Admin protocol revision announced in `X-Admin-Protocol`.
    #[clap(long, env = "CARDLINK_SIM_ADMIN_PROTOCOL", default_value = "globalPlatform.v1.0")]
    pub admin_protocol: String,

    /// Offer the NULL-encryption suites as well (debug servers only).
    #[clap(long, env = "CARDLINK_SIM_OFFER_NULL_CIPHERS")]
    pub offer_null_ciphers: bool,

    /// Behaviour mode of the virtual UICC.
    #[clap(long, env = "CARDLINK_SIM_MODE", default_value = "normal")]
    pub mode: BehaviourMode,

    /// Fixed per-APDU processing delay.
    #[clap(
        long,
        env = "CARDLINK_SIM_RESPONSE_DELAY",
        default_value = "0ms",
        value_parser = humantime::parse_duration
    )]
    pub response_delay: Duration,

    /// Probability of injecting an error status word (`error` mode).
    #[clap(long, env = "CARDLINK_SIM_ERROR_PROBABILITY", default_value = "0.1")]
    pub error_probability: f64,

    /// Status words drawn uniformly in `error` mode, as hex.
    #[clap(
        long,
        env = "CARDLINK_SIM_INJECTED_SWS",
        value_delimiter = ',',
        default_value = "6A82,6985"
    )]
    pub injected_sws: Vec<String>,

    /// Probability of delaying a response (`timeout` mode).
    #[clap(long, env = "CARDLINK_SIM_TIMEOUT_PROBABILITY", default_value = "0.1")]
    pub timeout_probability: f64,

    /// Lower bound of the injected delay (`timeout` mode).
    #[clap(
        long,
        env = "CARDLINK_SIM_TIMEOUT_MIN",
        default_value = "500ms",
        value_parser = humantime::parse_duration
    )]
    pub timeout_min: Duration,

    /// Upper bound of the injected delay (`timeout` mode).
    #[clap(
        long,
        env = "CARDLINK_SIM_TIMEOUT_MAX",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub timeout_max: Duration,

    /// Wait between the handshake and the first pull, mirroring the gap
    /// a real bearer needs to bring up the admin agent. Gives the bench
    /// time to stage the session queue.
    #[clap(
        long,
        env = "CARDLINK_SIM_INITIAL_PULL_DELAY",
        default_value = "0ms",
        value_parser = humantime::parse_duration
    )]
    pub initial_pull_delay: Duration,

    /// Transport-level connection attempts before giving up.
    #[clap(long, env = "CARDLINK_SIM_MAX_ATTEMPTS", default_value = "4")]
    pub max_attempts: u32,

    /// Answer GET DATA through `61xx`/GET RESPONSE chaining instead of
    /// inline data.
    #[clap(long, env = "CARDLINK_SIM_RESPONSE_CHAINING")]
    pub response_chaining: bool,
}

impl SimulatorConfig {
    /// Config pointing at `addr` with the given identity and key, all
    /// other values default. Meant for tests and embedding.
    pub fn for_server(addr: impl Into<String>, identity: impl Into<String>, key: &[u8]) -> Self {
        let mut config = Self::parse_from(["cardlink-sim"]);
        config.server_addr = addr.into();
        config.psk_identity = identity.into();
        config.psk_key_hex = hex::encode(key).into();
        config
    }

    /// Decodes and validates the PSK key.
    pub fn psk_key(&self) -> Result<Vec<u8>, ClientError> {
        let key = hex::decode(self.psk_key_hex.expose_secret())
            .map_err(|err| ClientError::Config(format!("psk key is not hex: {err}")))?;
        if key.len() != 16 && key.len() != 32 {
            return Err(ClientError::Config(format!(
                "psk key must be 16 or 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(key)
    }

    /// Parses the injected status-word list.
    pub fn injected_status_words(&self) -> Result<Vec<u16>, ClientError> {
        self.injected_sws
            .iter()
            .map(|sw| {
                u16::from_str_radix(sw.trim(), 16)
                    .map_err(|err| ClientError::Config(format!("injected sw {sw:?}: {err}")))
            })
            .collect()
    }
}
