//! Response behaviour of the simulator.
//!
//! Three modes: `normal` answers after a fixed delay, `error` injects a
//! configured status word with probability `p`, `timeout` delays the
//! answer inside a configured range with probability `p`. The controller
//! wraps the virtual UICC so injected behaviour never corrupts card
//! state: the handler always runs, only the response may be replaced.

use std::time::Duration;

use cardlink_types::apdu::{Apdu, ApduResponse};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};

use crate::ClientError;
use crate::config::SimulatorConfig;
use crate::uicc::VirtualUicc;

/// Behaviour mode of the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BehaviourMode {
    /// Fixed per-APDU delay.
    Normal,
    /// Probability `p` of answering with an injected status word.
    Error,
    /// Probability `p` of delaying the answer in a configured range.
    Timeout,
}

/// Applies the configured behaviour to every exchange.
pub struct BehaviourController {
    mode: BehaviourMode,
    delay: Duration,
    error_probability: f64,
    injected_sws: Vec<u16>,
    timeout_probability: f64,
    timeout_min: Duration,
    timeout_max: Duration,
    rng: StdRng,
}

impl BehaviourController {
    /// Builds the controller from the simulator configuration.
    pub fn from_config(config: &SimulatorConfig) -> Result<Self, ClientError> {
        let injected_sws = config.injected_status_words()?;
        if config.mode == BehaviourMode::Error && injected_sws.is_empty() {
            return Err(ClientError::Config(
                "error mode needs at least one injected status word".to_owned(),
            ));
        }
        if config.timeout_max < config.timeout_min {
            return Err(ClientError::Config(
                "timeout max must not be below timeout min".to_owned(),
            ));
        }
        for (name, p) in [
            ("error", config.error_probability),
            ("timeout", config.timeout_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ClientError::Config(format!(
                    "{name} probability {p} is outside 0..=1"
                )));
            }
        }
        Ok(Self {
            mode: config.mode,
            delay: config.response_delay,
            error_probability: config.error_probability,
            injected_sws,
            timeout_probability: config.timeout_probability,
            timeout_min: config.timeout_min,
            timeout_max: config.timeout_max,
            rng: StdRng::from_entropy(),
        })
    }

    /// Deterministic controller for tests.
    #[cfg(test)]
    pub(crate) fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Produces the card's answer to `cmd`, with mode behaviour applied.
    pub async fn respond(&mut self, uicc: &mut VirtualUicc, cmd: &Apdu) -> ApduResponse {
        let delay = match self.mode {
            BehaviourMode::Timeout if self.rng.gen_bool(self.timeout_probability) => {
                let min = self.timeout_min.as_millis() as u64;
                let max = self.timeout_max.as_millis() as u64;
                let stall = Duration::from_millis(self.rng.gen_range(min..=max));
                tracing::debug!("injecting {stall:?} response delay");
                stall
            }
            _ => self.delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = uicc.handle(cmd);
        if self.mode == BehaviourMode::Error && self.rng.gen_bool(self.error_probability) {
            let sw = self.injected_sws[self.rng.gen_range(0..self.injected_sws.len())];
            tracing::debug!("injecting status word {sw:04X}");
            return ApduResponse::from_sw(sw);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    fn config(mode: BehaviourMode) -> SimulatorConfig {
        let mut config = SimulatorConfig::parse_from(["cardlink-sim"]);
        config.mode = mode;
        config
    }

    #[tokio::test]
    async fn normal_mode_passes_the_card_response_through() {
        let mut controller =
            BehaviourController::from_config(&config(BehaviourMode::Normal)).expect("builds");
        let mut uicc = VirtualUicc::new();
        let resp = controller
            .respond(&mut uicc, &Apdu::case2(0x80, 0xCA, 0x9F, 0x7F, 256))
            .await;
        assert_eq!(resp.sw(), 0x9000);
    }

    #[tokio::test]
    async fn error_mode_with_p_one_always_injects() {
        let mut cfg = config(BehaviourMode::Error);
        cfg.error_probability = 1.0;
        cfg.injected_sws = vec!["6985".to_owned()];
        let mut controller = BehaviourController::from_config(&cfg)
            .expect("builds")
            .with_seed(42);
        let mut uicc = VirtualUicc::new();
        for _ in 0..4 {
            let resp = controller
                .respond(&mut uicc, &Apdu::case2(0x80, 0xCA, 0x9F, 0x7F, 256))
                .await;
            assert_eq!(resp.sw(), 0x6985);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_mode_with_p_one_always_stalls() {
        let mut cfg = config(BehaviourMode::Timeout);
        cfg.timeout_probability = 1.0;
        cfg.timeout_min = Duration::from_millis(100);
        cfg.timeout_max = Duration::from_millis(200);
        let mut controller = BehaviourController::from_config(&cfg)
            .expect("builds")
            .with_seed(1);
        let mut uicc = VirtualUicc::new();
        let before = tokio::time::Instant::now();
        let _ = controller
            .respond(&mut uicc, &Apdu::case2(0x80, 0xCA, 0x9F, 0x7F, 256))
            .await;
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn rejects_inverted_timeout_range() {
        let mut cfg = config(BehaviourMode::Timeout);
        cfg.timeout_min = Duration::from_secs(2);
        cfg.timeout_max = Duration::from_secs(1);
        assert!(BehaviourController::from_config(&cfg).is_err());
    }
}
