#![deny(missing_docs)]
//! Mobile simulator for the CardLink admin server.
//!
//! The simulator is the canonical counterpart of the PSK-TLS admin
//! server: it opens a PSK-TLS 1.2 connection with a configured
//! identity/key, runs the GlobalPlatform pull loop against the admin
//! path, and answers incoming C-APDUs from a [`uicc::VirtualUicc`]
//! shaped by a [`behaviour::BehaviourController`].
//!
//! Most embedders only need [`run_session`], which adds bounded
//! exponential retry (0.5/1/2/4 s, four attempts) around transport-level
//! failures. Handshake failures are authentication failures and are
//! never retried. For fine-grained control (custom card handlers, raw
//! stalling connections) use [`run_session_once`] and the [`tls`]
//! module.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use bytes::{Buf as _, BytesMut};
use cardlink_types::admin::{self, AdminCodecError, AdminResponseHead, Parsing};
use cardlink_types::apdu::{Apdu, ApduError, ApduResponse};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

pub mod behaviour;
pub mod config;
pub mod tls;
pub mod uicc;

pub use behaviour::{BehaviourController, BehaviourMode};
pub use config::SimulatorConfig;
pub use uicc::VirtualUicc;

/// Errors of the simulator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TCP-level failure; retried with bounded exponential backoff.
    #[error(transparent)]
    Transport(#[from] std::io::Error),
    /// TLS-level failure, including a wrong key or unknown identity.
    /// Never retried.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The server's HTTP framing was not understood.
    #[error("protocol: {0}")]
    Protocol(#[from] AdminCodecError),
    /// The server answered with an error status.
    #[error("server answered {0}")]
    ServerStatus(u16),
    /// A received C-APDU failed to decode.
    #[error("malformed command apdu: {0}")]
    Apdu(#[from] ApduError),
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the bounded retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// One `(command, response)` pair as seen by the card.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    /// C-APDU the server handed out.
    pub command: Apdu,
    /// R-APDU the simulator answered with.
    pub response: ApduResponse,
}

/// Result of one completed admin session.
#[derive(Debug)]
pub struct SessionReport {
    /// Exchanges in protocol order.
    pub exchanges: Vec<ExchangeRecord>,
    /// Connection attempts used, including the successful one.
    pub attempts: u32,
}

/// Runs one admin session against the configured server.
///
/// Builds a fresh virtual UICC per attempt (every attempt is a new
/// session to the server) and retries transport-level failures with
/// bounded exponential backoff.
pub async fn run_session(config: &SimulatorConfig) -> Result<SessionReport, ClientError> {
    tracing::debug!(
        "starting pull loop against {} as {}",
        config.server_addr,
        config.psk_identity
    );
    let attempts = Arc::new(AtomicU32::new(0));
    let exchanges = {
        let attempts = Arc::clone(&attempts);
        (|| {
            let config = config.clone();
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                let mut uicc =
                    VirtualUicc::new().with_response_chaining(config.response_chaining);
                let mut behaviour = BehaviourController::from_config(&config)?;
                run_session_once(&config, &mut uicc, &mut behaviour).await
            }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(500))
                .with_factor(2.0)
                .with_max_delay(Duration::from_secs(4))
                .with_max_times(config.max_attempts.saturating_sub(1) as usize),
        )
        .when(ClientError::is_retryable)
        .notify(|err: &ClientError, after: Duration| {
            tracing::warn!("transport error, retrying in {after:?}: {err}");
        })
        .await?
    };
    Ok(SessionReport {
        exchanges,
        attempts: attempts.load(Ordering::Relaxed),
    })
}

/// Runs exactly one session attempt with caller-supplied card and
/// behaviour. No retries.
pub async fn run_session_once(
    config: &SimulatorConfig,
    uicc: &mut VirtualUicc,
    behaviour: &mut BehaviourController,
) -> Result<Vec<ExchangeRecord>, ClientError> {
    let key = config.psk_key()?;
    let mut stream = tls::connect_psk(
        &config.server_addr,
        &config.psk_identity,
        key,
        config.offer_null_ciphers,
    )
    .await?;
    tracing::debug!("handshake done, entering pull loop");
    if !config.initial_pull_delay.is_zero() {
        tokio::time::sleep(config.initial_pull_delay).await;
    }

    let mut exchanges = Vec::new();
    let mut read_buf = BytesMut::with_capacity(8 * 1024);
    let mut write_buf = BytesMut::with_capacity(8 * 1024);
    // first pull carries no response
    let mut body: Vec<u8> = Vec::new();

    loop {
        write_buf.clear();
        admin::encode_request(
            &config.admin_path,
            &config.server_addr,
            &config.admin_protocol,
            &body,
            &mut write_buf,
        );
        stream.write_all(&write_buf).await?;
        stream.flush().await?;

        let response = read_response(&mut stream, &mut read_buf).await?;
        match response.status {
            200 => {
                let command = Apdu::decode(&response.body)?;
                tracing::debug!("handling {command:?}");
                let answer = behaviour.respond(uicc, &command).await;
                body = answer.encode();
                exchanges.push(ExchangeRecord { command, response: answer });
            }
            204 => {
                tracing::debug!("queue drained, session over");
                break;
            }
            status => return Err(ClientError::ServerStatus(status)),
        }
        if response.close {
            break;
        }
    }
    let _ = stream.shutdown().await;
    Ok(exchanges)
}

async fn read_response<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<AdminResponseHead, ClientError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    loop {
        if let Parsing::Done { value, offset } = admin::decode_response(buf)? {
            buf.advance(offset);
            return Ok(value);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(ClientError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed mid-response",
            )));
        }
    }
}
