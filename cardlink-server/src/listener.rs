//! The PSK-TLS accept loop and the per-connection session task.
//!
//! One task per accepted connection: handshake, session creation, then
//! the pull loop. All session state lives inside the task; external
//! actors reach it through the command channel registered with the
//! session manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cardlink_types::event::{Event, NO_CIPHER, UNKNOWN_IDENTITY};
use cardlink_types::{EndReason, SessionId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use crate::config::AdminServerConfig;
use crate::error::SessionError;
use crate::http::AdminConnection;
use crate::metrics::{
    METRICS_ID_APDU_RTT, METRICS_ID_APDUS_RECEIVED, METRICS_ID_APDUS_SENT,
    METRICS_ID_FLOOD_REJECTED, METRICS_ID_HANDSHAKE_DURATION, METRICS_ID_HANDSHAKES_COMPLETED,
    METRICS_ID_HANDSHAKES_FAILED, METRICS_ID_INTERNAL_ERRORS,
};
use crate::services::event_bus::EventBus;
use crate::services::flood_guard::{Admission, FloodGuard};
use crate::services::script_engine::ScriptProgress;
use crate::services::session::{PullReply, Session, SessionLimits};
use crate::services::session_manager::{SessionCommand, SessionManager};
use crate::services::session_store::{ApduRow, SessionRow, SessionStoreService};
use crate::tls::PskAcceptor;

/// Capacity of one session's command channel.
const SESSION_COMMAND_CAPACITY: usize = 32;

pub(crate) struct ListenerTaskArgs {
    pub(crate) listener: TcpListener,
    pub(crate) acceptor: Arc<PskAcceptor>,
    pub(crate) config: Arc<AdminServerConfig>,
    pub(crate) bus: EventBus,
    pub(crate) manager: SessionManager,
    pub(crate) store: SessionStoreService,
    pub(crate) flood: Arc<FloodGuard>,
    pub(crate) progress: mpsc::Sender<ScriptProgress>,
    pub(crate) cancellation_token: CancellationToken,
}

/// Accept loop. Stops accepting as soon as the token is cancelled;
/// running sessions receive the cancellation separately.
pub(crate) async fn listener_task(args: ListenerTaskArgs) -> eyre::Result<()> {
    let ListenerTaskArgs {
        listener,
        acceptor,
        config,
        bus,
        manager,
        store,
        flood,
        progress,
        cancellation_token,
    } = args;
    tracing::info!("accepting PSK-TLS connections");
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    if flood.admit(peer.ip(), Instant::now()) == Admission::Reject {
                        ::metrics::counter!(METRICS_ID_FLOOD_REJECTED).increment(1);
                        tracing::debug!(%peer, "refusing flooding peer with RST");
                        reject_with_rst(tcp);
                        continue;
                    }
                    tokio::spawn(connection_task(ConnectionTaskArgs {
                        tcp,
                        peer,
                        acceptor: Arc::clone(&acceptor),
                        config: Arc::clone(&config),
                        bus: bus.clone(),
                        manager: manager.clone(),
                        store: Arc::clone(&store),
                        flood: Arc::clone(&flood),
                        progress: progress.clone(),
                        cancellation_token: cancellation_token.clone(),
                    }));
                }
                Err(err) => {
                    // transient accept failures (fd pressure) must not
                    // bring the listener down
                    tracing::warn!("accept failed: {err:?}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::info!("listener stopped");
    bus.publish(Event::ServerStopped {});
    Ok(())
}

fn reject_with_rst(tcp: TcpStream) {
    // linger of zero turns the close into a RST before TLS starts
    if let Err(err) = tcp.set_linger(Some(Duration::ZERO)) {
        tracing::trace!("cannot set linger on rejected connection: {err:?}");
    }
    drop(tcp);
}

struct ConnectionTaskArgs {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<PskAcceptor>,
    config: Arc<AdminServerConfig>,
    bus: EventBus,
    manager: SessionManager,
    store: SessionStoreService,
    flood: Arc<FloodGuard>,
    progress: mpsc::Sender<ScriptProgress>,
    cancellation_token: CancellationToken,
}

async fn connection_task(args: ConnectionTaskArgs) {
    let ConnectionTaskArgs {
        tcp,
        peer,
        acceptor,
        config,
        bus,
        manager,
        store,
        flood,
        progress,
        cancellation_token,
    } = args;
    let handshake_start = Instant::now();
    let accepted = tokio::time::timeout(config.handshake_timeout, acceptor.accept(tcp)).await;
    let duration = handshake_start.elapsed();

    let (stream, identity) = match accepted {
        Ok(Ok((stream, observation))) => {
            let Some(identity) = observation.identity else {
                ::metrics::counter!(METRICS_ID_INTERNAL_ERRORS).increment(1);
                tracing::error!(%peer, "handshake succeeded without a PSK identity");
                return;
            };
            (stream, identity)
        }
        Ok(Err(failure)) => {
            handshake_failed(
                &bus,
                &flood,
                peer,
                failure.observation.identity,
                failure.reason,
                duration,
            );
            return;
        }
        Err(_) => {
            handshake_failed(&bus, &flood, peer, None, "timeout", duration);
            return;
        }
    };

    let cipher = PskAcceptor::cipher_name(&stream);
    ::metrics::counter!(METRICS_ID_HANDSHAKES_COMPLETED).increment(1);
    ::metrics::histogram!(METRICS_ID_HANDSHAKE_DURATION).record(duration.as_millis() as f64);
    bus.publish(Event::HandshakeCompleted {
        peer_addr: peer.to_string(),
        identity: identity.clone(),
        cipher,
        duration_us: duration.as_micros() as u64,
    });

    let id = SessionId::new();
    let now = Instant::now();
    let mut session = Session::new(
        id,
        identity.clone(),
        peer,
        SessionLimits::from_config(&config),
        now,
    );
    session.handshake_ok(now);
    let (tx, commands) = mpsc::channel(SESSION_COMMAND_CAPACITY);
    manager.register(id, tx);
    bus.publish(Event::SessionStarted {
        session_id: id,
        identity,
        peer_addr: peer.to_string(),
    });
    tracing::info!(session_id = %id, %peer, "session started");

    session_task(SessionTaskArgs {
        stream,
        session,
        commands,
        config,
        bus,
        manager,
        store,
        progress,
        cancellation_token,
    })
    .await;
}

fn handshake_failed(
    bus: &EventBus,
    flood: &FloodGuard,
    peer: SocketAddr,
    identity: Option<String>,
    reason: &str,
    duration: Duration,
) {
    ::metrics::counter!(METRICS_ID_HANDSHAKES_FAILED).increment(1);
    bus.publish(Event::HandshakeFailed {
        peer_addr: peer.to_string(),
        identity: identity.unwrap_or_else(|| UNKNOWN_IDENTITY.to_owned()),
        cipher: NO_CIPHER.to_owned(),
        reason: reason.to_owned(),
        duration_us: duration.as_micros() as u64,
    });
    if let Some(failures) = flood.record_failure(peer.ip(), Instant::now()) {
        tracing::warn!(%peer, failures, "PSK mismatch flood, banning peer");
        bus.publish(Event::PskMismatchFlood {
            peer_addr: peer.ip().to_string(),
            failures,
        });
    }
}

struct SessionTaskArgs {
    stream: SslStream<TcpStream>,
    session: Session,
    commands: mpsc::Receiver<SessionCommand>,
    config: Arc<AdminServerConfig>,
    bus: EventBus,
    manager: SessionManager,
    store: SessionStoreService,
    progress: mpsc::Sender<ScriptProgress>,
    cancellation_token: CancellationToken,
}

/// The session loop: reads pulls, applies operator commands, enforces
/// deadlines, and finishes with a graceful TLS close.
async fn session_task(args: SessionTaskArgs) {
    let SessionTaskArgs {
        stream,
        mut session,
        mut commands,
        config,
        bus,
        manager,
        store,
        progress,
        cancellation_token,
    } = args;
    let id = session.id();
    let mut conn = AdminConnection::new(stream);
    let mut persisted = 0usize;

    let reason = loop {
        let deadline = tokio::time::Instant::from_std(session.next_deadline());
        tokio::select! {
            () = cancellation_token.cancelled() => break EndReason::Shutdown,
            command = commands.recv() => {
                if let Some(command) = command {
                    apply_command(&mut session, command, &progress).await;
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                if let Some(reason) = session.expired_deadline(Instant::now()) {
                    tracing::info!(session_id = %id, %reason, "session deadline expired");
                    break reason;
                }
            }
            request = conn.read_request() => match request {
                Ok(request) => {
                    match process_pull(
                        &mut session,
                        &mut conn,
                        request,
                        &config,
                        &bus,
                        &store,
                        &progress,
                        &mut persisted,
                    )
                    .await
                    {
                        Ok(false) => {}
                        Ok(true) => break EndReason::Normal,
                        Err(err) => {
                            answer_error(&mut conn, &config, &err).await;
                            tracing::warn!(session_id = %id, "session error: {err}");
                            if matches!(err, SessionError::Internal(_)) {
                                ::metrics::counter!(METRICS_ID_INTERNAL_ERRORS).increment(1);
                            }
                            break err.end_reason();
                        }
                    }
                }
                Err(SessionError::ConnectionClosed) => {
                    tracing::debug!(session_id = %id, "peer closed the connection");
                    break EndReason::Transport;
                }
                Err(err) => {
                    tracing::warn!(session_id = %id, "read error: {err}");
                    break err.end_reason();
                }
            }
        }
    };

    // close_notify within the shutdown grace, then tear down
    let _ = tokio::time::timeout(config.shutdown_grace, conn.shutdown()).await;
    let ended = session.finish(reason);
    persist_history(&store, &session, &mut persisted).await;
    let snapshot = session.snapshot();
    let ended_at_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(snapshot.last_activity_ms);
    let row = SessionRow {
        id,
        psk_identity: snapshot.psk_identity.clone(),
        peer_addr: snapshot.peer_addr.clone(),
        state: snapshot.state,
        created_at_ms: snapshot.created_at_ms,
        ended_at_ms,
        end_reason: reason,
    };
    if let Err(err) = store.record_session(row).await {
        tracing::warn!(session_id = %id, "cannot persist session row: {err:?}");
    }
    let _ = progress.send(ScriptProgress::SessionEnded { session_id: id }).await;
    manager.deregister(id, snapshot);
    bus.publish(ended);
    tracing::info!(session_id = %id, %reason, "session ended");
}

async fn apply_command(
    session: &mut Session,
    command: SessionCommand,
    progress: &mpsc::Sender<ScriptProgress>,
) {
    match command {
        SessionCommand::Enqueue { apdu, reply } => {
            let position = session.enqueue_apdu(apdu);
            let _ = reply.send(position);
        }
        SessionCommand::EnqueueScript { script_id, script } => {
            session.enqueue_script(script_id, script);
        }
        SessionCommand::CancelScript { script_id } => {
            for update in session.cancel_script(script_id) {
                let _ = progress.send(update).await;
            }
        }
        SessionCommand::ClearQueue { reply } => {
            let (dropped, updates) = session.clear_queue();
            for update in updates {
                let _ = progress.send(update).await;
            }
            let _ = reply.send(dropped);
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
    }
}

/// Handles one pull end-to-end. Returns `true` when the final
/// `204 No Content` went out and the session is closing.
#[expect(clippy::too_many_arguments)]
async fn process_pull(
    session: &mut Session,
    conn: &mut AdminConnection<SslStream<TcpStream>>,
    request: cardlink_types::admin::AdminRequest,
    config: &AdminServerConfig,
    bus: &EventBus,
    store: &SessionStoreService,
    progress: &mpsc::Sender<ScriptProgress>,
    persisted: &mut usize,
) -> Result<bool, SessionError> {
    if request.path != config.admin_path {
        return Err(SessionError::UnknownPath(request.path));
    }
    if !config.admin_protocols.contains(&request.protocol) {
        return Err(SessionError::UnsupportedProtocol(request.protocol));
    }

    let step = session.handle_pull(&request.body, Instant::now())?;
    let closing = match &step.reply {
        PullReply::Command(bytes) => {
            write_with_timeout(config, conn.write_command(bytes, true)).await?;
            false
        }
        PullReply::NoContent => {
            write_with_timeout(config, conn.write_no_content()).await?;
            true
        }
    };

    for event in step.events {
        match &event {
            Event::ApduSent { .. } => {
                ::metrics::counter!(METRICS_ID_APDUS_SENT).increment(1);
            }
            Event::ApduReceived { duration_us, .. } => {
                ::metrics::counter!(METRICS_ID_APDUS_RECEIVED).increment(1);
                ::metrics::histogram!(METRICS_ID_APDU_RTT).record(*duration_us as f64 / 1000.0);
            }
            _ => {}
        }
        bus.publish(event);
    }
    for update in step.progress {
        let _ = progress.send(update).await;
    }
    persist_history(store, session, persisted).await;
    Ok(closing)
}

async fn write_with_timeout(
    config: &AdminServerConfig,
    write: impl Future<Output = Result<(), SessionError>>,
) -> Result<(), SessionError> {
    tokio::time::timeout(config.write_timeout, write)
        .await
        .map_err(|_| {
            SessionError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timeout",
            ))
        })?
}

async fn answer_error(
    conn: &mut AdminConnection<SslStream<TcpStream>>,
    config: &AdminServerConfig,
    err: &SessionError,
) {
    let status = match err {
        SessionError::Protocol(codec) => Some(codec.status_code()),
        SessionError::MalformedResponse(_)
        | SessionError::UnexpectedResponse
        | SessionError::UnknownPath(_) => Some(400),
        SessionError::UnsupportedProtocol(_) => Some(501),
        _ => None,
    };
    if let Some(status) = status {
        let reason = match status {
            413 => "Payload Too Large",
            501 => "Not Implemented",
            _ => "Bad Request",
        };
        let _ = write_with_timeout(config, conn.write_error(status, reason)).await;
    }
}

async fn persist_history(store: &SessionStoreService, session: &Session, persisted: &mut usize) {
    let id = session.id();
    for entry in &session.history()[*persisted..] {
        let row = ApduRow {
            session_id: id,
            seq: entry.seq,
            direction: entry.direction,
            hex: entry.apdu_hex.clone(),
            sw: entry.sw,
            at_ms: entry.at_ms,
            duration_us: entry.duration_us,
        };
        if let Err(err) = store.append_apdu(row).await {
            tracing::warn!(session_id = %id, "cannot persist apdu row: {err:?}");
        }
    }
    *persisted = session.history().len();
}
