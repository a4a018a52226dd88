#![deny(missing_docs)]
//! PSK-TLS admin server core for testing GlobalPlatform Amendment B
//! (SCP81) OTA administration of UICC cards.
//!
//! The server accepts inbound PSK-TLS 1.2 connections from cards (or the
//! bundled mobile simulator), speaks the GlobalPlatform HTTP admin
//! protocol over the channel, runs one state machine per session, and
//! drives scriptable APDU queues whose results are correlated, persisted
//! through a pluggable [`SessionStore`](services::session_store::SessionStore),
//! and published on an event bus.
//!
//! The main entry point is [`AdminServer::start`]: it binds the listener
//! and the loopback REST/WebSocket façade, spawns the background tasks,
//! and returns an [`AdminServerHandle`] carrying the operator surfaces
//! (session manager, script engine, event bus).
//!
//! Shutdown is cooperative: cancel the provided `CancellationToken` (or
//! call [`AdminServerHandle::shutdown`]). The listener stops accepting
//! first; each session finishes its in-flight response within the
//! configured grace, closes TLS with `close_notify`, and emits
//! `session_ended{reason: shutdown}`.

use std::sync::Arc;
use std::time::Duration;

use cardlink_types::event::Event;
use cardlink_types::keystore::KeyStore;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::StartError;
use crate::listener::ListenerTaskArgs;
use crate::services::flood_guard::FloodGuard;
use crate::tls::PskAcceptor;

pub(crate) mod api;
pub mod config;
pub mod error;
pub(crate) mod http;
pub mod keystore;
pub(crate) mod listener;
pub mod metrics;
pub mod services;
pub(crate) mod tls;

pub use config::{AdminServerConfig, CipherTier};
pub use services::event_bus::{EventBus, EventStream};
pub use services::script_engine::{
    ExpectedSw, Script, ScriptCommand, ScriptEngine, ScriptId, ScriptResult, ScriptState,
    ScriptStatus,
};
pub use services::session::{HistoryEntry, SessionSnapshot, SessionSummary};
pub use services::session_manager::{SessionManager, SessionManagerError};
pub use services::session_store::{
    ApduRow, MemorySessionStore, SessionRow, SessionStore, SessionStoreService,
};

/// The admin server. Use [`AdminServer::start`] to bring it up.
pub struct AdminServer;

/// Handles to a running admin server.
pub struct AdminServerHandle {
    /// Registry of live sessions.
    pub session_manager: SessionManager,
    /// Script scheduling surface.
    pub script_engine: ScriptEngine,
    /// The event bus; subscribe for session/APDU/handshake events.
    pub event_bus: EventBus,
    local_addr: std::net::SocketAddr,
    api_addr: std::net::SocketAddr,
    api_router: axum::Router,
    listener_task: tokio::task::JoinHandle<eyre::Result<()>>,
    api_task: tokio::task::JoinHandle<()>,
    cancellation_token: CancellationToken,
    event_flush_deadline: Duration,
}

impl AdminServer {
    /// Initializes and starts the admin server.
    ///
    /// This performs the following steps:
    ///
    /// 1. Validates the configuration and the key store.
    /// 2. Binds the PSK-TLS listener and builds the TLS context for the
    ///    configured cipher tier.
    /// 3. Creates the event bus, session manager, script engine and the
    ///    per-peer flood guard.
    /// 4. Spawns the accept loop.
    /// 5. Binds the loopback REST/WebSocket façade and spawns it.
    pub async fn start(
        config: AdminServerConfig,
        keystore: Arc<dyn KeyStore>,
        store: SessionStoreService,
        cancellation_token: CancellationToken,
    ) -> Result<AdminServerHandle, StartError> {
        config.validate().map_err(StartError::InvalidConfig)?;
        if keystore.is_empty() {
            return Err(StartError::Keystore("no identities provisioned".to_owned()));
        }
        metrics::describe_metrics();

        tracing::info!("binding PSK-TLS listener on {}", config.bind_addr);
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| StartError::Bind { addr: config.bind_addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartError::Bind { addr: config.bind_addr, source })?;

        let acceptor = Arc::new(PskAcceptor::new(config.cipher_tier, keystore)?);
        if config.cipher_tier.allows_null() {
            tracing::warn!(
                "NULL-encryption cipher suites enabled; admin traffic is readable on the wire"
            );
        }

        let bus = EventBus::new(config.event_capacity);
        let manager = SessionManager::new(config.ended_retention);
        let (script_engine, progress_tx) = ScriptEngine::new(manager.clone());
        let flood = Arc::new(FloodGuard::new(
            config.flood_threshold,
            config.flood_window,
            config.flood_ban,
        ));

        bus.publish(Event::ServerStarted {
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            cipher_tier: config.cipher_tier.name().to_owned(),
            null_ciphers: config.cipher_tier.allows_null(),
        });

        let config = Arc::new(config);
        let listener_task = tokio::spawn(listener::listener_task(ListenerTaskArgs {
            listener,
            acceptor,
            config: Arc::clone(&config),
            bus: bus.clone(),
            manager: manager.clone(),
            store,
            flood,
            progress: progress_tx,
            cancellation_token: cancellation_token.clone(),
        }));

        tracing::info!("binding REST façade on {}", config.api_bind_addr);
        let api_listener = TcpListener::bind(config.api_bind_addr)
            .await
            .map_err(|source| StartError::Bind { addr: config.api_bind_addr, source })?;
        let api_addr = api_listener
            .local_addr()
            .map_err(|source| StartError::Bind { addr: config.api_bind_addr, source })?;
        let api_router = api::routes(api::ApiState {
            manager: manager.clone(),
            bus: bus.clone(),
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            cancellation_token: cancellation_token.clone(),
        });
        let api_task = tokio::spawn({
            let router = api_router.clone();
            let token = cancellation_token.clone();
            async move {
                let serve = axum::serve(api_listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(err) = serve.await {
                    tracing::error!("REST façade failed: {err:?}");
                }
            }
        });

        tracing::info!("admin server up on {local_addr}, façade on {api_addr}");
        Ok(AdminServerHandle {
            session_manager: manager,
            script_engine,
            event_bus: bus,
            local_addr,
            api_addr,
            api_router,
            listener_task,
            api_task,
            cancellation_token,
            event_flush_deadline: config.shutdown_grace,
        })
    }
}

impl AdminServerHandle {
    /// Address the PSK-TLS listener is bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Address the REST façade is bound to.
    pub fn api_addr(&self) -> std::net::SocketAddr {
        self.api_addr
    }

    /// A clone of the façade router, mainly for in-process testing.
    pub fn api_router(&self) -> axum::Router {
        self.api_router.clone()
    }

    /// Stops accepting, cancels all sessions, and waits for the
    /// background tasks. Pending events get a bounded flush.
    pub async fn shutdown(self) -> eyre::Result<()> {
        tracing::info!("shutting down admin server");
        self.cancellation_token.cancel();
        self.listener_task.await??;
        if let Err(err) = self.api_task.await {
            tracing::warn!("REST façade task panicked: {err:?}");
        }
        self.event_bus.flush(self.event_flush_deadline).await;
        Ok(())
    }
}
