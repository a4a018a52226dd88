//! Runnable admin server: config from CLI/env, JSON key file, in-memory
//! session store, ctrl-c shutdown. Exit codes: 0 normal shutdown, 2 bind
//! failure, 3 keystore load failure, 4 invalid configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cardlink_server::{AdminServer, AdminServerConfig, MemorySessionStore};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// The configuration of the example server.
#[derive(Parser, Debug)]
struct ExampleServerConfig {
    /// Path to the JSON key file.
    #[clap(long, env = "CARDLINK_SERVER_KEY_FILE", default_value = "keys.json")]
    key_file: PathBuf,

    /// The admin server config.
    #[clap(flatten)]
    server: AdminServerConfig,
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cardlink=debug,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    install_tracing();
    let config = ExampleServerConfig::parse();

    let keystore = match cardlink_server::keystore::load_keystore_file(&config.key_file) {
        Ok(keystore) => Arc::new(keystore),
        Err(err) => {
            tracing::error!("cannot load keystore: {err:?}");
            return ExitCode::from(3);
        }
    };

    let cancellation_token = CancellationToken::new();
    let handle = match AdminServer::start(
        config.server,
        keystore,
        Arc::new(MemorySessionStore::new()),
        cancellation_token.clone(),
    )
    .await
    {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!("cannot start admin server: {err}");
            return ExitCode::from(err.exit_code());
        }
    };

    tracing::info!(
        "admin server on {}, REST façade on {}",
        handle.local_addr(),
        handle.api_addr()
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for ctrl-c: {err:?}");
    }
    tracing::info!("ctrl-c received");
    cancellation_token.cancel();
    match handle.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("shutdown failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}
