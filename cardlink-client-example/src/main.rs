//! Runnable mobile simulator: connects to an admin server, runs the pull
//! loop once, and prints every exchange.

use cardlink_client::SimulatorConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// The configuration of the example simulator.
#[derive(Parser, Debug)]
struct ExampleSimulatorConfig {
    /// Keep running sessions until interrupted.
    #[clap(long, env = "CARDLINK_SIM_LOOP")]
    endless: bool,

    /// The simulator config.
    #[clap(flatten)]
    simulator: SimulatorConfig,
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cardlink=debug,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_tracing();
    let config = ExampleSimulatorConfig::parse();

    loop {
        let report = cardlink_client::run_session(&config.simulator).await?;
        tracing::info!(
            "session done after {} attempt(s), {} exchange(s)",
            report.attempts,
            report.exchanges.len()
        );
        for (i, exchange) in report.exchanges.iter().enumerate() {
            tracing::info!(
                "  #{i}: {:?} -> sw {:04X}",
                exchange.command,
                exchange.response.sw()
            );
        }
        if !config.endless {
            break;
        }
    }
    Ok(())
}
