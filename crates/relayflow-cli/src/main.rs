//! relayflow entry point.
//!
//! Binary name: `relayflow`
//!
//! Parses CLI arguments, initializes tracing, the run store and the broker,
//! then dispatches to the requested command. `relay`, `worker`, and `run` are
//! long-running and stop gracefully on Ctrl+C or SIGTERM.

mod cli;
mod http;
mod state;

use clap::Parser;
use relayflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "info,relayflow=debug",
        _ => "trace",
    };

    init_tracing(&TracingOptions {
        default_filter: filter.to_string(),
        format: cli.log_format,
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.config.as_deref()).await?;

    let result = match cli.command {
        Commands::Relay => cli::engine::run_relay(&state).await,
        Commands::Worker { partitions, port } => {
            cli::engine::run_worker(&state, partitions, port).await
        }
        Commands::Run { port } => cli::engine::run_all(&state, port).await,
        Commands::Register { file } => cli::workflow::register(&state, &file, cli.json).await,
        Commands::Trigger {
            workflow_id,
            payload,
        } => cli::workflow::trigger(&state, workflow_id, payload.as_deref(), cli.json).await,
        Commands::Status => cli::status::status(&state, cli.json).await,
    };

    shutdown_tracing();
    result
}
