//! Long-running commands: relay, worker, and both in one process.

use std::sync::Arc;

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::http;
use crate::state::AppState;

/// Run the outbox relay until Ctrl+C / SIGTERM.
pub async fn run_relay(state: &AppState) -> Result<()> {
    let cancel = cancel_on_shutdown();
    let relay = state.relay();

    print_banner("outbox relay", state);
    relay.run(cancel).await;
    println!("\n  Relay stopped.");
    Ok(())
}

/// Run the stage executor and the health endpoint until Ctrl+C / SIGTERM.
pub async fn run_worker(state: &AppState, partitions: Option<Vec<u32>>, port: Option<u16>) -> Result<()> {
    let cancel = cancel_on_shutdown();
    let executor = Arc::new(state.executor(partitions)?);
    let port = port.unwrap_or(state.config.executor.health_port);

    let listener = http::health::bind(port).await?;
    print_banner("stage executor", state);

    let health = tokio::spawn(http::health::serve_on(listener, cancel.clone()));
    let executed = executor.run(cancel.clone()).await;

    // Executor exited (cancelled or failed to start): stop the health server too
    cancel.cancel();
    health.await??;
    executed?;

    println!("\n  Worker stopped.");
    Ok(())
}

/// Run relay, executor, and health endpoint in one process.
pub async fn run_all(state: &AppState, port: Option<u16>) -> Result<()> {
    let cancel = cancel_on_shutdown();
    let relay = state.relay();
    let executor = Arc::new(state.executor(None)?);
    let port = port.unwrap_or(state.config.executor.health_port);

    let listener = http::health::bind(port).await?;
    print_banner("relay + stage executor", state);

    let health = tokio::spawn(http::health::serve_on(listener, cancel.clone()));
    let (_, executed) = tokio::join!(relay.run(cancel.clone()), async {
        let result = Arc::clone(&executor).run(cancel.clone()).await;
        // A failed executor start takes the relay down with it
        cancel.cancel();
        result
    });

    health.await??;
    executed?;

    println!("\n  Stopped.");
    Ok(())
}

fn print_banner(what: &str, state: &AppState) {
    println!(
        "  {} relayflow {} on topic {} ({} partitions)",
        style("⚡").bold(),
        what,
        style(&state.config.broker.topic).cyan(),
        state.config.broker.partitions
    );
    println!("  {}", style("Press Ctrl+C to stop").dim());
}

/// A token cancelled on Ctrl+C or SIGTERM.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
