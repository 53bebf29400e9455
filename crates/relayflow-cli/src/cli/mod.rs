//! CLI command definitions and dispatch for the `relayflow` binary.

pub mod engine;
pub mod status;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relayflow_observe::tracing_setup::LogFormat;
use uuid::Uuid;

/// Durable outbox relay and multi-stage workflow executor.
#[derive(Parser)]
#[command(name = "relayflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: {data_dir}/relayflow.toml).
    #[arg(long, global = true, env = "RELAYFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format: pretty or json.
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the outbox relay until stopped.
    Relay,

    /// Run the stage executor and its health endpoint until stopped.
    Worker {
        /// Partitions to consume (comma-separated). Default: all.
        #[arg(long, value_delimiter = ',')]
        partitions: Option<Vec<u32>>,

        /// Health endpoint port (overrides executor.health_port).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run relay and executor in one process.
    Run {
        /// Health endpoint port (overrides executor.health_port).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Register a workflow definition from a TOML or JSON file.
    Register {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// Enqueue a run of a workflow (writes the run and its outbox row).
    Trigger {
        /// Workflow id printed by `register`.
        workflow_id: Uuid,

        /// Trigger payload as JSON (default: {}).
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show pending outbox rows and consumer lag per partition.
    Status,
}
