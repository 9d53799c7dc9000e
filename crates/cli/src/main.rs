// Runsync CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Flags override RUNSYNC_* environment variables, which override defaults.

mod client;
mod commands;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use output::OutputFormat;
use runsync_core::telemetry::{init_telemetry, TelemetryConfig};
use runsync_http::PushKind;

#[derive(Parser)]
#[command(name = "runsync")]
#[command(about = "Runsync CLI - Watch remote agent runs and sessions live")]
#[command(version)]
pub struct Cli {
    /// API base URL (defaults to RUNSYNC_API_URL or http://localhost:18000)
    #[arg(long)]
    pub api_url: Option<String>,

    /// WebSocket base URL (derived from the API URL when omitted)
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Push transport: ws or sse
    #[arg(long)]
    pub push: Option<PushKind>,

    /// Snapshot path of agent runs, e.g. /api/v1/tasks/{id}; without one,
    /// agent runs are reconciled from their event history
    #[arg(long, env = "RUNSYNC_AGENT_RUN_PATH")]
    pub agent_run_path: Option<String>,

    /// Bearer token for the API
    #[arg(long, env = "RUNSYNC_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// YAML file with engine tuning (polling, backoff, vocabularies)
    #[arg(long, env = "RUNSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, value_enum, default_value_t)]
    pub output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    /// Log filter for diagnostics on stderr (e.g. "runsync_core=debug")
    #[arg(long)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow an entity live until it reaches a terminal status
    Watch {
        #[command(flatten)]
        entity: commands::EntityArgs,

        /// The entity was just created; keep polling while it is not found
        #[arg(long)]
        just_created: bool,

        /// Also stop once a session is ready
        #[arg(long)]
        until_ready: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the event history of an entity
    Events {
        /// Entity (sandbox) ID
        entity: String,

        /// Maximum number of events
        #[arg(long, short, default_value = "100")]
        limit: usize,
    },

    /// Print the reconciled status of an entity
    Status {
        #[command(flatten)]
        entity: commands::EntityArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::from_env();
    if let Some(filter) = &cli.log {
        telemetry = telemetry.with_log_filter(filter.clone());
    }
    init_telemetry(telemetry);

    let session_kind = match &cli.command {
        Commands::Watch { entity, .. } | Commands::Status { entity } => entity.session_kind(),
        Commands::Events { .. } => None,
    };
    let client = client::Client::new(client::Overrides {
        api_url: cli.api_url,
        ws_url: cli.ws_url,
        push: cli.push,
        api_token: cli.token,
        agent_run_path: cli.agent_run_path,
        session_kind,
        config_file: cli.config,
    })?;
    let output_format = cli.output;

    match cli.command {
        Commands::Watch {
            entity,
            just_created,
            until_ready,
            timeout,
        } => {
            let args = commands::watch::WatchArgs {
                entity,
                just_created,
                until_ready,
                timeout,
            };
            commands::watch::run(&client, output_format, cli.quiet, args).await
        }
        Commands::Events { entity, limit } => {
            commands::events::run(&client, output_format, &entity, limit).await
        }
        Commands::Status { entity } => {
            commands::status::run(&client, output_format, cli.quiet, &entity).await
        }
    }
}
