mod client;
mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "matchday",
    about = "Live match reporting scheduler: queue health, recovery and reconciliation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./matchday.yaml)
    #[arg(long, global = true, env = "MATCHDAY_CONFIG")]
    config: Option<PathBuf>,

    /// Server to talk to (default: from the config's server section)
    #[arg(long, global = true, env = "MATCHDAY_URL")]
    server: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server, dispatcher and periodic loops
    Serve {
        /// Port to listen on (overrides the config)
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind (overrides the config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect and validate the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Show combined health from a running server
    Health,

    /// Run a queue health pass (classify and remediate)
    CheckQueues,

    /// Run emergency recovery now
    Recover,

    /// Reconcile the ledger against the execution backend
    Reconcile {
        /// Only this match (default: every match with active work)
        #[arg(long = "match")]
        match_id: Option<i64>,
    },

    /// Schedule thread creation and live reporting for a match
    Schedule {
        match_id: i64,
        /// Kickoff time, RFC 3339 (e.g. 2026-05-02T15:00:00Z)
        #[arg(long)]
        kickoff: chrono::DateTime<chrono::Utc>,
    },

    /// Pause all scheduled work for a match
    Pause { match_id: i64 },

    /// Resume paused work for a match
    Resume { match_id: i64 },

    /// List ledger records for a match
    Tasks { match_id: i64 },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(matchday_core::config::CONFIG_FILE));
    let server = cli.server;
    let json = cli.json;
    let remote = || cmd::remote(&config_path, server.as_deref());

    let result = match cli.command {
        Commands::Serve { port, host } => cmd::serve::run(&config_path, host, port),
        Commands::Config { subcommand } => cmd::config::run(&config_path, subcommand, json),
        Commands::Health => remote().and_then(|c| cmd::health::run(&c, json)),
        Commands::CheckQueues => remote().and_then(|c| cmd::queues::run(&c, json)),
        Commands::Recover => remote().and_then(|c| cmd::recover::run(&c, json)),
        Commands::Reconcile { match_id } => {
            remote().and_then(|c| cmd::reconcile::run(&c, match_id, json))
        }
        Commands::Schedule { match_id, kickoff } => {
            remote().and_then(|c| cmd::matches::schedule(&c, match_id, kickoff, json))
        }
        Commands::Pause { match_id } => remote().and_then(|c| cmd::matches::pause(&c, match_id, json)),
        Commands::Resume { match_id } => {
            remote().and_then(|c| cmd::matches::resume(&c, match_id, json))
        }
        Commands::Tasks { match_id } => remote().and_then(|c| cmd::matches::tasks(&c, match_id, json)),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
