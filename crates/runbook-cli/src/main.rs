mod client;
mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use cmd::run::RunExit;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "runbook",
    about = "Trigger pre-approved server actions and watch their output live",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (used by `serve` and `config`)
    #[arg(long, global = true, env = "RUNBOOK_CONFIG", default_value = "runbook.yaml")]
    config: PathBuf,

    /// Base URL of the runbook server
    #[arg(
        long,
        global = true,
        env = "RUNBOOK_URL",
        default_value = "http://127.0.0.1:4140"
    )]
    url: String,

    /// Operator token
    #[arg(long, global = true, env = "RUNBOOK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and HTTP API
    Serve {
        /// Listen address (overrides `listen` in the config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// List servers and their actions
    Servers,

    /// Show the caller behind the current token
    Whoami,

    /// Run an action and stream its output
    Run {
        server: String,
        action: String,

        /// Confirmation phrase for dangerous actions (prompted if omitted)
        #[arg(long)]
        confirm: Option<String>,

        /// Print the run id and return without waiting
        #[arg(long)]
        detach: bool,
    },

    /// Follow an existing run until it finishes
    Watch { run_id: String },

    /// List recent runs
    Runs,

    /// Show one run record
    Show { run_id: String },

    /// Validate the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
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

    let json = cli.json;
    let remote = || client(&cli.url, cli.token.as_deref());

    let result = match cli.command {
        Commands::Serve { listen } => cmd::serve::run(&cli.config, listen),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, json),
        Commands::Servers => remote().and_then(|c| cmd::servers::list(&c, json)),
        Commands::Whoami => remote().and_then(|c| cmd::servers::whoami(&c, json)),
        Commands::Run {
            server,
            action,
            confirm,
            detach,
        } => remote().and_then(|c| cmd::run::run(&c, &server, &action, confirm, detach, json)),
        Commands::Watch { run_id } => remote().and_then(|c| cmd::watch::follow(&c, &run_id, json)),
        Commands::Runs => remote().and_then(|c| cmd::runs::list(&c, json)),
        Commands::Show { run_id } => remote().and_then(|c| cmd::runs::show(&c, &run_id, json)),
    };

    if let Err(e) = result {
        if let Some(exit) = e.downcast_ref::<RunExit>() {
            eprintln!("{exit}");
            std::process::exit(exit.exit_code());
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn client(url: &str, token: Option<&str>) -> anyhow::Result<client::Client> {
    match token {
        Some(token) if !token.is_empty() => Ok(client::Client::new(url, token)),
        _ => anyhow::bail!("no operator token: pass --token or set RUNBOOK_TOKEN"),
    }
}
