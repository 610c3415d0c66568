//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use pairgate_core::{config, logging};

mod commands;

#[derive(Parser)]
#[command(name = "pairgate")]
#[command(version)]
#[command(about = "Connect the PairGate dashboard to its identity provider")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Identity provider base URL (overrides config and PAIRGATE_IDP_URL)
    #[arg(long, global = true, value_name = "URL")]
    idp_url: Option<String>,

    /// Write debug-level logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Open the dashboard, running the identity-provider handshake if needed
    Connect {
        /// Discard any stored session and authenticate again
        #[arg(long)]
        force: bool,
    },
    /// Show whether a session is established
    Status,
    /// Clear the stored session
    Disconnect,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Generate a fresh config from Rust defaults (for xtask)
    Generate,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match logging::init(cli.verbose) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = config::Config::load().context("load config")?;

    if let Some(url) = cli.idp_url.as_deref() {
        let trimmed = url.trim();
        config.frame.base_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }

    match cli.command {
        Commands::Connect { force } => commands::connect::run(&config, force).await,
        Commands::Status => commands::session::status(&config),
        Commands::Disconnect => commands::session::disconnect(&config),
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Generate => commands::config::generate(),
        },
    }
}
