use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "spotwire",
    version = spotwire::build_version(),
    about = "Track decoder activity and upload spot reports to a collector"
)]
struct Cli {
    /// Configuration file (default: $SPOTWIRE_CONFIG, then ./spotwire.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read newline-delimited JSON events and reports from stdin and process them
    Run,
    /// Print the request that would be sent for a JSON report read from stdin
    Encode,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    spotwire::log_format::init_logging();

    let cli = Cli::parse();
    let config = spotwire::config::SpotwireConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => commands::handle_run(config).await,
        Commands::Encode => commands::handle_encode(config).await,
    }
}
