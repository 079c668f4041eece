//! Quill CLI
//!
//! Command-line interface for the Quill job pipeline operations API.

mod api;
mod commands;
mod config;
mod id_resolver;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Quill content pipeline CLI", long_about = None)]
struct Cli {
    /// Operations API URL
    #[arg(long, env = "QUILL_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        api_url: cli.api_url,
    };

    handle_command(cli.command, &config).await
}
