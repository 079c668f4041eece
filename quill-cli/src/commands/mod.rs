//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod session;

pub use job::JobCommands;

use anyhow::Result;
use clap::Subcommand;
use quill_core::domain::job::JobKind;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a new job
    Enqueue {
        /// Job kind: chapter_generation, multi_pass_editing or editorial_analysis
        kind: JobKind,
        /// Entity the job processes (chapter, book...)
        target_id: String,
    },
    /// Job inspection and administration
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Provider session and rate limit state
    Session,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Enqueue { kind, target_id } => job::enqueue(config, kind, &target_id).await,
        Commands::Jobs { command } => job::handle_job_command(command, config).await,
        Commands::Session => session::show_session(config).await,
    }
}
