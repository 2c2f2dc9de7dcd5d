//! Retouch CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "retouch")]
#[command(about = "Asynchronous edit pipeline for hosted content", long_about = None)]
struct Cli {
    /// Path to the agent configuration file
    #[arg(long, env = "RETOUCH_CONFIG", default_value = "retouch.kdl")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted
    Run,
    /// Drain the queue once and exit
    Once,
    /// Submit an edit request
    Submit {
        /// Content item ID
        content_id: String,
        /// Edit instruction in plain language
        instruction: String,
        /// Requester reference for completion notifications
        #[arg(long)]
        requester: Option<String>,
    },
    /// Manage content backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Validate a payload file without touching the store
    Validate {
        /// Path to the payload file
        path: String,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List backups for a content item, newest first
    List {
        /// Content item ID
        content_id: String,
    },
    /// Snapshot the live payload of a content item
    Create {
        /// Content item ID
        content_id: String,
    },
    /// Roll a content item back to a snapshot
    Restore {
        /// Content item ID
        content_id: String,
        /// Payload file of the snapshot; defaults to the newest backup
        #[arg(long)]
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = retouch_config::AgentConfig::load(&cli.config)?;
            commands::run::run(config).await?;
        }
        Commands::Once => {
            let config = retouch_config::AgentConfig::load(&cli.config)?;
            commands::run::once(config).await?;
        }
        Commands::Submit {
            content_id,
            instruction,
            requester,
        } => {
            let config = retouch_config::AgentConfig::load(&cli.config)?;
            commands::submit(&config, &content_id, &instruction, requester).await?;
        }
        Commands::Backups { command } => {
            let config = retouch_config::AgentConfig::load(&cli.config)?;
            match command {
                BackupCommands::List { content_id } => {
                    commands::backups::list(&config, &content_id).await?;
                }
                BackupCommands::Create { content_id } => {
                    commands::backups::create(&config, &content_id).await?;
                }
                BackupCommands::Restore { content_id, file } => {
                    commands::backups::restore(&config, &content_id, file).await?;
                }
            }
        }
        Commands::Validate { path } => {
            commands::validate(&path).await?;
        }
    }

    Ok(())
}
