//! Mergestate Administration CLI

mod detached;
mod dump;
mod verify;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mergestate_core::{MergeState, MergeStateConfig};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mergestate-admin")]
#[command(author = "Mergestate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and repair persisted merge state")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the records of both state files
    Dump {
        /// Repository metadata root
        #[arg(short, long)]
        repo: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check that every recorded conflict still has its backup
    Verify {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        quiet: bool,
    },

    /// Remove the merge state and all backups
    Clear {
        #[arg(short, long)]
        repo: String,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(repo: &Path) -> Result<MergeStateConfig> {
    MergeStateConfig::load(repo)
        .with_context(|| format!("failed to load merge state config from {}", repo.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Dump { repo, json } => {
            let repo = Path::new(&repo);
            let config = load_config(repo)?;
            dump::dump_state(repo, &config, json)?;
        }

        Commands::Verify { repo, quiet } => {
            let repo = Path::new(&repo);
            let config = load_config(repo)?;
            verify::verify_state(repo, &config, quiet)?;
        }

        Commands::Clear { repo } => {
            let repo = Path::new(&repo);
            let config = load_config(repo)?;
            info!(repo = %repo.display(), "clearing merge state");
            MergeState::clean(repo, &config)
                .with_context(|| format!("failed to clear merge state in {}", repo.display()))?;
            println!("Merge state cleared");
        }
    }

    Ok(())
}
