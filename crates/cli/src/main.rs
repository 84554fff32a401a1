mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use npc_memory_config::MemoryServiceConfig;
use npc_memory_core::MemoryCoordinator;

#[derive(Debug, Parser)]
#[command(name = "npc-memory", version, about = "Admin and demo driver for the per-character memory engine")]
struct Cli {
    /// Path to the TOML config file. Falls back to built-in defaults when absent.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Record a new memory for a character.
    Add {
        character: String,
        content: String,
        /// Metadata as a JSON object, e.g. '{"location":"tavern"}'.
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Show the bounded recent-tier window for a character.
    Recent { character: String },
    /// Similarity search over a character's long-term memory.
    Search {
        character: String,
        query: String,
        #[arg(long)]
        k: Option<usize>,
    },
    /// Recent + relevant combined, as handed to a prompt assembler. Omit
    /// `--query` to fetch recent memory only.
    Context {
        character: String,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        k: Option<usize>,
    },
    /// Edit an existing memory's content/metadata in place.
    Update {
        character: String,
        id: uuid::Uuid,
        content: String,
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Remove a single memory by id.
    Delete { character: String, id: uuid::Uuid },
    /// Erase every tier for a character. Destructive — requires --yes outside a terminal.
    Clear {
        character: String,
        #[arg(long)]
        yes: bool,
    },
    /// List every character with memory in any tier.
    Characters,
    /// Force the buffer tier to embed immediately, regardless of threshold.
    EmbedNow { character: String },
    /// Dump one character's full state (all three tiers) to a JSON file.
    Export { character: String, path: PathBuf },
    /// Replay a previously exported JSON file.
    Import { path: PathBuf },
    /// Report the embedding engine's lifecycle state.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = MemoryServiceConfig::load_from(&cli.config)?;
    let coordinator = MemoryCoordinator::new(&config);
    coordinator.startup().await?;

    let result = commands::dispatch(&coordinator, cli.command).await;

    coordinator.shutdown().await?;
    result
}
