//! # RAG Chat CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag ingest` | Chunk, embed and upsert every `.txt` file in the source directory |
//! | `rag serve` | Start the HTTP chat server |
//!
//! Credentials come from `OPENAI_API_KEY`, `PINECONE_API_KEY` and
//! `PINECONE_INDEX`, read after loading `.env` if present. Log verbosity
//! follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rag_chat::config::{load_config_or_default, Credentials};
use rag_chat::{ingest, server};

/// Retrieval-augmented chat over plain-text documents.
#[derive(Parser)]
#[command(name = "rag", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`. A missing file at the default
    /// location means built-in defaults.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every document in the source directory into the vector index.
    ///
    /// Re-running is safe: chunk ids are deterministic and upserts overwrite.
    Ingest,

    /// Start the HTTP chat server.
    ///
    /// Serves the chat UI on `/` and the answer API on `POST /api/prompt`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config_or_default(&cli.config)?;
    let credentials = Credentials::from_env()?;

    match cli.command {
        Commands::Ingest => ingest::run_ingest(&config, &credentials).await?,
        Commands::Serve => server::run_server(&config, &credentials).await?,
    }

    Ok(())
}
