// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Offline LLM Runtime CLI
#[derive(Parser, Debug)]
#[command(name = "offline-llm")]
#[command(version)]
#[command(about = "Chat with a local GGUF model and search your documents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat, optionally grounded on a document
    Chat(commands::ChatArgs),

    /// Replace the corpus with a single document
    Ingest(commands::IngestArgs),

    /// Search the ingested corpus
    Search(commands::SearchArgs),

    /// Print version and effective configuration
    Info(commands::InfoArgs),
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Chat(args) => commands::chat(args).await,
        Commands::Ingest(args) => commands::ingest(args).await,
        Commands::Search(args) => commands::search(args).await,
        Commands::Info(args) => commands::info(args),
    }
}
