// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{bail, Result};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::backend::LlamaCppBackend;
use crate::config::RuntimeConfig;
use crate::rag::IngestProgress;
use crate::runtime::{ChatCompletionRequest, Runtime, RuntimeEvent};
use crate::version;

/// Model and configuration shared by every command that needs a model
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// Path to a GGUF model file
    #[arg(long, env = "LLM_MODEL_PATH")]
    pub model: PathBuf,

    /// TOML configuration file
    #[arg(long, env = "LLM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for persistent data (vector tables)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep every layer on the CPU
    #[arg(long)]
    pub cpu_only: bool,
}

/// Arguments for chat command
#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Document to ingest and use as context for every question
    #[arg(long)]
    pub document: Option<PathBuf>,

    /// System prompt for the session
    #[arg(long)]
    pub system_prompt: Option<String>,

    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value_t = 1024)]
    pub max_tokens: usize,
}

/// Arguments for ingest command
#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// File to ingest (txt, md, pdf, docx)
    pub file: PathBuf,
}

/// Arguments for search command
#[derive(Args, Debug)]
pub struct SearchArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Maximum number of results
    #[arg(long)]
    pub limit: Option<usize>,

    pub query: String,
}

/// Arguments for info command
#[derive(Args, Debug)]
pub struct InfoArgs {
    /// TOML configuration file
    #[arg(long, env = "LLM_CONFIG")]
    pub config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env_overrides();
    Ok(config)
}

async fn open_runtime(args: &ModelArgs) -> Result<Arc<Runtime>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if args.cpu_only {
        config.llm.gpu_layers = 0;
    }

    let backend = Arc::new(LlamaCppBackend::new()?);
    let runtime = Runtime::new(config, backend).await?;

    info!(model = %args.model.display(), "Loading model");
    if !runtime.load_model(&args.model).await? {
        bail!("Failed to load model {}", args.model.display());
    }

    Ok(Arc::new(runtime))
}

pub async fn chat(args: ChatArgs) -> Result<()> {
    let runtime = open_runtime(&args.model).await?;

    if let Some(document) = &args.document {
        let report = runtime.ingest_file(document).await?;
        println!("Ingested {} ({} chunks)", report.title, report.chunks);
    }

    let chat = runtime.start_chat(args.system_prompt.as_deref()).await?;

    let mut events = runtime.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RuntimeEvent::Token(fragment)) => {
                    print!("{}", fragment);
                    let _ = std::io::stdout().flush();
                }
                Ok(RuntimeEvent::StreamingStopped) => println!(),
                Ok(RuntimeEvent::StreamingStarted) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Token output fell behind")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Ctrl-C stops the running generation
    let interrupt_runtime = runtime.clone();
    let interrupt = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt_runtime.abort_inference() {
                println!("\nNothing to stop, type /exit to quit");
            }
        }
    });

    println!("Type a message, /clear to reset the conversation, /exit to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                runtime.clear_chat_history(&chat.id).await?;
                println!("Conversation cleared");
                continue;
            }
            _ => {}
        }

        let context = if args.document.is_some() {
            runtime.search_context(line, None).await?
        } else {
            None
        };

        let reply = runtime
            .chat_completion(ChatCompletionRequest {
                chat_id: chat.id.clone(),
                prompt: line.to_string(),
                temperature: args.temperature,
                max_tokens: args.max_tokens,
                history: Vec::new(),
                context,
            })
            .await;
        if reply.is_none() {
            println!("(no response)");
        }
    }

    interrupt.abort();
    printer.abort();
    runtime.shutdown().await;
    Ok(())
}

pub async fn ingest(args: IngestArgs) -> Result<()> {
    let runtime = open_runtime(&args.model).await?;

    let (tx, mut rx) = mpsc::channel(64);
    let reporter = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                IngestProgress::CorpusCleared => println!("Previous corpus removed"),
                IngestProgress::TextExtracted { characters } => {
                    println!("Extracted {} characters", characters)
                }
                IngestProgress::DocumentCreated { document_id } => {
                    println!("Document record {}", document_id)
                }
                IngestProgress::Chunked { chunks } => println!("Split into {} chunks", chunks),
                IngestProgress::ChunkEmbedded { index, total } => {
                    print!("\rEmbedded {}/{}", index + 1, total);
                    let _ = std::io::stdout().flush();
                }
                IngestProgress::VectorsWritten { rows } => println!("\nStored {} vectors", rows),
            }
        }
    });

    let result = runtime
        .pipeline()
        .ingest_file_with_progress(&args.file, Some(tx))
        .await;
    let _ = reporter.await;
    runtime.shutdown().await;

    let report = result?;
    println!("Ingested {} as {}", report.title, report.document_id);
    Ok(())
}

pub async fn search(args: SearchArgs) -> Result<()> {
    let runtime = open_runtime(&args.model).await?;
    let results = runtime.search(&args.query, args.limit).await;
    runtime.shutdown().await;

    let results = results?;
    if results.is_empty() {
        println!("No matching passages");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

pub fn info(args: InfoArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    config.validate()?;

    println!("{}", version::get_version_string());
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "build": version::get_version_info(),
            "config": config,
        }))?
    );
    Ok(())
}
