mod render;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use claim_stream::{
    ChatSession, ClaimHistory, ClaimPipeline, ClaimsClient, ClientConfig, FileStore, ProgressState,
    StreamRecord, claim_data, record::ERROR_STAGE,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::render::TerminalRenderer;

#[derive(Parser)]
#[command(name = "claim-intake", about = "Submit insurance claims and follow their processing live")]
struct Cli {
    /// Backend base URL (overrides CLAIM_API_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Directory holding the claim history (overrides CLAIM_HISTORY_DIR)
    #[arg(long, global = true)]
    history_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a claim and stream each processing stage as it completes
    Submit {
        /// Free-text claim description
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// Claim document to upload (image or PDF)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Ask follow-up questions about the result once processing finishes
        #[arg(long)]
        chat: bool,

        /// Write the finished records to this file for later `chat --claim-file`
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Ask one question about a processed claim
    Chat {
        #[arg(long)]
        question: String,

        /// JSON record list written by `submit --save`
        #[arg(long)]
        claim_file: Option<PathBuf>,
    },
    /// Inspect or edit previously submitted claims
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    List,
    Delete { id: Uuid },
    Clear,
}

/// Initialize tracing on stderr based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "claim_intake=info,claim_stream=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("Invalid client configuration")?;
    if let Some(url) = &cli.base_url {
        config.base_url = ClientConfig::with_base_url(url)
            .context("Invalid --base-url")?
            .base_url;
    }
    if let Some(dir) = &cli.history_dir {
        config.history_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(base_url = %config.base_url, "Using claims backend");

    let history = ClaimHistory::new(Arc::new(FileStore::new(&config.history_dir)));

    match cli.command {
        Command::Submit {
            text,
            file,
            chat,
            save,
        } => {
            let client = ClaimsClient::new(config)?;
            submit(client, history, text, file, chat, save).await
        }
        Command::Chat {
            question,
            claim_file,
        } => {
            let client = ClaimsClient::new(config)?;
            let data = match claim_file {
                Some(path) => load_claim_data(&path).await?,
                None => claim_data(&[])?,
            };
            let session = ChatSession::new(client).with_observer(Arc::new(TerminalRenderer::new()));
            session.send(&data, &question).await?;
            Ok(())
        }
        Command::History { action } => run_history(&history, action).await,
    }
}

async fn submit(
    client: ClaimsClient,
    history: ClaimHistory,
    text: Option<String>,
    file: Option<PathBuf>,
    chat: bool,
    save: Option<PathBuf>,
) -> Result<()> {
    let renderer = Arc::new(TerminalRenderer::new());
    let pipeline = ClaimPipeline::new(client.clone())
        .with_observer(renderer.clone())
        .with_history(history);

    let state = match (text, file) {
        (Some(text), _) => pipeline.submit_text(&text).await,
        (None, Some(path)) => pipeline.submit_file(&path).await,
        (None, None) => bail!("Either --text or --file is required"),
    }
    .context("Claim submission failed")?;

    let data = claim_data(&state.records)?;
    if let Some(path) = save {
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Saved claim records");
    }
    check_outcome(&state)?;

    if chat {
        let session = ChatSession::new(client).with_observer(renderer);
        chat_repl(&session, &data).await?;
    }
    Ok(())
}

/// A stream that reported an `Error` stage failed even though it ended cleanly
fn check_outcome(state: &ProgressState) -> Result<()> {
    if state.has_error_stage() {
        let reason = state
            .latest(ERROR_STAGE)
            .and_then(|record| record.str_field("error"))
            .unwrap_or("the backend reported an error");
        bail!("Claim processing failed: {reason}");
    }
    Ok(())
}

/// Read a saved record list, re-serializing it so only well-formed records are sent
async fn load_claim_data(path: &Path) -> Result<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let records: Vec<StreamRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a saved claim record list", path.display()))?;
    Ok(claim_data(&records)?)
}

async fn chat_repl(session: &ChatSession, data: &str) -> Result<()> {
    println!("Ask about this claim. /clear resets the conversation, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => session.clear(),
            question => {
                // the renderer already showed the failure, keep the session going
                if let Err(e) = session.send(data, question).await {
                    warn!(error = %e, "Chat answer failed");
                }
            }
        }
    }
    Ok(())
}

async fn run_history(history: &ClaimHistory, action: HistoryAction) -> Result<()> {
    match action {
        HistoryAction::List => {
            let entries = history.list().await?;
            if entries.is_empty() {
                println!("No claims submitted yet");
            }
            for entry in entries {
                let text: String = entry.text.chars().take(48).collect();
                println!(
                    "{}  {:<10}  {}  {}",
                    entry.id,
                    entry.status.to_string(),
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    text
                );
                if let Some(summary) = entry.summary {
                    println!("    {summary}");
                }
            }
        }
        HistoryAction::Delete { id } => {
            if !history.delete(id).await? {
                bail!("No history entry with id {id}");
            }
            println!("Deleted {id}");
        }
        HistoryAction::Clear => {
            history.clear().await?;
            println!("History cleared");
        }
    }
    Ok(())
}
