use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duels_pipeline::{BatchResponse, PipelineConfig};
use duels_storage::{PgRunStore, RunStore};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "duels-cli")]
#[command(about = "Duels run summary pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process one queued batch read from a file or stdin.
    Process {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Process { input: None }) {
        Commands::Process { input } => {
            let batch = match input {
                Some(path) => duels_ingest::load_batch_file(&path)?,
                None => {
                    let mut raw = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut raw)
                        .await
                        .context("reading batch from stdin")?;
                    duels_ingest::parse_batch(&raw)?
                }
            };
            let summary = duels_pipeline::run_batch_from_env(&batch).await?;
            tracing::info!(
                batch_id = %summary.batch_id,
                events = summary.events,
                persisted = summary.persisted,
                skipped = ?summary.skipped,
                "batch complete"
            );
            println!("{}", serde_json::to_string(&BatchResponse::ok())?);
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let store = PgRunStore::connect(&config.database_url, config.pg_store_config(1))
                .await
                .context("connecting to run store")?;
            store.migrate().await?;
            store.close().await;
            println!("migrations applied");
        }
        Commands::Serve => duels_web::serve_from_env().await?,
    }

    Ok(())
}
