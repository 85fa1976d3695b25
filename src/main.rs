//! mailvault - Command line entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use mailvault::config::Settings;
use mailvault::embedding::estimate_cost;
use mailvault::pipeline::ImportRequest;
use mailvault::providers::Credentials;
use mailvault::App;

#[derive(Debug, Parser)]
#[command(name = "mailvault", version, about = "Import mail into a local searchable archive")]
struct Cli {
    /// Settings file. Defaults to the user config directory.
    #[arg(long, global = true, env = "MAILVAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered providers.
    Providers,

    /// Authenticate and test the provider connection.
    Check {
        #[arg(long)]
        provider: Option<String>,
    },

    /// Run a full import.
    Import {
        #[arg(long)]
        provider: Option<String>,
        /// Provider search expression.
        #[arg(long)]
        query: Option<String>,
        /// Maximum number of messages to list.
        #[arg(long)]
        max: Option<usize>,
        /// Only messages on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long)]
        no_embeddings: bool,
    },

    /// Import messages newer than the newest stored one.
    Sync {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        no_embeddings: bool,
    },

    /// Show provider and archive status.
    Status {
        #[arg(long)]
        provider: Option<String>,
    },

    /// Embed stored messages that have no vector yet.
    Backfill {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Estimate the cost of embedding a number of messages.
    Estimate {
        #[arg(long)]
        count: usize,
        #[arg(long, default_value_t = 500)]
        avg_tokens: usize,
    },
}

#[derive(Serialize)]
struct ConnectionCheck {
    provider: String,
    account: Option<String>,
    connected: bool,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Command::Estimate { count, avg_tokens } = cli.command {
        let estimate = estimate_cost(count, avg_tokens, settings.embedding.price_per_million_tokens);
        return print_json(&estimate);
    }

    let app = App::build(settings).await?;

    match cli.command {
        Command::Providers => print_json(&app.registry().names()),

        Command::Check { provider } => {
            let pipeline = app.pipeline(provider.as_deref());
            let name = pipeline.provider().await;
            let shared = app.registry().get(&name).await?;
            {
                let mut guard = shared.write().await;
                if !guard.is_authenticated() {
                    guard
                        .authenticate(&Credentials::None)
                        .await
                        .with_context(|| format!("Authentication with {} failed", name))?;
                }
            }
            let guard = shared.read().await;
            print_json(&ConnectionCheck {
                provider: name,
                account: guard.account(),
                connected: guard.test_connection().await,
            })
        }

        Command::Import {
            provider,
            query,
            max,
            since,
            no_embeddings,
        } => {
            let pipeline = app.pipeline(provider.as_deref());
            let start_date = since
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt));
            let report = pipeline
                .run_full_import(ImportRequest {
                    query,
                    max_results: max,
                    start_date,
                    end_date: None,
                    generate_embeddings: !no_embeddings,
                })
                .await
                .context("Import failed")?;
            print_json(&report)
        }

        Command::Sync {
            provider,
            no_embeddings,
        } => {
            let pipeline = app.pipeline(provider.as_deref());
            let report = pipeline
                .run_incremental_sync(!no_embeddings)
                .await
                .context("Sync failed")?;
            print_json(&report)
        }

        Command::Status { provider } => {
            let status = app.pipeline(provider.as_deref()).get_status().await?;
            print_json(&status)
        }

        Command::Backfill { limit } => {
            let embedder = app
                .embedder()
                .context("Embeddings are disabled: set OPENAI_API_KEY")?;
            let limit = limit.unwrap_or(app.settings().embedding.backfill_limit);
            let report = embedder
                .backfill(app.store().as_ref(), limit)
                .await
                .context("Backfill failed")?;
            print_json(&report)
        }

        Command::Estimate { .. } => Ok(()),
    }
}
