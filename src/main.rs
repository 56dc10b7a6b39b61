//! copyvet - command-line entry point
//!
//! One binary drives the whole pipeline: intake from the change feed,
//! the batch checker, the reconciliation sweeps, remediation upkeep,
//! provisioning, and the HTTP front door.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use copyvet::config::Config;
use copyvet::db;
use copyvet::services::change_stream;
use copyvet::services::checker;
use copyvet::services::ignore_lists::IgnoreLists;
use copyvet::services::reconciler::Reconciler;
use copyvet::services::similarity_client::SimilarityClient;
use copyvet::services::wiki_client::WikiClient;
use copyvet::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "copyvet")]
#[command(about = "Wiki copyright-infringement screening backend")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "COPYVET_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store incoming change events as queued candidates
    IngestChanges {
        /// Start the stream at a past timestamp (RFC 3339)
        #[arg(long, value_name = "TIMESTAMP")]
        since: Option<DateTime<Utc>>,
        /// Stop after storing this many candidates
        #[arg(long, value_name = "N")]
        total: Option<u64>,
    },
    /// Extract added text for queued candidates and submit it
    CheckChanges {
        /// Size of the extraction worker pool (default: host core count)
        #[arg(long, value_name = "N")]
        pool_size: Option<usize>,
        /// Maximum number of candidates to check
        #[arg(long, value_name = "N")]
        limit: Option<i64>,
    },
    /// Poll the external service for stale submissions and reports
    ReconcileReports,
    /// Re-resolve page locations of promoted matches
    RefreshRemediation {
        /// Only touch rows at least this many days stale
        #[arg(long, value_name = "DAYS", default_value_t = 7)]
        older_than: i64,
    },
    /// Create the database schema (and optionally the webhook)
    Provision {
        /// Recreate the service webhook after deleting any existing one
        #[arg(long)]
        webhook: bool,
    },
    /// Run the HTTP front door (webhook + health endpoints)
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 5780)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting copyvet v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(cli.config.as_deref())?);
    let pool = db::init_database(&config.database_url).await?;

    let wiki = Arc::new(WikiClient::new(config.meta.wiki_oauth_token.clone())?);
    let similarity = Arc::new(SimilarityClient::new(&config.similarity)?);
    let ignore = Arc::new(IgnoreLists::new());

    match cli.command {
        Command::IngestChanges { since, total } => {
            change_stream::ingest_changes(&pool, &config, &wiki, &ignore, since, total).await?;
        }
        Command::CheckChanges { pool_size, limit } => {
            let pool_size = pool_size.unwrap_or_else(checker::default_pool_size);
            checker::check_changes(&pool, config, wiki, &similarity, pool_size, limit).await?;
        }
        Command::ReconcileReports => {
            let reconciler = Reconciler::new(pool, config, similarity, wiki, ignore);
            reconciler.reconcile_reports().await?;
        }
        Command::RefreshRemediation { older_than } => {
            let reconciler = Reconciler::new(pool, config, similarity, wiki, ignore);
            reconciler.refresh_remediation(Duration::days(older_than)).await?;
        }
        Command::Provision { webhook } => {
            // the schema is already in place from init_database above
            info!("database schema provisioned");
            if webhook {
                similarity.delete_webhooks().await?;
                similarity.create_webhook().await?;
            }
        }
        Command::Serve { bind, port } => {
            let webhook_secret = config
                .similarity
                .webhook_signing_secret
                .as_ref()
                .map(|s| s.as_bytes().to_vec());
            let reconciler = Arc::new(Reconciler::new(
                pool.clone(),
                config,
                similarity,
                wiki,
                ignore,
            ));
            let state = AppState::new(pool, reconciler, webhook_secret);
            let app = build_router(state);

            let listener = tokio::net::TcpListener::bind((bind.as_str(), port)).await?;
            info!("copyvet listening on http://{bind}:{port}");
            info!("Health check: http://{bind}:{port}/healthz");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
