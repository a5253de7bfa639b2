use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use statseed_core::Sport;
use statseed_storage::PgSeedStore;
use statseed_sync::{SeedConfig, SeedRuntime};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "statseed")]
#[command(about = "Post-event stat seeding and percentile alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed every pending event, one upstream fetch per (sport, season, league).
    Process {
        #[arg(long)]
        sport: Option<Sport>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        no_recalc: bool,
    },
    /// Seed a single event. Exits non-zero when seeding fails.
    Seed {
        #[arg(long)]
        event_id: i64,
        #[arg(long)]
        no_recalc: bool,
    },
    /// Push due deliveries until interrupted.
    Dispatch {
        #[arg(long)]
        once: bool,
    },
    Serve,
    Migrate,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Process {
            sport: None,
            limit: None,
            workers: None,
            max_retries: None,
            no_recalc: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_default() {
        Commands::Migrate => {
            let config = SeedConfig::from_env();
            let store = PgSeedStore::connect(&config.database_url, 2)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Process {
            sport,
            limit,
            workers,
            max_retries,
            no_recalc,
        } => {
            let runtime = SeedRuntime::from_env().await?;
            let mut request = runtime.default_request();
            request.sport = sport;
            request.limit = limit.unwrap_or(request.limit);
            request.workers = workers.unwrap_or(request.workers);
            request.max_retries = max_retries.unwrap_or(request.max_retries);
            request.recalc_percentiles = !no_recalc;

            let outcome = runtime
                .fanout
                .process_pending(&request, &shutdown_token())
                .await?;
            println!(
                "process complete: found={} processed={} succeeded={} failed={} entities={}",
                outcome.events_found,
                outcome.events_processed,
                outcome.succeeded,
                outcome.failed,
                outcome.entities_updated
            );
            for error in &outcome.errors {
                eprintln!("  error: {error}");
            }
        }
        Commands::Seed {
            event_id,
            no_recalc,
        } => {
            let runtime = SeedRuntime::from_env().await?;
            let outcome = runtime.orchestrator.seed_event(event_id, !no_recalc).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                bail!(
                    "seeding event {event_id} failed: {}",
                    outcome.error.unwrap_or_default()
                );
            }
        }
        Commands::Dispatch { once } => {
            let runtime = SeedRuntime::from_env().await?;
            let cancel = shutdown_token();
            if once {
                let report = runtime.dispatcher.tick(&cancel).await?;
                println!(
                    "dispatch complete: claimed={} sent={} failed={} skipped={}",
                    report.claimed, report.sent, report.failed, report.skipped
                );
            } else {
                runtime.dispatcher.run(cancel).await;
            }
        }
        Commands::Serve => {
            let runtime = SeedRuntime::from_env().await?;
            info!(
                scheduler = runtime.config.scheduler_enabled,
                sports = ?runtime.adapters.sports(),
                "statseed serving"
            );
            runtime.serve(shutdown_token()).await?;
        }
    }

    Ok(())
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            trigger.cancel();
        }
    });
    token
}
