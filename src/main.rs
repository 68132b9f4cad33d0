use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use depeg_watch::AppContext;
use depeg_watch::config::{Config, LogFormat};
use depeg_watch::jobs::rate_sample_job::{spawn_shutdown_listener, start_rate_sample_job};
use depeg_watch::services::backfill::{BackfillOptions, run_backfill};
use depeg_watch::services::export::{ExportWindow, export_samples};
use depeg_watch::services::rate_repository::{AlertStore, RateSampleStore};
use depeg_watch::services::report::{render_alerts_table, render_samples_table};
use depeg_watch::services::simulate::simulate_alert;

const DEFAULT_LOG_FILTER: &str = "info,depeg_watch=debug,sqlx=warn";

#[derive(Parser, Debug)]
#[command(name = "depeg-watch", version, about = "USDe/sUSDe official vs market rate watcher")]
struct Cli {
    /// Overrides RUST_LOG (e.g. "debug" or "info,depeg_watch=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample every aligned bucket until interrupted
    Run,

    /// Re-process historical buckets in [from, to)
    Backfill {
        /// RFC 3339 start (rounded up to the next bucket)
        #[arg(long)]
        from: DateTime<Utc>,

        /// RFC 3339 end (exclusive)
        #[arg(long)]
        to: DateTime<Utc>,

        /// Fetch and compute without writing
        #[arg(long)]
        dry_run: bool,

        #[arg(long, default_value_t = 1)]
        workers: usize,
    },

    /// Push fixed rates through the alert path once
    Simulate {
        #[arg(long)]
        official: Decimal,

        #[arg(long)]
        market: Decimal,
    },

    /// Print the most recent samples
    Show {
        #[arg(long, default_value_t = 20)]
        limit: u64,

        /// Also print the most recent alerts
        #[arg(long)]
        alerts: bool,
    },

    /// Write samples to CSV
    Export {
        #[arg(long)]
        csv: PathBuf,

        #[arg(long)]
        from: Option<DateTime<Utc>>,

        #[arg(long)]
        to: Option<DateTime<Utc>>,

        #[arg(long)]
        max_points: Option<usize>,
    },

    /// Delete alert records older than the given age
    PruneAlerts {
        #[arg(long)]
        older_than_days: u32,
    },

    /// Print name and version
    Version,
}

fn init_tracing(log_level: Option<&str>, format: LogFormat) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::from_env();
    let format = config
        .as_ref()
        .map(|c| c.logging.format)
        .unwrap_or(LogFormat::Pretty);
    init_tracing(cli.log_level.as_deref(), format);

    let ctx = AppContext::new(config.context("invalid configuration")?)?;

    match cli.command {
        Command::Run => run(&ctx).await,
        Command::Backfill {
            from,
            to,
            dry_run,
            workers,
        } => {
            backfill(
                &ctx,
                BackfillOptions {
                    from,
                    to,
                    dry_run,
                    workers,
                },
            )
            .await
        }
        Command::Simulate { official, market } => {
            let outcome = simulate_alert(
                &ctx.clock,
                ctx.sampling_settings(),
                ctx.notifier()?,
                official,
                market,
                Utc::now(),
            )
            .await?;
            tracing::info!(outcome = ?outcome, "Simulation finished");
            Ok(())
        }
        Command::Show { limit, alerts } => show(&ctx, limit, alerts).await,
        Command::Export {
            csv,
            from,
            to,
            max_points,
        } => {
            let repo = ctx.require_repository("export").await?;
            let max_points = ctx.config.resolve_max_points(max_points);
            let window =
                ExportWindow::resolve(from, to, Utc::now(), ctx.clock.interval(), max_points)?;
            let summary = export_samples(repo.as_ref(), &csv, window, max_points).await?;
            tracing::info!(
                total = summary.total,
                exported = summary.exported,
                path = %csv.display(),
                "Export finished"
            );
            Ok(())
        }
        Command::PruneAlerts { older_than_days } => {
            let repo = ctx.require_repository("prune-alerts").await?;
            let cutoff = Utc::now() - TimeDelta::days(i64::from(older_than_days));
            let deleted = repo.delete_alerts_before(cutoff).await?;
            tracing::info!(deleted, cutoff = %cutoff, "Pruned alerts");
            Ok(())
        }
        Command::Version => Ok(()),
    }
}

async fn run(ctx: &AppContext) -> Result<()> {
    let repository = ctx.open_repository().await?;
    let orchestrator = Arc::new(ctx.live_orchestrator(repository.clone())?);

    let cancel = CancellationToken::new();
    let listener = spawn_shutdown_listener(cancel.clone());

    let job = start_rate_sample_job(ctx.scheduler(), orchestrator, cancel.clone());
    let result = job.await.context("rate sample job panicked")?;

    cancel.cancel();
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "Shutdown listener task failed");
    }

    if let Some(repo) = repository {
        if let Ok(repo) = Arc::try_unwrap(repo) {
            repo.close().await?;
        }
    }
    result?;
    Ok(())
}

async fn backfill(ctx: &AppContext, options: BackfillOptions) -> Result<()> {
    let repository = if options.dry_run {
        None
    } else {
        Some(ctx.require_repository("backfill").await?)
    };
    let orchestrator = ctx.backfill_orchestrator(repository)?;

    let cancel = CancellationToken::new();
    let listener = spawn_shutdown_listener(cancel.clone());

    let result = run_backfill(&ctx.clock, &orchestrator, &options, &cancel).await;
    cancel.cancel();
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "Shutdown listener task failed");
    }

    let report = result?;
    tracing::info!(
        processed = report.processed,
        skipped = report.skipped,
        "Backfill finished"
    );
    Ok(())
}

async fn show(ctx: &AppContext, limit: u64, with_alerts: bool) -> Result<()> {
    let repo = ctx.require_repository("show").await?;

    let samples = repo.list_recent_samples(limit).await?;
    print!("{}", render_samples_table(&samples));
    println!("total samples: {}", repo.count_samples().await?);

    if with_alerts {
        let alerts = repo.list_recent_alerts(limit).await?;
        println!();
        print!("{}", render_alerts_table(&alerts));
    }
    Ok(())
}
