use std::path::PathBuf;

use annwatch_sync::{exchange_today, RunSummary, WatchConfig, WatchPipeline};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "annwatch-cli")]
#[command(about = "Corporate announcement watcher")]
struct Cli {
    /// Load environment variables from this file instead of `.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll once, notify on a new tracked announcement, record it.
    Run(RunArgs),
    /// Print tracked announcements for a day or a date range without notifying.
    Scan(ScanArgs),
    /// Print the severity a title would be announced with.
    Classify { title: String },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Re-deliver even when the announcement matches the stored state.
    #[arg(long)]
    force: bool,
    /// Query date as YYYYMMDD; defaults to today in exchange time.
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDate>,
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[arg(long, value_parser = parse_date, conflicts_with_all = ["from", "to"])]
    date: Option<NaiveDate>,
    /// First day of the range, YYYYMMDD.
    #[arg(long, value_parser = parse_date, requires = "to")]
    from: Option<NaiveDate>,
    /// Last day of the range (inclusive), YYYYMMDD.
    #[arg(long, value_parser = parse_date, requires = "from")]
    to: Option<NaiveDate>,
}

impl ScanArgs {
    fn range(&self) -> (NaiveDate, NaiveDate) {
        match (self.from, self.to) {
            (Some(from), Some(to)) => (from, to),
            _ => {
                let day = self.date.unwrap_or_else(exchange_today);
                (day, day)
            }
        }
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|err| format!("expected YYYYMMDD: {err}"))
}

/// `RUST_LOG` when set and valid, else `annwatch=info`.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("annwatch=info"))
}

fn load_env(path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<RunSummary> {
    let mut config = WatchConfig::from_env();
    if args.force {
        config = config.with_force_send(true);
    }
    if let Some(path) = args.state_file {
        config = config.with_state_path(path);
    }
    config.log_redacted();
    let date = args.date.unwrap_or_else(exchange_today);
    WatchPipeline::new(config)?.run_once(date).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    load_env(cli.env_file.as_ref())?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => match run(args).await {
            Ok(summary) => {
                println!(
                    "run complete: run_id={} outcome={:?} source={} notices={} persisted={} forced={}",
                    summary.run_id,
                    summary.outcome,
                    summary
                        .source
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    summary.notices_sent,
                    summary.persisted,
                    summary.forced,
                );
            }
            // Degraded runs still exit 0.
            Err(err) => error!(error = %format!("{err:#}"), "run failed"),
        },
        Commands::Scan(args) => {
            let (from, to) = args.range();
            let rows = WatchPipeline::new(WatchConfig::from_env())?
                .sweep(from, to)
                .await?;
            if rows.is_empty() {
                println!(
                    "no tracked announcements for {}..{}",
                    from.format("%Y%m%d"),
                    to.format("%Y%m%d")
                );
            }
            for row in rows {
                println!(
                    "{} | {} | {} | {} | {}",
                    row.record.date,
                    row.record.entity_id,
                    row.source,
                    row.record.title,
                    row.record.document_link
                );
            }
        }
        Commands::Classify { title } => match annwatch_sync::classify(&title) {
            Some(c) => println!("{} {}", c.marker(), c.label),
            None => println!("ignored"),
        },
    }

    Ok(())
}
