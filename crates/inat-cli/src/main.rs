use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use inat_sync::{ExitKind, JobTarget, RuntimeConfig, ScrapeError, ScrapeJob, ScrapeJobDraft};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "inat-accretor")]
#[command(about = "Accrete iNaturalist observations for a place and taxon into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Scrape every observation, resuming from a checkpoint if one exists (default).
    Scrape,
    /// Create or verify the destination table. Needs only --db-name and --table-name.
    Migrate,
    /// Show row count and checkpoint without fetching. Needs only --db-name and --table-name.
    Status,
}

#[derive(Debug, Clone, Default, Args)]
struct JobArgs {
    /// YAML job file; flags override its values.
    #[arg(long, global = true)]
    job: Option<PathBuf>,
    #[arg(long, global = true)]
    place_id: Option<u64>,
    #[arg(long, global = true)]
    taxon_id: Option<u64>,
    #[arg(long, global = true)]
    start_page: Option<u64>,
    #[arg(long, global = true)]
    per_page: Option<u64>,
    #[arg(long, global = true)]
    db_name: Option<String>,
    #[arg(long, global = true)]
    table_name: Option<String>,
    /// Only observations made on or before this date (YYYY-MM-DD).
    #[arg(long, global = true, value_parser = parse_day)]
    observed_until: Option<NaiveDate>,
}

impl JobArgs {
    fn resolve(self) -> Result<ScrapeJob, ScrapeError> {
        Ok(self.draft()?.finish()?)
    }

    fn resolve_target(self) -> Result<JobTarget, ScrapeError> {
        Ok(self.draft()?.target()?)
    }

    fn draft(self) -> Result<ScrapeJobDraft, ScrapeError> {
        let base = match &self.job {
            Some(path) => ScrapeJobDraft::load_yaml(path)?,
            None => ScrapeJobDraft::default(),
        };
        let flags = ScrapeJobDraft {
            place_id: self.place_id,
            taxon_id: self.taxon_id,
            start_page: self.start_page,
            per_page: self.per_page,
            db_name: self.db_name,
            table_name: self.table_name,
            observed_until: self.observed_until,
        };
        Ok(base.overlay(flags))
    }
}

fn parse_day(value: &str) -> Result<NaiveDate, String> {
    inat_core::parse_date(value).ok_or_else(|| format!("{value:?} is not a YYYY-MM-DD date"))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let kind = err
                .downcast_ref::<ScrapeError>()
                .map(ScrapeError::exit_kind)
                .unwrap_or(ExitKind::RuntimeFailure);
            match kind {
                ExitKind::ConfigurationError => ExitCode::from(2),
                ExitKind::RuntimeFailure => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let runtime = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let job = cli.job.resolve()?;
            let outcome = inat_sync::run_scrape(&job, &runtime).await?;
            let stats = outcome.summary.stats;
            println!(
                "scrape complete: run_id={} pages={} inserted={} duplicates={} rollovers={} report={}",
                outcome.summary.run_id,
                stats.pages_fetched,
                stats.records_inserted,
                stats.duplicates_ignored,
                stats.rollovers,
                outcome.report_path.display()
            );
        }
        Commands::Migrate => {
            let target = cli.job.resolve_target()?;
            let db_path = inat_sync::migrate(&target, &runtime).await?;
            println!("table {} ready in {}", target.table_name, db_path.display());
        }
        Commands::Status => {
            let target = cli.job.resolve_target()?;
            let status = inat_sync::job_status(&target, &runtime).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("rendering job status")?
            );
        }
    }

    Ok(())
}
