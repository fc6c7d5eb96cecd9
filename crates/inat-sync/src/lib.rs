//! Scrape job orchestration: wires the source adapter, accretion store, checkpoint
//! and job lock around the pagination controller.

mod config;
mod controller;
mod error;

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use inat_adapters::{INaturalistApi, JsonObservationExtractor, PageFetcher};
use inat_storage::{
    AccretionStore, CheckpointStore, FileCheckpointStore, HttpFetcher, JobLock,
    SqliteAccretionStore, StoreError,
};
use serde::Serialize;
use tokio::fs;
use tracing::info;

pub use config::{
    JobTarget, RuntimeConfig, ScrapeJob, ScrapeJobDraft, DEFAULT_DATA_DIR, DEFAULT_PER_PAGE,
    DEFAULT_START_PAGE,
};
pub use controller::{ControllerState, PaginationController, RunStats, ScrapeSummary};
pub use error::{ConfigError, ExitKind, ScrapeError};

pub const CRATE_NAME: &str = "inat-sync";

#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub summary: ScrapeSummary,
    pub report_path: PathBuf,
}

/// Where a job stands on disk, without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub db_path: PathBuf,
    pub checkpoint_path: PathBuf,
    /// `None` until the destination table has been created.
    pub rows: Option<u64>,
    pub checkpoint: Option<NaiveDate>,
}

/// Run a job against the live iNaturalist API, logging in first when credentials are set.
pub async fn run_scrape(
    job: &ScrapeJob,
    runtime: &RuntimeConfig,
) -> Result<ScrapeOutcome, ScrapeError> {
    job.table()?;
    let http = HttpFetcher::new(runtime.http_client_config())?;
    let api = INaturalistApi::new(http, runtime.endpoints.clone())
        .with_credentials(runtime.credentials.clone());
    if runtime.credentials.is_none() {
        info!("no INAT_USERNAME/INAT_PASSWORD set; scraping anonymously");
    }
    run_scrape_with(job, runtime, Box::new(api)).await
}

/// Run a job with any page source. Holds the job lock for the whole run and
/// writes the run report once the result set is exhausted.
pub async fn run_scrape_with(
    job: &ScrapeJob,
    runtime: &RuntimeConfig,
    fetcher: Box<dyn PageFetcher>,
) -> Result<ScrapeOutcome, ScrapeError> {
    let table = job.table()?;
    let _lock = JobLock::for_job(&runtime.data_dir, &job.db_name, &job.table_name)?;
    let store = SqliteAccretionStore::open(&runtime.data_dir, &job.db_name).await?;
    let checkpoint = FileCheckpointStore::for_job(&runtime.data_dir, &job.db_name, &job.table_name);

    let mut controller = PaginationController::new(
        job.query(),
        table,
        fetcher,
        Box::new(JsonObservationExtractor),
        Box::new(store),
        Box::new(checkpoint),
    );
    let summary = controller.run().await?;
    let report_path = write_run_report(&runtime.data_dir, &summary).await?;
    info!(report = %report_path.display(), "run report written");
    Ok(ScrapeOutcome {
        summary,
        report_path,
    })
}

/// Create (or verify) the destination table without scraping.
pub async fn migrate(target: &JobTarget, runtime: &RuntimeConfig) -> Result<PathBuf, ScrapeError> {
    let table = target.table()?;
    let _lock = JobLock::for_job(&runtime.data_dir, &target.db_name, &target.table_name)?;
    let store = SqliteAccretionStore::open(&runtime.data_dir, &target.db_name).await?;
    store.ensure_schema(&table).await?;
    Ok(store.path().to_path_buf())
}

pub async fn job_status(
    target: &JobTarget,
    runtime: &RuntimeConfig,
) -> Result<JobStatus, ScrapeError> {
    let table = target.table()?;
    let checkpoint =
        FileCheckpointStore::for_job(&runtime.data_dir, &target.db_name, &target.table_name);
    let db_path = runtime.data_dir.join(format!("{}.db", target.db_name));

    let db_exists = fs::try_exists(&db_path)
        .await
        .map_err(|source| StoreError::Io {
            path: db_path.clone(),
            source,
        })?;
    let rows = if db_exists {
        let store = SqliteAccretionStore::open_path(&db_path).await?;
        if store.table_exists(&table).await? {
            Some(store.row_count(&table).await?)
        } else {
            None
        }
    } else {
        None
    };

    Ok(JobStatus {
        db_path,
        checkpoint_path: checkpoint.path().to_path_buf(),
        rows,
        checkpoint: checkpoint.read().await?,
    })
}

async fn write_run_report(data_dir: &Path, summary: &ScrapeSummary) -> Result<PathBuf, ScrapeError> {
    let runs_dir = data_dir.join("runs");
    let path = runs_dir.join(format!("{}.json", summary.run_id));
    let report_err = |source| ScrapeError::Report {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(&runs_dir).await.map_err(report_err)?;
    let bytes = serde_json::to_vec_pretty(summary)
        .map_err(|e| report_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    fs::write(&path, bytes).await.map_err(report_err)?;
    Ok(path)
}
