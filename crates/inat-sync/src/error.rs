use std::path::PathBuf;

use chrono::NaiveDate;
use inat_core::QueryError;
use inat_storage::{CheckpointError, FetchError, LockError, StoreError};
use thiserror::Error;

use crate::controller::ControllerState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required job parameter {0}")]
    Missing(&'static str),
    #[error("db_name {0:?} must be a plain file name (letters, digits, '_', '-', '.')")]
    InvalidDbName(String),
    #[error("table_name {0:?} must use letters, digits and underscores, not starting with a digit")]
    InvalidTableName(String),
    #[error("reading job file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing job file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// How a failed job should be reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Bad parameters; fix them before re-running. Nothing was fetched.
    ConfigurationError,
    /// The job halted mid-run; re-run with the same parameters to resume.
    RuntimeFailure,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid query: {0}; choose a lower start_page or per_page")]
    InvalidQuery(#[from] QueryError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(
        "source returned observation {id} dated {found} after one dated {previous} on page {page}; results must be ascending by date"
    )]
    SourceOrderingViolation {
        id: i64,
        previous: NaiveDate,
        found: NaiveDate,
        page: u64,
    },
    #[error("page {page} reached the offset ceiling without any dated observation to roll over from")]
    MissingCursorDate { page: u64 },
    #[error("more than one full partition of observations share the date {cursor}; rolling over cannot make progress")]
    StalledCursor { cursor: NaiveDate },
    #[error("cannot {operation} while the controller is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },
    #[error("writing run report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScrapeError {
    pub fn exit_kind(&self) -> ExitKind {
        match self {
            ScrapeError::Config(_) | ScrapeError::InvalidQuery(_) => ExitKind::ConfigurationError,
            _ => ExitKind::RuntimeFailure,
        }
    }
}
