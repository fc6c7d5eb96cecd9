//! Job parameters (the static search "control panel") and process-level runtime settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use inat_adapters::{ApiEndpoints, Credentials, DEFAULT_API_BASE, DEFAULT_SITE_BASE};
use inat_core::Query;
use inat_storage::{BackoffPolicy, HttpClientConfig, TableName, TokenBucketConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_DATA_DIR: &str = "iNaturalist_data";
pub const DEFAULT_START_PAGE: u64 = 1;
pub const DEFAULT_PER_PAGE: u64 = 100;

/// Fully specified, immutable scrape job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub place_id: u64,
    pub taxon_id: u64,
    pub start_page: u64,
    pub per_page: u64,
    pub db_name: String,
    pub table_name: String,
    pub observed_until: Option<NaiveDate>,
}

impl ScrapeJob {
    pub fn target(&self) -> JobTarget {
        JobTarget {
            db_name: self.db_name.clone(),
            table_name: self.table_name.clone(),
        }
    }

    pub fn query(&self) -> Query {
        Query::new(self.place_id, self.taxon_id, self.per_page, self.start_page)
            .with_observed_until(self.observed_until)
    }

    pub fn table(&self) -> Result<TableName, ConfigError> {
        TableName::parse(&self.table_name)
            .map_err(|_| ConfigError::InvalidTableName(self.table_name.clone()))
    }
}

/// The database and table a job writes to. Enough for `migrate` and `status`,
/// which never query the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTarget {
    pub db_name: String,
    pub table_name: String,
}

impl JobTarget {
    pub fn table(&self) -> Result<TableName, ConfigError> {
        TableName::parse(&self.table_name)
            .map_err(|_| ConfigError::InvalidTableName(self.table_name.clone()))
    }
}

/// Partially specified job, as read from a YAML file or from command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeJobDraft {
    pub place_id: Option<u64>,
    pub taxon_id: Option<u64>,
    pub start_page: Option<u64>,
    pub per_page: Option<u64>,
    pub db_name: Option<String>,
    pub table_name: Option<String>,
    pub observed_until: Option<NaiveDate>,
}

impl ScrapeJobDraft {
    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Values set in `other` win.
    pub fn overlay(self, other: ScrapeJobDraft) -> Self {
        Self {
            place_id: other.place_id.or(self.place_id),
            taxon_id: other.taxon_id.or(self.taxon_id),
            start_page: other.start_page.or(self.start_page),
            per_page: other.per_page.or(self.per_page),
            db_name: other.db_name.or(self.db_name),
            table_name: other.table_name.or(self.table_name),
            observed_until: other.observed_until.or(self.observed_until),
        }
    }

    /// Validate only the destination, ignoring the search parameters.
    pub fn target(&self) -> Result<JobTarget, ConfigError> {
        let db_name = self.db_name.clone().ok_or(ConfigError::Missing("db_name"))?;
        if !is_plain_file_stem(&db_name) {
            return Err(ConfigError::InvalidDbName(db_name));
        }
        let target = JobTarget {
            db_name,
            table_name: self.table_name.clone().ok_or(ConfigError::Missing("table_name"))?,
        };
        target.table()?;
        Ok(target)
    }

    pub fn finish(self) -> Result<ScrapeJob, ConfigError> {
        let JobTarget {
            db_name,
            table_name,
        } = self.target()?;

        Ok(ScrapeJob {
            place_id: self.place_id.ok_or(ConfigError::Missing("place_id"))?,
            taxon_id: self.taxon_id.ok_or(ConfigError::Missing("taxon_id"))?,
            start_page: self.start_page.unwrap_or(DEFAULT_START_PAGE),
            per_page: self.per_page.unwrap_or(DEFAULT_PER_PAGE),
            db_name,
            table_name,
            observed_until: self.observed_until,
        })
    }
}

fn is_plain_file_stem(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Process-wide settings taken from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub endpoints: ApiEndpoints,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub requests_per_minute: u32,
    pub credentials: Option<Credentials>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            endpoints: ApiEndpoints::default(),
            user_agent: format!("inat-accretor/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            requests_per_minute: 60,
            credentials: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let credentials = match (non_empty("INAT_USERNAME"), non_empty("INAT_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };
        Self {
            data_dir: non_empty("INAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            endpoints: ApiEndpoints {
                api_base: non_empty("INAT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
                site_base: non_empty("INAT_SITE_BASE")
                    .unwrap_or_else(|| DEFAULT_SITE_BASE.to_string()),
            },
            user_agent: non_empty("INAT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: non_empty("INAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            requests_per_minute: non_empty("INAT_REQUESTS_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.requests_per_minute),
            credentials,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::per_minute(self.requests_per_minute)),
        }
    }
}
