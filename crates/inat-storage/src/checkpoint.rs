//! Date-cursor checkpoint persisted as a single ISO date in a small file.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use inat_core::{format_date, parse_date};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint {path} holds {contents:?}, which is not a YYYY-MM-DD date")]
    Corrupt { path: PathBuf, contents: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Passive persistence for the rollover cursor. At most one value exists.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace (or create) the checkpoint. Durable once this returns.
    async fn write(&self, date: NaiveDate) -> Result<(), CheckpointError>;

    async fn read(&self) -> Result<Option<NaiveDate>, CheckpointError>;

    /// Remove the checkpoint; succeeds when none exists.
    async fn clear(&self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file scoped to one destination table.
    pub fn for_job(data_dir: impl AsRef<Path>, db_name: &str, table_name: &str) -> Self {
        Self::new(
            data_dir
                .as_ref()
                .join(format!("{db_name}.{table_name}.checkpoint")),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn write(&self, date: NaiveDate) -> Result<(), CheckpointError> {
        let parent = self.parent();
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        let written = async {
            file.write_all(format_date(date).as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&temp_path)(err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&self.path)(err));
        }
        sync_dir(parent).await?;

        debug!(path = %self.path.display(), %date, "checkpoint written");
        Ok(())
    }

    async fn read(&self) -> Result<Option<NaiveDate>, CheckpointError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&self.path)(err)),
        };
        parse_date(&contents)
            .map(Some)
            .ok_or_else(|| CheckpointError::Corrupt {
                path: self.path.clone(),
                contents,
            })
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.path)(err)),
        }
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), CheckpointError> {
    let handle = fs::File::open(dir).await.map_err(io_err(dir))?;
    handle.sync_all().await.map_err(io_err(dir))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), CheckpointError> {
    Ok(())
}
