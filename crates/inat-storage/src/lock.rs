//! Exclusive per-job lock so two processes never race on one checkpoint and table.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another scrape job holds {path}")]
    Held { path: PathBuf },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the lifetime of a job. The OS releases the lock if the process dies,
/// so a crashed job never blocks its own resume.
#[derive(Debug)]
pub struct JobLock {
    file: File,
    path: PathBuf,
}

impl JobLock {
    pub fn for_job(
        data_dir: impl AsRef<Path>,
        db_name: &str,
        table_name: &str,
    ) -> Result<Self, LockError> {
        Self::acquire(data_dir.as_ref().join(format!("{db_name}.{table_name}.lock")))
    }

    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held { path });
        }

        file.set_len(0).map_err(io_err)?;
        write!(file, "{}", std::process::id()).map_err(io_err)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_first_drops() {
        let dir = tempdir().expect("tempdir");
        let first = JobLock::for_job(dir.path(), "snakes", "zimbabwe").expect("first");

        let second = JobLock::for_job(dir.path(), "snakes", "zimbabwe");
        assert!(matches!(second, Err(LockError::Held { .. })));

        let other_table = JobLock::for_job(dir.path(), "snakes", "swaziland");
        assert!(other_table.is_ok());

        drop(first);
        JobLock::for_job(dir.path(), "snakes", "zimbabwe").expect("reacquire");
    }
}
