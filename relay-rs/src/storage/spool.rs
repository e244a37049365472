//! Crash-safe message spool
//!
//! A message moves through the spool directories by atomic renames only:
//!
//! ```text
//!  open()        commit()        claim()          complete()
//! ───────→ tmp/ ─────────→ new/ ─────────→ queue/ ──────────→ (deleted)
//!            │ abort()                       │ dead_letter()
//!            ↓                               ↓
//!        (deleted)                        failed/
//! ```
//!
//! `tmp/` is private to the SMTP session writing the message. A file under
//! `new/` is complete and waits for the relay scanner; a file under `queue/`
//! belongs to the relay pipeline and stays there until it is delivered or
//! dead-lettered. [`Spool::defer`] leaves a file in `queue/` and only
//! refreshes its modification time, which the scanner uses as the time of
//! the last attempt.

use crate::error::{RelayError, Result};
use crate::storage::fs::{LocalFs, SpoolFile, SpoolFs};
use chrono::Utc;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EXTENSION: &str = "eml";

pub struct Spool {
    fs: Arc<dyn SpoolFs>,
    base: PathBuf,
    tmp_dir: PathBuf,
    pickup_dir: PathBuf,
    work_dir: PathBuf,
    failed_dir: PathBuf,
}

impl Spool {
    /// Open the spool rooted at `base` on the local filesystem
    pub fn open_local(base: impl Into<PathBuf>) -> Result<Self> {
        Self::with_fs(base, Arc::new(LocalFs))
    }

    /// Open the spool on an arbitrary filesystem, creating every directory
    pub fn with_fs(base: impl Into<PathBuf>, fs: Arc<dyn SpoolFs>) -> Result<Self> {
        let base = base.into();
        let spool = Self {
            tmp_dir: base.join("tmp"),
            pickup_dir: base.join("new"),
            work_dir: base.join("queue"),
            failed_dir: base.join("failed"),
            base,
            fs,
        };

        for dir in [
            &spool.tmp_dir,
            &spool.pickup_dir,
            &spool.work_dir,
            &spool.failed_dir,
        ] {
            spool.fs.create_dir_all(dir).map_err(|e| {
                RelayError::Storage(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }

        info!("Spool ready at {}", spool.base.display());
        Ok(spool)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn pickup_dir(&self) -> &Path {
        &self.pickup_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    /// Start writing a new message
    ///
    /// # Arguments
    /// * `id` - File stem to use; a timestamp plus random suffix when `None`
    ///
    /// # Errors
    /// Returns an error if the id is not a plain file name or the temp file
    /// cannot be created (including when it already exists).
    pub fn open(&self, id: Option<&str>) -> Result<SpoolTransaction> {
        let id = match id {
            Some(id) => {
                if id.is_empty() || id.contains(&['/', '\\'][..]) || id.starts_with('.') {
                    return Err(RelayError::Storage(format!("Invalid spool id: {:?}", id)));
                }
                id.to_string()
            }
            None => generate_id(),
        };

        let file_name = format!("{}.{}", id, EXTENSION);
        let temp_path = self.tmp_dir.join(&file_name);
        let final_path = self.pickup_dir.join(&file_name);

        let file = self.fs.create_new(&temp_path).map_err(|e| {
            RelayError::Storage(format!("Failed to create {}: {}", temp_path.display(), e))
        })?;

        debug!("Opened spool transaction {}", id);
        Ok(SpoolTransaction {
            fs: Arc::clone(&self.fs),
            id,
            temp_path,
            final_path,
            file: Some(file),
            state: TxState::Open,
            bytes_written: 0,
            write_error: None,
        })
    }

    /// Committed messages waiting for the scanner
    pub fn pickup_files(&self) -> Result<Vec<PathBuf>> {
        self.list(&self.pickup_dir)
    }

    /// Messages owned by the relay pipeline
    pub fn work_files(&self) -> Result<Vec<PathBuf>> {
        self.list(&self.work_dir)
    }

    /// Move a committed message into the work directory
    pub fn claim(&self, pickup_path: &Path) -> Result<PathBuf> {
        let file_name = pickup_path
            .file_name()
            .ok_or_else(|| RelayError::Storage(format!("Not a file: {:?}", pickup_path)))?;
        let work_path = self.work_dir.join(file_name);
        self.fs.rename(pickup_path, &work_path)?;
        debug!("Claimed {}", work_path.display());
        Ok(work_path)
    }

    /// Open a message for reading
    pub fn read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(self.fs.open(path)?)
    }

    /// Remove a delivered message
    pub fn complete(&self, work_path: &Path) -> Result<()> {
        self.fs.remove(work_path)?;
        Ok(())
    }

    /// Keep a message for a later attempt
    pub fn defer(&self, work_path: &Path) -> Result<()> {
        self.fs.touch(work_path)?;
        Ok(())
    }

    /// Move a message that can never be delivered out of the work directory
    pub fn dead_letter(&self, work_path: &Path) -> Result<PathBuf> {
        let file_name = work_path
            .file_name()
            .ok_or_else(|| RelayError::Storage(format!("Not a file: {:?}", work_path)))?;
        let failed_path = self.failed_dir.join(file_name);
        self.fs.rename(work_path, &failed_path)?;
        Ok(failed_path)
    }

    /// Whether the last attempt on `work_path` is at least `retry_interval` old
    pub fn is_due(&self, work_path: &Path, retry_interval: Duration) -> Result<bool> {
        let modified = self.fs.modified(work_path)?;
        Ok(SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= retry_interval)
            .unwrap_or(false))
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .fs
            .list_files(dir)?
            .into_iter()
            .filter(|p| p.extension().map_or(false, |ext| ext == EXTENSION))
            .collect())
    }
}

fn generate_id() -> String {
    format!(
        "{}.{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        Uuid::new_v4().simple()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    Aborted,
}

/// One message being written under `tmp/`
///
/// Dropping an open transaction aborts it.
pub struct SpoolTransaction {
    fs: Arc<dyn SpoolFs>,
    id: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<Box<dyn SpoolFile>>,
    state: TxState,
    bytes_written: u64,
    write_error: Option<io::Error>,
}

impl SpoolTransaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append bytes; a failure is remembered and reported by [`commit`](Self::commit)
    pub fn write(&mut self, data: &[u8]) {
        if self.write_error.is_some() {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            match file.write_all(data) {
                Ok(()) => self.bytes_written += data.len() as u64,
                Err(e) => {
                    warn!("Write to {} failed: {}", self.temp_path.display(), e);
                    self.write_error = Some(e);
                }
            }
        }
    }

    /// Make the message durable and move it into the pickup directory
    ///
    /// # Errors
    /// Returns an error if any earlier write, the final flush or the rename
    /// failed. The temp file is removed in every error case.
    pub fn commit(mut self) -> Result<PathBuf> {
        let synced = match self.file.take() {
            Some(mut file) => file.sync(),
            None => Ok(()),
        };

        let outcome = match (self.write_error.take(), synced) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => self.fs.rename(&self.temp_path, &self.final_path),
        };

        match outcome {
            Ok(()) => {
                self.state = TxState::Committed;
                info!(
                    "Committed {} ({} bytes)",
                    self.final_path.display(),
                    self.bytes_written
                );
                Ok(self.final_path.clone())
            }
            Err(e) => {
                error!("Failed to commit {}: {}", self.temp_path.display(), e);
                self.discard();
                Err(RelayError::Storage(format!(
                    "Failed to commit {}: {}",
                    self.id, e
                )))
            }
        }
    }

    /// Close and unlink the temp file
    pub fn abort(mut self) {
        self.discard();
        debug!("Aborted spool transaction {}", self.id);
    }

    fn discard(&mut self) {
        self.file = None;
        if let Err(e) = self.fs.remove(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to remove {}: {}", self.temp_path.display(), e);
            }
        }
        self.state = TxState::Aborted;
    }
}

impl Drop for SpoolTransaction {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            self.discard();
        }
    }
}
