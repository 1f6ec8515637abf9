//! Incremental recursive mirroring between two open share sessions.
//!
//! Files are compared by modification time only. After every copy the destination mtime is set
//! to the source mtime observed before the read, so an unchanged file compares `Current` on the
//! next run and a file modified mid-copy compares `Stale`.
//!
//! Per-entry failures are logged and counted in [`SyncStats::failed_files`]; only losing the
//! connection to either share aborts the walk.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::DeletionPolicy;
use crate::core::models::{FileComparison, SyncStats};
use crate::core::share::{ShareError, ShareSession};
use crate::logging::LogThrottle;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot list source directory: {0}")]
    Source(#[source] ShareError),

    #[error("cannot create destination directory: {0}")]
    Destination(#[source] ShareError),

    #[error("share connection lost: {0}")]
    ConnectionLost(#[source] ShareError),
}

impl SyncError {
    fn source_side(e: ShareError) -> Self {
        if e.is_connection_lost() {
            Self::ConnectionLost(e)
        } else {
            Self::Source(e)
        }
    }

    fn destination_side(e: ShareError) -> Self {
        if e.is_connection_lost() {
            Self::ConnectionLost(e)
        } else {
            Self::Destination(e)
        }
    }
}

type SyncFuture<'a> = Pin<Box<dyn Future<Output = Result<SyncStats, SyncError>> + Send + 'a>>;

pub struct DirectorySync<'a> {
    source: &'a dyn ShareSession,
    dest: &'a dyn ShareSession,
    deletion: DeletionPolicy,
    throttle: LogThrottle,
}

impl<'a> DirectorySync<'a> {
    pub fn new(
        source: &'a dyn ShareSession,
        dest: &'a dyn ShareSession,
        deletion: DeletionPolicy,
    ) -> Self {
        Self {
            source,
            dest,
            deletion,
            throttle: LogThrottle::new(PROGRESS_LOG_INTERVAL),
        }
    }

    /// Mirror `source_root` into `dest_root`, creating `dest_root` if needed.
    pub async fn sync(&self, source_root: &Path, dest_root: &Path) -> Result<SyncStats, SyncError> {
        info!(
            source = %source_root.display(),
            destination = %dest_root.display(),
            "Synchronizing subtree"
        );

        let stats = self.sync_tree(source_root, dest_root).await?;

        info!(
            source = %source_root.display(),
            copied = stats.copied_files,
            skipped = stats.skipped_files,
            failed = stats.failed_files,
            removed = stats.removed_files,
            bytes = stats.total_bytes,
            "Subtree synchronized"
        );
        Ok(stats)
    }

    fn sync_tree<'b>(&'b self, source_dir: &'b Path, dest_dir: &'b Path) -> SyncFuture<'b> {
        Box::pin(async move {
            self.dest
                .mkdir(dest_dir)
                .await
                .map_err(SyncError::destination_side)?;

            let entries = self
                .source
                .list(source_dir)
                .await
                .map_err(SyncError::source_side)?;

            let mut stats = SyncStats::default();

            for name in &entries {
                let source_path = source_dir.join(name);
                let dest_path = dest_dir.join(name);

                if self.source.is_directory(&source_path).await {
                    match self.sync_tree(&source_path, &dest_path).await {
                        Ok(child) => stats += child,
                        Err(e @ SyncError::ConnectionLost(_)) => return Err(e),
                        Err(e) => {
                            error!(path = %source_path.display(), error = %e, "Skipping directory");
                        }
                    }
                    continue;
                }

                match self.sync_file(&source_path, &dest_path).await {
                    Ok(Some(bytes)) => {
                        stats.copied_files += 1;
                        stats.total_bytes += bytes;
                    }
                    Ok(None) => stats.skipped_files += 1,
                    Err(e) if e.is_connection_lost() => return Err(SyncError::ConnectionLost(e)),
                    Err(e) => {
                        error!(path = %source_path.display(), error = %e, "Failed to sync file");
                        stats.failed_files += 1;
                    }
                }

                if let Some(since_last) = self.throttle.tick() {
                    info!(directory = %source_dir.display(), entries_since_last = since_last, "Sync in progress");
                }
            }

            if self.deletion == DeletionPolicy::Mirror {
                stats.removed_files += self.prune(dest_dir, &entries).await?;
            }

            Ok(stats)
        })
    }

    /// Classify a source file against its destination counterpart.
    pub async fn compare(&self, source_path: &Path, dest_path: &Path) -> Result<FileComparison, ShareError> {
        Ok(self.classify(source_path, dest_path).await?.0)
    }

    /// Like [`Self::compare`], also handing back the source mtime when it was read.
    async fn classify(
        &self,
        source_path: &Path,
        dest_path: &Path,
    ) -> Result<(FileComparison, Option<SystemTime>), ShareError> {
        if !self.dest.exists(dest_path).await? {
            return Ok((FileComparison::New, None));
        }

        let source_modified = self.source.mod_time(source_path).await?;
        let dest_modified = self.dest.mod_time(dest_path).await?;

        let comparison = if dest_modified < source_modified {
            FileComparison::Stale
        } else {
            FileComparison::Current
        };
        Ok((comparison, Some(source_modified)))
    }

    /// Returns the bytes copied, or `None` if the destination was current.
    async fn sync_file(&self, source_path: &Path, dest_path: &Path) -> Result<Option<u64>, ShareError> {
        let (comparison, observed) = self.classify(source_path, dest_path).await?;
        if !comparison.needs_copy() {
            debug!(path = %source_path.display(), "Destination current, skipping");
            return Ok(None);
        }

        // The mtime must predate the read so a concurrent edit shows up as stale next run
        let source_modified = match observed {
            Some(modified) => modified,
            None => self.source.mod_time(source_path).await?,
        };
        let data = self.source.read_all(source_path).await?;

        if let Err(e) = self.dest.write_all(dest_path, &data).await {
            if !e.is_connection_lost() {
                self.mark_for_recopy(dest_path).await;
            }
            return Err(e);
        }

        if let Err(e) = self.dest.set_mod_time(dest_path, source_modified).await {
            if e.is_connection_lost() {
                return Err(e);
            }
            warn!(
                path = %dest_path.display(),
                error = %e,
                "Failed to propagate modification time, source edits older than this copy will go undetected"
            );
        }

        debug!(
            path = %source_path.display(),
            bytes = data.len(),
            outcome = ?comparison,
            "Copied file"
        );
        Ok(Some(data.len() as u64))
    }

    /// Backdate whatever a failed write left at `dest_path` so the next run sees it as stale.
    /// Falls back to removing it when the mtime cannot be set.
    async fn mark_for_recopy(&self, dest_path: &Path) {
        match self.dest.exists(dest_path).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(path = %dest_path.display(), error = %e, "Cannot inspect destination after failed write");
                return;
            }
        }

        if let Err(e) = self.dest.set_mod_time(dest_path, SystemTime::UNIX_EPOCH).await {
            warn!(path = %dest_path.display(), error = %e, "Cannot backdate partial copy, removing it");
            if let Err(e) = self.dest.remove(dest_path).await {
                error!(path = %dest_path.display(), error = %e, "Failed to remove partial copy");
            }
        }
    }

    /// Remove destination entries that have no source counterpart.
    async fn prune(&self, dest_dir: &Path, source_entries: &[String]) -> Result<u64, SyncError> {
        let keep: HashSet<&str> = source_entries.iter().map(String::as_str).collect();
        let existing = self
            .dest
            .list(dest_dir)
            .await
            .map_err(SyncError::destination_side)?;

        let mut removed = 0;
        for name in existing.iter().filter(|n| !keep.contains(n.as_str())) {
            let path = dest_dir.join(name);
            match self.dest.remove(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed entry absent from source");
                    removed += 1;
                }
                Err(e) if e.is_connection_lost() => return Err(SyncError::ConnectionLost(e)),
                Err(e) => error!(path = %path.display(), error = %e, "Failed to remove entry"),
            }
        }
        Ok(removed)
    }
}
