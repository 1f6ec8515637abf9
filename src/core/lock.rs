//! Cross-process mutual exclusion for replication runs.
//!
//! All coordination goes through the shared SQLite store, never through process memory, so
//! the guarantees hold across daemon restarts and between daemons sharing one store file.
//! The acquire decision (inspect latest record, reclaim if stale, pick host, insert) runs in a
//! single immediate transaction, and a partial unique index on running records rejects any
//! second running row for the same backup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::core::models::{LockRecord, LockStatus, RunReport};
use crate::db::locks::{self, AcquireOutcome, AcquireRequest};

/// Proof of a held lock, needed to finalize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockLease {
    pub record_id: String,
    pub backup_name: String,
    pub selected_host: String,
}

#[derive(Clone)]
pub struct LockCoordinator {
    db: Connection,
    stale_after: chrono::Duration,
    host_identity: String,
}

impl LockCoordinator {
    pub fn new(db: Connection, stale_after: chrono::Duration) -> Self {
        let host_identity = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            db,
            stale_after,
            host_identity,
        }
    }

    /// Take the lock for `backup_name` and pick the least-loaded host, or `None` if a
    /// non-stale run already holds it.
    pub async fn acquire(&self, backup_name: &str, candidates: &[String]) -> Result<Option<LockLease>> {
        self.acquire_at(backup_name, candidates, Utc::now()).await
    }

    pub async fn acquire_at(
        &self,
        backup_name: &str,
        candidates: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<LockLease>> {
        let request = AcquireRequest {
            backup_name: backup_name.to_string(),
            candidates: candidates.to_vec(),
            now_ms: now.timestamp_millis(),
            stale_after_ms: self.stale_after.num_milliseconds(),
            process_id: std::process::id(),
            host_identity: self.host_identity.clone(),
        };

        let outcome = locks::acquire(&self.db, request)
            .await
            .with_context(|| format!("Failed to acquire lock for {}", backup_name))?;

        match outcome {
            AcquireOutcome::Acquired {
                record_id,
                selected_host,
                reclaimed,
            } => {
                if let Some(abandoned) = reclaimed {
                    warn!(backup = %backup_name, record = %abandoned, "Reclaimed abandoned run");
                }
                info!(backup = %backup_name, host = %selected_host, record = %record_id, "Lock acquired");
                Ok(Some(LockLease {
                    record_id,
                    backup_name: backup_name.to_string(),
                    selected_host,
                }))
            }
            AcquireOutcome::Busy { holder } => {
                info!(backup = %backup_name, holder = ?holder, "Backup already running, skipping");
                Ok(None)
            }
        }
    }

    /// Record the host the run actually connected to.
    pub async fn reassign_host(&self, lease: &mut LockLease, host: &str) -> Result<()> {
        if lease.selected_host == host {
            return Ok(());
        }
        if !locks::reassign_host(&self.db, lease.record_id.clone(), host.to_string()).await? {
            warn!(backup = %lease.backup_name, "Lock no longer running, host not reassigned");
        }
        debug!(backup = %lease.backup_name, from = %lease.selected_host, to = %host, "Lock host reassigned");
        lease.selected_host = host.to_string();
        Ok(())
    }

    /// Finalize the lease as completed with the run result attached.
    pub async fn release(&self, lease: &LockLease, report: &RunReport) -> Result<()> {
        let result = serde_json::to_string(report)?;
        self.finish(lease, LockStatus::Completed, None, Some(result)).await
    }

    pub async fn mark_failed(&self, lease: &LockLease, error: &str) -> Result<()> {
        self.finish(lease, LockStatus::Failed, Some(error.to_string()), None)
            .await
    }

    async fn finish(
        &self,
        lease: &LockLease,
        status: LockStatus,
        error: Option<String>,
        result: Option<String>,
    ) -> Result<()> {
        let finished = locks::finish(
            &self.db,
            lease.record_id.clone(),
            status,
            Utc::now().timestamp_millis(),
            error,
            result,
        )
        .await
        .with_context(|| format!("Failed to finalize lock for {}", lease.backup_name))?;

        if finished {
            info!(backup = %lease.backup_name, status = status.as_str(), "Lock released");
        } else {
            // Reaped while we were still working; the record already says failed
            warn!(backup = %lease.backup_name, record = %lease.record_id, "Lock was reclaimed before release");
        }
        Ok(())
    }

    /// Fail every running record older than the staleness threshold.
    pub async fn reap_stale(&self) -> Result<Vec<String>> {
        self.reap_stale_at(Utc::now()).await
    }

    pub async fn reap_stale_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - self.stale_after;
        let reaped = locks::reap_stale(&self.db, cutoff.timestamp_millis(), now.timestamp_millis())
            .await
            .context("Failed to reap stale locks")?;

        for name in &reaped {
            warn!(backup = %name, "Marked abandoned run as failed");
        }
        Ok(reaped)
    }

    pub async fn history(&self, backup_name: Option<&str>, limit: u32) -> Result<Vec<LockRecord>> {
        locks::list(&self.db, backup_name.map(str::to_string), limit).await
    }

    pub async fn record(&self, lease: &LockLease) -> Result<Option<LockRecord>> {
        locks::get(&self.db, lease.record_id.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    async fn coordinator() -> LockCoordinator {
        let conn = db::init_in_memory().await.unwrap();
        LockCoordinator::new(conn, chrono::Duration::hours(24))
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1", "nas2"]);

        let lease = coord.acquire("LV1", &candidates).await.unwrap().unwrap();
        assert!(coord.acquire("LV1", &candidates).await.unwrap().is_none());

        coord.mark_failed(&lease, "boom").await.unwrap();
        assert!(coord.acquire("LV1", &candidates).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_running_record_is_reclaimed() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1"]);

        let old = coord
            .acquire_at("LV1", &candidates, Utc::now() - chrono::Duration::hours(30))
            .await
            .unwrap()
            .unwrap();

        let fresh = coord.acquire("LV1", &candidates).await.unwrap();
        assert!(fresh.is_some());

        let old_record = coord.record(&old).await.unwrap().unwrap();
        assert_eq!(old_record.status, LockStatus::Failed);
        assert!(old_record.error.unwrap().contains("abandoned"));
        assert!(old_record.completed_at.is_some());
    }

    #[tokio::test]
    async fn recent_running_record_is_not_reclaimed() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1"]);

        coord
            .acquire_at("LV1", &candidates, Utc::now() - chrono::Duration::hours(23))
            .await
            .unwrap()
            .unwrap();
        assert!(coord.acquire("LV1", &candidates).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn picks_least_loaded_host_across_backups() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1", "nas2"]);

        let first = coord.acquire("LV1", &candidates).await.unwrap().unwrap();
        let second = coord.acquire("LV2", &candidates).await.unwrap().unwrap();

        assert_eq!(first.selected_host, "nas1");
        assert_eq!(second.selected_host, "nas2");
    }

    #[tokio::test]
    async fn release_attaches_result() {
        let coord = coordinator().await;
        let lease = coord.acquire("LV1", &hosts(&["nas1"])).await.unwrap().unwrap();
        let report = RunReport::new("LV1", "nas1", Vec::new(), 3);

        coord.release(&lease, &report).await.unwrap();

        let record = coord.record(&lease).await.unwrap().unwrap();
        assert_eq!(record.status, LockStatus::Completed);
        assert_eq!(record.result.unwrap()["backup_name"], "LV1");
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn reassign_updates_host_for_load_counting() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1", "nas2"]);

        let mut lease = coord.acquire("LV1", &candidates).await.unwrap().unwrap();
        coord.reassign_host(&mut lease, "nas2").await.unwrap();
        assert_eq!(lease.selected_host, "nas2");

        let next = coord.acquire("LV2", &candidates).await.unwrap().unwrap();
        assert_eq!(next.selected_host, "nas1");
    }

    #[tokio::test]
    async fn reaper_fails_only_stale_records() {
        let coord = coordinator().await;
        let candidates = hosts(&["nas1"]);

        coord
            .acquire_at("LV1", &candidates, Utc::now() - chrono::Duration::hours(48))
            .await
            .unwrap()
            .unwrap();
        coord.acquire("LV2", &candidates).await.unwrap().unwrap();

        let reaped = coord.reap_stale().await.unwrap();
        assert_eq!(reaped, vec!["LV1"]);

        let history = coord.history(None, 10).await.unwrap();
        let lv2 = history.iter().find(|r| r.backup_name == "LV2").unwrap();
        assert_eq!(lv2.status, LockStatus::Running);
    }
}
