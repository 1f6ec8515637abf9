use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_rusqlite::rusqlite::{
    self, ErrorCode, OptionalExtension, Row, TransactionBehavior, types::Type,
};
use tokio_rusqlite::{Connection, params};
use uuid::Uuid;

use crate::core::models::{LockRecord, LockStatus};

/// Everything `acquire` needs, captured up front so the whole decision runs in one transaction.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub backup_name: String,
    pub candidates: Vec<String>,
    pub now_ms: i64,
    pub stale_after_ms: i64,
    pub process_id: u32,
    pub host_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired {
        record_id: String,
        selected_host: String,
        /// Id of an abandoned running record that was flipped to failed.
        reclaimed: Option<String>,
    },
    /// Another run holds the lock. `holder` is unknown when a concurrent insert won the race.
    Busy { holder: Option<String> },
}

const STALE_ERROR: &str = "run abandoned: exceeded staleness threshold while running";

pub async fn acquire(conn: &Connection, req: AcquireRequest) -> Result<AcquireOutcome> {
    if req.candidates.is_empty() {
        bail!("no candidate hosts for backup '{}'", req.backup_name);
    }

    let outcome = conn
        .call(move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // The unique index allows at most one running row per backup
            let running: Option<(String, i64)> = tx
                .query_row(
                    "SELECT id, started_at FROM lock_records
                     WHERE backup_name = ?1 AND status = 'running'",
                    params![&req.backup_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let mut reclaimed = None;
            if let Some((id, started_at)) = running {
                if req.now_ms - started_at <= req.stale_after_ms {
                    return Ok(AcquireOutcome::Busy { holder: Some(id) });
                }
                tx.execute(
                    "UPDATE lock_records SET status = 'failed', completed_at = ?2, error = ?3
                     WHERE id = ?1 AND status = 'running'",
                    params![&id, req.now_ms, STALE_ERROR],
                )?;
                reclaimed = Some(id);
            }

            let load = running_per_host(&tx)?;
            let selected_host = req
                .candidates
                .iter()
                .min_by_key(|h| load.get(h.as_str()).copied().unwrap_or(0))
                .cloned()
                .unwrap_or_default();

            let record_id = Uuid::now_v7().to_string();
            let inserted = tx.execute(
                "INSERT INTO lock_records
                 (id, backup_name, selected_host, started_at, status, process_id, host_identity)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
                params![
                    &record_id,
                    &req.backup_name,
                    &selected_host,
                    req.now_ms,
                    req.process_id,
                    &req.host_identity
                ],
            );

            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Ok(AcquireOutcome::Busy { holder: None });
                }
                Err(e) => return Err(e),
            }

            tx.commit()?;
            Ok::<_, rusqlite::Error>(AcquireOutcome::Acquired {
                record_id,
                selected_host,
                reclaimed,
            })
        })
        .await?;

    Ok(outcome)
}

fn running_per_host(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<HashMap<String, i64>> {
    let mut stmt = tx.prepare(
        "SELECT selected_host, COUNT(*) FROM lock_records
         WHERE status = 'running' GROUP BY selected_host",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

/// Move a running record to a terminal status. Returns false if it was no longer running.
pub async fn finish(
    conn: &Connection,
    record_id: String,
    status: LockStatus,
    now_ms: i64,
    error: Option<String>,
    result: Option<String>,
) -> Result<bool> {
    if !status.is_terminal() {
        bail!("cannot finish a lock record as running");
    }

    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE lock_records
                 SET status = ?2, completed_at = ?3, error = ?4, result = ?5
                 WHERE id = ?1 AND status = 'running'",
                params![record_id, status.as_str(), now_ms, error, result],
            )
        })
        .await?;

    Ok(changed == 1)
}

pub async fn reassign_host(conn: &Connection, record_id: String, host: String) -> Result<bool> {
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE lock_records SET selected_host = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![record_id, host],
            )
        })
        .await?;

    Ok(changed == 1)
}

/// Fail every running record started before `cutoff_ms`. Returns the reclaimed backup names.
pub async fn reap_stale(conn: &Connection, cutoff_ms: i64, now_ms: i64) -> Result<Vec<String>> {
    let reaped = conn
        .call(move |c| {
            let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let stale: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, backup_name FROM lock_records
                     WHERE status = 'running' AND started_at < ?1",
                )?;
                let rows = stmt.query_map(params![cutoff_ms], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            for (id, _) in &stale {
                tx.execute(
                    "UPDATE lock_records SET status = 'failed', completed_at = ?2, error = ?3
                     WHERE id = ?1 AND status = 'running'",
                    params![id, now_ms, STALE_ERROR],
                )?;
            }

            tx.commit()?;
            Ok::<_, rusqlite::Error>(stale.into_iter().map(|(_, name)| name).collect())
        })
        .await?;

    Ok(reaped)
}

/// Most recent records first, optionally for one backup.
pub async fn list(conn: &Connection, backup_name: Option<String>, limit: u32) -> Result<Vec<LockRecord>> {
    let records = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, backup_name, selected_host, started_at, completed_at, status,
                        process_id, host_identity, error, result
                 FROM lock_records
                 WHERE ?1 IS NULL OR backup_name = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![backup_name, limit], record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    Ok(records)
}

pub async fn get(conn: &Connection, record_id: String) -> Result<Option<LockRecord>> {
    let record = conn
        .call(move |c| {
            c.query_row(
                "SELECT id, backup_name, selected_host, started_at, completed_at, status,
                        process_id, host_identity, error, result
                 FROM lock_records WHERE id = ?1",
                params![record_id],
                record_from_row,
            )
            .optional()
        })
        .await?;

    Ok(record)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LockRecord> {
    let status: String = row.get(5)?;
    let status = LockStatus::parse(&status)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "status".to_string(), Type::Text))?;
    let result: Option<String> = row.get(9)?;
    let process_id: i64 = row.get(6)?;

    Ok(LockRecord {
        id: row.get(0)?,
        backup_name: row.get(1)?,
        selected_host: row.get(2)?,
        started_at: from_millis(row.get(3)?),
        completed_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        status,
        process_id: process_id as u32,
        host_identity: row.get(7)?,
        error: row.get(8)?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;
    const NOW_MS: i64 = 1_700_000_000_000;

    async fn store() -> Connection {
        crate::db::init_in_memory().await.unwrap()
    }

    async fn insert(conn: &Connection, id: &str, status: LockStatus, started_at: i64) {
        let id = id.to_string();
        conn.call(move |c| {
            c.execute(
                "INSERT INTO lock_records
                 (id, backup_name, selected_host, started_at, status, process_id, host_identity)
                 VALUES (?1, 'LV1', 'nas1', ?2, ?3, 1, 'other-daemon')",
                params![id, started_at, status.as_str()],
            )
        })
        .await
        .unwrap();
    }

    fn request(now_ms: i64) -> AcquireRequest {
        AcquireRequest {
            backup_name: "LV1".into(),
            candidates: vec!["nas1".into(), "nas2".into()],
            now_ms,
            stale_after_ms: 24 * HOUR_MS,
            process_id: 42,
            host_identity: "this-daemon".into(),
        }
    }

    #[tokio::test]
    async fn stale_run_behind_newer_finished_record_is_reclaimed() {
        let conn = store().await;
        // Skewed clocks: the abandoned run sorts before a finished one
        insert(&conn, "abandoned", LockStatus::Running, NOW_MS - 30 * HOUR_MS).await;
        insert(&conn, "finished", LockStatus::Completed, NOW_MS - HOUR_MS).await;

        match acquire(&conn, request(NOW_MS)).await.unwrap() {
            AcquireOutcome::Acquired { reclaimed, .. } => {
                assert_eq!(reclaimed.as_deref(), Some("abandoned"));
            }
            other => panic!("expected Acquired, got {:?}", other),
        }

        let old = get(&conn, "abandoned".into()).await.unwrap().unwrap();
        assert_eq!(old.status, LockStatus::Failed);
    }

    #[tokio::test]
    async fn live_run_behind_newer_finished_record_reports_its_holder() {
        let conn = store().await;
        insert(&conn, "live", LockStatus::Running, NOW_MS - HOUR_MS).await;
        insert(&conn, "finished", LockStatus::Failed, NOW_MS).await;

        assert_eq!(
            acquire(&conn, request(NOW_MS)).await.unwrap(),
            AcquireOutcome::Busy {
                holder: Some("live".into())
            }
        );
    }

    #[tokio::test]
    async fn empty_candidate_list_is_rejected() {
        let conn = store().await;
        let mut req = request(NOW_MS);
        req.candidates.clear();

        assert!(acquire(&conn, req).await.is_err());
    }
}
