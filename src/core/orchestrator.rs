use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{BackupTarget, ConfigError, DeletionPolicy};
use crate::context::AppContext;
use crate::core::failover::{Connected, FailoverConnector, prefer_host};
use crate::core::lock::{LockCoordinator, LockLease};
use crate::core::models::{RunReport, SubtreeReport};
use crate::core::notifications::{ReportEvent, ReportSink, create_sink};
use crate::core::share::{ShareConnector, ShareError};
use crate::core::sync::{DirectorySync, SyncError};

const MIN_RUN_INTERVAL: Duration = Duration::from_secs(60);
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("lock store failure: {0:#}")]
    Lock(anyhow::Error),

    #[error("source unreachable: {0}")]
    Source(#[source] ShareError),

    #[error("destination unreachable: {0}")]
    Destination(#[source] ShareError),

    #[error("sync of {} failed: {source}", path.display())]
    Sync {
        path: PathBuf,
        #[source]
        source: SyncError,
    },

    #[error("replication task aborted: {0}")]
    Aborted(String),
}

/// Per-run lifecycle, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Skipped,
    Locked,
    Connecting,
    Syncing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Another run held the lock; nothing was touched.
    Skipped { backup_name: String },
}

impl RunOutcome {
    fn to_event(&self) -> ReportEvent {
        match self {
            Self::Completed(report) => ReportEvent::Completed(report.clone()),
            Self::Skipped { backup_name } => ReportEvent::Skipped {
                backup_name: backup_name.clone(),
            },
        }
    }
}

pub struct Orchestrator {
    locks: LockCoordinator,
    failover: FailoverConnector,
    sink: Option<Arc<dyn ReportSink>>,
    deletion: DeletionPolicy,
}

impl Orchestrator {
    pub fn new(ctx: &AppContext, connector: Arc<dyn ShareConnector>) -> Self {
        Self {
            locks: LockCoordinator::new(ctx.db.clone(), ctx.config.stale_after()),
            failover: FailoverConnector::new(connector, ctx.config.connect_timeout()),
            sink: create_sink(&ctx.config.report),
            deletion: ctx.config.deletion_policy,
        }
    }

    pub fn from_parts(
        locks: LockCoordinator,
        failover: FailoverConnector,
        sink: Option<Arc<dyn ReportSink>>,
        deletion: DeletionPolicy,
    ) -> Self {
        Self {
            locks,
            failover,
            sink,
            deletion,
        }
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Run one replication of `target` and report the outcome.
    pub async fn run(&self, target: &BackupTarget) -> Result<RunOutcome, RunError> {
        let span = info_span!("replication_run", backup = %target.name);

        async {
            let result = self.execute(target).await;

            let event = match &result {
                Ok(outcome) => outcome.to_event(),
                Err(e) => ReportEvent::Failed {
                    backup_name: target.name.clone(),
                    error: e.to_string(),
                },
            };
            if let Some(sink) = &self.sink {
                if let Err(e) = sink.report(&event).await {
                    warn!(error = %e, "Failed to deliver run report");
                }
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, target: &BackupTarget) -> Result<RunOutcome, RunError> {
        debug!(phase = ?RunPhase::Pending, "Validating target");
        target.validate()?;

        let lease = self
            .locks
            .acquire(&target.name, &target.destination.hosts)
            .await
            .map_err(RunError::Lock)?;

        let Some(lease) = lease else {
            debug!(phase = ?RunPhase::Skipped, "Lock held elsewhere");
            return Ok(RunOutcome::Skipped {
                backup_name: target.name.clone(),
            });
        };
        debug!(phase = ?RunPhase::Locked, host = %lease.selected_host, "Lock held");

        // Run on its own task so a panic still reaches the cleanup below
        let task = tokio::spawn(
            replicate(
                self.failover.clone(),
                self.locks.clone(),
                lease.clone(),
                target.clone(),
                self.deletion,
            )
            .in_current_span(),
        );
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(RunError::Aborted(e.to_string())),
        };

        match result {
            Ok(report) => {
                self.release_or_fail(&lease, &report)
                    .await
                    .map_err(RunError::Lock)?;
                debug!(phase = ?RunPhase::Completed, "Run finished");
                Ok(RunOutcome::Completed(report))
            }
            Err(e) => {
                if let Err(lock_err) = self.locks.mark_failed(&lease, &e.to_string()).await {
                    error!(error = %lock_err, "Failed to record run failure");
                }
                debug!(phase = ?RunPhase::Failed, error = %e, "Run failed");
                Err(e)
            }
        }
    }

    /// Release the lease, retrying once. If that fails too the record is marked failed, so it
    /// never stays `running` until the stale reaper finds it.
    async fn release_or_fail(&self, lease: &LockLease, report: &RunReport) -> Result<()> {
        let Err(e) = self.locks.release(lease, report).await else {
            return Ok(());
        };
        warn!(error = %format!("{:#}", e), "Lock release failed, retrying");
        tokio::time::sleep(RELEASE_RETRY_DELAY).await;

        let Err(e) = self.locks.release(lease, report).await else {
            return Ok(());
        };

        let reason = format!("run completed but the lock could not be released: {:#}", e);
        if let Err(fail_err) = self.locks.mark_failed(lease, &reason).await {
            error!(error = %format!("{:#}", fail_err), "Failed to record run failure");
        }
        Err(e)
    }

    /// Drive every target on its own interval and reap stale locks until Ctrl-C.
    pub async fn start(self: Arc<Self>, targets: Vec<BackupTarget>, reap_every: Duration) -> Result<()> {
        info!(targets = targets.len(), "Replication daemon starting");

        let mut tasks: JoinSet<()> = JoinSet::new();

        for target in targets {
            let this = Arc::clone(&self);
            tasks.spawn(async move {
                let period = Duration::from_secs(target.interval_secs).max(MIN_RUN_INTERVAL);
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    // Outcome already went to the report sink
                    let _ = this.run(&target).await;
                }
            });
        }

        let this = Arc::clone(&self);
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(reap_every.max(MIN_RUN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = this.locks.reap_stale().await {
                    error!(error = %e, "Stale lock sweep failed");
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("Shutting down, in-flight runs will be reclaimed as stale");
        tasks.shutdown().await;
        Ok(())
    }
}

async fn replicate(
    failover: FailoverConnector,
    locks: LockCoordinator,
    mut lease: LockLease,
    target: BackupTarget,
    deletion: DeletionPolicy,
) -> Result<RunReport, RunError> {
    let started = Instant::now();

    debug!(phase = ?RunPhase::Connecting, "Connecting to shares");
    let source = failover
        .open(&target.source.address())
        .await
        .map_err(RunError::Source)?;

    let candidates = prefer_host(&target.destination.hosts, &lease.selected_host);
    let Connected {
        session: dest,
        selected_host,
    } = failover
        .connect(
            &candidates,
            &target.destination.share,
            &target.destination.credentials(),
        )
        .await
        .map_err(RunError::Destination)?;

    if let Err(e) = locks.reassign_host(&mut lease, &selected_host).await {
        warn!(error = %e, "Failed to record failover host");
    }

    debug!(phase = ?RunPhase::Syncing, host = %selected_host, "Synchronizing");
    let sync = DirectorySync::new(source.as_ref(), dest.as_ref(), deletion);

    let mut subtrees = Vec::with_capacity(target.paths.len());
    for pair in &target.paths {
        let stats = sync
            .sync(&pair.source, &pair.destination)
            .await
            .map_err(|source| RunError::Sync {
                path: pair.source.clone(),
                source,
            })?;

        subtrees.push(SubtreeReport {
            source: pair.source.clone(),
            destination: pair.destination.clone(),
            stats,
        });
    }

    Ok(RunReport::new(
        &target.name,
        &selected_host,
        subtrees,
        started.elapsed().as_secs(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedNetwork;
    use crate::config::{DestinationEndpoint, PathPair, SourceEndpoint};
    use crate::core::models::LockStatus;
    use crate::db;
    use std::time::SystemTime;

    fn target() -> BackupTarget {
        BackupTarget {
            name: "LV1".into(),
            interval_secs: 3600,
            source: SourceEndpoint {
                host: "fs01".into(),
                share: "data".into(),
                domain: String::new(),
                username: "svc".into(),
                password: "pw".into(),
            },
            destination: DestinationEndpoint {
                hosts: vec!["nas1".into()],
                share: "backup".into(),
                domain: String::new(),
                username: "svc".into(),
                password: "pw".into(),
            },
            paths: vec![PathPair {
                source: "P".into(),
                destination: "LV1/P".into(),
            }],
        }
    }

    #[tokio::test]
    async fn unreleasable_lock_is_marked_failed() {
        let network = SimulatedNetwork::new();
        network.add_share("nas1", "backup");
        network.put_file("fs01", "data", "P/a.txt", b"a", SystemTime::UNIX_EPOCH);

        let conn = db::init_in_memory().await.unwrap();
        conn.call(|c| {
            c.execute_batch(
                "CREATE TRIGGER refuse_completion BEFORE UPDATE OF status ON lock_records
                 WHEN NEW.status = 'completed'
                 BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
            )
        })
        .await
        .unwrap();

        let locks = LockCoordinator::new(conn, chrono::Duration::hours(24));
        let failover = FailoverConnector::new(Arc::new(network), Duration::from_secs(1));
        let orchestrator = Orchestrator::from_parts(locks.clone(), failover, None, DeletionPolicy::Accumulate);

        let err = orchestrator.run(&target()).await.unwrap_err();
        assert!(matches!(err, RunError::Lock(_)));

        let history = locks.history(Some("LV1"), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, LockStatus::Failed);
        assert!(history[0].error.as_ref().unwrap().contains("could not be released"));

        // Nothing is left running, so the next run is not blocked
        assert!(locks.acquire("LV1", &["nas1".to_string()]).await.unwrap().is_some());
    }
}
