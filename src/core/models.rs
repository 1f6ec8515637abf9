use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::path::PathBuf;

/// Counters produced by one directory synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub copied_files: u64,
    pub skipped_files: u64,
    /// Files that hit a per-file error and were neither copied nor skipped.
    pub failed_files: u64,
    /// Destination entries deleted under the mirror deletion policy.
    pub removed_files: u64,
    pub total_bytes: u64,
}

impl SyncStats {
    pub fn total_files(&self) -> u64 {
        self.copied_files + self.skipped_files
    }
}

impl AddAssign for SyncStats {
    fn add_assign(&mut self, other: Self) {
        self.copied_files += other.copied_files;
        self.skipped_files += other.skipped_files;
        self.failed_files += other.failed_files;
        self.removed_files += other.removed_files;
        self.total_bytes += other.total_bytes;
    }
}

impl Add for SyncStats {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

/// How a source file relates to its destination copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileComparison {
    /// Destination absent.
    New,
    /// Destination strictly older than source.
    Stale,
    Current,
}

impl FileComparison {
    pub fn needs_copy(self) -> bool {
        matches!(self, Self::New | Self::Stale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Running,
    Completed,
    Failed,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One persisted replication run, as stored in the lock table.
#[derive(Debug, Clone, Serialize)]
pub struct LockRecord {
    pub id: String,
    pub backup_name: String,
    pub selected_host: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: LockStatus,
    pub process_id: u32,
    pub host_identity: String,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Per path-pair breakdown of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreeReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub stats: SyncStats,
}

/// Structured result of a completed replication run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub backup_name: String,
    pub selected_host: String,
    pub copied_files: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub removed_files: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub duration_secs: u64,
    pub subtrees: Vec<SubtreeReport>,
}

impl RunReport {
    pub fn new(
        backup_name: &str,
        selected_host: &str,
        subtrees: Vec<SubtreeReport>,
        duration_secs: u64,
    ) -> Self {
        let totals = subtrees
            .iter()
            .fold(SyncStats::default(), |acc, s| acc + s.stats);

        Self {
            backup_name: backup_name.to_string(),
            selected_host: selected_host.to_string(),
            copied_files: totals.copied_files,
            skipped_files: totals.skipped_files,
            failed_files: totals.failed_files,
            removed_files: totals.removed_files,
            total_files: totals.total_files(),
            total_bytes: totals.total_bytes,
            duration_secs,
            subtrees,
        }
    }
}
