pub mod failover;
pub mod lock;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod share;
pub mod sync;

pub use failover::{Connected, FailoverConnector};
pub use lock::{LockCoordinator, LockLease};
pub use models::{FileComparison, LockRecord, LockStatus, RunReport, SubtreeReport, SyncStats};
pub use notifications::{ReportEvent, ReportSink};
pub use orchestrator::{Orchestrator, RunError, RunOutcome};
pub use share::{ShareAddress, ShareConnector, ShareCredentials, ShareError, ShareSession};
pub use sync::{DirectorySync, SyncError};
