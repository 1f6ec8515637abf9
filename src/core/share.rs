//! Remote file-share session abstraction.
//!
//! A [`ShareConnector`] opens one [`ShareSession`] per `(host, share)` pair. Sessions execute
//! operations one at a time and never retry on their own; retry and failover live in
//! [`crate::core::failover`].

use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Login material for a share. The domain may be empty for workgroup shares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareCredentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

/// Fully resolved address of one share on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareAddress {
    pub host: String,
    pub share: String,
    pub credentials: ShareCredentials,
}

impl ShareAddress {
    pub fn new(host: impl Into<String>, share: impl Into<String>, credentials: ShareCredentials) -> Self {
        Self {
            host: host.into(),
            share: share.into(),
            credentials,
        }
    }
}

impl std::fmt::Display for ShareAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "//{}/{}", self.host, self.share)
    }
}

/// Size and modification time of a share entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub modified: SystemTime,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ShareError {
    /// A single share operation failed.
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("no candidate hosts configured")]
    NoCandidates,

    /// Every candidate host was tried and none could be opened.
    #[error("no host reachable (tried {}): {last}", attempted.join(", "))]
    Exhausted {
        attempted: Vec<String>,
        #[source]
        last: Box<ShareError>,
    },
}

impl ShareError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True when the error means the session itself is gone, not just one entry.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_connection_lost_error(source),
            Self::Timeout { .. } => true,
            Self::NoCandidates => false,
            Self::Exhausted { .. } => true,
        }
    }
}

/// Check if an I/O error indicates the share connection dropped.
pub fn is_connection_lost_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NetworkDown => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                    | libc::ENOTCONN
                    | libc::EHOSTDOWN
                    | libc::EHOSTUNREACH
                    | libc::ECONNRESET
                    | libc::ESTALE
                    | libc::ENETDOWN
                    | libc::ENETUNREACH
                )
            } else {
                false
            }
        }
    }
}

/// True if `path` stays below the share root: no root, prefix or `..` components.
/// The empty path is the share root itself.
pub fn is_share_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// One open connection to a share. Paths are relative to the share root.
#[async_trait]
pub trait ShareSession: Send + Sync {
    /// Host this session is connected to.
    fn host(&self) -> &str;

    /// Names of the entries directly under `path`.
    async fn list(&self, path: &Path) -> Result<Vec<String>, ShareError>;

    /// Probe by listing: a listing that succeeds means `path` is a directory.
    async fn is_directory(&self, path: &Path) -> bool {
        self.list(path).await.is_ok()
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, ShareError>;

    async fn mod_time(&self, path: &Path) -> Result<SystemTime, ShareError> {
        Ok(self.stat(path).await?.modified)
    }

    async fn exists(&self, path: &Path) -> Result<bool, ShareError>;

    /// Create `path` and any missing parents. Succeeds if it already exists.
    async fn mkdir(&self, path: &Path) -> Result<(), ShareError>;

    async fn read_all(&self, path: &Path) -> Result<Vec<u8>, ShareError>;

    /// Create or truncate `path` with `data`.
    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<(), ShareError>;

    async fn set_mod_time(&self, path: &Path, modified: SystemTime) -> Result<(), ShareError>;

    /// Remove a file, or a directory with everything below it.
    async fn remove(&self, path: &Path) -> Result<(), ShareError>;
}

/// Opens validated sessions against a share backend.
#[async_trait]
pub trait ShareConnector: Send + Sync {
    /// Open a session and list the share root once before returning it.
    async fn open(&self, address: &ShareAddress) -> Result<Box<dyn ShareSession>, ShareError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_relative_paths() {
        assert!(is_share_relative(Path::new("")));
        assert!(is_share_relative(Path::new("LV1/Projects")));
        assert!(is_share_relative(Path::new("./Projects")));
        assert!(!is_share_relative(Path::new("/srv/escaped")));
        assert!(!is_share_relative(Path::new("Projects/../../etc")));
    }

    #[test]
    fn connection_lost_on_estale() {
        let error = io::Error::from_raw_os_error(libc::ESTALE);
        assert!(is_connection_lost_error(&error));
    }

    #[test]
    fn connection_lost_on_not_connected_kind() {
        let error = io::Error::new(ErrorKind::NotConnected, "gone");
        assert!(is_connection_lost_error(&error));
    }

    #[test]
    fn not_found_is_a_per_file_error() {
        let error = io::Error::new(ErrorKind::NotFound, "vanished");
        assert!(!is_connection_lost_error(&error));
        assert!(!ShareError::io("read", "a.txt", error).is_connection_lost());
    }

    #[test]
    fn permission_denied_is_a_per_file_error() {
        let error = io::Error::new(ErrorKind::PermissionDenied, "denied");
        assert!(!is_connection_lost_error(&error));
    }

    #[test]
    fn exhausted_error_names_every_attempt() {
        let err = ShareError::Exhausted {
            attempted: vec!["h1".into(), "h2".into()],
            last: Box::new(ShareError::Timeout {
                host: "h2".into(),
                timeout: Duration::from_secs(10),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("h1, h2"));
        assert!(msg.contains("timed out"));
    }
}
