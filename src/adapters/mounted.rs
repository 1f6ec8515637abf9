use crate::core::share::{
    FileStat, ShareAddress, ShareConnector, ShareError, ShareSession, is_share_relative,
};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

/// Shares mounted by the OS (cifs/smbfs) under `<mount_root>/<host>/<share>`.
///
/// Authentication happens at mount time, so the credentials in a [`ShareAddress`]
/// are not used here.
pub struct MountedShareConnector {
    mount_root: PathBuf,
}

impl MountedShareConnector {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }
}

#[async_trait]
impl ShareConnector for MountedShareConnector {
    async fn open(&self, address: &ShareAddress) -> Result<Box<dyn ShareSession>, ShareError> {
        let root = self.mount_root.join(&address.host).join(&address.share);
        let session = MountedSession {
            host: address.host.clone(),
            root,
        };

        // Validate the mount before handing it out
        session.list(Path::new("")).await?;
        debug!(share = %address, root = %session.root.display(), "Opened mounted share");

        Ok(Box::new(session))
    }
}

struct MountedSession {
    host: String,
    root: PathBuf,
}

/// Suffix of the sibling file a copy is written to before being renamed into place.
const PARTIAL_SUFFIX: &str = ".sharemirror-partial";

impl MountedSession {
    /// Map a share-relative path onto the mount, refusing anything that would leave it.
    fn resolve(&self, op: &'static str, path: &Path) -> Result<PathBuf, ShareError> {
        if !is_share_relative(path) {
            return Err(ShareError::io(
                op,
                path,
                io::Error::new(ErrorKind::InvalidInput, "path escapes the share root"),
            ));
        }
        Ok(self.root.join(path))
    }
}

fn partial_path(full: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(full.file_name().unwrap_or_default());
    name.push(PARTIAL_SUFFIX);
    full.with_file_name(name)
}

#[async_trait]
impl ShareSession for MountedSession {
    fn host(&self) -> &str {
        &self.host
    }

    /// Symlinks are not listed: following them can loop or leave the share.
    async fn list(&self, path: &Path) -> Result<Vec<String>, ShareError> {
        let full = self.resolve("list", path)?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| ShareError::io("list", path, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ShareError::io("list", path, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| ShareError::io("list", path, e))?;
            if file_type.is_symlink() {
                debug!(path = %entry.path().display(), "Skipping symlink");
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn is_directory(&self, path: &Path) -> bool {
        let Ok(full) = self.resolve("is_directory", path) else {
            return false;
        };
        fs::symlink_metadata(full)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, ShareError> {
        let metadata = fs::metadata(self.resolve("stat", path)?)
            .await
            .map_err(|e| ShareError::io("stat", path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| ShareError::io("stat", path, e))?;

        Ok(FileStat {
            modified,
            size: metadata.len(),
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool, ShareError> {
        match fs::symlink_metadata(self.resolve("exists", path)?).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ShareError::io("exists", path, e)),
        }
    }

    async fn mkdir(&self, path: &Path) -> Result<(), ShareError> {
        fs::create_dir_all(self.resolve("mkdir", path)?)
            .await
            .map_err(|e| ShareError::io("mkdir", path, e))
    }

    async fn read_all(&self, path: &Path) -> Result<Vec<u8>, ShareError> {
        fs::read(self.resolve("read", path)?)
            .await
            .map_err(|e| ShareError::io("read", path, e))
    }

    /// Writes a sibling partial file and renames it over `path`, so a failed write never
    /// leaves a truncated file under the real name.
    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<(), ShareError> {
        let full = self.resolve("write", path)?;
        let partial = partial_path(&full);

        let written = match fs::write(&partial, data).await {
            Ok(()) => fs::rename(&partial, &full).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&partial).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial file");
                }
            }
            return Err(ShareError::io("write", path, e));
        }
        Ok(())
    }

    async fn set_mod_time(&self, path: &Path, modified: SystemTime) -> Result<(), ShareError> {
        let full = self.resolve("set_mod_time", path)?;
        let mtime = filetime::FileTime::from_system_time(modified);

        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full, mtime))
            .await
            .map_err(|e| ShareError::io("set_mod_time", path, io::Error::other(e)))?
            .map_err(|e| ShareError::io("set_mod_time", path, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), ShareError> {
        let full = self.resolve("remove", path)?;
        let metadata = fs::symlink_metadata(&full)
            .await
            .map_err(|e| ShareError::io("remove", path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        };
        result.map_err(|e| ShareError::io("remove", path, e))
    }
}
