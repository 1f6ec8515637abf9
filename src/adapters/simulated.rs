use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::core::share::{FileStat, ShareAddress, ShareConnector, ShareError, ShareSession};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, modified: SystemTime },
}

type Tree = BTreeMap<PathBuf, Node>;

#[derive(Default)]
struct HostState {
    unreachable: bool,
    latency: Duration,
    open_attempts: u32,
    stat_calls: u32,
    shares: HashMap<String, Tree>,
    faults: Faults,
}

/// Per-file faults, keyed by `(share, path)`.
#[derive(Default)]
struct Faults {
    reads: HashSet<(String, PathBuf)>,
    /// Writes that store only the first half of the data, then fail.
    torn_writes: HashSet<(String, PathBuf)>,
}

/// In-memory network of hosts and shares.
///
/// Cloning yields another handle onto the same network, so a test can keep one handle to
/// inject faults while the orchestrator uses another as its [`ShareConnector`].
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    hosts: Arc<Mutex<HashMap<String, HostState>>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, HostState>> {
        // A panicking test thread must not wedge every other handle
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_share(&self, host: &str, share: &str) {
        self.state()
            .entry(host.to_string())
            .or_default()
            .shares
            .entry(share.to_string())
            .or_default();
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.state().entry(host.to_string()).or_default().unreachable = !reachable;
    }

    /// Delay applied to every `open` against `host`.
    pub fn set_latency(&self, host: &str, latency: Duration) {
        self.state().entry(host.to_string()).or_default().latency = latency;
    }

    /// Make every read of `path` on `host/share` fail with a permission error.
    pub fn fail_reads(&self, host: &str, share: &str, path: impl AsRef<Path>) {
        self.state()
            .entry(host.to_string())
            .or_default()
            .faults
            .reads
            .insert((share.to_string(), path.as_ref().to_path_buf()));
    }

    /// Make every write of `path` on `host/share` store half its data and fail as if the
    /// disk filled up.
    pub fn tear_writes(&self, host: &str, share: &str, path: impl AsRef<Path>) {
        self.state()
            .entry(host.to_string())
            .or_default()
            .faults
            .torn_writes
            .insert((share.to_string(), path.as_ref().to_path_buf()));
    }

    pub fn clear_faults(&self, host: &str) {
        if let Some(state) = self.state().get_mut(host) {
            state.faults = Faults::default();
        }
    }

    pub fn open_attempts(&self, host: &str) -> u32 {
        self.state().get(host).map(|h| h.open_attempts).unwrap_or(0)
    }

    /// Number of `stat` round trips served by `host`, mtime lookups included.
    pub fn stat_calls(&self, host: &str) -> u32 {
        self.state().get(host).map(|h| h.stat_calls).unwrap_or(0)
    }

    /// Create a file (and its parent directories) with the given content and mtime.
    pub fn put_file(
        &self,
        host: &str,
        share: &str,
        path: impl AsRef<Path>,
        data: &[u8],
        modified: SystemTime,
    ) {
        let path = path.as_ref();
        self.add_share(host, share);
        let mut hosts = self.state();
        let Some(tree) = hosts.get_mut(host).and_then(|h| h.shares.get_mut(share)) else {
            return;
        };
        if let Some(parent) = path.parent() {
            insert_dirs(tree, parent);
        }
        tree.insert(
            path.to_path_buf(),
            Node::File {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn put_dir(&self, host: &str, share: &str, path: impl AsRef<Path>) {
        self.add_share(host, share);
        let mut hosts = self.state();
        if let Some(tree) = hosts.get_mut(host).and_then(|h| h.shares.get_mut(share)) {
            insert_dirs(tree, path.as_ref());
        }
    }

    /// Content and mtime of a file, if present.
    pub fn file(
        &self,
        host: &str,
        share: &str,
        path: impl AsRef<Path>,
    ) -> Option<(Vec<u8>, SystemTime)> {
        let hosts = self.state();
        match hosts.get(host)?.shares.get(share)?.get(path.as_ref())? {
            Node::File { data, modified } => Some((data.clone(), *modified)),
            Node::Dir => None,
        }
    }

    pub fn contains(&self, host: &str, share: &str, path: impl AsRef<Path>) -> bool {
        let hosts = self.state();
        hosts
            .get(host)
            .and_then(|h| h.shares.get(share))
            .is_some_and(|tree| tree.contains_key(path.as_ref()))
    }

    /// Run `f` against the tree of a reachable share.
    fn with_tree<T>(
        &self,
        host: &str,
        share: &str,
        op: &'static str,
        path: &Path,
        f: impl FnOnce(&mut Tree, &Faults) -> io::Result<T>,
    ) -> Result<T, ShareError> {
        let mut hosts = self.state();
        let state = hosts
            .get_mut(host)
            .filter(|h| !h.unreachable)
            .ok_or_else(|| {
                ShareError::io(op, path, io::Error::new(ErrorKind::NotConnected, "host unreachable"))
            })?;
        let tree = state.shares.get_mut(share).ok_or_else(|| {
            ShareError::io(op, path, io::Error::new(ErrorKind::NotFound, "no such share"))
        })?;
        f(tree, &state.faults).map_err(|e| ShareError::io(op, path, e))
    }
}

fn insert_dirs(tree: &mut Tree, path: &Path) {
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        tree.entry(ancestor.to_path_buf()).or_insert(Node::Dir);
    }
}

fn is_dir(tree: &Tree, path: &Path) -> bool {
    path.as_os_str().is_empty() || matches!(tree.get(path), Some(Node::Dir))
}

fn not_found() -> io::Error {
    io::Error::new(ErrorKind::NotFound, "no such file or directory")
}

#[async_trait]
impl ShareConnector for SimulatedNetwork {
    async fn open(&self, address: &ShareAddress) -> Result<Box<dyn ShareSession>, ShareError> {
        let latency = {
            let mut hosts = self.state();
            let state = hosts.entry(address.host.clone()).or_default();
            state.open_attempts += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let session = SimulatedSession {
            network: self.clone(),
            host: address.host.clone(),
            share: address.share.clone(),
        };
        session.list(Path::new("")).await?;
        Ok(Box::new(session))
    }
}

struct SimulatedSession {
    network: SimulatedNetwork,
    host: String,
    share: String,
}

#[async_trait]
impl ShareSession for SimulatedSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list(&self, path: &Path) -> Result<Vec<String>, ShareError> {
        self.network
            .with_tree(&self.host, &self.share, "list", path, |tree, _| {
                if !is_dir(tree, path) {
                    return Err(match tree.get(path) {
                        Some(_) => io::Error::new(ErrorKind::NotADirectory, "not a directory"),
                        None => not_found(),
                    });
                }
                Ok(tree
                    .keys()
                    .filter(|p| p.parent() == Some(path))
                    .filter_map(|p| p.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect())
            })
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, ShareError> {
        if let Some(state) = self.network.state().get_mut(&self.host) {
            state.stat_calls += 1;
        }
        self.network
            .with_tree(&self.host, &self.share, "stat", path, |tree, _| match tree.get(path) {
                Some(Node::File { data, modified }) => Ok(FileStat {
                    modified: *modified,
                    size: data.len() as u64,
                }),
                Some(Node::Dir) => Ok(FileStat {
                    modified: SystemTime::UNIX_EPOCH,
                    size: 0,
                }),
                None => Err(not_found()),
            })
    }

    async fn exists(&self, path: &Path) -> Result<bool, ShareError> {
        self.network
            .with_tree(&self.host, &self.share, "exists", path, |tree, _| {
                Ok(is_dir(tree, path) || tree.contains_key(path))
            })
    }

    async fn mkdir(&self, path: &Path) -> Result<(), ShareError> {
        self.network
            .with_tree(&self.host, &self.share, "mkdir", path, |tree, _| {
                if path
                    .ancestors()
                    .any(|a| matches!(tree.get(a), Some(Node::File { .. })))
                {
                    return Err(io::Error::new(ErrorKind::AlreadyExists, "file in the way"));
                }
                insert_dirs(tree, path);
                Ok(())
            })
    }

    async fn read_all(&self, path: &Path) -> Result<Vec<u8>, ShareError> {
        let share = self.share.clone();
        self.network
            .with_tree(&self.host, &self.share, "read", path, |tree, faults| {
                if faults.reads.contains(&(share, path.to_path_buf())) {
                    return Err(io::Error::new(ErrorKind::PermissionDenied, "read denied"));
                }
                match tree.get(path) {
                    Some(Node::File { data, .. }) => Ok(data.clone()),
                    Some(Node::Dir) => Err(io::Error::new(ErrorKind::IsADirectory, "is a directory")),
                    None => Err(not_found()),
                }
            })
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> Result<(), ShareError> {
        let share = self.share.clone();
        self.network
            .with_tree(&self.host, &self.share, "write", path, |tree, faults| {
                let parent = path.parent().unwrap_or(Path::new(""));
                if !is_dir(tree, parent) {
                    return Err(not_found());
                }
                if matches!(tree.get(path), Some(Node::Dir)) {
                    return Err(io::Error::new(ErrorKind::IsADirectory, "is a directory"));
                }
                let torn = faults.torn_writes.contains(&(share, path.to_path_buf()));
                let stored = if torn { &data[..data.len() / 2] } else { data };
                tree.insert(
                    path.to_path_buf(),
                    Node::File {
                        data: stored.to_vec(),
                        modified: SystemTime::now(),
                    },
                );
                if torn {
                    return Err(io::Error::new(ErrorKind::StorageFull, "no space left on device"));
                }
                Ok(())
            })
    }

    async fn set_mod_time(&self, path: &Path, modified: SystemTime) -> Result<(), ShareError> {
        self.network
            .with_tree(&self.host, &self.share, "set_mod_time", path, |tree, _| {
                match tree.get_mut(path) {
                    Some(Node::File { modified: m, .. }) => {
                        *m = modified;
                        Ok(())
                    }
                    Some(Node::Dir) => Ok(()),
                    None => Err(not_found()),
                }
            })
    }

    async fn remove(&self, path: &Path) -> Result<(), ShareError> {
        self.network
            .with_tree(&self.host, &self.share, "remove", path, |tree, _| {
                if tree.remove(path).is_none() {
                    return Err(not_found());
                }
                tree.retain(|p, _| !p.starts_with(path));
                Ok(())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::share::ShareCredentials;

    fn address(host: &str) -> ShareAddress {
        ShareAddress::new(host, "data", ShareCredentials::default())
    }

    #[tokio::test]
    async fn open_validates_reachability() {
        let network = SimulatedNetwork::new();
        network.add_share("h1", "data");
        network.set_reachable("h1", false);

        let err = network.open(&address("h1")).await.err().unwrap();
        assert!(err.is_connection_lost());
        assert_eq!(network.open_attempts("h1"), 1);
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let network = SimulatedNetwork::new();
        network.put_file("h1", "data", "a.txt", b"a", SystemTime::now());
        network.put_file("h1", "data", "sub/b.txt", b"b", SystemTime::now());

        let session = network.open(&address("h1")).await.unwrap();
        let mut root = session.list(Path::new("")).await.unwrap();
        root.sort();
        assert_eq!(root, vec!["a.txt", "sub"]);
        assert_eq!(session.list(Path::new("sub")).await.unwrap(), vec!["b.txt"]);
        assert!(session.is_directory(Path::new("sub")).await);
        assert!(!session.is_directory(Path::new("a.txt")).await);
    }

    #[tokio::test]
    async fn write_requires_existing_parent() {
        let network = SimulatedNetwork::new();
        network.add_share("h1", "data");
        let session = network.open(&address("h1")).await.unwrap();

        assert!(session.write_all(Path::new("x/y.txt"), b"y").await.is_err());
        session.mkdir(Path::new("x")).await.unwrap();
        session.write_all(Path::new("x/y.txt"), b"y").await.unwrap();
        assert_eq!(network.file("h1", "data", "x/y.txt").unwrap().0, b"y");
    }

    #[tokio::test]
    async fn operations_fail_after_host_drops() {
        let network = SimulatedNetwork::new();
        network.put_file("h1", "data", "a.txt", b"a", SystemTime::now());
        let session = network.open(&address("h1")).await.unwrap();

        network.set_reachable("h1", false);
        let err = session.read_all(Path::new("a.txt")).await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
