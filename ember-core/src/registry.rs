//! Persistent daemon registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.ember/
//!   registry/
//!     daemon-<id>.yaml      (one file per live daemon: mode 0600)
//! ```
//!
//! Each daemon only ever writes its own entry, so cross-process writers never
//! touch the same file. Within a process, add/remove go through one mutex.
//! Writes are atomic: serialize → `.yaml.tmp` sibling → `chmod 0600` →
//! `rename`.
//!
//! A daemon that crashes leaves its entry behind. Clients must treat entries
//! as unverified until [`probe`] succeeds; [`DaemonRegistry::prune_stale`]
//! removes the ones that fail.
//!
//! # API pattern
//!
//! Path helpers have two forms:
//! - `fn_at(home: &Path)`: explicit home; used in tests with `TempDir`
//! - `fn()`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::fs;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{io_err, RegistryError};
use crate::types::{ContextFingerprint, DaemonId, DaemonRegistryEntry};

const ENTRY_PREFIX: &str = "daemon-";
const ENTRY_SUFFIX: &str = ".yaml";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.ember/`
pub fn ember_root_at(home: &Path) -> PathBuf {
    home.join(".ember")
}

/// `<home>/.ember/registry/`: pure, no I/O.
pub fn default_registry_dir_at(home: &Path) -> PathBuf {
    ember_root_at(home).join("registry")
}

/// `default_registry_dir_at` convenience wrapper.
pub fn default_registry_dir() -> Result<PathBuf, RegistryError> {
    Ok(default_registry_dir_at(&home()?))
}

// ---------------------------------------------------------------------------
// 2. Registry
// ---------------------------------------------------------------------------

/// File-backed directory of advertised daemons.
#[derive(Debug)]
pub struct DaemonRegistry {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl DaemonRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/daemon-<id>.yaml`: pure, no I/O.
    pub fn entry_path(&self, daemon_id: &DaemonId) -> PathBuf {
        self.dir
            .join(format!("{ENTRY_PREFIX}{}{ENTRY_SUFFIX}", daemon_id.0.simple()))
    }

    /// Atomically write (or replace) the entry for `entry.daemon_id`.
    pub fn store(&self, entry: &DaemonRegistryEntry) -> Result<PathBuf, RegistryError> {
        let _guard = self.lock();
        ensure_dir(&self.dir)?;

        let path = self.entry_path(&entry.daemon_id);
        let tmp_path = tmp_path_for(&path);
        let yaml = serde_yaml::to_string(entry)?;
        fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
        set_file_permissions(&tmp_path)?;
        fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;

        tracing::debug!(path = %path.display(), address = %entry.address, "stored daemon registry entry");
        Ok(path)
    }

    /// Remove every entry advertising `address`. Returns how many were removed.
    pub fn remove(&self, address: &SocketAddr) -> Result<usize, RegistryError> {
        let _guard = self.lock();
        let mut removed = 0;
        for (path, entry) in self.scan()?.entries {
            if entry.address == *address {
                remove_file_if_present(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove the entry written by `daemon_id`. Returns `false` if absent.
    pub fn remove_daemon(&self, daemon_id: &DaemonId) -> Result<bool, RegistryError> {
        let _guard = self.lock();
        remove_file_if_present(&self.entry_path(daemon_id))
    }

    /// Load a single entry, `None` if the daemon has no entry.
    pub fn load(&self, daemon_id: &DaemonId) -> Result<Option<DaemonRegistryEntry>, RegistryError> {
        let path = self.entry_path(daemon_id);
        match fs::read_to_string(&path) {
            Ok(contents) => parse_entry(&path, &contents).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// All advertised daemons, oldest first. A missing directory is empty.
    /// Entry files that cannot be parsed are logged and skipped.
    pub fn all(&self) -> Result<Vec<DaemonRegistryEntry>, RegistryError> {
        let mut entries: Vec<DaemonRegistryEntry> =
            self.scan()?.entries.into_iter().map(|(_, entry)| entry).collect();
        entries.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.daemon_id.0.cmp(&b.daemon_id.0))
        });
        Ok(entries)
    }

    /// Entries whose fingerprint matches. Not probed.
    pub fn find_compatible(
        &self,
        fingerprint: &ContextFingerprint,
    ) -> Result<Vec<DaemonRegistryEntry>, RegistryError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|entry| entry.fingerprint == *fingerprint)
            .collect())
    }

    /// Probe every entry and remove the unreachable ones, along with entry
    /// files that cannot be parsed. Returns the removed entries.
    pub fn prune_stale(&self, timeout: Duration) -> Result<Vec<DaemonRegistryEntry>, RegistryError> {
        let scan = self.scan()?;
        for path in &scan.unreadable {
            let _guard = self.lock();
            tracing::info!(path = %path.display(), "removing unreadable daemon entry");
            remove_file_if_present(path)?;
        }

        let mut pruned = Vec::new();
        for (_, entry) in scan.entries {
            if probe(&entry, timeout) {
                continue;
            }
            tracing::info!(daemon = %entry.daemon_id, address = %entry.address, "pruning stale daemon entry");
            self.remove_daemon(&entry.daemon_id)?;
            pruned.push(entry);
        }
        Ok(pruned)
    }

    fn scan(&self) -> Result<Scan, RegistryError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Scan::default()),
            Err(err) => return Err(io_err(&self.dir, err)),
        };

        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_entry_file(p))
            .collect();
        paths.sort();

        let mut scan = Scan::default();
        for path in paths {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                // Removed by its owner between listing and reading.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            };
            match parse_entry(&path, &contents) {
                Ok(entry) => scan.entries.push((path, entry)),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable daemon entry");
                    scan.unreadable.push(path);
                }
            }
        }
        Ok(scan)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry files found in the registry directory.
#[derive(Debug, Default)]
struct Scan {
    entries: Vec<(PathBuf, DaemonRegistryEntry)>,
    unreadable: Vec<PathBuf>,
}

/// True if something accepts TCP connections at the entry's address.
pub fn probe(entry: &DaemonRegistryEntry, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&entry.address, timeout).is_ok()
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

fn parse_entry(path: &Path, contents: &str) -> Result<DaemonRegistryEntry, RegistryError> {
    serde_yaml::from_str(contents).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn is_entry_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(ENTRY_PREFIX) && name.ends_with(ENTRY_SUFFIX))
        .unwrap_or(false)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("daemon.yaml");
    path.with_file_name(format!("{name}.tmp"))
}

fn remove_file_if_present(path: &Path) -> Result<bool, RegistryError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed daemon registry entry");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), RegistryError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
