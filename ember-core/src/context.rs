//! Immutable daemon identity and configuration snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::types::{ContextFingerprint, DaemonId};

/// Built once at startup and shared by `Arc`; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonContext {
    daemon_id: DaemonId,
    registry_dir: PathBuf,
    idle_timeout: Option<Duration>,
    pid: Option<u32>,
    options: BTreeMap<String, String>,
    version: String,
}

impl DaemonContext {
    pub fn builder(registry_dir: impl Into<PathBuf>) -> DaemonContextBuilder {
        DaemonContextBuilder::new(registry_dir)
    }

    pub fn daemon_id(&self) -> DaemonId {
        self.daemon_id
    }

    pub fn registry_dir(&self) -> &Path {
        &self.registry_dir
    }

    /// `None` when idle shutdown is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Compatibility digest: registry directory, daemon options and version.
    ///
    /// Identity fields and the idle timeout are excluded; two daemons with
    /// different ids but the same configuration are interchangeable.
    pub fn fingerprint(&self) -> ContextFingerprint {
        fingerprint_of(&self.registry_dir, &self.options, &self.version)
    }
}

/// Compute the fingerprint a client should look for.
pub fn fingerprint_of(
    registry_dir: &Path,
    options: &BTreeMap<String, String>,
    version: &str,
) -> ContextFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(registry_dir.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    for (key, value) in options {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(version.as_bytes());
    ContextFingerprint(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct DaemonContextBuilder {
    daemon_id: Option<DaemonId>,
    registry_dir: PathBuf,
    idle_timeout: Option<Duration>,
    pid: Option<u32>,
    options: BTreeMap<String, String>,
    version: String,
}

impl DaemonContextBuilder {
    pub fn new(registry_dir: impl Into<PathBuf>) -> Self {
        Self {
            daemon_id: None,
            registry_dir: registry_dir.into(),
            idle_timeout: None,
            pid: None,
            options: BTreeMap::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn daemon_id(mut self, id: DaemonId) -> Self {
        self.daemon_id = Some(id);
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = (String, String)>) -> Self {
        self.options.extend(options);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn build(self) -> DaemonContext {
        DaemonContext {
            daemon_id: self.daemon_id.unwrap_or_else(DaemonId::generate),
            registry_dir: self.registry_dir,
            idle_timeout: self.idle_timeout,
            pid: self.pid,
            options: self.options,
            version: self.version,
        }
    }
}
