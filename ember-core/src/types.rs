//! Domain types shared by the daemon and its clients.
//!
//! Registry entries are serializable via serde + serde_yaml.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Unique identity of one daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub Uuid);

impl DaemonId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Shared secret a client must present with each request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken(pub String);

impl AuthToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Compare against a presented token in time independent of where the
    /// two differ. Only the length comparison may short-circuit.
    pub fn verify(&self, presented: &AuthToken) -> bool {
        let (expected, presented) = (self.0.as_bytes(), presented.0.as_bytes());
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

impl From<&str> for AuthToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Digest of the configuration a client must match to reuse a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextFingerprint(pub String);

impl fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// One advertised daemon, persisted as `daemon-<id>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonRegistryEntry {
    pub daemon_id: DaemonId,
    pub address: SocketAddr,
    pub fingerprint: ContextFingerprint,
    pub registry_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub token: AuthToken,
    pub started_at: DateTime<Utc>,
}
