//! Error types for ember-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while wiring or resolving services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No registry in the lookup chain provides the requested capability.
    #[error("no service registered for {service} (searched {searched})")]
    Unresolved {
        service: &'static str,
        searched: String,
    },

    /// The same capability was registered twice in one scope.
    #[error("service {service} is already registered in registry '{registry}'")]
    DuplicateRegistration {
        service: &'static str,
        registry: String,
    },

    /// A factory (transitively) depends on its own service.
    #[error("cyclic service dependency: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<&'static str> },

    /// A factory failed to produce its instance.
    #[error("failed to create service {service}: {reason}")]
    Creation {
        service: &'static str,
        reason: String,
    },

    /// Lookup or registration against a registry that was already closed.
    #[error("registry '{registry}' is closed")]
    RegistryClosed { registry: String },

    /// Releasing a closable service failed.
    #[error("failed to close service {service}: {source}")]
    Close {
        service: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ServiceError {
    /// Wrap any error raised inside a factory.
    pub fn creation(service: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Creation {
            service,
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by executor pools.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build executor pool '{pool}': {source}")]
    Build {
        pool: String,
        #[source]
        source: std::io::Error,
    },

    /// Work submitted after the pool stopped accepting.
    #[error("executor pool '{pool}' is shut down")]
    Rejected { pool: String },

    /// Shutdown gave up waiting for running work.
    #[error("executor pool '{pool}' abandoned {abandoned} unit(s) of work after the grace period")]
    Abandoned { pool: String, abandoned: usize },
}

/// Errors from the persistent daemon registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse registry entry at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or pass --registry-dir")]
    HomeNotFound,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}
