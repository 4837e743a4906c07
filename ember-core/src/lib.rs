//! Ember core library: service registry, executor pools, daemon context,
//! idle-timeout policy and the persistent daemon registry.
//!
//! - [`services`]: lazy, hierarchical [`ServiceRegistry`]
//! - [`executor`]: [`ExecutorFactory`] and its named pools
//! - [`context`]: immutable [`DaemonContext`]
//! - [`idle`]: [`IdleTimeout`] policy
//! - [`registry`]: on-disk [`DaemonRegistry`] of advertised daemons
//! - [`error`]: error enums for all of the above

pub mod context;
pub mod error;
pub mod executor;
pub mod idle;
pub mod registry;
pub mod services;
pub mod types;

pub use context::{DaemonContext, DaemonContextBuilder};
pub use error::{ExecutorError, RegistryError, ServiceError};
pub use executor::{ConcurrencyPolicy, ExecutorFactory, ExecutorPool};
pub use idle::IdleTimeout;
pub use registry::DaemonRegistry;
pub use services::{Close, CloseError, ServiceKey, ServiceRegistry};
pub use types::{AuthToken, ContextFingerprint, DaemonId, DaemonRegistryEntry};
