//! Named worker pools with tracked, cascading shutdown.
//!
//! Every pool is a dedicated tokio runtime. Blocking units of work go through
//! [`ExecutorPool::execute`] and run on the runtime's blocking threads; timer
//! style tasks go through [`ExecutorPool::spawn`] and run on its single
//! worker thread. Pools are only created through an [`ExecutorFactory`], which
//! shuts all of them down when it is closed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::error::ExecutorError;
use crate::services::{Close, CloseError};

/// Default time a pool waits for running work on shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Time the runtime gets to unwind stragglers once the grace period is over.
const FORCE_STOP_WAIT: Duration = Duration::from_millis(100);

const IDLE_POLL: Duration = Duration::from_millis(10);

/// How many units of work a pool runs at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// One unit at a time; further work queues.
    Single,
    /// At most `n` units at a time.
    Fixed(usize),
    /// Grows as needed (bounded only by tokio's blocking-thread cap).
    Unbounded,
}

impl ConcurrencyPolicy {
    fn thread_limit(self) -> Option<usize> {
        match self {
            ConcurrencyPolicy::Single => Some(1),
            ConcurrencyPolicy::Fixed(n) => Some(n.max(1)),
            ConcurrencyPolicy::Unbounded => None,
        }
    }
}

/// Decrements the pool's active count when a unit of work ends or is dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one named pool.
pub struct ExecutorPool {
    name: String,
    policy: ConcurrencyPolicy,
    runtime: Mutex<Option<Runtime>>,
    active: Arc<AtomicUsize>,
    grace: Duration,
}

impl ExecutorPool {
    fn build(name: &str, policy: ConcurrencyPolicy, grace: Duration) -> Result<Self, ExecutorError> {
        let thread_prefix = name.to_string();
        let thread_seq = AtomicUsize::new(0);
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .worker_threads(1)
            .thread_name_fn(move || {
                let n = thread_seq.fetch_add(1, Ordering::SeqCst);
                format!("{thread_prefix}-{n}")
            })
            .enable_all();
        if let Some(limit) = policy.thread_limit() {
            builder.max_blocking_threads(limit);
        }
        let runtime = builder.build().map_err(|source| ExecutorError::Build {
            pool: name.to_string(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            policy,
            runtime: Mutex::new(Some(runtime)),
            active: Arc::new(AtomicUsize::new(0)),
            grace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Run a blocking unit of work on a pool thread.
    ///
    /// A panicking job is logged and counted as finished; it never takes the
    /// pool down.
    pub fn execute<F>(&self, job: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = lock(&self.runtime);
        let runtime = runtime.as_ref().ok_or_else(|| self.rejected())?;
        let active = ActiveGuard::enter(&self.active);
        let pool = self.name.clone();
        runtime.spawn_blocking(move || {
            let _active = active;
            if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!(pool = %pool, "unit of work panicked");
            }
        });
        Ok(())
    }

    /// Run an async task (timers, signal listeners) on the pool's worker.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = lock(&self.runtime);
        let runtime = runtime.as_ref().ok_or_else(|| self.rejected())?;
        Ok(runtime.spawn(future))
    }

    /// Units of work submitted through [`execute`](Self::execute) that have
    /// not finished yet.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.runtime).is_none()
    }

    /// Block until no unit of work is running, or `timeout` elapses.
    /// Returns `true` when the pool drained.
    pub fn await_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL.min(deadline - now));
        }
    }

    /// Stop accepting work, wait up to the grace period for running work,
    /// then stop the pool. Work still running afterwards is abandoned and
    /// reported as [`ExecutorError::Abandoned`].
    ///
    /// Must be called from outside any pool thread.
    pub fn shutdown(&self) -> Result<(), ExecutorError> {
        let Some(runtime) = lock(&self.runtime).take() else {
            return Ok(());
        };
        let drained = self.await_idle(self.grace);
        let abandoned = self.active();
        runtime.shutdown_timeout(FORCE_STOP_WAIT);

        if drained {
            tracing::debug!(pool = %self.name, "executor pool stopped");
            Ok(())
        } else {
            tracing::warn!(pool = %self.name, abandoned, "executor pool stopped with running work");
            Err(ExecutorError::Abandoned {
                pool: self.name.clone(),
                abandoned,
            })
        }
    }

    fn rejected(&self) -> ExecutorError {
        ExecutorError::Rejected {
            pool: self.name.clone(),
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        // Safe from any context, unlike dropping the runtime directly.
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("active", &self.active())
            .finish()
    }
}

/// Creates pools and owns their shutdown.
#[derive(Debug)]
pub struct ExecutorFactory {
    pools: Mutex<Vec<Arc<ExecutorPool>>>,
    grace: Duration,
    closed: AtomicBool,
}

impl Default for ExecutorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorFactory {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace: Duration) -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            grace,
            closed: AtomicBool::new(false),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Create and track a new pool.
    pub fn new_pool(&self, name: &str, policy: ConcurrencyPolicy) -> Result<Arc<ExecutorPool>, ExecutorError> {
        let mut pools = lock(&self.pools);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Rejected { pool: name.to_string() });
        }
        let pool = Arc::new(ExecutorPool::build(name, policy, self.grace)?);
        tracing::debug!(pool = name, ?policy, "created executor pool");
        pools.push(Arc::clone(&pool));
        Ok(pool)
    }

    /// Names of the pools issued so far, in creation order.
    pub fn pool_names(&self) -> Vec<String> {
        lock(&self.pools).iter().map(|p| p.name.clone()).collect()
    }

    /// Shut down every issued pool, newest first. All pools are attempted;
    /// the first failure is returned.
    pub fn shutdown(&self) -> Result<(), ExecutorError> {
        let pools = {
            let mut pools = lock(&self.pools);
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pools)
        };
        let mut first_error = None;
        for pool in pools.into_iter().rev() {
            if let Err(err) = pool.shutdown() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Close for ExecutorFactory {
    fn close(&self) -> Result<(), CloseError> {
        self.shutdown().map_err(Into::into)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
