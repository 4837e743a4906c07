//! In-flight command accounting for the idle watcher.
//!
//! A connection that is open but silent is not a running command; only the
//! span between reading a request and writing its reply is counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_core::IdleTimeout;

/// Counts commands currently executing and records activity on the daemon's
/// idle timeout when each one starts and finishes.
#[derive(Debug)]
pub struct CommandTracker {
    in_flight: AtomicUsize,
    idle: Arc<IdleTimeout>,
}

impl CommandTracker {
    pub fn new(idle: Arc<IdleTimeout>) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            idle,
        }
    }

    /// Mark a command as running until the guard is dropped.
    pub fn begin(self: &Arc<Self>) -> CommandGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.idle.touch();
        CommandGuard(Arc::clone(self))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Record activity that is not a command, such as a new connection.
    pub fn touch(&self) {
        self.idle.touch();
    }
}

/// Ends one command's accounting when dropped, however the command ended.
#[derive(Debug)]
pub struct CommandGuard(Arc<CommandTracker>);

impl Drop for CommandGuard {
    fn drop(&mut self) {
        self.0.idle.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn guard_counts_and_touches_on_begin_and_end() {
        let origin = Instant::now();
        let idle = Arc::new(IdleTimeout::starting_at(Some(Duration::from_secs(60)), origin));
        let tracker = Arc::new(CommandTracker::new(idle.clone()));
        assert_eq!(tracker.in_flight(), 0);

        std::thread::sleep(Duration::from_millis(5));
        let first = tracker.begin();
        let second = tracker.begin();
        let after_begin = idle.last_activity();
        assert!(after_begin > origin);
        assert_eq!(tracker.in_flight(), 2);

        std::thread::sleep(Duration::from_millis(5));
        drop(first);
        assert_eq!(tracker.in_flight(), 1);
        assert!(idle.last_activity() > after_begin);
        drop(second);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn guard_is_released_on_panic() {
        let idle = Arc::new(IdleTimeout::new(None));
        let tracker = Arc::new(CommandTracker::new(idle));
        let inner = tracker.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _command = inner.begin();
            panic!("command blew up");
        }));
        assert!(outcome.is_err());
        assert_eq!(tracker.in_flight(), 0);
    }
}
