//! # Pending Results
//!
//! A one-shot slot that one thread resolves and others wait on with a deadline.
//! Used by remote proxies and ping probes so callers block on a condition
//! variable instead of sleeping in a loop.
//!
//! "Not yet resolved" ([`WaitOutcome::Pending`]) is kept distinct from a
//! resolved value, even when the value itself is empty.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Resolved(T),
    Pending,
}

impl<T> WaitOutcome<T> {
    pub fn resolved(self) -> Option<T> {
        match self {
            WaitOutcome::Resolved(value) => Some(value),
            WaitOutcome::Pending => None,
        }
    }
}

#[derive(Debug)]
pub struct Pending<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A poisoned slot still holds a consistent Option.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the value and wake all waiters. The first resolution wins;
    /// returns `false` if a value was already present.
    pub fn resolve(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.ready.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().is_some()
    }

    /// Take the value out, waiting at most `timeout`
    pub fn wait_take(&self, timeout: Duration) -> WaitOutcome<T> {
        self.wait_with(timeout, Option::take)
    }

    /// Wait until `read` yields a value or the deadline passes. A timeout too
    /// large to add to the clock waits without a deadline.
    fn wait_with<R>(
        &self,
        timeout: Duration,
        mut read: impl FnMut(&mut Option<T>) -> Option<R>,
    ) -> WaitOutcome<R> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.lock();
        loop {
            if let Some(value) = read(&mut *slot) {
                return WaitOutcome::Resolved(value);
            }
            slot = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::Pending;
                    }
                    match self.ready.wait_timeout(slot, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(e) => e.into_inner().0,
                    }
                }
                None => self.ready.wait(slot).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }
}

impl<T: Clone> Pending<T> {
    pub fn peek(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Wait for the value without consuming it
    pub fn wait(&self, timeout: Duration) -> WaitOutcome<T> {
        self.wait_with(timeout, |slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unresolved_wait_times_out() {
        let pending: Pending<u32> = Pending::new();
        let started = Instant::now();
        assert_eq!(pending.wait(Duration::from_millis(20)), WaitOutcome::Pending);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_resolution_wakes_waiter() {
        let pending = Arc::new(Pending::new());
        let resolver = pending.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            resolver.resolve("done")
        });
        assert_eq!(
            pending.wait(Duration::from_secs(5)),
            WaitOutcome::Resolved("done")
        );
        assert!(handle.join().unwrap_or(false));
    }

    #[test]
    fn test_first_resolution_wins() {
        let pending = Pending::new();
        assert!(pending.resolve(1));
        assert!(!pending.resolve(2));
        assert_eq!(pending.peek(), Some(1));
    }

    #[test]
    fn test_resolved_empty_value_differs_from_pending() {
        let pending: Pending<Option<u8>> = Pending::new();
        pending.resolve(None);
        assert_eq!(
            pending.wait_take(Duration::from_millis(1)),
            WaitOutcome::Resolved(None)
        );
        assert_eq!(pending.wait_take(Duration::from_millis(1)), WaitOutcome::Pending);
    }

    #[test]
    fn test_unbounded_timeout_waits_without_deadline() {
        let pending = Pending::new();
        pending.resolve(1);
        assert_eq!(pending.wait_take(Duration::MAX), WaitOutcome::Resolved(1));

        let pending = Arc::new(Pending::new());
        let resolver = pending.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            resolver.resolve(2)
        });
        assert_eq!(pending.wait(Duration::MAX), WaitOutcome::Resolved(2));
        assert!(handle.join().unwrap_or(false));
    }
}
