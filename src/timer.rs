//! Monotonic scheduled one-shot callbacks with O(1) cancellation.
//!
//! One instance belongs to each [`crate::session::Session`] (see DESIGN.md
//! "Resolved open questions" for why this is per-session rather than a
//! single process-wide instance). `check()` is safe to call re-entrantly:
//! the due set is removed from the active map before any callback runs, so
//! a callback that calls `schedule`/`cancel` cannot observe or corrupt
//! entries still being fired in the same pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(test))]
use std::time::Instant;

#[cfg(test)]
use mock_instant::Instant;

use parking_lot::Mutex;

pub type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct Entry {
    expiry: Instant,
    callback: Option<Callback>,
}

struct Inner {
    next_token: u64,
    entries: HashMap<u64, Entry>,
}

/// Cheap to clone; clones share the same underlying table.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<Mutex<Inner>>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: Arc::new(Mutex::new(Inner {
                next_token: 1,
                entries: HashMap::new(),
            })),
        }
    }

    /// Stores `(now + timeout, callback)` and returns a cancellation token.
    pub fn schedule(&self, timeout: Duration, callback: Callback) -> TimerToken {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let expiry = Instant::now() + timeout;
        inner.entries.insert(
            token,
            Entry {
                expiry,
                callback: Some(callback),
            },
        );
        TimerToken(token)
    }

    /// Safe to call on a token that already fired or was already cancelled.
    pub fn cancel(&self, token: TimerToken) {
        self.inner.lock().entries.remove(&token.0);
    }

    /// Earliest pending expiry, if any; callers drive a `sleep_until` off
    /// this to invoke `check()` exactly when something becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.expiry)
            .min()
    }

    /// Fires every active timer whose expiry has passed, in unspecified
    /// order; each fire is one-shot.
    pub fn check(&self) {
        let now = Instant::now();
        let due: Vec<Callback> = {
            let mut inner = self.inner.lock();
            let due_tokens: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.expiry <= now)
                .map(|(token, _)| *token)
                .collect();
            due_tokens
                .into_iter()
                .filter_map(|token| inner.entries.remove(&token))
                .filter_map(|entry| entry.callback)
                .collect()
        };
        for callback in due {
            callback();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock_instant::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_after_advance() {
        MockClock::set_time(Duration::ZERO);
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers.schedule(Duration::from_millis(100), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        timers.check();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        MockClock::advance(Duration::from_millis(150));
        timers.check();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        MockClock::set_time(Duration::ZERO);
        let timers = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = timers.schedule(Duration::from_millis(10), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        timers.cancel(token);
        MockClock::advance(Duration::from_millis(20));
        timers.check();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_schedule_from_callback_is_safe() {
        MockClock::set_time(Duration::ZERO);
        let timers = TimerManager::new();
        let inner_fired = Arc::new(AtomicUsize::new(0));
        let timers_clone = timers.clone();
        let inner_fired_clone = inner_fired.clone();
        timers.schedule(Duration::from_millis(10), Box::new(move || {
            timers_clone.schedule(Duration::ZERO, Box::new(move || {
                inner_fired_clone.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        MockClock::advance(Duration::from_millis(10));
        timers.check();
        assert_eq!(inner_fired.load(Ordering::SeqCst), 0);
        timers.check();
        assert_eq!(inner_fired.load(Ordering::SeqCst), 1);
    }
}
