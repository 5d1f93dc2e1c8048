//! Completion signal shared between a compile task and its waiters.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(target_arch = "wasm32")]
use web_time::Duration;

struct SignalInner {
    complete: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// One-shot "work finished" event.
///
/// Clones share the same event. The producer calls [`complete`](Self::complete)
/// exactly once; any number of consumers may poll or block on it.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                complete: AtomicBool::new(false),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// A signal that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        let signal = Self::new();
        signal.complete();
        signal
    }

    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Marks the work as finished and wakes every waiter.
    pub fn complete(&self) {
        let _guard = self.inner.lock.lock();
        let was_complete = self.inner.complete.swap(true, Ordering::AcqRel);
        debug_assert!(!was_complete, "CompletionSignal completed twice");
        self.inner.cvar.notify_all();
    }

    /// Blocks the calling thread until the signal completes.
    pub fn wait(&self) {
        if self.is_complete() {
            return;
        }
        let mut guard = self.inner.lock.lock();
        while !self.is_complete() {
            self.inner.cvar.wait(&mut guard);
        }
    }

    /// Blocks for at most `timeout`. Returns whether the signal completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_complete() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        if !self.is_complete() {
            let _ = self.inner.cvar.wait_for(&mut guard, timeout);
        }
        self.is_complete()
    }

    /// `true` when both handles refer to the same event.
    #[inline]
    #[must_use]
    pub fn same_signal(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_after_complete_on_other_thread() {
        let signal = CompletionSignal::new();
        let producer = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.complete();
        });
        signal.wait();
        assert!(signal.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let signal = CompletionSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        signal.complete();
        assert!(signal.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn clones_share_the_event() {
        let a = CompletionSignal::new();
        let b = a.clone();
        assert!(a.same_signal(&b));
        assert!(!a.same_signal(&CompletionSignal::new()));
    }
}
