//! Completion signalling between caller threads and dispatch threads

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A monotonically counting event.
///
/// `complete` bumps the count and wakes waiters. One-shot users wait for the
/// first completion; loop-style users (session close, safe-umount) wait for
/// the count to move past a snapshot.
#[derive(Default)]
pub struct Completion {
    count: Mutex<u64>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal completion, waking all waiters.
    pub fn complete(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.count.lock() > 0
    }

    /// Block until the first completion.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
    }

    /// Block until the first completion or the timeout. Returns whether the
    /// completion happened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            return true;
        }
        let _ = self.cv.wait_for(&mut count, timeout);
        *count > 0
    }

    /// Block until the count changes from its current value or the timeout
    /// expires. Returns whether it changed.
    pub fn wait_for_change_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        let seen = *count;
        let _ = self.cv.wait_for(&mut count, timeout);
        *count != seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_complete_before_wait() {
        let c = Completion::new();
        c.complete();
        assert!(c.is_complete());
        c.wait();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c = Completion::new();
        assert!(!c.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let c = Arc::new(Completion::new());
        let c2 = c.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c2.complete();
        });
        assert!(c.wait_timeout(Duration::from_secs(5)));
        t.join().unwrap();
    }
}
