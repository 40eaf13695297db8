//! Interruptible sleeps for the worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        // take the lock so a waiter between its flag check and wait() cannot miss the notify
        let _g = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cv.notify_all();
    }

    /// Sleep up to `timeout`. Returns true if stopped (immediately on `stop()`).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.cv.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_wakes_sleeper() {
        let s = StopSignal::new();
        let s2 = s.clone();
        let start = Instant::now();
        let h = std::thread::spawn(move || s2.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        s.stop();
        assert!(h.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn times_out_when_not_stopped() {
        let s = StopSignal::new();
        assert!(!s.wait_timeout(Duration::from_millis(20)));
        s.stop();
        assert!(s.wait_timeout(Duration::from_secs(30)));
    }
}
