//! Binary wakeup event: one latched signal, consumed by the next waiter.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

// Condvar timeouts take a Duration; cap "effectively forever" waits rather
// than overflowing Duration::from_secs_f64.
const MAX_WAIT_S: f64 = 1e9;

pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Event {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Latch the signal and wake one waiter. Idempotent.
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until signaled, consuming the signal.
    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Block until signaled or until `timeout_s` seconds elapse, whichever
    /// comes first; a latched signal is consumed either way. Non-finite
    /// timeouts wait indefinitely, negative ones only poll the latch.
    pub(crate) fn wait_timeout(&self, timeout_s: f64) {
        if !timeout_s.is_finite() {
            self.wait();
            return;
        }
        let deadline =
            Instant::now() + Duration::from_secs_f64(timeout_s.clamp(0.0, MAX_WAIT_S));
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *signaled {
                *signaled = false;
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_before_wait_is_latched() {
        let event = Event::new();
        event.signal();
        event.signal();
        let start = Instant::now();
        event.wait_timeout(5.0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_without_signal() {
        let event = Event::new();
        let start = Instant::now();
        event.wait_timeout(0.05);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn signal_wakes_a_blocked_waiter() {
        use std::sync::Arc;

        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        event.signal();
        waiter.join().unwrap();
    }
}
