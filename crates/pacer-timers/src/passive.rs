//! The host-pumped driver: no thread of its own.

use std::sync::Arc;

use crate::callback::CallbackTimer;
use crate::clock::MonoTime;
use crate::queue::{QueueCore, QueueNotify};
use crate::timer::Timer;
use crate::TimerError;

/// A timer queue pumped by the host's own loop.
///
/// The host calls [`process`](PassiveQueue::process) and sleeps at most the
/// returned delay. Whenever a start moves the head of the queue earlier, the
/// reschedule callback fires so the host can recompute its sleep budget.
pub struct PassiveQueue {
    core: Arc<QueueCore>,
    quantum: Box<dyn Fn() -> f64 + Send + Sync>,
}

struct HostNotify(Box<dyn Fn() + Send + Sync>);

impl QueueNotify for HostNotify {
    fn reschedule(&self) {
        (self.0)();
    }
}

impl PassiveQueue {
    /// `reschedule` is invoked (without the queue lock) whenever the next
    /// deadline moves earlier; `quantum` reports the host loop's sleep
    /// granularity in seconds.
    pub fn new(
        reschedule: impl Fn() + Send + Sync + 'static,
        quantum: impl Fn() -> f64 + Send + Sync + 'static,
    ) -> Self {
        PassiveQueue {
            core: QueueCore::new(Box::new(HostNotify(Box::new(reschedule)))),
            quantum: Box::new(quantum),
        }
    }

    /// Deliver every expiration due at `now`; returns the delay in seconds
    /// until the next deadline, or +inf when the queue is idle.
    pub fn process(&self, now: MonoTime) -> f64 {
        self.core.process(now)
    }

    pub fn create_timer(&self) -> Result<Timer, TimerError> {
        Ok(self.core.create_timer()?)
    }

    /// Create a timer around a plain callback; see [`CallbackTimer`].
    pub fn create_callback_timer(
        &self,
        callback: impl Fn(MonoTime) + Send + Sync + 'static,
    ) -> Result<CallbackTimer, TimerError> {
        CallbackTimer::new(&self.core, callback)
    }

    /// The host's sleep granularity, as reported by its quantum callback.
    pub fn sleep_quantum(&self) -> f64 {
        (self.quantum)()
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending_count()
    }

    pub fn show(&self, level: u32) {
        tracing::info!("passive timer queue");
        if level >= 1 {
            self.core.show(level - 1);
        }
    }
}
