//! Plain-callback timers: the adapter that turns a bare `Fn` into a
//! one-shot notifier, for callers that do not implement [`Notify`].

use std::sync::Arc;

use crate::clock::{MonoTime, MonotonicClock};
use crate::notify::{Expire, Notify};
use crate::queue::QueueCore;
use crate::timer::Timer;
use crate::TimerError;

struct CallbackNotify {
    callback: Box<dyn Fn(MonoTime) + Send + Sync>,
}

impl Notify for CallbackNotify {
    fn expire(&self, now: MonoTime) -> Expire {
        (self.callback)(now);
        Expire::NoRestart
    }

    fn show(&self, _level: u32) {
        tracing::info!("callback notifier");
    }
}

/// A timer bound to one callback at creation.
///
/// The callback runs once per start on the queue's processing thread and
/// never restarts itself; start again (including from inside the callback)
/// for periodic behavior. Dropping the handle cancels and reclaims the
/// timer.
pub struct CallbackTimer {
    timer: Timer,
    notify: Arc<CallbackNotify>,
}

impl CallbackTimer {
    pub(crate) fn new(
        core: &Arc<QueueCore>,
        callback: impl Fn(MonoTime) + Send + Sync + 'static,
    ) -> Result<Self, TimerError> {
        Ok(CallbackTimer {
            timer: core.create_timer()?,
            notify: Arc::new(CallbackNotify {
                callback: Box::new(callback),
            }),
        })
    }

    /// Schedule the callback to run at `at`; see [`Timer::start_at`].
    pub fn start_at(&self, at: MonoTime) -> u32 {
        self.timer.start_at(self.notify.clone(), at)
    }

    /// Schedule the callback `delay_s` seconds from now.
    pub fn start_after(&self, delay_s: f64) -> u32 {
        self.start_at(MonotonicClock::now() + delay_s)
    }

    /// See [`Timer::cancel`].
    pub fn cancel(&self) -> bool {
        self.timer.cancel()
    }

    /// See [`Timer::expire_delay`].
    pub fn expire_delay(&self, now: MonoTime) -> f64 {
        self.timer.expire_delay(now)
    }

    pub fn show(&self, level: u32) {
        self.timer.show(level);
    }
}
