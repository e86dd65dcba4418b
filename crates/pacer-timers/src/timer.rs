//! The user-visible scheduled entity and its queue-private record.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use pacer_arena::ArenaBox;

use crate::clock::{MonoTime, MonotonicClock};
use crate::notify::Notify;
use crate::queue::QueueCore;

/// Rack capacity for timer records.
pub(crate) const TIMER_RACK_CAPACITY: usize = 16;

/// Queue-private state of one timer. Every field is guarded by the owning
/// queue's mutex.
pub(crate) struct TimerCore {
    pub(crate) expiration: MonoTime,
    /// Cached index into the owning queue's heap; `None` while limbo. The
    /// heap rewrites it on every move.
    pub(crate) heap_pos: Option<usize>,
    pub(crate) notify: Option<Arc<dyn Notify>>,
}

/// Arena-allocated cell holding a [`TimerCore`].
///
/// The cell is aliased: the owning [`Timer`] handle holds it via `ArenaBox`
/// while the queue's heap and `expiring` marker hold raw [`TimerRef`]s to it.
/// The owning queue's mutex serializes every access (see [`TimerRef::core_mut`]),
/// and the cancel/expire protocol guarantees no `TimerRef` survives the
/// handle: `Timer::drop` cancels first, which removes the heap entry and
/// waits out (or flags) a callback in flight.
pub(crate) struct TimerCell(std::cell::UnsafeCell<TimerCore>);

unsafe impl Send for TimerCell {}
unsafe impl Sync for TimerCell {}

impl TimerCell {
    pub(crate) fn new() -> Self {
        TimerCell(std::cell::UnsafeCell::new(TimerCore {
            expiration: MonoTime::ZERO,
            heap_pos: None,
            notify: None,
        }))
    }
}

/// Non-owning reference to a timer record, compared by address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct TimerRef(NonNull<TimerCell>);

// TimerRefs live inside the queue state and cross threads with it; the
// record they point to is Send + Sync and only reachable under the queue
// mutex.
unsafe impl Send for TimerRef {}
unsafe impl Sync for TimerRef {}

impl TimerRef {
    pub(crate) fn new(cell: &TimerCell) -> Self {
        TimerRef(NonNull::from(cell))
    }

    /// # Safety
    ///
    /// The caller must hold the owning queue's mutex, and the referenced
    /// timer must not have been destroyed. The returned borrow must be
    /// dropped before any other `core_mut` on the same timer (keep scopes
    /// tight; in particular, end the borrow before heap operations, which
    /// rewrite cached indices through their own `core_mut`).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn core_mut<'a>(self) -> &'a mut TimerCore {
        &mut *(*self.0.as_ptr()).0.get()
    }
}

/// A one-shot timer created by a queue.
///
/// Dropping the handle cancels and reclaims the timer; that is the only
/// deallocation path, and it is safe to take from inside the timer's own
/// expire callback.
pub struct Timer {
    queue: Arc<QueueCore>,
    cell: ArenaBox<TimerCell, TIMER_RACK_CAPACITY>,
}

impl Timer {
    pub(crate) fn new(
        queue: Arc<QueueCore>,
        cell: ArenaBox<TimerCell, TIMER_RACK_CAPACITY>,
    ) -> Self {
        Timer { queue, cell }
    }

    fn timer_ref(&self) -> TimerRef {
        TimerRef::new(&self.cell)
    }

    /// Schedule (or reschedule) the timer to expire at `at`.
    ///
    /// Returns the number of expirations that will run as a direct
    /// consequence of this call: `1` when the timer was limbo, or when the
    /// reschedule of a pending timer moved it to the head of the queue; `0`
    /// when a pending timer was merely repositioned. The new notifier and
    /// expiration override any restart a concurrently running callback might
    /// request.
    pub fn start_at(&self, notify: Arc<dyn Notify>, at: MonoTime) -> u32 {
        self.queue.start(self.timer_ref(), notify, at)
    }

    /// Schedule the timer `delay_s` seconds from now.
    pub fn start_after(&self, notify: Arc<dyn Notify>, delay_s: f64) -> u32 {
        self.start_at(notify, MonotonicClock::now() + delay_s)
    }

    /// Unschedule the timer.
    ///
    /// Returns `true` when the timer was pending and its callback was not in
    /// flight; that expiration will now never run. When the callback *is*
    /// running on another thread, this blocks until it has returned and then
    /// reports `false`: the expiration was already being delivered. Called
    /// from inside the callback itself it does not block.
    pub fn cancel(&self) -> bool {
        self.queue.cancel(self.timer_ref())
    }

    /// Cancel and reclaim the timer. Equivalent to dropping it.
    pub fn destroy(self) {}

    /// The pending expiration, read under the queue mutex; `None` in limbo.
    pub fn expire_info(&self) -> Option<MonoTime> {
        self.queue.expire_info(self.timer_ref())
    }

    /// Seconds from `now` until expiration, clamped to zero for overdue
    /// timers; `f64::NEG_INFINITY` when the timer is not pending.
    pub fn expire_delay(&self, now: MonoTime) -> f64 {
        match self.expire_info() {
            Some(expiration) => (expiration - now).max(0.0),
            None => f64::NEG_INFINITY,
        }
    }

    /// Log this timer's state; `level >= 1` also dumps the notifier.
    pub fn show(&self, level: u32) {
        self.queue.show_timer(self.timer_ref(), level);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Once cancel returns, the callback is not running and the heap has
        // no reference to the record; the arena box can be reclaimed.
        self.queue.cancel(self.timer_ref());
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("expiration", &self.expire_info())
            .finish()
    }
}
