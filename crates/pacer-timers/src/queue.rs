//! The scheduler core shared by the active and passive drivers.
//!
//! One mutex guards the heap, the expiring-timer marker, the cancel flag,
//! and every timer record of the queue. No user callback ever runs with the
//! mutex held; the cancel/expire race is mediated with a dedicated condvar
//! instead.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use pacer_arena::{Arena, ArenaError, FreeList};

use crate::clock::{MonoTime, MonotonicClock};
use crate::heap::TimerHeap;
use crate::notify::{Expire, Notify};
use crate::timer::{Timer, TimerCell, TimerRef, TIMER_RACK_CAPACITY};

/// Minimum spacing between log reports of panicking expire callbacks.
const PANIC_MSG_MIN_PERIOD_S: f64 = 300.0;

/// Group tag for this crate's arena instantiations.
pub(crate) struct TimerGroup;

type TimerArena = Arena<TimerCell, TimerGroup, FreeList, TIMER_RACK_CAPACITY>;

/// The driver side of a queue: how to wake whoever sleeps until the next
/// expiration.
pub(crate) trait QueueNotify: Send + Sync {
    fn reschedule(&self);
}

struct QueueState {
    heap: TimerHeap,
    /// The timer whose callback is being delivered, set for the whole
    /// expiration step including the unlocked callback window. Compared by
    /// address only once `cancel_pending` is set: the callback may have
    /// destroyed the record.
    expiring: Option<TimerRef>,
    /// Set by `cancel` when it removed the currently-expiring timer.
    cancel_pending: bool,
    /// Thread currently inside `process`, if any.
    process_thread: Option<ThreadId>,
    last_panic_report: Option<MonoTime>,
}

impl QueueState {
    /// Delay until the next expiration, clamped non-negative; +inf when idle.
    fn next_delay(&self, now: MonoTime) -> f64 {
        match self.heap.top() {
            Some((_, expiration)) => (expiration - now).max(0.0),
            None => f64::INFINITY,
        }
    }

    fn report_expire_panic(&mut self, payload: &(dyn std::any::Any + Send)) {
        let now = MonotonicClock::now();
        let due = self
            .last_panic_report
            .map_or(true, |last| now - last >= PANIC_MSG_MIN_PERIOD_S);
        if !due {
            return;
        }
        self.last_panic_report = Some(now);
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        tracing::error!(panic = msg, "panic in timer expire callback");
        tracing::warn!("periodic timer may not restart");
    }
}

pub(crate) struct QueueCore {
    state: Mutex<QueueState>,
    /// Wakes cancellers blocked on a callback in flight.
    cancel_done: Condvar,
    notify: Box<dyn QueueNotify>,
    arena: TimerArena,
}

impl QueueCore {
    pub(crate) fn new(notify: Box<dyn QueueNotify>) -> Arc<Self> {
        Arc::new(QueueCore {
            state: Mutex::new(QueueState {
                heap: TimerHeap::new(),
                expiring: None,
                cancel_pending: false,
                process_thread: None,
                last_panic_report: None,
            }),
            cancel_done: Condvar::new(),
            notify,
            arena: TimerArena::instance(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn create_timer(self: &Arc<Self>) -> Result<Timer, ArenaError> {
        let cell = self.arena.alloc(TimerCell::new())?;
        Ok(Timer::new(Arc::clone(self), cell))
    }

    /// Schedule `timer` to expire at `at` with `notify`, returning the
    /// started count (see [`Timer::start_at`]). The driver is woken after
    /// the lock is released iff the head expiration moved earlier.
    pub(crate) fn start(&self, timer: TimerRef, notify: Arc<dyn Notify>, at: MonoTime) -> u32 {
        let (started, wake) = {
            let mut st = self.lock();
            let old_top = st.heap.top().map(|(_, expiration)| expiration);

            // SAFETY: queue mutex held; the caller owns the timer handle.
            // The new notifier and expiration also override any restart a
            // concurrently running callback of this timer might request
            // (`process` sees `notify` repopulated and leaves it alone).
            let pending_pos = {
                let core = unsafe { timer.core_mut() };
                core.notify = Some(notify);
                core.expiration = at;
                core.heap_pos
            };

            let started = match pending_pos {
                Some(pos) => {
                    st.heap.update(pos, at);
                    let is_top = st.heap.top().is_some_and(|(top, _)| top == timer);
                    u32::from(is_top)
                }
                None => {
                    st.heap.push(timer, at);
                    1
                }
            };

            let new_top = st
                .heap
                .top()
                .map(|(_, expiration)| expiration)
                .expect("heap cannot be empty after start");
            let wake = old_top.map_or(true, |old| new_top < old);
            (started, wake)
        };

        if wake {
            self.notify.reschedule();
        }
        started
    }

    /// Unschedule `timer`; see [`Timer::cancel`] for the contract.
    pub(crate) fn cancel(&self, timer: TimerRef) -> bool {
        let mut st = self.lock();
        // SAFETY: queue mutex held; the caller owns the timer handle.
        let pos = unsafe { timer.core_mut() }.heap_pos;
        let Some(pos) = pos else {
            return false;
        };
        st.heap.erase(pos);

        if st.expiring != Some(timer) {
            return true;
        }

        // The callback is in flight. Flag it so process leaves the record
        // alone (the callback may destroy the timer), then wait it out.
        // Waiting on our own thread would deadlock, and a caller inside the
        // callback already has the ordering it needs.
        st.cancel_pending = true;
        if st.process_thread == Some(thread::current().id()) {
            return false;
        }
        while st.cancel_pending && st.expiring == Some(timer) {
            st = self
                .cancel_done
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        false
    }

    /// Deliver every expiration due at `now` and return the delay until the
    /// next one (+inf when the queue goes idle). A second thread calling in
    /// while another is processing gets the current delay back immediately.
    pub(crate) fn process(&self, now: MonoTime) -> f64 {
        let mut st = self.lock();
        if st.process_thread.is_some() {
            return st.next_delay(now);
        }
        st.process_thread = Some(thread::current().id());

        while let Some((timer, expiration)) = st.heap.top() {
            if expiration > now {
                break;
            }
            st.expiring = Some(timer);

            // Clearing the notifier is the marker that lets the postlude
            // detect a re-start of this timer during its own callback.
            // SAFETY: queue mutex held; a pending timer's record is alive.
            let saved = unsafe { timer.core_mut() }.notify.take();

            let mut outcome = Expire::NoRestart;
            if let Some(notify) = &saved {
                drop(st);
                let result = catch_unwind(AssertUnwindSafe(|| notify.expire(now)));
                st = self.lock();
                match result {
                    Ok(requested) => outcome = requested,
                    Err(payload) => st.report_expire_panic(payload.as_ref()),
                }
            }

            if st.cancel_pending {
                // cancel() pulled the expiring timer out of the heap while
                // its callback ran, possibly destroying it in the process.
                // The record must not be touched.
                st.cancel_pending = false;
                self.cancel_done.notify_all();
            } else {
                // SAFETY: not cancelled, so the record outlived the
                // callback; the mutex is held again. Borrow ends before the
                // heap operations below.
                let (pos, expiration, restarted) = {
                    let core = unsafe { timer.core_mut() };
                    if core.notify.is_some() {
                        // start() ran during the callback (from inside it or
                        // from another thread); its schedule wins over any
                        // restart requested through `outcome`.
                        (core.heap_pos, core.expiration, true)
                    } else if let Expire::Restart(delay) = outcome {
                        core.notify = saved;
                        core.expiration = MonotonicClock::now() + delay.as_secs();
                        (core.heap_pos, core.expiration, true)
                    } else {
                        (core.heap_pos, core.expiration, false)
                    }
                };
                let pos = pos.expect("expiring timer left the heap without cancel");
                if restarted {
                    st.heap.update(pos, expiration);
                } else {
                    st.heap.erase(pos);
                }
            }
            st.expiring = None;
        }

        st.process_thread = None;
        st.next_delay(now)
    }

    pub(crate) fn expire_info(&self, timer: TimerRef) -> Option<MonoTime> {
        let _st = self.lock();
        // SAFETY: queue mutex held; the caller owns the timer handle.
        let core = unsafe { timer.core_mut() };
        core.heap_pos.map(|_| core.expiration)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().heap.len()
    }

    /// Log a queue summary; `level >= 1` dumps each pending timer and
    /// `level >= 2` their notifiers.
    pub(crate) fn show(&self, level: u32) {
        let st = self.lock();
        tracing::info!(pending = st.heap.len(), "timer queue");
        if level >= 1 {
            let now = MonotonicClock::now();
            for timer in st.heap.iter_timers() {
                // SAFETY: queue mutex held; pending records are alive.
                let core = unsafe { timer.core_mut() };
                tracing::info!(
                    state = "pending",
                    delay_s = core.expiration - now,
                    "timer"
                );
                if level >= 2 {
                    if let Some(notify) = &core.notify {
                        notify.show(level - 2);
                    }
                }
            }
        }
    }

    pub(crate) fn show_timer(&self, timer: TimerRef, level: u32) {
        let _st = self.lock();
        // SAFETY: queue mutex held; the caller owns the timer handle.
        let core = unsafe { timer.core_mut() };
        match core.heap_pos {
            Some(_) => {
                let delay_s = core.expiration - MonotonicClock::now();
                tracing::info!(state = "pending", delay_s, "timer");
            }
            None => tracing::info!(state = "limbo", "timer"),
        }
        if level >= 1 {
            if let Some(notify) = &core.notify {
                notify.show(level - 1);
            }
        }
    }
}

impl Drop for QueueCore {
    fn drop(&mut self) {
        // Timers hold an Arc to their core, so the core can only drop after
        // every timer it created was destroyed, which empties the heap.
        debug_assert!(self.lock().heap.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::notify::RestartDelay;

    struct NoopNotify;

    impl QueueNotify for NoopNotify {
        fn reschedule(&self) {}
    }

    /// Records expirations and returns a per-call outcome.
    struct Script {
        count: AtomicUsize,
        outcome: Box<dyn Fn(usize, MonoTime) -> Expire + Send + Sync>,
    }

    impl Script {
        fn counting() -> Arc<Self> {
            Script::with(|_, _| Expire::NoRestart)
        }

        fn with(outcome: impl Fn(usize, MonoTime) -> Expire + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Script {
                count: AtomicUsize::new(0),
                outcome: Box::new(outcome),
            })
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::Relaxed)
        }
    }

    impl Notify for Script {
        fn expire(&self, now: MonoTime) -> Expire {
            let n = self.count.fetch_add(1, Ordering::Relaxed);
            (self.outcome)(n, now)
        }
    }

    fn core() -> Arc<QueueCore> {
        QueueCore::new(Box::new(NoopNotify))
    }

    fn base() -> MonoTime {
        MonoTime::ZERO
    }

    #[test]
    fn empty_queue_reports_no_deadline_and_runs_nothing() {
        let core = core();
        assert_eq!(core.process(base() + 100.0), f64::INFINITY);
        assert_eq!(core.pending_count(), 0);
    }

    #[test]
    fn overdue_start_expires_on_next_process() {
        let core = core();
        let timer = core.create_timer().unwrap();
        let script = Script::counting();

        assert_eq!(timer.start_at(script.clone(), base() + 9.0), 1);
        assert_eq!(core.process(base() + 10.0), f64::INFINITY);
        assert_eq!(script.count(), 1);
        assert_eq!(timer.expire_info(), None);
    }

    #[test]
    fn future_timers_only_shorten_the_delay() {
        let core = core();
        let timer = core.create_timer().unwrap();
        let script = Script::counting();

        timer.start_at(script.clone(), base() + 10.0);
        assert_eq!(core.process(base() + 4.0), 6.0);
        assert_eq!(script.count(), 0);
        assert_eq!(timer.expire_info(), Some(base() + 10.0));
    }

    #[test]
    fn start_then_cancel_is_a_no_op_pair() {
        let core = core();
        let bystander = core.create_timer().unwrap();
        bystander.start_at(Script::counting(), base() + 50.0);

        let timer = core.create_timer().unwrap();
        let script = Script::counting();
        assert_eq!(core.pending_count(), 1);

        assert_eq!(timer.start_at(script.clone(), base() + 1.0), 1);
        assert!(timer.cancel());
        assert_eq!(core.pending_count(), 1);
        assert_eq!(timer.expire_info(), None);

        assert_eq!(core.process(base() + 2.0), 48.0);
        assert_eq!(script.count(), 0);
    }

    #[test]
    fn second_cancel_is_a_no_op() {
        let core = core();
        let timer = core.create_timer().unwrap();
        timer.start_at(Script::counting(), base() + 1.0);

        assert!(timer.cancel());
        assert!(!timer.cancel());
    }

    #[test]
    fn started_count_tracks_head_position() {
        let core = core();
        let ahead = core.create_timer().unwrap();
        ahead.start_at(Script::counting(), base() + 1.0);

        let timer = core.create_timer().unwrap();
        let script = Script::counting();

        // Limbo start is always a new expiration.
        assert_eq!(timer.start_at(script.clone(), base() + 5.0), 1);
        // Pending reschedule behind the head: nothing new will run early.
        assert_eq!(timer.start_at(script.clone(), base() + 4.0), 0);
        // Pending reschedule onto the head.
        assert_eq!(timer.start_at(script.clone(), base() + 0.5), 1);
    }

    #[test]
    fn reschedule_of_a_pending_timer_coalesces() {
        let core = core();
        let timer = core.create_timer().unwrap();
        let script = Script::counting();

        timer.start_at(script.clone(), base() + 1.0);
        timer.start_at(script.clone(), base() + 2.0);
        timer.start_at(script.clone(), base() + 3.0);
        assert_eq!(core.pending_count(), 1);

        assert_eq!(core.process(base() + 1.5), 1.5);
        assert_eq!(script.count(), 0, "superseded expirations must not fire");

        core.process(base() + 3.0);
        assert_eq!(script.count(), 1);
    }

    #[test]
    fn restart_outcome_reschedules_from_callback_return() {
        let core = core();
        let timer = core.create_timer().unwrap();
        let script = Script::with(|n, _| {
            if n == 0 {
                Expire::Restart(RestartDelay::from_secs(5.0))
            } else {
                Expire::NoRestart
            }
        });

        let begun = MonotonicClock::now();
        timer.start_at(script.clone(), base() + 1.0);
        core.process(base() + 1.0);
        assert_eq!(script.count(), 1);

        // Rescheduled relative to the real clock at callback return, not to
        // the synthetic process instant or the old expiration.
        let expiration = timer.expire_info().expect("restart keeps the timer pending");
        let err = expiration - (begun + 5.0);
        assert!((0.0..1.0).contains(&err), "restart offset was {err}");
    }

    #[test]
    fn concurrent_start_overrides_restart_request() {
        let core = core();
        let timer = core.create_timer().unwrap();

        // Start the timer again while its callback is blocked mid-flight;
        // that schedule must win over the Restart(1000) the callback is
        // about to return.
        let release = Arc::new(crate::event::Event::new());
        let entered = Arc::new(crate::event::Event::new());
        let script = {
            let release = Arc::clone(&release);
            let entered = Arc::clone(&entered);
            Script::with(move |_, _| {
                entered.signal();
                release.wait();
                Expire::Restart(RestartDelay::from_secs(1000.0))
            })
        };

        timer.start_at(script.clone(), base() + 1.0);
        let processor = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || core.process(base() + 1.0))
        };
        entered.wait();

        assert_eq!(timer.start_at(script.clone(), base() + 42.0), 1);
        release.signal();
        processor.join().unwrap();

        assert_eq!(timer.expire_info(), Some(base() + 42.0));
        timer.cancel();
    }

    #[test]
    fn panicking_callback_is_contained() {
        let core = core();
        let timer = core.create_timer().unwrap();
        let survivor = core.create_timer().unwrap();

        struct Bomb;
        impl Notify for Bomb {
            fn expire(&self, _now: MonoTime) -> Expire {
                panic!("notifier exploded");
            }
        }

        let script = Script::counting();
        timer.start_at(Arc::new(Bomb), base() + 1.0);
        survivor.start_at(script.clone(), base() + 2.0);

        // The panic is caught, logged (throttled), and treated as NoRestart;
        // the queue keeps delivering.
        assert_eq!(core.process(base() + 3.0), f64::INFINITY);
        assert_eq!(timer.expire_info(), None);
        assert_eq!(script.count(), 1);
    }
}
