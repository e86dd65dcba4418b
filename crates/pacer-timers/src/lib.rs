//! One-shot timer queues with sub-second accuracy.
//!
//! A queue schedules user-supplied notifiers on a monotonic timebase. The
//! threaded flavor ([`ActiveQueue`], usually shared through
//! [`QueueRegistry`]) owns a worker that sleeps until the next expiration;
//! the host-pumped flavor ([`PassiveQueue`]) reports how long its host may
//! sleep. Timer records are recycled through the thread-private rack arena
//! in [`pacer_arena`], so creating and destroying large timer populations
//! stays off the global allocator.
//!
//! The concurrency contract worth knowing up front: callbacks run with no
//! queue lock held, and after [`Timer::cancel`] returns, the callback is not
//! running and will not run again until the next start.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use pacer_timers::{Expire, MonoTime, Notify, QueueRegistry};
//!
//! struct Tick(AtomicUsize);
//! impl Notify for Tick {
//!     fn expire(&self, _now: MonoTime) -> Expire {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!         Expire::NoRestart
//!     }
//! }
//!
//! let queue = QueueRegistry::master().allocate(true, 50).unwrap();
//! let timer = queue.create_timer().unwrap();
//! let tick = Arc::new(Tick(AtomicUsize::new(0)));
//! timer.start_after(tick.clone(), 0.01);
//! std::thread::sleep(std::time::Duration::from_millis(100));
//! assert_eq!(tick.0.load(Ordering::Relaxed), 1);
//! ```

mod active;
mod callback;
mod clock;
mod event;
mod heap;
mod notify;
mod passive;
mod queue;
mod registry;
mod timer;

pub use active::ActiveQueue;
pub use callback::CallbackTimer;
pub use clock::{MonoTime, MonotonicClock};
pub use notify::{Expire, Notify, RestartDelay};
pub use pacer_arena::ArenaError;
pub use passive::PassiveQueue;
pub use registry::{ActiveQueueHandle, QueueRegistry};
pub use timer::Timer;

/// Failures surfaced when building queues and timers. Timer scheduling
/// itself (`start`/`cancel`/`process`) never fails.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// Timer-record storage could not be allocated; fatal at the call site.
    #[error("timer storage allocation failed: {0}")]
    Alloc(#[from] ArenaError),
    /// The worker thread for an active queue could not be spawned.
    #[error("failed to spawn timer worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
