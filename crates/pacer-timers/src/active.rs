//! The threaded driver: a worker that sleeps until the next expiration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::callback::CallbackTimer;
use crate::clock::{MonoTime, MonotonicClock};
use crate::event::Event;
use crate::queue::{QueueCore, QueueNotify};
use crate::timer::Timer;
use crate::TimerError;

/// A timer queue with its own worker thread.
///
/// The worker delivers expirations and then sleeps until the next deadline
/// or until a start moves the head of the queue earlier. Most callers obtain
/// one through [`QueueRegistry::allocate`](crate::QueueRegistry::allocate)
/// so that a single worker per priority band is shared process-wide.
pub struct ActiveQueue {
    core: Arc<QueueCore>,
    wakeup: Arc<Event>,
    terminate: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ok_to_share: bool,
    priority: u32,
}

/// Reschedule hook handed to the queue core: waking the worker is all it
/// takes, the worker re-reads the head deadline on every pass.
struct WakeWorker(Arc<Event>);

impl QueueNotify for WakeWorker {
    fn reschedule(&self) {
        self.0.signal();
    }
}

impl ActiveQueue {
    /// Spawn a queue with a dedicated worker thread. `priority` is the
    /// band label used for registry sharing and the worker's thread name.
    pub fn new(ok_to_share: bool, priority: u32) -> Result<Self, TimerError> {
        let wakeup = Arc::new(Event::new());
        let core = QueueCore::new(Box::new(WakeWorker(Arc::clone(&wakeup))));
        let terminate = Arc::new(AtomicBool::new(false));

        let worker = std::thread::Builder::new()
            .name(format!("pacer-timer-p{priority}"))
            .spawn({
                let core = Arc::clone(&core);
                let wakeup = Arc::clone(&wakeup);
                let terminate = Arc::clone(&terminate);
                move || run_worker(core, wakeup, terminate)
            })?;

        Ok(ActiveQueue {
            core,
            wakeup,
            terminate,
            worker: Mutex::new(Some(worker)),
            ok_to_share,
            priority,
        })
    }

    /// Create a timer driven by this queue's worker.
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

    /// Wake the worker so it re-reads the next deadline. Idempotent.
    pub fn reschedule(&self) {
        self.wakeup.signal();
    }

    pub fn sharing_ok(&self) -> bool {
        self.ok_to_share
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Timers currently scheduled.
    pub fn pending_count(&self) -> usize {
        self.core.pending_count()
    }

    /// Log the queue state; deeper levels dump pending timers and notifiers.
    pub fn show(&self, level: u32) {
        tracing::info!(
            priority = self.priority,
            ok_to_share = self.ok_to_share,
            "active timer queue"
        );
        if level >= 1 {
            self.core.show(level - 1);
        }
    }
}

impl Drop for ActiveQueue {
    fn drop(&mut self) {
        self.terminate.store(true, Ordering::Release);
        self.wakeup.signal();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            // Never the queue mutex here: the worker may be inside process()
            // taking it.
            let _ = worker.join();
        }
    }
}

fn run_worker(core: Arc<QueueCore>, wakeup: Arc<Event>, terminate: Arc<AtomicBool>) {
    tracing::debug!("timer worker started");
    while !terminate.load(Ordering::Acquire) {
        let delay_s = core.process(MonotonicClock::now());
        wakeup.wait_timeout(delay_s);
    }
    tracing::debug!("timer worker stopped");
}
