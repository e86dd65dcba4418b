//! Process-wide registry of shared active queues, keyed by priority band.
//!
//! Most callers want one timer thread per priority rather than one per
//! subsystem; the registry reference-counts shared queues so independent
//! subsystems can hold the same worker.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::active::ActiveQueue;
use crate::TimerError;

struct SharedEntry {
    queue: Arc<ActiveQueue>,
    refs: usize,
}

/// The shared-queue registry. One per process; obtain it with
/// [`QueueRegistry::master`].
pub struct QueueRegistry {
    shared: Mutex<Vec<SharedEntry>>,
}

impl QueueRegistry {
    /// The process-wide instance, created on first use. It outlives every
    /// queue it hands out.
    pub fn master() -> &'static QueueRegistry {
        static MASTER: OnceLock<QueueRegistry> = OnceLock::new();
        MASTER.get_or_init(|| QueueRegistry {
            shared: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedEntry>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain an active queue for `priority`.
    ///
    /// With `ok_to_share`, an existing shared queue of the same priority is
    /// reference-counted and returned; otherwise a fresh queue (registered
    /// for sharing iff `ok_to_share`) is created. Dropping the handle
    /// releases the reference and tears the queue down at zero.
    pub fn allocate(
        &'static self,
        ok_to_share: bool,
        priority: u32,
    ) -> Result<ActiveQueueHandle, TimerError> {
        let mut shared = self.lock();
        if ok_to_share {
            if let Some(entry) = shared.iter_mut().find(|e| e.queue.priority() == priority) {
                entry.refs += 1;
                tracing::debug!(priority, refs = entry.refs, "sharing existing timer queue");
                return Ok(ActiveQueueHandle {
                    registry: self,
                    queue: Arc::clone(&entry.queue),
                });
            }
        }

        let queue = Arc::new(ActiveQueue::new(ok_to_share, priority)?);
        tracing::debug!(priority, ok_to_share, "created timer queue");
        if ok_to_share {
            shared.push(SharedEntry {
                queue: Arc::clone(&queue),
                refs: 1,
            });
        }
        Ok(ActiveQueueHandle {
            registry: self,
            queue,
        })
    }

    fn release(&self, queue: &Arc<ActiveQueue>) {
        let unregistered = {
            let mut shared = self.lock();
            match shared.iter_mut().position(|e| Arc::ptr_eq(&e.queue, queue)) {
                Some(idx) => {
                    shared[idx].refs -= 1;
                    if shared[idx].refs == 0 {
                        Some(shared.remove(idx).queue)
                    } else {
                        None
                    }
                }
                // Unshared queues are not registered; the handle's Arc is
                // the only strong reference besides the caller's.
                None => None,
            }
        };
        // The registry's Arc drops here, outside the lock: destroying the
        // queue joins its worker thread.
        drop(unregistered);
    }
}

/// A reference-counted grant on an [`ActiveQueue`].
///
/// Dereferences to the queue; dropping it (or calling
/// [`release`](ActiveQueueHandle::release)) returns the grant, and the last
/// grant on a queue destroys it.
pub struct ActiveQueueHandle {
    registry: &'static QueueRegistry,
    queue: Arc<ActiveQueue>,
}

impl ActiveQueueHandle {
    /// Explicitly return this grant. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Deref for ActiveQueueHandle {
    type Target = ActiveQueue;

    fn deref(&self) -> &ActiveQueue {
        &self.queue
    }
}

impl Drop for ActiveQueueHandle {
    fn drop(&mut self) {
        self.registry.release(&self.queue);
    }
}
