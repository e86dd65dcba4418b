//! Per-thread open-rack bookkeeping.
//!
//! Each thread keeps one table, indexed by the dense per-arena slot assigned
//! at store creation. The table's destructor is the thread-exit hook: it
//! releases every open rack reference so a rack whose only remaining holder
//! is a defunct thread cannot leak.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::ArenaError;

/// A thread's reference to its currently-open rack for one arena, with the
/// type-erased release hook that drops that reference.
pub(crate) struct OpenRack {
    pub(crate) rack: NonNull<()>,
    pub(crate) store: NonNull<()>,
    pub(crate) release: unsafe fn(store: NonNull<()>, rack: NonNull<()>),
}

const INITIAL_CAPACITY: usize = 16;

struct RackTable {
    entries: Vec<Option<OpenRack>>,
}

impl RackTable {
    fn entry(&mut self, idx: usize) -> &mut Option<OpenRack> {
        if idx >= self.entries.len() {
            let capacity = (idx + 1).max(INITIAL_CAPACITY).next_power_of_two();
            self.entries.resize_with(capacity, || None);
        }
        &mut self.entries[idx]
    }
}

impl Drop for RackTable {
    fn drop(&mut self) {
        for open in self.entries.drain(..).flatten() {
            // SAFETY: the entry was installed by the arena that owns this
            // slot index, with matching store/rack/release monomorphization.
            unsafe { (open.release)(open.store, open.rack) };
        }
    }
}

thread_local! {
    static RACK_TABLE: RefCell<RackTable> = RefCell::new(RackTable { entries: Vec::new() });
}

/// Run `f` on this thread's entry for arena slot `idx`.
///
/// Fails only when the thread-local table is unreachable, i.e. the calling
/// thread is already tearing down.
pub(crate) fn with_entry<R>(
    idx: usize,
    f: impl FnOnce(&mut Option<OpenRack>) -> R,
) -> Result<R, ArenaError> {
    RACK_TABLE
        .try_with(|table| f(table.borrow_mut().entry(idx)))
        .map_err(|_| ArenaError::ThreadContextUnavailable)
}
