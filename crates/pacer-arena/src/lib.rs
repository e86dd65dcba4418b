//! Thread-private arena allocation for small fixed-type objects.
//!
//! An [`Arena`] hands out storage for single values of one type `T` in
//! *racks*: fixed-capacity contiguous blocks. Each thread keeps at most one
//! open rack per arena and carves slots off it with no locking; the only
//! shared synchronization on the allocation path is one relaxed refcount
//! increment. When a thread exhausts its rack it checks a fresh one out of
//! the shared store, and a rack is handed back (to a free list, by default)
//! only once every slot carved from it has been released *and* no thread
//! still holds it open.
//!
//! Arenas are distinguished by `(T, G, N, P)`: the value type, a group tag
//! that lets independent subsystems keep independent thread-private state,
//! the rack capacity, and the store policy.
//!
//! ```
//! use pacer_arena::Arena;
//!
//! struct MyGroup;
//! let arena = Arena::<u64, MyGroup>::instance();
//! let boxed = arena.alloc(7).unwrap();
//! assert_eq!(*boxed, 7);
//! ```

mod rack;
mod store;
mod thread_ctx;

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use rack::{Rack, Slot};
use store::RackStore;
use thread_ctx::OpenRack;

pub use store::{FreeList, Pool, RackPolicy};

/// Arena allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The per-thread bookkeeping could not be reached, which only happens
    /// while the calling thread is tearing down. Fatal at the call site.
    #[error("thread-private allocation context unavailable")]
    ThreadContextUnavailable,
}

/// The default group tag for arenas that do not need an isolated one.
pub struct DefaultGroup;

/// Handle to the process-wide arena for one `(T, G, N, P)` instantiation.
///
/// The handle is `Copy` and free to obtain; the backing state is created on
/// first use and lives for the rest of the process.
pub struct Arena<T: Send + 'static, G = DefaultGroup, P = FreeList, const N: usize = 256> {
    store: &'static RackStore<T, N>,
    _marker: PhantomData<(fn() -> G, fn() -> P)>,
}

impl<T: Send + 'static, G, P, const N: usize> Clone for Arena<T, G, P, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Send + 'static, G, P, const N: usize> Copy for Arena<T, G, P, N> {}

impl<T, G, P, const N: usize> Arena<T, G, P, N>
where
    T: Send + 'static,
    G: 'static,
    P: RackPolicy,
{
    /// Get the arena, creating its shared store on first use.
    pub fn instance() -> Self {
        Arena {
            store: store::store_for::<T, G, P, N>(),
            _marker: PhantomData,
        }
    }

    /// Allocate storage for one `T` and move `value` into it.
    ///
    /// Fails only when the calling thread's arena bookkeeping is unreachable
    /// (the thread is exiting); callers treat that as a fatal allocation
    /// failure.
    pub fn alloc(&self, value: T) -> Result<ArenaBox<T, N>, ArenaError> {
        let store = self.store;
        let slot = thread_ctx::with_entry(store.thread_slot, |entry| {
            let rack = match entry {
                Some(open) => open.rack.cast::<Rack<T, N>>(),
                None => {
                    let rack = store.checkout();
                    // The thread's open-rack reference.
                    // SAFETY: freshly checked out, nothing else sees it yet.
                    unsafe { rack.as_ref() }.add_ref();
                    *entry = Some(OpenRack {
                        rack: rack.cast(),
                        store: NonNull::from(store).cast(),
                        release: release_open::<T, N>,
                    });
                    rack
                }
            };
            // SAFETY: the entry at our slot index is always a rack of this
            // arena's instantiation, held open by this thread.
            let rack = unsafe { rack.as_ref() };
            let slot = rack.carve();
            if rack.is_exhausted() {
                // Drop the open-rack reference now so the rack can drain as
                // its live slots are released; the next alloc checks out a
                // fresh one.
                let open = entry.take().expect("open rack entry vanished");
                // SAFETY: installed above with matching monomorphization.
                unsafe { (open.release)(open.store, open.rack) };
            }
            slot
        })?;

        // SAFETY: the slot was just carved: reserved for us, uninitialized.
        unsafe { slot.as_ref().value_ptr().write(value) };
        Ok(ArenaBox {
            slot,
            store,
            _marker: PhantomData,
        })
    }

    /// Drop the calling thread's reference to its currently-open rack, so a
    /// partially-consumed rack can drain back into the shared store. Runs
    /// automatically at thread exit; a long-lived thread that has stopped
    /// allocating can call it eagerly.
    pub fn release_thread_rack(&self) {
        let _ = thread_ctx::with_entry(self.store.thread_slot, |entry| {
            if let Some(open) = entry.take() {
                // SAFETY: installed by this arena with matching types.
                unsafe { (open.release)(open.store, open.rack) };
            }
        });
    }

    /// Racks currently checked out of the shared store.
    pub fn rack_count(&self) -> usize {
        self.store.rack_count()
    }

    /// Bytes held by checked-out racks.
    pub fn byte_count(&self) -> usize {
        self.store.byte_count()
    }
}

/// Release hook for a thread's open-rack reference, monomorphized per
/// instantiation and stored type-erased in the thread table.
unsafe fn release_open<T: Send + 'static, const N: usize>(store: NonNull<()>, rack: NonNull<()>) {
    let store = store.cast::<RackStore<T, N>>();
    let rack = rack.cast::<Rack<T, N>>();
    if rack.as_ref().remove_ref() {
        store.as_ref().retire(rack);
    }
}

/// Owner of one `T` allocated from an [`Arena`].
///
/// Dropping the box drops the value and releases its slot; the last released
/// slot of a rack that no thread holds open sends the rack back to the store.
pub struct ArenaBox<T: Send + 'static, const N: usize> {
    slot: NonNull<Slot<T>>,
    store: &'static RackStore<T, N>,
    _marker: PhantomData<T>,
}

// An ArenaBox is an owning pointer: moving it between threads moves the `T`,
// and sharing it shares the `T`.
unsafe impl<T: Send + 'static, const N: usize> Send for ArenaBox<T, N> {}
unsafe impl<T: Send + Sync + 'static, const N: usize> Sync for ArenaBox<T, N> {}

impl<T: Send + 'static, const N: usize> Deref for ArenaBox<T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the slot holds an initialized `T` for the box's lifetime.
        unsafe { &*self.slot.as_ref().value_ptr() }
    }
}

impl<T: Send + 'static, const N: usize> DerefMut for ArenaBox<T, N> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, plus we hold the unique owning handle.
        unsafe { &mut *self.slot.as_ref().value_ptr() }
    }
}

impl<T: Send + 'static, const N: usize> Drop for ArenaBox<T, N> {
    fn drop(&mut self) {
        // SAFETY: we own the slot; the back-pointer was written at carve
        // time and the rack outlives its live slots by refcount.
        unsafe {
            let slot = self.slot.as_ref();
            std::ptr::drop_in_place(slot.value_ptr());
            let rack = slot.rack_ptr().cast::<Rack<T, N>>();
            debug_assert!(!rack.is_null());
            if (*rack).remove_ref() {
                self.store.retire(NonNull::new_unchecked(rack.cast_mut()));
            }
        }
    }
}

impl<T: Send + fmt::Debug + 'static, const N: usize> fmt::Debug for ArenaBox<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_round_trips_the_value() {
        struct RoundTrip;
        let arena = Arena::<String, RoundTrip>::instance();
        let mut s = arena.alloc(String::from("hello")).unwrap();
        s.push_str(" world");
        assert_eq!(&*s, "hello world");
    }

    #[test]
    fn drop_runs_the_value_destructor() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        struct DropGroup;
        let arena = Arena::<Counted, DropGroup>::instance();
        let a = arena.alloc(Counted).unwrap();
        let b = arena.alloc(Counted).unwrap();
        drop(a);
        drop(b);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn single_slot_racks_never_stay_open() {
        struct TinyGroup;
        let arena = Arena::<u32, TinyGroup, FreeList, 1>::instance();
        let a = arena.alloc(1).unwrap();
        let b = arena.alloc(2).unwrap();
        assert_eq!(arena.rack_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(arena.rack_count(), 0);
    }
}
