use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::rack::Rack;

/// How a store services rack checkout and retirement.
///
/// [`FreeList`] (the default) recycles retired rack buffers through a
/// mutex-protected list; the list is touched only when a thread exhausts its
/// open rack, never per allocation. [`Pool`] goes straight to the global
/// allocator and keeps only the counters.
pub trait RackPolicy: Send + Sync + 'static {
    #[doc(hidden)]
    const RECYCLES: bool;
}

/// Recycle retired racks through a shared free list.
pub struct FreeList;

/// Allocate and free racks through the global allocator.
pub struct Pool;

impl RackPolicy for FreeList {
    const RECYCLES: bool = true;
}

impl RackPolicy for Pool {
    const RECYCLES: bool = false;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared side of one arena instantiation: the retired-rack free list (or the
/// pool passthrough) and the outstanding-rack counters.
pub(crate) struct RackStore<T, const N: usize> {
    /// Dense index of this arena in every thread's open-rack table.
    pub(crate) thread_slot: usize,
    recycles: bool,
    free: Mutex<Vec<NonNull<Rack<T, N>>>>,
    racks: AtomicUsize,
    bytes: AtomicUsize,
    trace_at: AtomicUsize,
}

// The free list holds exclusively-owned rack buffers behind a mutex; the
// counters are atomics.
unsafe impl<T: Send, const N: usize> Send for RackStore<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for RackStore<T, N> {}

impl<T: 'static, const N: usize> RackStore<T, N> {
    fn new(thread_slot: usize, recycles: bool) -> Self {
        RackStore {
            thread_slot,
            recycles,
            free: Mutex::new(Vec::new()),
            racks: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            trace_at: AtomicUsize::new(8),
        }
    }

    /// Hand out a fresh or recycled rack with a zero reference count.
    pub(crate) fn checkout(&self) -> NonNull<Rack<T, N>> {
        let recycled = if self.recycles { lock(&self.free).pop() } else { None };
        let rack = match recycled {
            Some(rack) => {
                // SAFETY: racks on the free list have no outstanding
                // references; nothing else can observe this one yet.
                unsafe { rack.as_ref() }.reset();
                rack
            }
            None => {
                // SAFETY: Box::into_raw never returns null.
                unsafe { NonNull::new_unchecked(Box::into_raw(Rack::new_boxed())) }
            }
        };

        let outstanding = self.racks.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(size_of::<Rack<T, N>>(), Ordering::Relaxed);
        let trace_at = self.trace_at.load(Ordering::Relaxed);
        if outstanding >= trace_at
            && self
                .trace_at
                .compare_exchange(trace_at, trace_at * 2, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::trace!(
                ty = std::any::type_name::<T>(),
                racks = outstanding,
                bytes = self.bytes.load(Ordering::Relaxed),
                "arena rack population doubled"
            );
        }
        rack
    }

    /// Take back a rack whose reference count reached zero.
    pub(crate) fn retire(&self, rack: NonNull<Rack<T, N>>) {
        self.racks.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size_of::<Rack<T, N>>(), Ordering::Relaxed);
        if self.recycles {
            lock(&self.free).push(rack);
        } else {
            // SAFETY: the rack came from `checkout` via Box::into_raw and has
            // no outstanding references.
            drop(unsafe { Box::from_raw(rack.as_ptr()) });
        }
    }

    pub(crate) fn rack_count(&self) -> usize {
        self.racks.load(Ordering::Relaxed)
    }

    pub(crate) fn byte_count(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

type StoreRegistry = Mutex<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>;

fn registry() -> &'static StoreRegistry {
    static REGISTRY: OnceLock<StoreRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

/// Look up (creating on first use) the process-wide store for one arena
/// instantiation. Stores live for the rest of the process; teardown-order
/// problems between racks and the threads using them cannot arise.
pub(crate) fn store_for<T, G, P, const N: usize>() -> &'static RackStore<T, N>
where
    T: Send + 'static,
    G: 'static,
    P: RackPolicy,
{
    let key = TypeId::of::<(T, G, P, [(); N])>();
    let mut map = lock(registry());
    let entry: &'static (dyn Any + Send + Sync) = *map.entry(key).or_insert_with(|| {
        let slot = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
        let store: &'static RackStore<T, N> =
            Box::leak(Box::new(RackStore::new(slot, P::RECYCLES)));
        store
    });
    drop(map);
    entry
        .downcast_ref::<RackStore<T, N>>()
        .expect("arena store registry entry has mismatched type")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TagA;
    struct TagB;

    #[test]
    fn stores_are_distinct_per_instantiation() {
        let a = store_for::<u32, TagA, FreeList, 8>();
        let a2 = store_for::<u32, TagA, FreeList, 8>();
        let b = store_for::<u32, TagB, FreeList, 8>();
        assert!(std::ptr::eq(a, a2));
        assert!(!std::ptr::eq(a, b));
        assert_ne!(a.thread_slot, b.thread_slot);
    }

    #[test]
    fn free_list_recycles_the_same_buffer() {
        let store = store_for::<u64, TagA, FreeList, 4>();
        let rack = store.checkout();
        assert_eq!(store.rack_count(), 1);
        store.retire(rack);
        assert_eq!(store.rack_count(), 0);

        let again = store.checkout();
        assert_eq!(again, rack);
        store.retire(again);
    }

    #[test]
    fn pool_frees_instead_of_recycling() {
        let store = store_for::<u64, TagA, Pool, 4>();
        let rack = store.checkout();
        assert_eq!(store.byte_count(), size_of::<Rack<u64, 4>>());
        store.retire(rack);
        assert_eq!(store.rack_count(), 0);
        assert_eq!(store.byte_count(), 0);
    }
}
