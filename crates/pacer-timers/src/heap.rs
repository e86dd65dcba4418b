//! Mutable-priority min-heap of pending timers, keyed by expiration.
//!
//! Entries carry a copy of the key; the pending timer caches its own slot
//! index, which the heap rewrites on every move. That makes erase-by-timer
//! and key-update O(log n) without a scan. Order between equal expirations
//! is unspecified.
//!
//! Every method must be called with the owning queue's mutex held; the heap
//! lives inside the queue state, so that holds by construction.

use crate::clock::MonoTime;
use crate::timer::TimerRef;

#[derive(Clone, Copy)]
struct HeapEntry {
    expiration: MonoTime,
    timer: TimerRef,
}

pub(crate) struct TimerHeap {
    entries: Vec<HeapEntry>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        TimerHeap { entries: Vec::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn top(&self) -> Option<(TimerRef, MonoTime)> {
        self.entries.first().map(|e| (e.timer, e.expiration))
    }

    /// Insert a limbo timer; its cached index is written before sifting.
    pub(crate) fn push(&mut self, timer: TimerRef, expiration: MonoTime) {
        let pos = self.entries.len();
        self.entries.push(HeapEntry { expiration, timer });
        self.write_pos(pos);
        self.sift_up(pos);
    }

    /// Remove the entry at `pos` (the timer's cached index); the removed
    /// timer's index is cleared.
    pub(crate) fn erase(&mut self, pos: usize) {
        debug_assert!(pos < self.entries.len());
        self.clear_pos(pos);
        let last = self.entries.len() - 1;
        if pos == last {
            self.entries.pop();
            return;
        }
        self.entries.swap_remove(pos);
        self.write_pos(pos);
        self.resift(pos);
    }

    /// Re-establish order for the timer at `pos` after its expiration was
    /// mutated in place.
    pub(crate) fn update(&mut self, pos: usize, expiration: MonoTime) {
        debug_assert!(pos < self.entries.len());
        self.entries[pos].expiration = expiration;
        self.resift(pos);
    }

    /// Pending timers in storage order, for debug dumps only.
    pub(crate) fn iter_timers(&self) -> impl Iterator<Item = TimerRef> + '_ {
        self.entries.iter().map(|e| e.timer)
    }

    fn resift(&mut self, pos: usize) {
        if pos > 0 && self.entries[pos].expiration < self.entries[(pos - 1) / 2].expiration {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].expiration >= self.entries[parent].expiration {
                break;
            }
            self.entries.swap(pos, parent);
            self.write_pos(pos);
            self.write_pos(parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.entries[right].expiration < self.entries[left].expiration {
                child = right;
            }
            if self.entries[child].expiration >= self.entries[pos].expiration {
                break;
            }
            self.entries.swap(pos, child);
            self.write_pos(pos);
            self.write_pos(child);
            pos = child;
        }
    }

    fn write_pos(&self, pos: usize) {
        // SAFETY: the queue mutex is held (module invariant) and timers are
        // only in the heap while their handle is alive; the borrow ends
        // within this statement.
        unsafe { self.entries[pos].timer.core_mut().heap_pos = Some(pos) };
    }

    fn clear_pos(&self, pos: usize) {
        // SAFETY: as in `write_pos`.
        unsafe { self.entries[pos].timer.core_mut().heap_pos = None };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerCell;

    // Synthetic instants relative to the epoch keep the arithmetic exact.
    const BASE: MonoTime = MonoTime::ZERO;

    fn cells(n: usize) -> Vec<&'static TimerCell> {
        (0..n).map(|_| &*Box::leak(Box::new(TimerCell::new()))).collect()
    }

    fn pos_of(cell: &TimerCell) -> Option<usize> {
        // SAFETY: single-threaded test, no queue involved.
        unsafe { TimerRef::new(cell).core_mut().heap_pos }
    }

    fn set_expiration(cell: &TimerCell, at: MonoTime) {
        // SAFETY: as above.
        unsafe { TimerRef::new(cell).core_mut().expiration = at };
    }

    fn drain_delays(heap: &mut TimerHeap) -> Vec<f64> {
        let mut seen = Vec::new();
        while let Some((_, expiration)) = heap.top() {
            seen.push(expiration - BASE);
            heap.erase(0);
        }
        seen
    }

    #[test]
    fn top_is_always_the_minimum() {
        let cells = cells(6);
        let delays = [5.0, 1.0, 4.0, 0.5, 3.0, 2.0];

        let mut heap = TimerHeap::new();
        for (cell, delay) in cells.iter().zip(delays) {
            heap.push(TimerRef::new(cell), BASE + delay);
        }
        assert_eq!(heap.len(), 6);
        assert_eq!(pos_of(cells[3]), Some(0));

        assert_eq!(drain_delays(&mut heap), vec![0.5, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn cached_indices_track_every_move() {
        let cells = cells(8);

        let mut heap = TimerHeap::new();
        for (i, cell) in cells.iter().enumerate() {
            heap.push(TimerRef::new(cell), BASE + (8 - i) as f64);
        }
        for cell in &cells {
            let pos = pos_of(cell).unwrap();
            assert_eq!(heap.entries[pos].timer, TimerRef::new(cell));
        }
    }

    #[test]
    fn erase_from_the_middle_keeps_order() {
        let cells = cells(7);
        let mut heap = TimerHeap::new();
        for (i, cell) in cells.iter().enumerate() {
            heap.push(TimerRef::new(cell), BASE + i as f64);
        }

        let victim = cells[3];
        heap.erase(pos_of(victim).unwrap());
        assert_eq!(pos_of(victim), None);
        assert_eq!(heap.len(), 6);

        assert_eq!(drain_delays(&mut heap), vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn update_reorders_in_both_directions() {
        let cells = cells(5);
        let mut heap = TimerHeap::new();
        for (i, cell) in cells.iter().enumerate() {
            heap.push(TimerRef::new(cell), BASE + 1.0 + i as f64);
        }

        // Move the last timer to the front.
        set_expiration(cells[4], BASE + 0.1);
        heap.update(pos_of(cells[4]).unwrap(), BASE + 0.1);
        assert_eq!(heap.top().unwrap().0, TimerRef::new(cells[4]));

        // Then push the current head to the back.
        set_expiration(cells[4], BASE + 9.0);
        heap.update(pos_of(cells[4]).unwrap(), BASE + 9.0);
        assert_eq!(heap.top().unwrap().0, TimerRef::new(cells[0]));

        assert_eq!(drain_delays(&mut heap), vec![1.0, 2.0, 3.0, 4.0, 9.0]);
    }

    #[test]
    fn empty_heap_has_no_top() {
        let heap = TimerHeap::new();
        assert!(heap.is_empty());
        assert!(heap.top().is_none());
    }
}
