//! Atomically swappable target cell.
//!
//! Readers never lock: they pin the cell, load the current pointer and run
//! against it. Writers swap in a fully built `Arc<T>` and retire the old one;
//! retired targets are dropped by the first writer that observes no pinned
//! reader. Every load, swap and pin uses `SeqCst` so that "no pins seen after
//! my swap" implies every later reader loads the new pointer.
use std::{
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{
            AtomicPtr, AtomicU64, AtomicUsize,
            Ordering::{Relaxed, SeqCst},
        },
    },
};

use parking_lot::Mutex;

pub struct DispatchCell<T> {
    current: AtomicPtr<T>,
    pins: AtomicUsize,
    retired: Mutex<Vec<Arc<T>>>,
    swaps: AtomicU64,
}

// SAFETY: the cell only hands out shared references to T and moves Arc<T>
// between threads, which is what Arc<T>: Send + Sync requires.
unsafe impl<T: Send + Sync> Send for DispatchCell<T> {}
// SAFETY: see above
unsafe impl<T: Send + Sync> Sync for DispatchCell<T> {}

struct Pin<'a>(&'a AtomicUsize);

impl<'a> Pin<'a> {
    #[inline]
    fn new(pins: &'a AtomicUsize) -> Self {
        pins.fetch_add(1, SeqCst);
        Self(pins)
    }
}

impl Drop for Pin<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

impl<T> DispatchCell<T> {
    pub fn new(initial: Arc<T>) -> Self {
        Self {
            current: AtomicPtr::new(Arc::into_raw(initial) as *mut T),
            pins: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
            swaps: AtomicU64::new(0),
        }
    }

    /// Run `f` against the current target. The target stays alive for the
    /// whole call even if another thread replaces it meanwhile.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _pin = Pin::new(&self.pins);
        let ptr = self.current.load(SeqCst);
        // SAFETY: ptr came from Arc::into_raw and is only released by a
        // writer that saw zero pins after swapping it out; we are pinned.
        f(unsafe { &*ptr })
    }

    /// Clone out the current target.
    pub fn load(&self) -> Arc<T> {
        let _pin = Pin::new(&self.pins);
        let ptr = self.current.load(SeqCst);
        // SAFETY: pinned as in `with`, so the strong count is at least one
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Publish a new target. Last writer wins.
    pub fn store(&self, target: Arc<T>) {
        let new = Arc::into_raw(target) as *mut T;
        let old = self.current.swap(new, SeqCst);
        self.swaps.fetch_add(1, Relaxed);

        let mut retired = self.retired.lock();
        // SAFETY: old came from Arc::into_raw in new() or store()
        retired.push(unsafe { Arc::from_raw(old) });
        if self.pins.load(SeqCst) == 0 {
            retired.clear();
        }
    }

    /// Identity of the current target, stable until the next `store`.
    pub fn target_id(&self) -> usize {
        self.current.load(SeqCst) as usize
    }

    /// how many times a target has been published after construction
    pub fn swaps(&self) -> u64 {
        self.swaps.load(Relaxed)
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

impl<T> Drop for DispatchCell<T> {
    fn drop(&mut self) {
        let ptr = *self.current.get_mut();
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: &mut self means no reader is left, ptr is from into_raw
            drop(unsafe { Arc::from_raw(ptr.as_ptr()) });
        }
        self.retired.get_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
    };

    struct Counted {
        value: usize,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, SeqCst);
        }
    }

    fn counted(value: usize, drops: &Arc<AtomicUsize>) -> Arc<Counted> {
        Arc::new(Counted {
            value,
            drops: drops.clone(),
        })
    }

    #[test]
    fn store_replaces_target_and_reclaims_unpinned_ones() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = DispatchCell::new(counted(1, &drops));
        assert_eq!(cell.with(|t| t.value), 1);

        cell.store(counted(2, &drops));
        assert_eq!(cell.with(|t| t.value), 2);
        assert_eq!(drops.load(SeqCst), 1, "unpinned old target is dropped");
        assert_eq!(cell.retired_len(), 0);
        assert_eq!(cell.swaps(), 1);

        drop(cell);
        assert_eq!(drops.load(SeqCst), 2);
    }

    #[test]
    fn target_replaced_while_running_stays_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = DispatchCell::new(counted(1, &drops));

        let seen = cell.with(|t| {
            cell.store(counted(2, &drops));
            // we are still pinned, so the old target must not be gone
            assert_eq!(drops.load(SeqCst), 0);
            t.value
        });
        assert_eq!(seen, 1);
        assert_eq!(cell.retired_len(), 1, "old target waits for a later writer");

        cell.store(counted(3, &drops));
        assert_eq!(drops.load(SeqCst), 2);
        assert_eq!(cell.retired_len(), 0);
    }

    #[test]
    fn load_keeps_a_strong_reference() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = DispatchCell::new(counted(7, &drops));
        let held = cell.load();
        cell.store(counted(8, &drops));
        assert_eq!(held.value, 7);
        assert_eq!(drops.load(SeqCst), 0);
        drop(held);
        assert_eq!(drops.load(SeqCst), 1);
    }

    #[test]
    fn target_identity_changes_only_on_store() {
        let cell = DispatchCell::new(Arc::new(0u32));
        let id = cell.target_id();
        cell.with(|_| ());
        assert_eq!(cell.target_id(), id);
        cell.store(Arc::new(1u32));
        assert_ne!(cell.target_id(), id);
    }

    #[test]
    fn readers_only_ever_observe_complete_targets() {
        let cell = Arc::new(DispatchCell::new(Arc::new((0usize, 0usize))));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut reads = 0usize;
                    while !stop.load(SeqCst) {
                        cell.with(|&(a, b)| assert_eq!(a, b, "torn target observed"));
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for i in 1..2000usize {
            cell.store(Arc::new((i, i)));
        }
        stop.store(true, SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cell.with(|&(a, _)| a), 1999);
    }
}
