//! Fixed-capacity object pool for the capture pipeline.
//!
//! The camera pipeline recycles two kinds of objects at frame rate: capture
//! buffer records owned by the capture unit, and per-request control state
//! owned by the control unit. Both are bounded by the platform pipeline
//! depth, so the pool here never grows. Running out of items is a
//! backpressure signal the caller must handle, not a reason to allocate.
//!
//! # Safety Model
//!
//! The pool uses a semaphore + lock-free queue pattern:
//! 1. Semaphore tracks available slots (permits = available items)
//! 2. `SegQueue` holds indices of free slots (lock-free)
//! 3. Slots live in a boxed slice that is never resized
//! 4. `Loaned` caches the slot pointer for lock-free access
//!
//! Each permit corresponds to exactly one index in the free queue, so a slot
//! is never handed to two holders at once.
//!
//! # Example
//!
//! ```
//! use hal_pool::ItemPool;
//!
//! let pool = ItemPool::new_with_reset(4, || vec![0u8; 64], |buf| buf.fill(0));
//!
//! let mut item = pool.try_acquire().unwrap();
//! item[0] = 42;
//! assert_eq!(pool.available(), 3);
//!
//! // Returned to the pool (and reset) when dropped
//! drop(item);
//! assert_eq!(pool.available(), 4);
//! assert_eq!(pool.try_acquire().unwrap()[0], 0);
//! ```

use crossbeam_queue::SegQueue;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

/// Type alias for reset function used when returning items to the pool.
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Bounded pool of pre-allocated objects.
///
/// # Type Parameters
/// - `T`: The type of object to pool (must be `Send`)
///
/// # Safety
///
/// This type uses `UnsafeCell` internally but is safe because:
/// 1. Semaphore ensures at most `capacity` permits outstanding
/// 2. Each permit corresponds to exactly one slot index
/// 3. `SegQueue` ensures each index held by at most one `Loaned`
/// 4. The slot slice is never reallocated, so cached pointers stay valid
pub struct ItemPool<T> {
    slots: Box<[UnsafeCell<T>]>,
    /// Lock-free queue of available slot indices
    free_indices: SegQueue<usize>,
    /// Semaphore counting available items
    semaphore: Semaphore,
    /// Optional reset function called when item returned to pool
    reset_fn: Option<ResetFn<T>>,
}

// SAFETY: Pool is Send+Sync because:
// 1. UnsafeCell contents accessed only when holding a semaphore permit
// 2. Each permit corresponds to exactly one slot
// 3. T: Send allows transfer between threads
unsafe impl<T: Send> Send for ItemPool<T> {}
unsafe impl<T: Send> Sync for ItemPool<T> {}

impl<T: Send + 'static> ItemPool<T> {
    /// Create a new pool with the specified capacity, factory, and optional reset function.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new<F, R>(capacity: usize, factory: F, reset: Option<R>) -> Arc<Self>
    where
        F: Fn() -> T,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        assert!(capacity > 0, "pool capacity must be greater than 0");

        let slots: Box<[UnsafeCell<T>]> =
            (0..capacity).map(|_| UnsafeCell::new(factory())).collect();

        let free_indices = SegQueue::new();
        for i in 0..capacity {
            free_indices.push(i);
        }

        Arc::new(Self {
            slots,
            free_indices,
            semaphore: Semaphore::new(capacity),
            reset_fn: reset.map(|f| Box::new(f) as ResetFn<T>),
        })
    }

    /// Create a new pool without a reset function.
    pub fn new_simple<F>(capacity: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> T,
    {
        Self::new(capacity, factory, None::<fn(&mut T)>)
    }

    /// Create a new pool with a reset function.
    pub fn new_with_reset<F, R>(capacity: usize, factory: F, reset: R) -> Arc<Self>
    where
        F: Fn() -> T,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::new(capacity, factory, Some(reset))
    }

    /// Try to acquire an item without blocking (acquireItem).
    ///
    /// Returns `None` if every item is currently loaned out. The pool never
    /// allocates past its capacity.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<Loaned<T>> {
        let permit = self.semaphore.try_acquire().ok()?;
        permit.forget();
        let Some(idx) = self.free_indices.pop() else {
            error!(
                pool_type = std::any::type_name::<T>(),
                capacity = self.capacity(),
                "Free list empty after permit"
            );
            self.semaphore.add_permits(1);
            return None;
        };
        Some(Loaned {
            pool: Arc::clone(self),
            idx,
            slot_ptr: self.slots[idx].get(),
        })
    }

    /// Release an item back to the pool (releaseItem).
    ///
    /// Called automatically by `Loaned::drop`.
    fn release(&self, idx: usize) {
        if let Some(reset_fn) = &self.reset_fn {
            // SAFETY: the loan for this slot is being dropped, no other reference exists
            let item = unsafe { &mut *self.slots[idx].get() };
            reset_fn(item);
        }

        self.free_indices.push(idx);
        self.semaphore.add_permits(1);
    }

    /// Total number of items owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of items currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of items currently loaned out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }
}

/// RAII guard for a loaned item from the pool.
///
/// Dereferences to the pooled item without locking and returns it to the
/// pool when dropped.
pub struct Loaned<T: Send + 'static> {
    pool: Arc<ItemPool<T>>,
    idx: usize,
    /// SAFETY: valid for the lifetime of the loan because the slot slice is
    /// never reallocated and this slot is exclusively ours until drop().
    slot_ptr: *mut T,
}

// SAFETY: Loaned is Send+Sync because:
// 1. We have exclusive access to our slot via semaphore
// 2. T: Send allows transfer between threads
unsafe impl<T: Send + 'static> Send for Loaned<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Loaned<T> {}

impl<T: Send + 'static> Loaned<T> {
    /// Get immutable reference to the loaned item.
    #[inline]
    #[must_use]
    pub fn get(&self) -> &T {
        // SAFETY: exclusive access via semaphore permit
        unsafe { &*self.slot_ptr }
    }

    /// Get mutable reference to the loaned item.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: exclusive access via semaphore permit; &mut self ensures uniqueness
        unsafe { &mut *self.slot_ptr }
    }

    /// Slot index, stable for the life of the pool.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.idx
    }
}

impl<T: Send + 'static> Deref for Loaned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl<T: Send + 'static> DerefMut for Loaned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for Loaned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaned")
            .field("slot", &self.idx)
            .field("item", self.get())
            .finish()
    }
}

impl<T: Send + 'static> Drop for Loaned<T> {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_pool_basic() {
        let pool = ItemPool::new_with_reset(2, || vec![0u8; 100], |v| v.fill(0));

        let mut item1 = pool.try_acquire().unwrap();
        item1[0] = 42;
        drop(item1);

        let item2 = pool.try_acquire().unwrap();
        assert_eq!(item2[0], 0);
    }

    #[test]
    fn test_try_acquire_exhausted_does_not_grow() {
        let pool = ItemPool::new_simple(2, || 0i32);

        let a = pool.try_acquire();
        let b = pool.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    #[should_panic(expected = "pool capacity must be greater than 0")]
    fn test_zero_capacity_panics() {
        let _ = ItemPool::new_simple(0, || 0i32);
    }

    #[test]
    fn test_reset_function_called() {
        let reset_count = Arc::new(AtomicUsize::new(0));
        let reset_count_clone = Arc::clone(&reset_count);

        let pool = ItemPool::new_with_reset(
            1,
            || 0i32,
            move |_| {
                reset_count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        drop(pool.try_acquire().unwrap());
        drop(pool.try_acquire().unwrap());
        assert_eq!(reset_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_threads_never_share_a_slot() {
        let pool = ItemPool::new_simple(4, || 0usize);
        let held: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(item) = pool.try_acquire() {
                            assert!(
                                held.lock().unwrap().insert(item.slot_index()),
                                "slot handed out twice"
                            );
                            assert!(pool.in_use() <= pool.capacity());
                            held.lock().unwrap().remove(&item.slot_index());
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_slot_index() {
        let pool = ItemPool::new_simple(3, || 0i32);

        let item0 = pool.try_acquire().unwrap();
        let item1 = pool.try_acquire().unwrap();
        let item2 = pool.try_acquire().unwrap();

        let mut indices = vec![item0.slot_index(), item1.slot_index(), item2.slot_index()];
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
