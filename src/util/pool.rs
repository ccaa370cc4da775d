//! Bounded object pool for per-tick scratch collections
//!
//! Free objects live in a fixed-capacity ring buffer. Acquiring from an empty
//! pool allocates fresh; releasing into a full pool drops the object. Neither
//! path blocks or fails.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Objects that can be reset for reuse
pub trait Recycle: Default {
    /// Clear contents while keeping allocated capacity
    fn recycle(&mut self);
}

impl<T: std::hash::Hash + Eq, S: std::hash::BuildHasher + Default> Recycle
    for std::collections::HashSet<T, S>
{
    fn recycle(&mut self) {
        self.clear();
    }
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub reused: u64,
    pub allocated: u64,
    pub discarded: u64,
}

pub struct Pool<T: Recycle> {
    free: Mutex<VecDeque<T>>,
    capacity: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Recycle> Pool<T> {
    /// Create a pool retaining at most `capacity` free objects
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Take an object, returned to the pool when the guard drops
    #[inline]
    pub fn acquire(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            value: Some(self.take()),
        }
    }

    /// Take an object without a guard. Caller is responsible for `release`.
    pub fn take(&self) -> T {
        match self.free.lock().pop_front() {
            Some(value) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Return an object to the pool
    pub fn release(&self, mut value: T) {
        value.recycle();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push_back(value);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of free objects currently held
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reused: self.reused.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Scoped pool object. Goes back to its pool on drop unless detached.
pub struct Pooled<'a, T: Recycle> {
    pool: &'a Pool<T>,
    value: Option<T>,
}

impl<T: Recycle> Pooled<'_, T> {
    /// Detach from the pool; the caller now owns the object
    pub fn into_inner(mut self) -> T {
        // value is only None after drop or a previous into_inner, both consume self
        self.value.take().unwrap_or_default()
    }
}

impl<T: Recycle> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after detach"),
        }
    }
}

impl<T: Recycle> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after detach"),
        }
    }
}

impl<T: Recycle> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}
