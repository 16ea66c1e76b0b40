//! Bounded recycler for per-request entities. `acquire` never
//! allocates beyond a miss; `release` drops silently once the pool is full.
//! Generalizes the teacher's `ConnectionSlab` free-list discipline
//! (`slab.rs`) to an arbitrary `T` instead of a fixed `Conn`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct ObjectPool<T> {
    idle: Mutex<Vec<T>>,
    capacity: AtomicUsize,
    misses: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl<T> ObjectPool<T> {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(initial_capacity)),
            capacity: AtomicUsize::new(initial_capacity),
            misses: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Pops an idle instance and resets it via `reset`, or allocates a new
    /// one via `make` on a miss (counted).
    pub fn acquire<F, R>(&self, make: F, reset: R) -> T
    where
        F: FnOnce() -> T,
        R: FnOnce(&mut T),
    {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let popped = self.idle.lock().unwrap().pop();
        match popped {
            Some(mut instance) => {
                reset(&mut instance);
                instance
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                make()
            }
        }
    }

    /// Returns `instance` to the idle set, or drops it if the pool is at
    /// capacity. Caller must never release the same logical instance twice.
    pub fn release(&self, instance: T) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let cap = self.capacity.load(Ordering::Relaxed);
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < cap {
            idle.push(instance);
        }
        // else: drop on the floor, the underlying memory is reclaimed normally.
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.acquired.load(Ordering::Relaxed) - self.released.load(Ordering::Relaxed)
    }

    /// Adaptive capacity step. Called by a background observer on a
    /// 30s tick; grows 1.5x (up to `ceiling`) when misses exceed 10% of
    /// capacity, shrinks 20% (down to `floor`) after a sustained zero-miss
    /// window. Resizing only changes the admission limit; in-flight
    /// entities are never relocated.
    pub fn adjust_capacity(&self, misses_since_last_tick: usize, idle_minutes: u64, floor: usize, ceiling: usize) {
        let cap = self.capacity.load(Ordering::Relaxed);
        if misses_since_last_tick * 10 > cap {
            let grown = ((cap as f64) * 1.5).ceil() as usize;
            self.capacity.store(grown.min(ceiling).max(cap), Ordering::Relaxed);
        } else if misses_since_last_tick == 0 && idle_minutes >= 10 && cap > floor {
            let shrunk = ((cap as f64) * 0.8).floor() as usize;
            self.capacity.store(shrunk.max(floor), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_on_empty_pool_counts_a_miss_and_allocates() {
        let pool: ObjectPool<String> = ObjectPool::new(2);
        let s = pool.acquire(|| "fresh".to_string(), |s| s.clear());
        assert_eq!(s, "fresh");
        assert_eq!(pool.misses(), 1);
    }

    #[test]
    fn release_then_acquire_reuses_and_resets() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(2);
        let mut v = pool.acquire(Vec::new, |v| v.clear());
        v.extend_from_slice(b"stale");
        pool.release(v);

        let reused = pool.acquire(Vec::new, |v| v.clear());
        assert!(reused.is_empty(), "reset must run on reuse");
        assert_eq!(pool.misses(), 1, "only the first acquire should miss");
    }

    #[test]
    fn release_drops_silently_when_full() {
        let pool: ObjectPool<u32> = ObjectPool::new(1);
        pool.release(1);
        pool.release(2); // dropped, pool already at capacity 1
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn adaptive_growth_and_shrink() {
        let pool: ObjectPool<u32> = ObjectPool::new(100);
        pool.adjust_capacity(20, 0, 100, 10_000); // 20 misses > 10% of 100
        assert_eq!(pool.capacity(), 150);

        pool.adjust_capacity(0, 10, 100, 10_000); // zero misses for 10 min
        assert_eq!(pool.capacity(), 120);
    }
}
