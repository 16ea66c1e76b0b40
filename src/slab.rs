//! Fixed-capacity connection table with an intrusive free list threaded
//! through `Conn::fd`. Grounded on the same allocation discipline the
//! `ObjectPool<T>` (`pool.rs`) generalizes to arbitrary recyclable types.

use crate::conn::{Conn, ConnState};

pub struct ConnectionSlab {
    entries: Box<[Conn]>,
    head_free: i32,
    active_count: usize,
}

impl ConnectionSlab {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut conn = Conn::empty();
            conn.fd = if i == capacity - 1 { -1 } else { (i + 1) as i32 };
            entries.push(conn);
        }
        Self { entries: entries.into_boxed_slice(), head_free: 0, active_count: 0 }
    }

    #[inline(always)]
    pub fn allocate(&mut self, new_fd: i32) -> Option<usize> {
        if self.head_free == -1 {
            return None;
        }
        let idx = self.head_free as usize;
        let conn = &mut self.entries[idx];
        self.head_free = conn.fd;

        conn.fd = new_fd;
        conn.state = ConnState::Accepted;
        conn.read_len = 0;
        conn.write_pos = 0;
        conn.write_len = 0;
        conn.keep_alive = 0;
        conn.requests_served = 0;
        // read_buf/write_buf are intentionally left unzeroed; state tracking
        // (read_len/write_len) never lets stale bytes leak into a response.

        self.active_count += 1;
        Some(idx)
    }

    #[inline(always)]
    pub fn free(&mut self, index: usize) {
        if index >= self.entries.len() {
            return;
        }
        let conn = &mut self.entries[index];
        if conn.state == ConnState::Free {
            return; // double-free guard
        }
        conn.fd = self.head_free;
        conn.state = ConnState::Free;
        self.head_free = index as i32;
        self.active_count -= 1;
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Conn> {
        self.entries.get_mut(index)
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&Conn> {
        self.entries.get(index)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_operations() {
        let mut slab = ConnectionSlab::new(10);
        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 10);

        let idx1 = slab.allocate(100).unwrap();
        assert_eq!(idx1, 0);
        assert_eq!(slab.get(idx1).unwrap().fd, 100);
        assert_eq!(slab.get(idx1).unwrap().state, ConnState::Accepted);

        let idx2 = slab.allocate(101).unwrap();
        assert_eq!(idx2, 1);

        slab.free(idx1);
        assert_eq!(slab.len(), 1);

        // index 0 was pushed back to the head of the free list
        let idx3 = slab.allocate(102).unwrap();
        assert_eq!(idx3, 0);
    }

    #[test]
    fn test_slab_exhaustion() {
        let mut slab = ConnectionSlab::new(2);
        assert!(slab.allocate(1).is_some());
        assert!(slab.allocate(2).is_some());
        assert!(slab.allocate(3).is_none());
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut slab = ConnectionSlab::new(2);
        let idx = slab.allocate(1).unwrap();
        slab.free(idx);
        slab.free(idx);
        assert_eq!(slab.len(), 0);
    }
}
