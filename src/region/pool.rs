//! A bounded slab of page-sized scratch buffers. Twin pages and per-word
//! counter buffers both draw from it. The free stack is pre-reserved and the
//! slab is mapped once at construction, so allocation from the fault handler
//! performs no heap allocation, locking, or syscalls.

use crate::util::constants::*;
use crate::util::memory;
use crate::util::Address;

pub struct PageStore {
    slab: Address,
    free: Vec<u16>,
    capacity: usize,
}

impl PageStore {
    pub fn new(capacity: usize) -> PageStore {
        debug_assert!(capacity > 0 && capacity <= u16::MAX as usize);
        let slab = memory::anon_private(capacity * BYTES_IN_PAGE).unwrap_or_else(|e| {
            error!("failed to map page store ({} pages): {}", capacity, e);
            panic!("failed to map page store ({} pages): {}", capacity, e);
        });
        let mut store = PageStore {
            slab,
            free: Vec::with_capacity(capacity),
            capacity,
        };
        store.reset();
        store
    }

    /// Take a page-sized buffer. Exhaustion is fatal: the write-set of a
    /// transaction outgrew the configured bound.
    pub fn alloc(&mut self) -> Address {
        match self.free.pop() {
            Some(index) => self.slab + (index as usize) * BYTES_IN_PAGE,
            None => {
                error!("page store exhausted ({} buffers); transaction dirtied too many pages", self.capacity);
                panic!("page store exhausted ({} buffers); transaction dirtied too many pages", self.capacity);
            }
        }
    }

    /// Reclaim every buffer. Called at the transaction boundary after the
    /// write-set is dropped; outstanding addresses become dangling and must
    /// not be kept across the reset.
    pub fn reset(&mut self) {
        self.free.clear();
        // Popped from the back, so low indices hand out first.
        for index in (0..self.capacity as u16).rev() {
            self.free.push(index);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        let _ = memory::munmap(self.slab, self.capacity * BYTES_IN_PAGE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reset_recycle() {
        let mut store = PageStore::new(4);
        let a = store.alloc();
        let b = store.alloc();
        assert_ne!(a, b);
        assert!(a.is_aligned_to(BYTES_IN_PAGE));
        assert_eq!(b - a, BYTES_IN_PAGE);
        assert_eq!(store.available(), 2);
        store.reset();
        assert_eq!(store.available(), 4);
        assert_eq!(store.alloc(), a);
    }

    #[test]
    fn buffers_are_writable() {
        let mut store = PageStore::new(2);
        let page = store.alloc();
        memory::set(page, 0x5a, BYTES_IN_PAGE);
        unsafe {
            assert_eq!((page + (BYTES_IN_PAGE - 1)).load::<u8>(), 0x5a);
        }
    }
}
