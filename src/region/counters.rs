//! The cross-process counter arrays of a region. All four live in anonymous
//! shared mappings created by the opening process, so forked workers inherit
//! them at the same addresses. Every update is a single-cell atomic; the
//! host program's own synchronization provides any cross-cell ordering.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::memory;
use crate::util::Address;

/// The (owner, version) pair tracked per machine word, packed into one
/// atomically written 32-bit cell. `tid == 0` means untouched; `tid ==
/// SHARED_MARK` means written by two or more workers.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct WordChange {
    /// Worker id of the last (sole) writer, or a sentinel.
    pub tid: u16,
    /// Number of observed changes, saturating.
    pub version: u16,
}

impl WordChange {
    pub(crate) fn pack(self) -> u32 {
        ((self.version as u32) << 16) | self.tid as u32
    }

    pub(crate) fn unpack(raw: u32) -> WordChange {
        WordChange {
            tid: raw as u16,
            version: (raw >> 16) as u16,
        }
    }

    /// Written by two or more workers?
    pub fn is_shared(self) -> bool {
        self.tid == SHARED_MARK
    }
}

/// Shared counter arrays, sized by the region's byte capacity:
/// one user count per page, one (last owner, invalidation count) pair per
/// cache line, one [`WordChange`] cell per word.
pub struct Counters {
    page_users: Address,
    cache_last_owner: Address,
    cache_invalidates: Address,
    word_changes: Address,
    pages: usize,
    cache_lines: usize,
    words: usize,
}

impl Counters {
    /// Allocate zeroed counter arrays covering `capacity` bytes of region.
    /// Fatal on mapping failure, like every other piece of region setup.
    pub fn allocate(capacity: usize) -> Counters {
        debug_assert!(capacity % BYTES_IN_PAGE == 0);
        let pages = capacity >> LOG_BYTES_IN_PAGE;
        let cache_lines = capacity >> LOG_BYTES_IN_CACHE_LINE;
        let words = capacity >> LOG_BYTES_IN_WORD;
        let array = |bytes: usize, what: &str| -> Address {
            memory::allocate_shared(bytes, None, None).unwrap_or_else(|e| {
                error!("failed to allocate {} array ({} bytes): {}", what, bytes, e);
                panic!("failed to allocate {} array ({} bytes): {}", what, bytes, e);
            })
        };
        Counters {
            page_users: array(pages * std::mem::size_of::<usize>(), "page user"),
            cache_last_owner: array(cache_lines * std::mem::size_of::<usize>(), "line owner"),
            cache_invalidates: array(cache_lines * std::mem::size_of::<usize>(), "invalidation"),
            word_changes: array(words * std::mem::size_of::<u32>(), "word change"),
            pages,
            cache_lines,
            words,
        }
    }

    fn page_users_cell(&self, page: usize) -> &AtomicUsize {
        debug_assert!(page < self.pages);
        unsafe { &*self.page_users.to_ptr::<AtomicUsize>().add(page) }
    }

    fn cache_last_owner_cell(&self, line: usize) -> &AtomicUsize {
        debug_assert!(line < self.cache_lines);
        unsafe { &*self.cache_last_owner.to_ptr::<AtomicUsize>().add(line) }
    }

    fn cache_invalidates_cell(&self, line: usize) -> &AtomicUsize {
        debug_assert!(line < self.cache_lines);
        unsafe { &*self.cache_invalidates.to_ptr::<AtomicUsize>().add(line) }
    }

    fn word_cell(&self, word: usize) -> &AtomicU32 {
        debug_assert!(word < self.words);
        unsafe { &*self.word_changes.to_ptr::<AtomicU32>().add(word) }
    }

    /// A worker's transaction enrolled `page`; returns the previous count.
    pub fn users_enter(&self, page: usize) -> usize {
        self.page_users_cell(page).fetch_add(1, Ordering::Relaxed)
    }

    /// A worker's transaction released `page` (or cancelled a double
    /// enrollment).
    pub fn users_exit(&self, page: usize) {
        let prev = self.page_users_cell(page).fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Current concurrent-dirtier count of `page`.
    pub fn users(&self, page: usize) -> usize {
        self.page_users_cell(page).load(Ordering::Relaxed)
    }

    /// Current invalidation count of `line`.
    pub fn invalidates(&self, line: usize) -> usize {
        self.cache_invalidates_cell(line).load(Ordering::Relaxed)
    }

    /// Current change record of `word`.
    pub fn word_change(&self, word: usize) -> WordChange {
        WordChange::unpack(self.word_cell(word).load(Ordering::Relaxed))
    }

    /// Take ownership of `line` and record an invalidation if the previous
    /// owner was a different worker. Returns true when an interleaving was
    /// counted.
    pub fn record_cache_invalidate(&self, line: usize, tid: u16) -> bool {
        let last = self
            .cache_last_owner_cell(line)
            .swap(tid as usize, Ordering::Relaxed);
        if last != 0 && last != tid as usize {
            self.cache_invalidates_cell(line).fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Fold `delta` observed changes of `word` by worker `tid` into the
    /// shared cell. The owner field degrades monotonically: untouched ->
    /// single owner -> SHARED_MARK; the version saturates at the field width.
    pub fn record_word_changes(&self, word: usize, tid: u16, delta: usize) {
        let cell = self.word_cell(word);
        let mut wc = WordChange::unpack(cell.load(Ordering::Relaxed));
        if wc.tid == 0 {
            wc.tid = tid;
        } else if wc.tid != tid && wc.tid != SHARED_MARK {
            wc.tid = SHARED_MARK;
        }
        wc.version = wc
            .version
            .saturating_add(delta.min(u16::MAX as usize) as u16);
        cell.store(wc.pack(), Ordering::Relaxed);
    }

    /// Reset the counters covering `[offset, offset + len)` ahead of heap
    /// object reuse, unless a covered line has accumulated enough
    /// invalidations to matter to the reporter. Counters are left intact on
    /// refusal.
    pub fn cleanup_range(&self, offset: usize, len: usize) -> bool {
        debug_assert!(len > 0);
        let capacity = self.words << LOG_BYTES_IN_WORD;
        debug_assert!(offset < capacity);
        // An object tail past the region end has no counters to clean.
        let len = len.min(capacity - offset);
        let first_line = offset >> LOG_BYTES_IN_CACHE_LINE;
        let last_line = (offset + len - 1) >> LOG_BYTES_IN_CACHE_LINE;
        for line in first_line..=last_line {
            if self.invalidates(line) >= MIN_INVALIDATES_CARE {
                return false;
            }
        }
        for line in first_line..=last_line {
            self.cache_invalidates_cell(line).store(0, Ordering::Relaxed);
        }
        let first_word = offset >> LOG_BYTES_IN_WORD;
        let last_word = (offset + len - 1) >> LOG_BYTES_IN_WORD;
        for word in first_word..=last_word {
            self.word_cell(word).store(0, Ordering::Relaxed);
        }
        true
    }

    /// Raw accessor for tests.
    #[cfg(test)]
    pub(crate) fn set_invalidates(&self, line: usize, count: usize) {
        self.cache_invalidates_cell(line).store(count, Ordering::Relaxed);
    }
}

impl Drop for Counters {
    fn drop(&mut self) {
        let _ = memory::munmap(self.page_users, self.pages * std::mem::size_of::<usize>());
        let _ = memory::munmap(
            self.cache_last_owner,
            self.cache_lines * std::mem::size_of::<usize>(),
        );
        let _ = memory::munmap(
            self.cache_invalidates,
            self.cache_lines * std::mem::size_of::<usize>(),
        );
        let _ = memory::munmap(self.word_changes, self.words * std::mem::size_of::<u32>());
    }
}
