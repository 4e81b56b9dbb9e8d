//! Input interface of the object-attribution reporter. The runtime hands the
//! reporter a [`RegionView`] at finalize; the reporter owns every heuristic
//! that turns raw counters into source-level hotspots.

use crate::region::counters::Counters;
use crate::region::WordChange;
use crate::util::constants::*;
use crate::util::Address;

/// Read-only access to a region's master bytes and shared counters, sized by
/// the region's protected range.
pub struct RegionView<'a> {
    base: Address,
    len: usize,
    master: &'a [u8],
    counters: &'a Counters,
}

impl<'a> RegionView<'a> {
    pub(crate) fn new(
        base: Address,
        len: usize,
        master: &'a [u8],
        counters: &'a Counters,
    ) -> RegionView<'a> {
        debug_assert_eq!(master.len(), len);
        RegionView {
            base,
            len,
            master,
            counters,
        }
    }

    /// The region's public base address (of the working view).
    pub fn base(&self) -> Address {
        self.base
    }

    /// The region's protected length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The committed bytes of the region, bypassing any private view.
    pub fn master(&self) -> &'a [u8] {
        self.master
    }

    /// The number of cache lines covered by the view.
    pub fn cache_lines(&self) -> usize {
        self.len >> LOG_BYTES_IN_CACHE_LINE
    }

    /// The number of machine words covered by the view.
    pub fn words(&self) -> usize {
        self.len >> LOG_BYTES_IN_WORD
    }

    /// Cross-worker invalidation count of a cache line.
    pub fn cache_invalidates(&self, line: usize) -> usize {
        debug_assert!(line < self.cache_lines());
        self.counters.invalidates(line)
    }

    /// The (owner, version) record of a machine word.
    pub fn word_change(&self, word: usize) -> WordChange {
        debug_assert!(word < self.words());
        self.counters.word_change(word)
    }
}

/// The attribution reporter. Implementations receive the counters of each
/// region at finalize and attribute them to heap or global objects.
pub trait Tracker {
    /// Attribute a heap region's counters to the objects in
    /// `[view.base(), heap_end)`.
    fn check_heap_objects(&mut self, view: RegionView<'_>, heap_end: Address);

    /// Attribute a globals region's counters to the global objects it holds.
    fn check_global_objects(&mut self, view: RegionView<'_>);
}
