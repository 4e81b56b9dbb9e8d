//! Per-transaction records of dirtied pages, kept in a bounded sorted vector
//! so refresh can batch runs of consecutive pages and the fault handler can
//! insert without allocating.

use crate::util::constants::*;
use crate::util::Address;

/// Everything a worker tracks about one dirtied page for the duration of a
/// transaction. Twin buffers are borrowed from the worker's page store and
/// reclaimed wholesale at the next transaction boundary.
#[derive(Copy, Clone)]
pub struct PageInfo {
    /// Index of the page within the region.
    pub page_no: usize,
    /// Base address of the page in this worker's working view.
    pub page_start: Address,
    /// Snapshot of the page at the faulting write. Never written afterwards
    /// until the entry is dropped.
    pub orig_twin: Address,
    /// Snapshot refreshed by each sampling pass. Bound only once the page is
    /// known to be shared.
    pub temp_twin: Address,
    /// Per-word delta counters for the sampling passes, one cell per word.
    pub local_changes: Address,
    /// Two or more workers have dirtied this page in the current transactions.
    pub shared: bool,
    /// `temp_twin` and `local_changes` are bound.
    pub alloced: bool,
}

impl PageInfo {
    pub fn local_change(&self, word: usize) -> usize {
        debug_assert!(self.alloced && word < WORDS_IN_PAGE);
        unsafe { *self.local_changes.to_ptr::<usize>().add(word) }
    }

    pub fn bump_local_change(&self, word: usize) {
        debug_assert!(self.alloced && word < WORDS_IN_PAGE);
        unsafe {
            let cell = self.local_changes.to_mut_ptr::<usize>().add(word);
            *cell += 1;
        }
    }
}

/// A worker's write-set: the dirtied pages of the current transaction, sorted
/// by page number. Doubles as the page-entry pool; capacity is fixed up
/// front and exceeding it is fatal.
pub struct DirtyPages {
    entries: Vec<PageInfo>,
}

impl DirtyPages {
    pub fn with_capacity(capacity: usize) -> DirtyPages {
        DirtyPages {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert `page`, replacing any existing entry with the same page number
    /// (a spurious re-enrollment overwrites the old record wholesale).
    /// Returns true when an entry was replaced.
    pub fn insert(&mut self, page: PageInfo) -> bool {
        match self
            .entries
            .binary_search_by_key(&page.page_no, |p| p.page_no)
        {
            Ok(i) => {
                self.entries[i] = page;
                true
            }
            Err(i) => {
                if self.entries.len() == self.entries.capacity() {
                    error!(
                        "write-set bound exceeded ({} pages); transaction is too long",
                        self.entries.capacity()
                    );
                    panic!(
                        "write-set bound exceeded ({} pages); transaction is too long",
                        self.entries.capacity()
                    );
                }
                self.entries.insert(i, page);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PageInfo> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, PageInfo> {
        self.entries.iter_mut()
    }

    #[cfg(test)]
    pub fn get(&self, page_no: usize) -> Option<&PageInfo> {
        self.entries
            .binary_search_by_key(&page_no, |p| p.page_no)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Iterate maximal runs of consecutive page numbers as
    /// `(first_page_no, page_count)`. Refresh uses this to batch its
    /// `madvise` + `mprotect` pairs.
    pub fn contiguous_runs(&self) -> ContiguousRuns<'_> {
        ContiguousRuns {
            entries: &self.entries,
            index: 0,
        }
    }
}

pub struct ContiguousRuns<'a> {
    entries: &'a [PageInfo],
    index: usize,
}

impl Iterator for ContiguousRuns<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.index >= self.entries.len() {
            return None;
        }
        let first = self.entries[self.index].page_no;
        let mut count = 1;
        while self.index + count < self.entries.len()
            && self.entries[self.index + count].page_no == first + count
        {
            count += 1;
        }
        self.index += count;
        Some((first, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(page_no: usize) -> PageInfo {
        PageInfo {
            page_no,
            page_start: Address::ZERO,
            orig_twin: Address::ZERO,
            temp_twin: Address::ZERO,
            local_changes: Address::ZERO,
            shared: false,
            alloced: false,
        }
    }

    #[test]
    fn insert_keeps_entries_sorted() {
        let mut dirty = DirtyPages::with_capacity(8);
        for page_no in [7, 2, 5, 3] {
            assert!(!dirty.insert(entry(page_no)));
        }
        let order: Vec<usize> = dirty.iter().map(|p| p.page_no).collect();
        assert_eq!(order, vec![2, 3, 5, 7]);
    }

    #[test]
    fn reinsert_overwrites() {
        let mut dirty = DirtyPages::with_capacity(4);
        assert!(!dirty.insert(entry(3)));
        let mut replacement = entry(3);
        replacement.shared = true;
        assert!(dirty.insert(replacement));
        assert_eq!(dirty.len(), 1);
        assert!(dirty.get(3).unwrap().shared);
    }

    #[test]
    fn runs_batch_consecutive_pages() {
        let mut dirty = DirtyPages::with_capacity(8);
        for page_no in [9, 5, 7, 6] {
            dirty.insert(entry(page_no));
        }
        let runs: Vec<(usize, usize)> = dirty.contiguous_runs().collect();
        assert_eq!(runs, vec![(5, 3), (9, 1)]);
    }

    #[test]
    fn runs_handle_singletons_and_empty() {
        let dirty = DirtyPages::with_capacity(4);
        assert_eq!(dirty.contiguous_runs().count(), 0);

        let mut dirty = DirtyPages::with_capacity(4);
        dirty.insert(entry(1));
        dirty.insert(entry(3));
        let runs: Vec<(usize, usize)> = dirty.contiguous_runs().collect();
        assert_eq!(runs, vec![(1, 1), (3, 1)]);
    }
}
