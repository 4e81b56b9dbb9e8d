//! The copy-on-write memory region manager. A region is a contiguous byte
//! range backed by an unlinked temporary file with two overlaid views: the
//! *master* (shared, read-write, private to the runtime, mutated only at
//! diff points by the commit engine) and the *working* view (the address the
//! program sees, toggled between fault-on-write private and plain shared
//! per transaction).
//!
//! One region manages the instrumented heap, another the globals. The fault
//! handler, the periodic sampler and the transaction boundaries of the
//! substitution layer all drive a region through the operations on
//! [`Region`].

pub(crate) mod backing;
pub(crate) mod counters;
pub(crate) mod diff;
pub(crate) mod page_info;
pub(crate) mod pool;
#[cfg(test)]
mod region_tests;

use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

use self::backing::BackingFile;
use self::counters::Counters;
use self::page_info::{DirtyPages, PageInfo};
use self::pool::PageStore;
use crate::heap_cleanup;
use crate::tracker::{RegionView, Tracker};
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, Protection, Sharing};
use crate::util::{logger, Address};

pub use self::counters::WordChange;

/// The cross-worker half of a region: the backing file, the master view and
/// the shared counter arrays. Created once by the opening process and
/// inherited by forked workers; per-worker handles reference it through an
/// `Arc`.
pub(crate) struct RegionShared {
    backing: BackingFile,
    master: Address,
    counters: Counters,
    capacity: usize,
    len: usize,
    is_heap: bool,
}

impl RegionShared {
    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}

impl Drop for RegionShared {
    fn drop(&mut self) {
        // The working views stay mapped: one of them may be the program's
        // live heap or globals. Only the runtime-private master goes away.
        let _ = memory::munmap(self.master, self.capacity);
    }
}

/// A worker's handle on a region: the working view plus the strictly
/// process-local transaction state (write-set, twin store, worker id).
pub struct Region {
    shared: Arc<RegionShared>,
    base: Address,
    dirty: DirtyPages,
    store: PageStore,
    tid: u16,
    protected: bool,
}

fn fatal(what: &str, err: std::io::Error) -> ! {
    error!("{}: {}", what, err);
    panic!("{}: {}", what, err);
}

impl Region {
    /// Open an anonymous heap region of `capacity` bytes. The working view
    /// lands at a kernel-chosen base; the region starts unprotected.
    pub fn open_heap(capacity: usize) -> Region {
        Region::open(capacity, None, true)
    }

    /// Overlay an existing globals range. The first `init_len` bytes at
    /// `init` are copied into the master before the working view replaces
    /// the original mapping (the overlay destroys the original contents).
    /// `init_len` is rounded up to whole pages and bounds the protected
    /// range; `capacity` bounds the counter arrays.
    ///
    /// # Safety
    /// `[init, init + capacity)` must be a page-aligned mapped range this
    /// process owns and is prepared to have replaced, with the first
    /// `init_len` bytes readable.
    pub unsafe fn open_globals(init: Address, init_len: usize, capacity: usize) -> Region {
        Region::open(capacity, Some((init, init_len)), false)
    }

    fn open(capacity: usize, init: Option<(Address, usize)>, is_heap: bool) -> Region {
        let _ = logger::try_init();
        assert!(
            capacity > 0 && capacity % BYTES_IN_PAGE == 0,
            "region capacity must be a positive number of whole pages"
        );
        let backing = BackingFile::create(capacity);
        let master = memory::allocate_shared(backing.len(), Some(backing.fd()), None)
            .unwrap_or_else(|e| fatal("mapping the master view", e));

        let mut len = capacity;
        let mut fixed = None;
        if let Some((init_addr, init_len)) = init {
            assert!(
                init_len > 0 && init_len <= capacity,
                "region ({} bytes) is too small for the overlaid range ({} bytes)",
                capacity,
                init_len
            );
            assert!(conversions::is_page_aligned(init_addr));
            // Save the globals before the working overlay squashes them.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    init_addr.to_ptr::<u8>(),
                    master.to_mut_ptr::<u8>(),
                    init_len,
                );
            }
            len = conversions::raw_align_up_page(init_len);
            fixed = Some(init_addr);
        }

        let working = memory::allocate_shared(capacity, Some(backing.fd()), fixed)
            .unwrap_or_else(|e| fatal("mapping the working view", e));
        let counters = Counters::allocate(capacity);

        let shared = Arc::new(RegionShared {
            backing,
            master,
            counters,
            capacity,
            len,
            is_heap,
        });
        if is_heap {
            heap_cleanup::register(working, len, &shared);
        }
        debug!(
            "opened {} region: base={} len={:#x} capacity={:#x} master={}",
            if is_heap { "heap" } else { "globals" },
            working,
            len,
            capacity,
            master
        );

        Region {
            shared,
            base: working,
            dirty: DirtyPages::with_capacity(MAX_DIRTY_PAGES),
            store: PageStore::new(PAGE_STORE_PAGES),
            tid: 0,
            protected: false,
        }
    }

    /// A second in-process working view over the same backing file and
    /// counters, emulating another worker for tests (real workers are forked
    /// and inherit the primary view).
    #[cfg(test)]
    pub(crate) fn secondary_view(&self, tid: u16) -> Region {
        let working = memory::allocate_shared(
            self.shared.capacity,
            Some(self.shared.backing.fd()),
            None,
        )
        .unwrap_or_else(|e| fatal("mapping a secondary working view", e));
        let mut view = Region {
            shared: Arc::clone(&self.shared),
            base: working,
            dirty: DirtyPages::with_capacity(MAX_DIRTY_PAGES),
            store: PageStore::new(PAGE_STORE_PAGES),
            tid: 0,
            protected: false,
        };
        view.set_tid(tid);
        view
    }

    /// The start of the working view.
    pub fn base(&self) -> Address {
        self.base
    }

    /// The protected length in bytes (the whole capacity for heap regions,
    /// the page-rounded initialized prefix for globals regions).
    pub fn len(&self) -> usize {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_heap(&self) -> bool {
        self.shared.is_heap
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty.len()
    }

    /// true iff the address is in this region's working view.
    pub fn in_range(&self, addr: Address) -> bool {
        addr >= self.base && addr < self.base + self.shared.len
    }

    /// Pin the worker id recorded in the shared counters. The runtime
    /// normally derives it from the process id; the substitution layer may
    /// pin it right after fork. `0` and [`SHARED_MARK`] are reserved.
    pub fn set_tid(&mut self, tid: u16) {
        assert!(tid != 0 && tid != SHARED_MARK, "worker id {} is reserved", tid);
        self.tid = tid;
    }

    fn my_tid(&self) -> u16 {
        if self.tid != 0 {
            self.tid
        } else {
            (unsafe { libc::getpid() }) as u16
        }
    }

    fn master_page(&self, page_no: usize) -> Address {
        self.shared.master + conversions::pages_to_bytes(page_no)
    }

    /// Remap the working view read-only and private, arming fault-on-write
    /// for the next transaction.
    pub fn open_protection(&mut self) {
        memory::remap_fixed(
            self.base,
            self.shared.len,
            self.shared.backing.fd(),
            Protection::ReadOnly,
            Sharing::Private,
        )
        .unwrap_or_else(|e| fatal("protecting the working view", e));
        self.protected = true;
        trace!("protection opened on region at {}", self.base);
    }

    /// Remap the working view read-write and shared, leaving instrumented
    /// execution. Subsequent writes reach the backing file directly.
    pub fn close_protection(&mut self) {
        memory::remap_fixed(
            self.base,
            self.shared.len,
            self.shared.backing.fd(),
            Protection::ReadWrite,
            Sharing::Shared,
        )
        .unwrap_or_else(|e| fatal("unprotecting the working view", e));
        self.protected = false;
        trace!("protection closed on region at {}", self.base);
    }

    /// Enroll the page holding `addr` in the write-set after a faulting
    /// write. Called from the host's SIGSEGV handler once the address is
    /// known to be in range; the path allocates from pre-sized pools only
    /// and performs no locking or logging.
    pub fn handle_write(&mut self, addr: Address) {
        assert!(self.in_range(addr), "write capture outside the region");
        debug_assert!(self.protected);

        let page_start = conversions::page_align_down(addr);
        let page_no = (page_start - self.base) >> LOG_BYTES_IN_PAGE;

        // A failure here resurfaces as a fatal fault on the retried write.
        let _ = memory::mprotect(page_start, BYTES_IN_PAGE, Protection::ReadWrite);

        // Force the kernel to materialize the private copy before the
        // snapshot. The volatile self-store cannot be elided, and the fence
        // keeps the snapshot copy below it.
        unsafe {
            let word = page_start.to_mut_ptr::<usize>();
            let val = std::ptr::read_volatile(word);
            std::ptr::write_volatile(word, val);
        }
        compiler_fence(Ordering::SeqCst);

        let orig_twin = self.store.alloc();
        unsafe {
            std::ptr::copy_nonoverlapping(
                page_start.to_ptr::<u8>(),
                orig_twin.to_mut_ptr::<u8>(),
                BYTES_IN_PAGE,
            );
        }

        let prev_users = self.shared.counters.users_enter(page_no);
        let page = PageInfo {
            page_no,
            page_start,
            orig_twin,
            temp_twin: Address::ZERO,
            local_changes: Address::ZERO,
            shared: prev_users != 0,
            alloced: false,
        };
        if self.dirty.insert(page) {
            // Spurious re-enrollment: the fresh entry replaced the old one,
            // so cancel the extra user count.
            self.shared.counters.users_exit(page_no);
        }
    }

    /// Sample the dirtied pages between transactions. Pages seen to be
    /// multi-user get a temporary twin bound; each pass tallies word-level
    /// deltas and cache-line interleavings observed since the previous one.
    pub fn periodic_check(&mut self) {
        let tid = self.my_tid();
        let Region {
            shared,
            dirty,
            store,
            ..
        } = self;
        let counters = shared.counters();
        for page in dirty.iter_mut() {
            if !page.shared {
                // An un-shared page may have gained a second user since the
                // fault; re-read before skipping it.
                if counters.users(page.page_no) == 1 {
                    continue;
                }
                page.shared = true;
            }
            let create_temp = if !page.alloced {
                page.temp_twin = store.alloc();
                page.local_changes = store.alloc();
                memory::zero(page.local_changes, BYTES_IN_PAGE);
                page.alloced = true;
                true
            } else {
                false
            };
            record_changes_and_update(counters, page, create_temp, tid);
        }
    }

    /// Merge every dirtied page's byte-level diff into the master and fold
    /// the observed deltas into the shared counters. The write-set survives;
    /// the caller invokes [`Region::begin`] next. With `do_checking`, pages
    /// that never bound sampling resources still get word-level counter
    /// updates; without it they take the fast masked-diff path.
    pub fn commit(&self, do_checking: bool) {
        if self.dirty.is_empty() {
            return;
        }
        let tid = self.my_tid();
        trace!(
            "commit: {} dirty pages on region at {}",
            self.dirty.len(),
            self.base
        );
        for page in self.dirty.iter() {
            if page.shared && page.alloced {
                self.check_commit_page(page, tid);
            } else if do_checking {
                self.check_commit_page_untracked(page, tid);
            } else {
                unsafe {
                    diff::commit_page_diffs(
                        page.page_start,
                        page.orig_twin,
                        self.master_page(page.page_no),
                    );
                }
            }
        }
    }

    /// Checked commit of a sampled page: words are compared against both
    /// twins so the counters separate changes already tallied by sampling
    /// from the final commit-time difference, then merged byte-wise.
    fn check_commit_page(&self, page: &PageInfo, tid: u16) {
        let counters = self.shared.counters();
        let local = page.page_start.to_ptr::<usize>();
        let twin = page.orig_twin.to_ptr::<usize>();
        let temp = page.temp_twin.to_ptr::<usize>();
        let dest = self.master_page(page.page_no);
        let word_base = page.page_no * WORDS_IN_PAGE;
        let line_base = page.page_no * CACHE_LINES_IN_PAGE;
        let mut recorded_line = usize::MAX;

        for i in 0..WORDS_IN_PAGE {
            let local_word = unsafe { *local.add(i) };
            if local_word == unsafe { *twin.add(i) } {
                // The word reads pristine, but sampling may have caught a
                // transient value in between.
                let delta = page.local_change(i);
                if delta != 0 {
                    counters.record_word_changes(word_base + i, tid, delta);
                }
                continue;
            }
            if local_word != unsafe { *temp.add(i) } {
                // Changed again since the last sampling pass.
                let line = i >> LOG_WORDS_IN_CACHE_LINE;
                if line != recorded_line {
                    counters.record_cache_invalidate(line_base + line, tid);
                    recorded_line = line;
                }
                counters.record_word_changes(word_base + i, tid, page.local_change(i) + 1);
            } else {
                counters.record_word_changes(word_base + i, tid, page.local_change(i));
            }
            unsafe {
                diff::commit_word(
                    page.page_start + i * BYTES_IN_WORD,
                    page.orig_twin + i * BYTES_IN_WORD,
                    dest + i * BYTES_IN_WORD,
                );
            }
        }
    }

    /// Checked commit of a page without sampling resources: every word that
    /// differs from the pristine twin counts as one change.
    fn check_commit_page_untracked(&self, page: &PageInfo, tid: u16) {
        let counters = self.shared.counters();
        let local = page.page_start.to_ptr::<usize>();
        let twin = page.orig_twin.to_ptr::<usize>();
        let dest = self.master_page(page.page_no);
        let word_base = page.page_no * WORDS_IN_PAGE;
        let line_base = page.page_no * CACHE_LINES_IN_PAGE;
        let mut recorded_line = usize::MAX;

        for i in 0..WORDS_IN_PAGE {
            if unsafe { *local.add(i) == *twin.add(i) } {
                continue;
            }
            let line = i >> LOG_WORDS_IN_CACHE_LINE;
            if line != recorded_line {
                counters.record_cache_invalidate(line_base + line, tid);
                recorded_line = line;
            }
            counters.record_word_changes(word_base + i, tid, 1);
            unsafe {
                diff::commit_word(
                    page.page_start + i * BYTES_IN_WORD,
                    page.orig_twin + i * BYTES_IN_WORD,
                    dest + i * BYTES_IN_WORD,
                );
            }
        }
    }

    /// Start a transaction: discard the private copies of the dirtied pages
    /// so reads observe the committed master, re-arm fault-on-write, release
    /// the user counts, and recycle the write-set.
    pub fn begin(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        trace!(
            "begin: refreshing {} dirty pages on region at {}",
            self.dirty.len(),
            self.base
        );
        // Runs of consecutive pages share one madvise + mprotect pair.
        for (first, count) in self.dirty.contiguous_runs() {
            let start = self.base + conversions::pages_to_bytes(first);
            let bytes = conversions::pages_to_bytes(count);
            memory::discard(start, bytes)
                .unwrap_or_else(|e| fatal("discarding private pages", e));
            memory::mprotect(start, bytes, Protection::ReadOnly)
                .unwrap_or_else(|e| fatal("reprotecting refreshed pages", e));
        }
        for page in self.dirty.iter() {
            self.shared.counters.users_exit(page.page_no);
        }
        self.dirty.clear();
        self.store.reset();
        debug_assert_eq!(self.store.available(), PAGE_STORE_PAGES);
    }

    /// Reset the counters covering a freed heap object about to be reused,
    /// unless a covered cache line has accumulated enough invalidations that
    /// the reporter should still see it (then nothing is touched and `false`
    /// comes back).
    pub fn cleanup_heap_object(&self, ptr: Address, len: usize) -> bool {
        debug_assert!(self.shared.is_heap);
        if !self.in_range(ptr) {
            return false;
        }
        self.shared.counters.cleanup_range(ptr - self.base, len)
    }

    /// Read the master's word at the offset of `addr`, bypassing the private
    /// working view. Atomics the host exposes live in the master.
    pub fn sharemem_read_word(&self, addr: Address) -> usize {
        debug_assert!(self.in_range(addr));
        let offset = addr - self.base;
        unsafe { std::ptr::read_volatile((self.shared.master + offset).to_ptr::<usize>()) }
    }

    /// Write the master's word at the offset of `addr`, bypassing the
    /// private working view.
    pub fn sharemem_write_word(&self, addr: Address, value: usize) {
        debug_assert!(self.in_range(addr));
        let offset = addr - self.base;
        unsafe {
            std::ptr::write_volatile((self.shared.master + offset).to_mut_ptr::<usize>(), value)
        }
    }

    /// A read-only snapshot handle over the master bytes and the shared
    /// counters, for the attribution reporter. Meant for quiescent points.
    pub fn view(&self) -> RegionView<'_> {
        let master =
            unsafe { std::slice::from_raw_parts(self.shared.master.to_ptr::<u8>(), self.shared.len) };
        RegionView::new(self.base, self.shared.len, master, &self.shared.counters)
    }

    /// Hand the region's counters to the attribution reporter. Heap regions
    /// report over `[base, heap_end)` (defaulting to the whole region);
    /// globals regions over their initialized range.
    pub fn finalize(&self, heap_end: Option<Address>, tracker: &mut dyn Tracker) {
        let view = self.view();
        if self.shared.is_heap {
            tracker.check_heap_objects(view, heap_end.unwrap_or(self.base + self.shared.len));
        } else {
            tracker.check_global_objects(view);
        }
    }
}

/// One sampling pass over one page. The first pass diffs against the
/// pristine twin (capturing everything written since enrollment) and then
/// copies the working page into the temporary twin as the next baseline;
/// later passes diff against the temporary twin and fold the observed words
/// into it. The pristine twin is never written.
fn record_changes_and_update(counters: &Counters, page: &PageInfo, create_temp: bool, tid: u16) {
    debug_assert!(page.alloced);
    let twin = if create_temp {
        page.orig_twin
    } else {
        page.temp_twin
    };
    let local_ptr = page.page_start.to_ptr::<usize>();
    let twin_ptr = twin.to_mut_ptr::<usize>();
    let line_base = page.page_no * CACHE_LINES_IN_PAGE;
    let mut recorded_line = usize::MAX;

    for i in 0..WORDS_IN_PAGE {
        let local_word = unsafe { *local_ptr.add(i) };
        let twin_word = unsafe { *twin_ptr.add(i) };
        if local_word == twin_word {
            continue;
        }
        // One increment per line per pass: within-worker re-writes are not
        // interleavings.
        let line = i >> LOG_WORDS_IN_CACHE_LINE;
        if line != recorded_line {
            counters.record_cache_invalidate(line_base + line, tid);
            recorded_line = line;
        }
        page.bump_local_change(i);
        if !create_temp {
            unsafe { *twin_ptr.add(i) = local_word };
        }
    }
    if create_temp {
        unsafe {
            std::ptr::copy_nonoverlapping(
                page.page_start.to_ptr::<u8>(),
                page.temp_twin.to_mut_ptr::<u8>(),
                BYTES_IN_PAGE,
            );
        }
    }
}
