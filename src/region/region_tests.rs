use std::ptr;

use super::*;
use crate::heap_cleanup;
use crate::util::conversions::byte_offset_to_word;
use crate::util::test_util::serial_test;

const TID_A: u16 = 21;
const TID_B: u16 = 22;

fn open_heap(pages: usize, tid: u16) -> Region {
    let mut region = Region::open_heap(pages * BYTES_IN_PAGE);
    region.set_tid(tid);
    region.open_protection();
    region
}

unsafe fn write_byte(addr: Address, val: u8) {
    ptr::write_volatile(addr.to_mut_ptr::<u8>(), val);
}

unsafe fn read_byte(addr: Address) -> u8 {
    ptr::read_volatile(addr.to_ptr::<u8>())
}

fn master_byte(region: &Region, offset: usize) -> u8 {
    region.view().master()[offset]
}

#[test]
fn single_writer_single_word() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let addr = a.base();
        a.handle_write(addr);
        unsafe { write_byte(addr, 0xaa) };
        assert_eq!(a.dirty_page_count(), 1);

        a.commit(true);
        assert_eq!(master_byte(&a, 0), 0xaa);
        {
            let view = a.view();
            assert_eq!(view.cache_invalidates(0), 0);
            assert_eq!(
                view.word_change(0),
                WordChange {
                    tid: TID_A,
                    version: 1
                }
            );
        }

        a.begin();
        assert_eq!(a.dirty_page_count(), 0);
        // The refreshed working view observes the committed master.
        assert_eq!(unsafe { read_byte(addr) }, 0xaa);
    });
}

#[test]
fn two_writers_same_cache_line() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        a.handle_write(a.base());
        unsafe { write_byte(a.base(), 0xaa) };
        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 8usize, 0xbb) };

        a.periodic_check();
        b.periodic_check();
        a.commit(true);
        b.commit(true);

        assert_eq!(master_byte(&a, 0), 0xaa);
        assert_eq!(master_byte(&a, 8), 0xbb);
        {
            let view = a.view();
            // The second sampler found the first worker's id on the line.
            assert_eq!(view.cache_invalidates(0), 1);
            assert_eq!(
                view.word_change(0),
                WordChange {
                    tid: TID_A,
                    version: 1
                }
            );
            assert_eq!(
                view.word_change(byte_offset_to_word(8)),
                WordChange {
                    tid: TID_B,
                    version: 1
                }
            );
        }
        a.begin();
        b.begin();
        assert_eq!(a.shared.counters.users(0), 0);
    });
}

#[test]
fn two_writers_distinct_cache_lines_same_page() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        a.handle_write(a.base());
        unsafe { write_byte(a.base(), 0x11) };
        b.handle_write(b.base());
        unsafe { write_byte(b.base() + BYTES_IN_CACHE_LINE, 0x22) };

        assert_eq!(a.shared.counters.users(0), 2);
        a.periodic_check();
        b.periodic_check();
        assert!(a.dirty.get(0).unwrap().shared);
        assert!(b.dirty.get(0).unwrap().shared);

        a.commit(true);
        b.commit(true);
        assert_eq!(master_byte(&a, 0), 0x11);
        assert_eq!(master_byte(&a, BYTES_IN_CACHE_LINE), 0x22);
        {
            let view = a.view();
            // No interleaving happened on either line.
            assert_eq!(view.cache_invalidates(0), 0);
            assert_eq!(view.cache_invalidates(1), 0);
        }
        a.begin();
        b.begin();
        assert_eq!(a.shared.counters.users(0), 0);
    });
}

#[test]
fn same_word_written_by_two_workers_marks_shared() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        a.handle_write(a.base());
        unsafe { write_byte(a.base(), 0x11) };
        a.commit(true);
        a.begin();

        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 1usize, 0x22) };
        b.commit(true);
        b.begin();

        let view = a.view();
        assert_eq!(view.word_change(0).tid, SHARED_MARK);
        assert_eq!(view.word_change(0).version, 2);
        assert!(view.word_change(0).is_shared());
        assert_eq!(master_byte(&a, 0), 0x11);
        assert_eq!(master_byte(&a, 1), 0x22);
    });
}

#[test]
fn aba_word_counted_but_not_committed() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        // A second worker dirties the page so sampling tracks it.
        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 2 * BYTES_IN_CACHE_LINE, 0x99) };

        a.handle_write(a.base());
        unsafe { write_byte(a.base(), 0x01) };
        a.periodic_check(); // the sampler catches the transient value
        unsafe { write_byte(a.base(), 0x00) };
        a.periodic_check();
        a.commit(true);

        // Nothing reached the master, but the transient was counted.
        assert_eq!(master_byte(&a, 0), 0x00);
        let view = a.view();
        assert_eq!(
            view.word_change(0),
            WordChange {
                tid: TID_A,
                version: 2
            }
        );
        assert_eq!(view.cache_invalidates(0), 0);
    });
}

#[test]
fn refresh_batches_contiguous_page_runs() {
    serial_test(|| {
        let mut a = open_heap(16, TID_A);
        for page_no in [5usize, 6, 7, 9] {
            let addr = a.base() + conversions::pages_to_bytes(page_no);
            a.handle_write(addr);
            unsafe { write_byte(addr, page_no as u8) };
        }
        let runs: Vec<(usize, usize)> = a.dirty.contiguous_runs().collect();
        assert_eq!(runs, vec![(5, 3), (9, 1)]);

        a.commit(false);
        a.begin();
        assert_eq!(a.dirty_page_count(), 0);
        for page_no in [5usize, 6, 7, 9] {
            let addr = a.base() + conversions::pages_to_bytes(page_no);
            assert_eq!(unsafe { read_byte(addr) }, page_no as u8);
        }
    });
}

#[test]
fn heap_reuse_cleanup_respects_threshold() {
    serial_test(|| {
        let a = open_heap(2, TID_A);
        let obj = a.base() + 3 * BYTES_IN_CACHE_LINE;
        let len = 3 * BYTES_IN_CACHE_LINE;
        let first_word = byte_offset_to_word(3 * BYTES_IN_CACHE_LINE);

        a.shared.counters.record_word_changes(first_word, TID_A, 2);
        assert!(a.cleanup_heap_object(obj, len));
        assert_eq!(a.view().word_change(first_word), WordChange::default());

        // A hot line inside the object blocks the reset.
        a.shared.counters.record_word_changes(first_word, TID_A, 2);
        a.shared.counters.set_invalidates(4, MIN_INVALIDATES_CARE);
        assert!(!a.cleanup_heap_object(obj, len));
        assert_eq!(a.view().word_change(first_word).version, 2);
        assert_eq!(a.view().cache_invalidates(4), MIN_INVALIDATES_CARE);

        // Pointers outside the region are not ours to clean.
        assert!(!a.cleanup_heap_object(a.base() + a.len() + 64usize, 8));

        // The allocator-facing seam routes to the same counters.
        a.shared.counters.set_invalidates(4, 0);
        assert!(heap_cleanup::cleanup_object(obj, len));
        assert_eq!(a.view().word_change(first_word).version, 0);
    });
}

#[test]
fn pristine_twin_immutable_and_foreign_words_survive_commit() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        // Make the page shared so sampling binds a temporary twin.
        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 96usize, 0x44) };

        a.handle_write(a.base());
        let twin = a.dirty.get(0).unwrap().orig_twin;
        let twin_before =
            unsafe { std::slice::from_raw_parts(twin.to_ptr::<u8>(), BYTES_IN_PAGE) }.to_vec();
        unsafe { write_byte(a.base(), 0x55) };
        a.periodic_check();
        unsafe { write_byte(a.base() + 8usize, 0x66) };
        a.periodic_check();

        let twin_after = unsafe { std::slice::from_raw_parts(twin.to_ptr::<u8>(), BYTES_IN_PAGE) };
        assert_eq!(twin_before.as_slice(), twin_after);

        // A word committed by another worker between our fault and our
        // commit survives the merge untouched.
        a.sharemem_write_word(a.base() + 256usize, 0x7777);
        a.commit(true);
        assert_eq!(a.sharemem_read_word(a.base() + 256usize), 0x7777);
        assert_eq!(master_byte(&a, 0), 0x55);
        assert_eq!(master_byte(&a, 8), 0x66);
    });
}

#[test]
fn consecutive_begins_are_idempotent() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let addr = a.base() + BYTES_IN_PAGE;
        a.handle_write(addr);
        unsafe { write_byte(addr, 0x12) };
        a.commit(false);
        a.begin();

        let snapshot = a.view().master().to_vec();
        a.begin();
        assert_eq!(a.dirty_page_count(), 0);
        assert_eq!(a.view().master(), snapshot.as_slice());
        assert_eq!(unsafe { read_byte(addr) }, 0x12);
    });
}

#[test]
fn one_increment_per_line_per_sampling_pass() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 24usize, 0x31) };
        a.handle_write(a.base());
        unsafe {
            // Three words of the same cache line.
            write_byte(a.base(), 1);
            write_byte(a.base() + 8usize, 2);
            write_byte(a.base() + 16usize, 3);
        }
        b.periodic_check();
        a.periodic_check();
        assert_eq!(a.view().cache_invalidates(0), 1);

        // A pass with nothing new records nothing.
        a.periodic_check();
        assert_eq!(a.view().cache_invalidates(0), 1);

        // Re-writes by the owning worker are not interleavings.
        unsafe { write_byte(a.base() + 32usize, 4) };
        a.periodic_check();
        assert_eq!(a.view().cache_invalidates(0), 1);
    });
}

#[test]
fn globals_region_overlays_and_preserves_contents() {
    serial_test(|| {
        let capacity = 2 * BYTES_IN_PAGE;
        let init = memory::anon_private(capacity).unwrap();
        memory::set(init, 0x3c, 100);

        let mut g = unsafe { Region::open_globals(init, 100, capacity) };
        g.set_tid(TID_A);
        assert!(!g.is_heap());
        assert_eq!(g.len(), BYTES_IN_PAGE); // rounded up to a whole page
        assert_eq!(g.base(), init);
        // The overlay preserved the initial bytes on both views.
        assert_eq!(unsafe { read_byte(init + 42usize) }, 0x3c);
        assert_eq!(master_byte(&g, 42), 0x3c);
        assert_eq!(unsafe { read_byte(init + 100usize) }, 0x00);

        g.open_protection();
        g.handle_write(g.base() + 4usize);
        unsafe { write_byte(g.base() + 4usize, 0x9d) };
        g.commit(true);
        g.begin();
        assert_eq!(master_byte(&g, 4), 0x9d);
        assert_eq!(master_byte(&g, 5), 0x3c);
        assert_eq!(unsafe { read_byte(g.base() + 4usize) }, 0x9d);
    });
}

#[derive(Default)]
struct RecordingTracker {
    heap_calls: Vec<(usize, usize, usize)>,
    global_calls: Vec<(usize, usize)>,
}

impl Tracker for RecordingTracker {
    fn check_heap_objects(&mut self, view: RegionView<'_>, heap_end: Address) {
        self.heap_calls
            .push((view.base().as_usize(), view.len(), heap_end.as_usize()));
    }

    fn check_global_objects(&mut self, view: RegionView<'_>) {
        self.global_calls.push((view.base().as_usize(), view.len()));
    }
}

#[test]
fn finalize_dispatches_by_region_kind() {
    serial_test(|| {
        let a = open_heap(2, TID_A);
        let mut tracker = RecordingTracker::default();
        let heap_end = a.base() + BYTES_IN_PAGE;
        a.finalize(Some(heap_end), &mut tracker);
        assert_eq!(
            tracker.heap_calls,
            vec![(a.base().as_usize(), a.len(), heap_end.as_usize())]
        );

        let init = memory::anon_private(BYTES_IN_PAGE).unwrap();
        let g = unsafe { Region::open_globals(init, 64, BYTES_IN_PAGE) };
        g.finalize(None, &mut tracker);
        assert_eq!(
            tracker.global_calls,
            vec![(init.as_usize(), BYTES_IN_PAGE)]
        );
        assert_eq!(tracker.heap_calls.len(), 1);
    });
}

#[test]
fn close_protection_restores_direct_shared_writes() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        assert!(a.is_protected());
        a.close_protection();
        assert!(!a.is_protected());

        // Writes reach the master without any commit.
        unsafe { write_byte(a.base() + 3usize, 0xab) };
        assert_eq!(master_byte(&a, 3), 0xab);

        // And master writes are visible through the working view.
        a.sharemem_write_word(a.base() + BYTES_IN_WORD, 0x1234);
        assert_eq!(unsafe { (a.base() + BYTES_IN_WORD).load::<usize>() }, 0x1234);
    });
}

#[test]
fn page_user_counts_balance_across_transactions() {
    serial_test(|| {
        let mut a = open_heap(2, TID_A);
        let mut b = a.secondary_view(TID_B);
        b.open_protection();

        a.handle_write(a.base());
        unsafe { write_byte(a.base(), 1) };
        b.handle_write(b.base());
        unsafe { write_byte(b.base() + 8usize, 2) };
        assert_eq!(a.shared.counters.users(0), 2);

        // A spurious re-enrollment keeps the count at one per worker.
        a.handle_write(a.base() + 16usize);
        assert_eq!(a.shared.counters.users(0), 2);
        assert_eq!(a.dirty_page_count(), 1);

        a.commit(false);
        a.begin();
        assert_eq!(a.shared.counters.users(0), 1);
        b.commit(false);
        b.begin();
        assert_eq!(b.shared.counters.users(0), 0);

        // A fresh single-user transaction stays unshared.
        a.handle_write(a.base());
        assert!(!a.dirty.get(0).unwrap().shared);
        a.begin();
        assert_eq!(a.shared.counters.users(0), 0);
    });
}
