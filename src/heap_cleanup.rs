//! Seam between the heap allocator collaborator and the instrumented heap
//! regions. A heap region registers itself once at construction; the
//! allocator calls [`cleanup_object`] when it frees an allocation that is
//! about to be reused, so stale counters don't get attributed to the next
//! object at the same address.

use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::region::RegionShared;
use crate::util::Address;

struct Registration {
    base: Address,
    len: usize,
    shared: Weak<RegionShared>,
}

static REGIONS: Mutex<Vec<Registration>> = Mutex::new(Vec::new());

/// Record a heap region's counter arrays for cleanup-on-free. Called once
/// per heap region by the region constructor.
pub(crate) fn register(base: Address, len: usize, shared: &Arc<RegionShared>) {
    let mut regions = REGIONS.lock();
    // Dead regions (dropped handles) make room for new ones.
    regions.retain(|r| r.shared.strong_count() > 0);
    regions.push(Registration {
        base,
        len,
        shared: Arc::downgrade(shared),
    });
    debug!("registered heap region at {} ({:#x} bytes) for cleanup", base, len);
}

/// Reset the counters covering a freed heap object, unless one of its cache
/// lines carries enough invalidations that the reporter should still see the
/// signal. Returns false (leaving every counter intact) on refusal or when
/// `ptr` is not inside a registered heap region.
pub fn cleanup_object(ptr: Address, len: usize) -> bool {
    let regions = REGIONS.lock();
    for r in regions.iter() {
        if ptr >= r.base && ptr < r.base + r.len {
            if let Some(shared) = r.shared.upgrade() {
                return shared.counters().cleanup_range(ptr - r.base, len);
            }
        }
    }
    false
}
