use crate::util::constants::*;
use crate::util::Address;

/// Align an address down to the start of its page.
pub fn page_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_PAGE)
}

pub fn is_page_aligned(address: Address) -> bool {
    address.is_aligned_to(BYTES_IN_PAGE)
}

pub fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

pub fn bytes_to_pages_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE
}

/// Round a byte length up to a whole number of pages.
pub fn raw_align_up_page(bytes: usize) -> usize {
    pages_to_bytes(bytes_to_pages_up(bytes))
}

/// The word index of a byte offset within its region.
pub fn byte_offset_to_word(offset: usize) -> usize {
    offset >> LOG_BYTES_IN_WORD
}

/// The cache line index of a byte offset within its region.
pub fn byte_offset_to_cache_line(offset: usize) -> usize {
    offset >> LOG_BYTES_IN_CACHE_LINE
}
