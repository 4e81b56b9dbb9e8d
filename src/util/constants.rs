/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;
/// Mask selecting the in-page byte offset of an address
pub const PAGE_MASK: usize = BYTES_IN_PAGE - 1;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in a machine word
pub const LOG_BYTES_IN_WORD: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in a machine word
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a machine word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a cache line
pub const LOG_BYTES_IN_CACHE_LINE: u8 = 6;
/// The number of bytes in a cache line, the unit of false-sharing attribution
pub const BYTES_IN_CACHE_LINE: usize = 1 << LOG_BYTES_IN_CACHE_LINE;

/// log2 of the number of words in a cache line
pub const LOG_WORDS_IN_CACHE_LINE: u8 = LOG_BYTES_IN_CACHE_LINE - LOG_BYTES_IN_WORD;
/// The number of words in a cache line
pub const WORDS_IN_CACHE_LINE: usize = 1 << LOG_WORDS_IN_CACHE_LINE;

/// The number of words in a page
pub const WORDS_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_WORD;
/// The number of cache lines in a page
pub const CACHE_LINES_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_CACHE_LINE;

/// Owner id recorded for a word written by two or more workers. Reserved:
/// no live worker id may be pinned to this value, and worker ids are nonzero.
pub const SHARED_MARK: u16 = 0xFFFF;

/// A cache line with at least this many recorded invalidations keeps its
/// counters across heap object reuse so the reporter still sees the signal.
pub const MIN_INVALIDATES_CARE: usize = 2;

/// Upper bound on the pages a single transaction may dirty. Exceeding it is
/// fatal to the worker; the host program must pick shorter transactions.
pub const MAX_DIRTY_PAGES: usize = 1024;

/// Page-sized scratch buffers available per worker. Each dirty page holds an
/// original twin; a shared page additionally binds a temporary twin and a
/// word-counter buffer, so the store is sized at three buffers per page bound.
pub const PAGE_STORE_PAGES: usize = 3 * MAX_DIRTY_PAGES;
