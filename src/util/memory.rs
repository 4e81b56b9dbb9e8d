//! Thin wrappers over the mapping syscalls the runtime depends on. All
//! fallible calls surface `std::io::Result` so callers decide whether a
//! failure is fatal (for the region's protection discipline it always is).

use std::io::{Error, Result};

use libc::{MAP_ANONYMOUS, MAP_FIXED, MAP_NORESERVE, MAP_PRIVATE, MAP_SHARED};
use libc::{PROT_READ, PROT_WRITE};

use crate::util::Address;

/// Page protection for a region view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Reads allowed, writes fault.
    ReadOnly,
    /// Reads and writes allowed.
    ReadWrite,
}

impl Protection {
    fn native(self) -> i32 {
        match self {
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// Sharing mode for a region view of the backing file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Sharing {
    /// Writes are visible to every process mapping the file.
    Shared,
    /// Writes go to process-private copy-on-write pages.
    Private,
}

impl Sharing {
    fn native(self) -> i32 {
        match self {
            Sharing::Shared => MAP_SHARED,
            Sharing::Private => MAP_PRIVATE,
        }
    }
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

/// Map `size` bytes shared and read-write: of `fd` when given, anonymous
/// otherwise, at `fixed` when given, at a kernel-chosen address otherwise.
/// Anonymous shared mappings are inherited by forked workers, which is how
/// the counter arrays become cross-process state.
pub fn allocate_shared(size: usize, fd: Option<i32>, fixed: Option<Address>) -> Result<Address> {
    let mut flags = MAP_SHARED;
    if fd.is_none() {
        flags |= MAP_ANONYMOUS;
    }
    if fixed.is_some() {
        flags |= MAP_FIXED;
    }
    let hint = fixed.map_or(std::ptr::null_mut(), |a| a.to_mut_ptr());
    let ptr = unsafe {
        libc::mmap(
            hint,
            size,
            PROT_READ | PROT_WRITE,
            flags,
            fd.unwrap_or(-1),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(ptr))
}

/// Map `size` bytes of anonymous process-private scratch memory. Backed
/// lazily (`MAP_NORESERVE`) so an oversized pool costs nothing until used.
pub fn anon_private(size: usize) -> Result<Address> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(ptr))
}

/// Replace the mapping at `[start, start + size)` with a fresh view of
/// `fd` at file offset 0, with the requested protection and sharing. This is
/// how a working view toggles between the fault-on-write private state and
/// the plain shared state.
pub fn remap_fixed(
    start: Address,
    size: usize,
    fd: i32,
    prot: Protection,
    sharing: Sharing,
) -> Result<()> {
    let ptr = unsafe {
        libc::mmap(
            start.to_mut_ptr(),
            size,
            prot.native(),
            sharing.native() | MAP_FIXED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    debug_assert_eq!(Address::from_mut_ptr(ptr), start);
    Ok(())
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

pub fn mprotect(start: Address, size: usize, prot: Protection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.native()) },
        0,
    )
}

/// Drop the process-private copies of `[start, start + size)`. The next read
/// of the range observes the backing file again.
pub fn discard(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn anon_private_is_zeroed_and_writable() {
        let addr = anon_private(BYTES_IN_PAGE).unwrap();
        unsafe {
            assert_eq!(addr.load::<usize>(), 0);
            addr.store::<usize>(42);
            assert_eq!(addr.load::<usize>(), 42);
        }
        munmap(addr, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn shared_anonymous_mapping_is_zeroed() {
        let addr = allocate_shared(BYTES_IN_PAGE, None, None).unwrap();
        unsafe {
            assert_eq!(addr.load::<u64>(), 0);
        }
        munmap(addr, BYTES_IN_PAGE).unwrap();
    }
}
