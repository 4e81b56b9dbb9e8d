//! The shared substrate of a region: an unlinked temporary file that both
//! the master and the working views map.

use std::ffi::CStr;

/// An unlinked temporary file of fixed length. The file exists only as long
/// as some process keeps the descriptor (or a mapping of it) alive; nothing
/// is durable across exit.
pub struct BackingFile {
    fd: i32,
    len: usize,
}

impl BackingFile {
    /// Create a backing file of exactly `len` bytes. Failure is fatal: the
    /// region cannot exist without its substrate.
    pub fn create(len: usize) -> BackingFile {
        // mkstemp rewrites the template in place, so it lives in a local buffer.
        let mut template = *b"/tmp/twinmem-backing-XXXXXX\0";
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            error!("failed to create backing file: {}", err);
            panic!("failed to create backing file: {}", err);
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            error!("failed to size backing file to {} bytes: {}", len, err);
            panic!("failed to size backing file to {} bytes: {}", len, err);
        }
        // Unlink immediately: workers reach the file through the inherited
        // descriptor, and the kernel reclaims it when the last one exits.
        let name = unsafe { CStr::from_ptr(template.as_ptr().cast()) };
        if unsafe { libc::unlink(name.as_ptr()) } != 0 {
            warn!(
                "failed to unlink backing file {:?}: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        BackingFile { fd, len }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
