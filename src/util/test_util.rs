use std::sync::{Mutex, PoisonError};

// Every test that opens a heap region touches the process-wide cleanup
// registry, and several map multi-megabyte views of their backing files.
// One test at a time keeps registry lookups deterministic and the address
// space quiet.
static EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Run `f` while holding the crate-wide test lock. A panicking test poisons
/// the lock; later tests take it anyway, since the shared state they care
/// about (the registry) prunes dead regions on its own.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    let _exclusive = EXCLUSIVE.lock().unwrap_or_else(PoisonError::into_inner);
    f();
}
