//! A process-level runtime core that detects false sharing by replacing
//! shared-memory threading with a page-protected, process-based model.
//!
//! Each worker "thread" of the host program runs as a separate process over a
//! common backing file holding the program's heap and globals. A worker's
//! writes land in a private copy-on-write view and are captured at page
//! granularity: the first write to a protected page faults, the fault handler
//! calls [`Region::handle_write`], and the page is snapshotted against a
//! pristine twin. At the next synchronization boundary the byte-level diff of
//! each dirtied page is merged back into the shared master mapping
//! ([`Region::commit`]) and the private copies are discarded
//! ([`Region::begin`]).
//!
//! In parallel with the merge, per-word change counters and per-cache-line
//! interleaving counters are maintained in shared memory. They feed an
//! attribution reporter (the [`tracker::Tracker`] collaborator) that turns the
//! raw counts into suspected false-sharing hotspots.
//!
//! The crate owns only the memory side of the scheme. Interposing on libc,
//! turning threads into processes, delivering the faults, and attributing
//! counters to source-level objects are all external collaborators.

extern crate libc;
#[macro_use]
extern crate log;

pub mod heap_cleanup;
pub mod region;
pub mod tracker;
pub mod util;

pub use crate::region::{Region, WordChange};
pub use crate::tracker::{RegionView, Tracker};
pub use crate::util::address::Address;
