//! The replicated log and state-machine runtime: a directory of append-only
//! segments, presented as one logical journal specialized with commit
//! semantics, reclaimed by a background compactor, and driven into a user
//! state machine by the runtime.
//!
//! Leader election, membership, and transport are out of scope: this module
//! assumes a leader already exists and delivers entries as a monotonically
//! increasing index stream (see crate-level Non-goals).

pub mod compactor;
pub mod demo;
pub mod journal;
pub mod log;
pub mod segment;
pub mod session;
pub mod state_machine;

/// A log index. Starts at 1; 0 means "no entry".
pub type Index = u64;

/// A Raft election epoch. Opaque to this crate beyond being carried on
/// entries and compared for monotonicity.
pub type Term = u64;

/// An immutable log entry. Entries are created only by appending and are
/// never modified in place; truncation and compaction only ever remove them.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    /// Wall-clock milliseconds assigned at append on the leader. This is the
    /// only place real time enters the system -- the state machine runtime
    /// never reads the wall clock itself.
    pub timestamp: i64,
    pub payload: Vec<u8>,
}
