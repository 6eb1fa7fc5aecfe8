//! A segmented Raft log and replicated state-machine runtime: durable
//! append-only storage for a sequence of commands, specialized with commit
//! semantics, reclaimed by a background compactor, and driven into a user
//! state machine in strict index order.
//!
//! Leader election, cluster membership, and network transport are out of
//! scope; this crate assumes a leader already exists and entries arrive (or
//! are produced locally) as a monotonically increasing index stream.

pub mod config;
pub mod encoding;
pub mod error;
pub mod raft;

pub use error::{Error, Result};
