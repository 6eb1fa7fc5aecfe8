//! A reference state machine exercising the runtime end to end: an integer
//! set with TTL and ephemeral (session-scoped) entries. This is test
//! scaffolding, not a user-facing collection type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::session::SessionId;
use crate::raft::state_machine::{ApplyContext, Commit, CompactionPolicy, FilterContext, StateMachine};
use crate::raft::Index;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Persistent,
    Ephemeral,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    Add { value: i32, ttl_ms: u64, mode: Mode },
    Contains { value: i32 },
}

struct Record {
    /// Index of the commit that wrote this record. Used by `filter` to tell
    /// a record's own writing commit apart from an older, superseded write
    /// of the same value that happens to share a timestamp.
    written_at: Index,
    timestamp: i64,
    ttl_ms: u64,
    ephemeral: bool,
    session: Option<SessionId>,
}

impl Record {
    /// TTL-active and, if ephemeral, still owned by a live session.
    fn is_live(&self, now: i64, session_live: bool) -> bool {
        if self.ttl_ms > 0 && now.saturating_sub(self.timestamp) as u64 >= self.ttl_ms {
            return false;
        }
        if self.ephemeral {
            return session_live;
        }
        true
    }
}

#[derive(Default)]
pub struct KvStateMachine {
    entries: HashMap<i32, Record>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateMachine for KvStateMachine {
    fn register(&mut self, _session: SessionId) {}

    fn expire(&mut self, session: SessionId) {
        self.entries.retain(|_, record| record.session != Some(session) || !record.ephemeral);
    }

    fn close(&mut self, session: SessionId) {
        self.expire(session);
    }

    fn apply(&mut self, commit: &Commit, ctx: &ApplyContext, body: &[u8]) -> Result<Vec<u8>> {
        let command: Command = crate::encoding::bincode::deserialize(body)?;
        match command {
            Command::Add { value, ttl_ms, mode } => {
                self.entries.insert(
                    value,
                    Record {
                        written_at: commit.index,
                        timestamp: commit.timestamp,
                        ttl_ms,
                        ephemeral: mode == Mode::Ephemeral,
                        session: commit.session,
                    },
                );
                Ok(Vec::new())
            }
            Command::Contains { value } => {
                // Lazily evict a prior entry found to be expired or
                // ephemerally orphaned: a reader treats it as absent and is
                // free to overwrite/remove it.
                let live = match self.entries.get(&value) {
                    Some(record) => {
                        // Liveness is the record's *own* session, not the
                        // session that happens to be making this read.
                        let session_live = record.session.map(|s| ctx.session_live(s)).unwrap_or(true);
                        if record.is_live(ctx.now, session_live) {
                            true
                        } else {
                            self.entries.remove(&value);
                            false
                        }
                    }
                    None => false,
                };
                Ok(vec![live as u8])
            }
        }
    }

    fn filter(&self, commit: &Commit, ctx: &FilterContext, body: &[u8]) -> Result<bool> {
        let command: Command = crate::encoding::bincode::deserialize(body)?;
        Ok(match command {
            Command::Add { value, ttl_ms, mode } => {
                let ephemeral = mode == Mode::Ephemeral;
                match self.entries.get(&value) {
                    // Only the record actually written by `commit` is worth
                    // keeping; an older, superseded `Add` at a lower commit
                    // index is always stale once a newer one has landed.
                    Some(record) if record.written_at == commit.index => {
                        Record {
                            written_at: record.written_at,
                            timestamp: commit.timestamp,
                            ttl_ms,
                            ephemeral,
                            session: commit.session,
                        }
                        .is_live(ctx.now, ctx.session_live)
                    }
                    _ => false,
                }
            }
            // `Contains` never itself needs retaining once applied: it
            // produces no durable state of its own.
            Command::Contains { .. } => commit.index > ctx.commit_index,
        })
    }

    fn policy(&self, _body: &[u8]) -> CompactionPolicy {
        CompactionPolicy::Major
    }
}
