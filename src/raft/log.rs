//! Specializes the [journal](super::journal) with Raft commit semantics: a
//! monotonic `commitIndex`, `flushOnCommit` fsync behavior, and truncation
//! that refuses to touch committed entries.
//!
//! The Raft log has the following invariants:
//!
//! * `commitIndex <= lastIndex` always.
//! * Once `commitIndex` reaches `i`, the entry at `i` is never rewritten by
//!   any path except major compaction, which may only replace it with a
//!   semantically equivalent or smaller-footprint entry.
//! * `commitIndex` survives a restart: a reopened log never truncates an
//!   entry that was committed and durable before it closed.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::raft::journal::Journal;
use crate::raft::{Entry, Index, Term};

const COMMIT_FILE: &str = "commit";

pub struct Log {
    journal: Journal,
    commit_index: AtomicU64,
    flush_on_commit: bool,
    /// Set once an fsync fails on the commit path: a durability failure is
    /// never silently swallowed. Once set, further writes are refused
    /// rather than risk committing over a gap.
    degraded: AtomicBool,
}

impl Log {
    pub fn open(dir: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let journal = Journal::open(dir, config.segment_size)?;
        // A crash can leave the journal's tail ahead of the last persisted
        // commit file (e.g. an append that was never committed), but never
        // behind it: `commit()` only persists after the fsync it guards
        // succeeds. Clamp defensively anyway so a corrupted or hand-edited
        // commit file can't resurrect a commitIndex beyond what physically
        // exists.
        let commit_index = load_commit_index(journal.dir())?.min(journal.last_index());
        Ok(Self {
            journal,
            commit_index: AtomicU64::new(commit_index),
            flush_on_commit: config.flush_on_commit,
            degraded: AtomicBool::new(false),
        })
    }

    /// Whether a prior fsync failure has put this log into a read-only
    /// degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn first_index(&self) -> Index {
        self.journal.first_index()
    }

    pub fn last_index(&self) -> Index {
        self.journal.last_index()
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn get(&self, index: Index) -> Result<Entry> {
        self.journal.read(index)
    }

    /// Returns a writer over this log. Cheap: the log is already internally
    /// synchronized, so the writer is just a thin handle.
    pub fn writer(&self) -> Writer<'_> {
        Writer { log: self }
    }

    /// Returns a forward cursor over `[start_index, lastIndex]`. The cursor
    /// re-resolves each entry by index on every call to `next`, so it
    /// naturally observes truncation: advancing past a position it hasn't
    /// yet reached that was since truncated away yields `Error::OutOfBounds`
    /// instead of silently stopping.
    pub fn reader(&self, start_index: Index) -> Reader<'_> {
        let high_water = self.last_index();
        Reader { log: self, next: start_index, high_water }
    }

    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }
}

/// Reads the durably persisted `commitIndex` written by a prior
/// `persist_commit_index`, or `0` if the log has never committed anything.
fn load_commit_index(dir: &Path) -> Result<Index> {
    let path = commit_file_path(dir);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let Ok(bytes): std::result::Result<[u8; 8], _> = bytes.try_into() else {
        return Err(Error::CorruptedLog(format!("{path:?} is not an 8-byte commit index")));
    };
    Ok(u64::from_le_bytes(bytes))
}

/// Durably persists `index` as the log's `commitIndex`, via the same
/// write-tmp/fsync/rename/fsync-directory transaction compaction uses for
/// segment files.
fn persist_commit_index(dir: &Path, index: Index) -> Result<()> {
    let tmp_path = dir.join(format!("{COMMIT_FILE}.tmp"));
    let final_path = commit_file_path(dir);
    std::fs::write(&tmp_path, index.to_le_bytes())?;
    File::open(&tmp_path)?.sync_all()?;
    std::fs::rename(&tmp_path, &final_path)?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn commit_file_path(dir: &Path) -> PathBuf {
    dir.join(COMMIT_FILE)
}

pub struct Writer<'a> {
    log: &'a Log,
}

impl Writer<'_> {
    pub fn append(&self, term: Term, timestamp: i64, payload: Vec<u8>) -> Result<Index> {
        self.check_degraded()?;
        self.log.journal.append(term, timestamp, payload)
    }

    /// Advances `commitIndex` to `index`. A no-op if `index <= commitIndex`
    /// (monotonic). Fsyncs synchronously first when the log is configured
    /// `flushOnCommit`, then durably persists the new `commitIndex` itself
    /// so it survives a restart. A failure at either step halts
    /// `commitIndex` progression at its last durable value and puts the log
    /// into degraded mode.
    pub fn commit(&self, index: Index) -> Result<Index> {
        self.check_degraded()?;
        let current = self.log.commit_index.load(Ordering::SeqCst);
        if index <= current {
            return Ok(current);
        }
        if self.log.flush_on_commit {
            self.flush()?;
        }
        if let Err(err) = persist_commit_index(self.log.journal.dir(), index) {
            self.log.degraded.store(true, Ordering::SeqCst);
            log::error!("failed to persist commit index, log entering read-only degraded mode: {err}");
            return Err(err);
        }
        self.log.commit_index.store(index, Ordering::SeqCst);
        log::debug!("commit index advanced to {index}");
        Ok(index)
    }

    /// Removes all entries with `i > index`. Fails with
    /// `CannotTruncateCommitted` when `index <= commitIndex`.
    pub fn truncate(&self, index: Index) -> Result<()> {
        self.check_degraded()?;
        let commit_index = self.log.commit_index.load(Ordering::SeqCst);
        if index <= commit_index {
            return Err(Error::CannotTruncateCommitted(index));
        }
        self.log.journal.truncate(index)
    }

    pub fn flush(&self) -> Result<()> {
        if let Err(err) = self.log.journal.flush() {
            self.log.degraded.store(true, Ordering::SeqCst);
            log::error!("fsync failed, log entering read-only degraded mode: {err}");
            return Err(err);
        }
        Ok(())
    }

    fn check_degraded(&self) -> Result<()> {
        if self.log.is_degraded() {
            return Err(Error::Internal("log is in a read-only degraded mode after a prior fsync failure".into()));
        }
        Ok(())
    }
}

pub struct Reader<'a> {
    log: &'a Log,
    next: Index,
    /// Highest `lastIndex` ever observed by this reader. Lets `next`
    /// distinguish "reached the current end of the log" (not yet an error)
    /// from "the position I was about to read got truncated away" (is).
    high_water: Index,
}

impl Iterator for Reader<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        let last = self.log.last_index();
        self.high_water = self.high_water.max(last);
        if self.next > last {
            if self.next <= self.high_water {
                return Some(Err(Error::OutOfBounds(self.next)));
            }
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.log.get(index))
    }
}
