//! The journal presents a directory of [`Segment`]s as one logical
//! append-only array with positional access.
//!
//! The segment list and cursors are guarded by a single `RwLock`: appenders
//! and the truncator take the write side, readers and the compactor's
//! directory scan take the read side, upgrading to the write side only for
//! the atomic segment-list swap that finishes a compaction pass.
//!
//! Within a process that `RwLock` is the whole story; across processes an
//! advisory `flock` on `dir/.lock` (held for the journal's lifetime) refuses
//! to let a second process open the same directory, since nothing else here
//! coordinates two independent appenders writing the same segment files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};
use crate::raft::segment::{self, Segment};
use crate::raft::{Entry, Index, Term};

pub struct Journal {
    dir: PathBuf,
    state: RwLock<JournalState>,
    /// Advisory exclusive lock on `dir/.lock`, held for the journal's
    /// lifetime to enforce single-writer discipline across processes
    /// (within a process, the `RwLock` above already serializes access).
    /// Released automatically when the journal is dropped.
    _lock_file: File,
}

pub(crate) struct JournalState {
    /// Ordered by `first_index`; always contains at least one segment (the
    /// active tail), even when the journal is empty.
    pub(crate) segments: Vec<Segment>,
    pub(crate) segment_size: u64,
    pub(crate) next_segment_id: u64,
}

impl Journal {
    /// Opens (or creates) a journal rooted at `dir`, loading existing
    /// segments and repairing a torn tail left by a crash mid-write.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock_file = OpenOptions::new().create(true).write(true).open(dir.join(".lock"))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            Error::Internal(format!("{dir:?} is already locked by another open journal"))
        })?;

        let mut segments = segment::load(&dir)?;

        let next_segment_id = segments.last().map(|s| s.id + 1).unwrap_or(0);
        if segments.is_empty() {
            segments.push(Segment::create(&dir, 0, 1, segment_size)?);
        } else {
            segments.last_mut().unwrap().set_cap(segment_size);
        }

        log::info!(
            "opened journal at {:?}: {} segment(s), first={} last={}",
            dir,
            segments.len(),
            segments.first().unwrap().first_index,
            segments.last().unwrap().last_index,
        );

        Ok(Self {
            dir,
            state: RwLock::new(JournalState { segments, segment_size, next_segment_id }),
            _lock_file: lock_file,
        })
    }

    pub fn first_index(&self) -> Index {
        let state = self.state.read().unwrap();
        state.segments.first().unwrap().first_index
    }

    pub fn last_index(&self) -> Index {
        let state = self.state.read().unwrap();
        state.segments.last().unwrap().last_index
    }

    /// Appends a new entry at `last_index() + 1`, rolling to a fresh segment
    /// if the active tail is full. Returns the assigned index.
    pub fn append(&self, term: Term, timestamp: i64, payload: Vec<u8>) -> Result<Index> {
        let mut state = self.state.write().unwrap();
        let index = state.segments.last().unwrap().last_index + 1;
        let entry = Entry { index, term, timestamp, payload };

        let tail = state.segments.last_mut().unwrap();
        match tail.append(&entry) {
            Ok(_) => Ok(index),
            Err(Error::SegmentFull) => {
                log::debug!("rolling segment at index {index}");
                let segment_size = state.segment_size;
                let id = state.next_segment_id;
                state.next_segment_id += 1;
                let mut next = Segment::create(&self.dir, id, index, segment_size)?;
                next.append(&entry)?;
                state.segments.push(next);
                Ok(index)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the entry at `index`, failing with `OutOfBounds` outside
    /// `[firstIndex, lastIndex]` or when `index` fell within range but was
    /// dropped by compaction.
    pub fn read(&self, index: Index) -> Result<Entry> {
        let state = self.state.read().unwrap();
        let segment = Self::locate(&state.segments, index).ok_or(Error::OutOfBounds(index))?;
        let offset = segment.offset_of(index).ok_or(Error::OutOfBounds(index))?;
        segment.read(offset)
    }

    /// Finds the segment that should contain `index` by binary search over
    /// `first_index`, returning `None` if `index` is out of the journal's
    /// overall range.
    fn locate(segments: &[Segment], index: Index) -> Option<&Segment> {
        if segments.is_empty() {
            return None;
        }
        if index < segments.first().unwrap().first_index || index > segments.last().unwrap().last_index {
            return None;
        }
        let pos = segments.partition_point(|s| s.first_index <= index) - 1;
        Some(&segments[pos])
    }

    /// Removes all entries with index greater than `index`: whole segments
    /// starting after it are deleted, and the tail segment covering it is
    /// truncated in place.
    pub fn truncate(&self, index: Index) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let keep = state.segments.iter().take_while(|s| s.first_index <= index).count().max(1);
        let removed = state.segments.split_off(keep);
        for segment in removed {
            segment.delete()?;
        }

        let tail = state.segments.last_mut().unwrap();
        if tail.first_index > index {
            // Even the tail's first entry is past `index`: the whole segment empties out.
            tail.truncate(segment::HEADER_LEN)?;
        } else if let Some(offset) = tail.offset_of(index + 1) {
            tail.truncate(offset)?;
        }
        // Otherwise index >= tail.last_index already: nothing to discard.

        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.segments.last_mut().unwrap().flush()
    }

    pub(crate) fn state(&self) -> &RwLock<JournalState> {
        &self.state
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn append_assigns_sequential_indexes() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        assert_eq!(journal.append(1, 100, b"A".to_vec()).unwrap(), 1);
        assert_eq!(journal.append(1, 100, b"B".to_vec()).unwrap(), 2);
        assert_eq!(journal.last_index(), 2);
    }

    #[test]
    fn read_round_trips_payload() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        let index = journal.append(1, 100, b"hello".to_vec()).unwrap();
        let entry = journal.read(index).unwrap();
        assert_eq!(entry.payload, b"hello");
    }

    #[test]
    fn read_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        journal.append(1, 100, b"A".to_vec()).unwrap();
        assert!(matches!(journal.read(5), Err(Error::OutOfBounds(5))));
        assert!(matches!(journal.read(0), Err(Error::OutOfBounds(0))));
    }

    #[test]
    fn truncate_removes_tail_entries() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        for i in 1..=10u8 {
            journal.append(1, 100, vec![i]).unwrap();
        }
        journal.truncate(7).unwrap();
        assert_eq!(journal.last_index(), 7);
        assert!(journal.read(7).is_ok());
        assert!(matches!(journal.read(8), Err(Error::OutOfBounds(8))));
    }

    #[test]
    fn rolls_to_new_segment_when_full() {
        let dir = TempDir::new().unwrap();
        // Cap just big enough for the header plus one minimal record.
        let journal = Journal::open(dir.path(), segment::HEADER_LEN + 33).unwrap();
        journal.append(1, 100, b"A".to_vec()).unwrap();
        journal.append(1, 100, b"B".to_vec()).unwrap();
        journal.append(1, 100, b"C".to_vec()).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".log"))
            .collect();
        assert_eq!(names.len(), 3);
        for i in 1..=3 {
            assert!(names.contains(&format!("{i}.log")), "missing segment {i}.log: {names:?}");
        }
    }

    #[test]
    fn open_refuses_a_second_concurrent_writer() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        assert!(Journal::open(dir.path(), u64::MAX).is_err());
        drop(journal);
        assert!(Journal::open(dir.path(), u64::MAX).is_ok());
    }

    #[test]
    fn reopen_after_close_preserves_entries() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(dir.path(), u64::MAX).unwrap();
            journal.append(1, 100, b"A".to_vec()).unwrap();
            journal.append(1, 100, b"B".to_vec()).unwrap();
            journal.flush().unwrap();
        }
        let journal = Journal::open(dir.path(), u64::MAX).unwrap();
        assert_eq!(journal.last_index(), 2);
        assert_eq!(journal.read(1).unwrap().payload, b"A");
        assert_eq!(journal.read(2).unwrap().payload, b"B");
    }
}
