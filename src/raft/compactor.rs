//! Background reclamation of on-disk log space: minor compaction rewrites
//! one stale segment at a time, major compaction sweeps a contiguous
//! committed range and merges the segments covering it into one.
//!
//! A compaction transaction is (1) write the new segment to a `.log.tmp`
//! sibling, (2) fsync, (3) rename to the final name, (4) fsync the
//! directory, (5) drop the superseded in-memory segment(s) so their
//! now-unlinked inodes are reclaimed. Steps (1)-(4) happen in
//! [`Segment::create_tmp`]/[`Segment::commit_tmp`]; a crash between (3) and
//! (5) is harmless because renaming over the same `<firstIndex>.log` name
//! never leaves two files claiming the same range. Major compaction's merge
//! path additionally deletes the source segments other than the one whose
//! name got reused by the rename -- a crash there can leave a stale segment
//! file on disk that the next `load` will simply treat as a live segment
//! again, which is safe since its entries were never lost, only not yet
//! reclaimed.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::raft::log::Log;
use crate::raft::segment::Segment;
use crate::raft::state_machine::{Commit, CompactionPolicy, Envelope, FilterContext, Runtime, StateMachine};
use crate::raft::{Entry, Index};

pub struct Compactor<S: StateMachine> {
    log: Arc<Log>,
    runtime: Arc<Runtime<S>>,
    minor_threshold: f64,
    major_interval: Duration,
}

impl<S: StateMachine> Compactor<S> {
    pub fn new(log: Arc<Log>, runtime: Arc<Runtime<S>>, minor_threshold: f64, major_interval: Duration) -> Self {
        Self { log, runtime, minor_threshold, major_interval }
    }

    pub fn major_interval(&self) -> Duration {
        self.major_interval
    }

    /// One minor-compaction pass: picks the sealed (non-tail) segment with
    /// the highest stale fraction among entries at or below `commitIndex`
    /// and rewrites it if that fraction meets the configured threshold.
    /// Returns the id of the segment compacted, if any.
    pub fn run_minor(&self) -> Result<Option<u64>> {
        let commit_index = self.log.commit_index();
        let dir = self.log.journal().dir().to_path_buf();

        let candidate = self.pick_minor_candidate(commit_index)?;
        let Some((id, first_index, last_index)) = candidate else { return Ok(None) };

        log::info!("minor compaction: rewriting segment {id} (first={first_index} last={last_index})");
        self.rewrite_segment(&dir, id, first_index, last_index, commit_index, None)?;
        Ok(Some(id))
    }

    fn pick_minor_candidate(&self, commit_index: Index) -> Result<Option<(u64, Index, Index)>> {
        let state = self.log.journal().state().read().unwrap();
        let sealed = &state.segments[..state.segments.len().saturating_sub(1)];

        let mut best: Option<(u64, Index, Index, f64)> = None;
        for segment in sealed {
            let mut total = 0usize;
            let mut stale = 0usize;
            for index in segment.iter_indices() {
                if index > commit_index {
                    continue;
                }
                total += 1;
                let offset = segment.offset_of(index).expect("index came from iter_indices");
                let entry = segment.read(offset)?;
                if !self.should_keep(&entry, commit_index, None)? {
                    stale += 1;
                }
            }
            if total == 0 {
                continue;
            }
            let fraction = stale as f64 / total as f64;
            if fraction >= self.minor_threshold && best.as_ref().map(|b| fraction > b.3).unwrap_or(true) {
                best = Some((segment.id, segment.first_index, segment.last_index, fraction));
            }
        }
        Ok(best.map(|(id, first, last, _)| (id, first, last)))
    }

    /// One major-compaction pass: merges every sealed segment ending at or
    /// before `compaction_index` into a single segment, applying `MAJOR`-
    /// policy filters with the compaction index visible. Returns the number
    /// of segments folded into the merge, or 0 if there was nothing sealed
    /// to compact.
    ///
    /// Segments are ordered by `first_index` and each one's range picks up
    /// exactly where the previous one's ends, so "every segment with
    /// `last_index <= compaction_index`" is always a contiguous prefix of
    /// the segment list -- there's no gap a merge could straddle.
    pub fn run_major(&self, compaction_index: Index) -> Result<usize> {
        let commit_index = self.log.commit_index();
        if compaction_index > commit_index {
            return Err(Error::Internal(format!(
                "compaction index {compaction_index} beyond commit index {commit_index}"
            )));
        }
        let dir = self.log.journal().dir().to_path_buf();

        let targets: Vec<(u64, Index, Index)> = {
            let state = self.log.journal().state().read().unwrap();
            let sealed = &state.segments[..state.segments.len().saturating_sub(1)];
            sealed.iter().filter(|s| s.last_index <= compaction_index).map(|s| (s.id, s.first_index, s.last_index)).collect()
        };

        if targets.is_empty() {
            return Ok(0);
        }

        log::info!("major compaction: merging {} segment(s) up to index {compaction_index}", targets.len());
        self.merge_segments(&dir, &targets, commit_index, compaction_index)?;
        Ok(targets.len())
    }

    /// Decodes `entry`'s envelope and consults the state machine's filter.
    /// A filter error is treated as "keep" (conservative); entries above
    /// `commitIndex` are always kept regardless of what the filter says,
    /// since compaction must never touch the uncommitted tail.
    ///
    /// During a major pass (`compaction_index.is_some()`), a command whose
    /// declared [`CompactionPolicy`] is `Minor` is never eligible for
    /// removal here -- it survives untouched, and is only ever reclaimed by
    /// a minor pass.
    fn should_keep(&self, entry: &Entry, commit_index: Index, compaction_index: Option<Index>) -> Result<bool> {
        if entry.index > commit_index {
            return Ok(true);
        }
        let envelope: Envelope = match bincode::deserialize(&entry.payload) {
            Ok(envelope) => envelope,
            // Above commitIndex this would be truncatable corruption; here,
            // at or below it, it's fatal -- but a filter pass finding it
            // fatal would halt compaction rather than the apply path, so
            // surface it rather than silently keeping or dropping a record
            // we can't even interpret.
            Err(err) => return Err(err),
        };

        if compaction_index.is_some() {
            let policy = self.runtime.with_state_machine(|machine| machine.policy(&envelope.body));
            if policy == CompactionPolicy::Minor {
                return Ok(true);
            }
        }

        let session_live = match envelope.session {
            Some(id) => self.runtime.session_live(id),
            None => false,
        };
        let commit = Commit { index: entry.index, term: entry.term, timestamp: entry.timestamp, session: envelope.session };
        let ctx = FilterContext { now: self.runtime.time(), commit_index, compaction_index, session_live };

        match self.runtime.with_state_machine(|machine| machine.filter(&commit, &ctx, &envelope.body)) {
            Ok(keep) => Ok(keep),
            Err(err) => {
                log::warn!("filter handler errored at index {}, treating as keep: {err}", entry.index);
                Ok(true)
            }
        }
    }

    /// Rewrites the segment named `id` keeping only the entries
    /// `should_keep` approves, preserving its original addressing range.
    fn rewrite_segment(
        &self,
        dir: &Path,
        id: u64,
        first_index: Index,
        last_index: Index,
        commit_index: Index,
        compaction_index: Option<Index>,
    ) -> Result<()> {
        let kept: Vec<Entry> = {
            let state = self.log.journal().state().read().unwrap();
            let segment = state
                .segments
                .iter()
                .find(|s| s.id == id)
                .ok_or_else(|| Error::Internal(format!("segment {id} vanished mid-compaction")))?;
            let mut kept = Vec::new();
            for index in segment.iter_indices() {
                let offset = segment.offset_of(index).expect("index came from iter_indices");
                let entry = segment.read(offset)?;
                if self.should_keep(&entry, commit_index, compaction_index)? {
                    kept.push(entry);
                }
            }
            kept
        };

        let mut rewritten = Segment::create_tmp(dir, id, first_index, u64::MAX)?;
        for entry in &kept {
            rewritten.append(entry)?;
        }
        rewritten.set_range(first_index, last_index);
        let rewritten = rewritten.commit_tmp(dir)?;

        let mut state = self.log.journal().state().write().unwrap();
        if let Some(pos) = state.segments.iter().position(|s| s.id == id) {
            state.segments[pos] = rewritten;
        }
        Ok(())
    }

    /// Merges `targets` -- a contiguous run of sealed segments, ordered by
    /// `first_index` -- into one new segment spanning their combined range,
    /// keeping only the entries `should_keep` approves. The merged segment
    /// is written under a fresh id but reuses the first target's
    /// `<firstIndex>.log` name, so addressing stays contiguous with
    /// whatever precedes and follows the merged range.
    fn merge_segments(
        &self,
        dir: &Path,
        targets: &[(u64, Index, Index)],
        commit_index: Index,
        compaction_index: Index,
    ) -> Result<()> {
        let first_index = targets.first().unwrap().1;
        let last_index = targets.last().unwrap().2;
        let target_ids: HashSet<u64> = targets.iter().map(|&(id, _, _)| id).collect();

        let kept: Vec<Entry> = {
            let state = self.log.journal().state().read().unwrap();
            let mut kept = Vec::new();
            for &(id, _, _) in targets {
                let segment = state
                    .segments
                    .iter()
                    .find(|s| s.id == id)
                    .ok_or_else(|| Error::Internal(format!("segment {id} vanished mid-compaction")))?;
                for index in segment.iter_indices() {
                    let offset = segment.offset_of(index).expect("index came from iter_indices");
                    let entry = segment.read(offset)?;
                    if self.should_keep(&entry, commit_index, Some(compaction_index))? {
                        kept.push(entry);
                    }
                }
            }
            kept
        };

        let new_id = {
            let mut state = self.log.journal().state().write().unwrap();
            let id = state.next_segment_id;
            state.next_segment_id += 1;
            id
        };

        let mut merged = Segment::create_tmp(dir, new_id, first_index, u64::MAX)?;
        for entry in &kept {
            merged.append(entry)?;
        }
        merged.set_range(first_index, last_index);
        let merged = merged.commit_tmp(dir)?;

        let removed: Vec<Segment> = {
            let mut state = self.log.journal().state().write().unwrap();
            // `targets` is always a prefix of the segment list (see
            // `run_major`'s doc comment), so the merged segment always
            // replaces the first `targets.len()` entries.
            let removed: Vec<Segment> = state.segments.drain(0..targets.len()).collect();
            debug_assert!(removed.iter().all(|s| target_ids.contains(&s.id)));
            state.segments.insert(0, merged);
            removed
        };

        // The first removed segment's file was already replaced in place by
        // `commit_tmp`'s rename; the rest are now-redundant and must be
        // deleted explicitly.
        for segment in removed.into_iter().skip(1) {
            segment.delete()?;
        }
        Ok(())
    }

    /// Spawns a background thread that runs a major-compaction pass every
    /// `major_interval` against the apply thread's current `applied_index`
    /// as the compaction index.
    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()>
    where
        S: 'static,
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(self.major_interval);
            let compaction_index = self.runtime.applied_index();
            if compaction_index == 0 {
                continue;
            }
            if let Err(err) = self.run_major(compaction_index) {
                log::error!("major compaction pass failed: {err}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::raft::demo::{Command, KvStateMachine, Mode};

    fn open(dir: &TempDir, segment_size: u64) -> Arc<Log> {
        let config = Config { segment_size, ..Config::default() };
        Arc::new(Log::open(dir.path(), &config).unwrap())
    }

    fn add(value: i32) -> Vec<u8> {
        bincode::serialize(&Command::Add { value, ttl_ms: 0, mode: Mode::Persistent })
    }

    #[test]
    fn minor_compaction_rewrites_stale_segment() {
        let dir = TempDir::new().unwrap();
        // Cap sized to fit exactly one `Add` record, so each of the two
        // appends below rolls into its own segment.
        let payload_len = Envelope::encode(None, add(1)).len() as u64;
        let record_len = 4 + 24 + payload_len + 4;
        let log = open(&dir, crate::raft::segment::HEADER_LEN + record_len);
        let runtime = Arc::new(Runtime::new(Arc::clone(&log), KvStateMachine::new()));

        let writer = log.writer();
        writer.append(1, 1000, Envelope::encode(None, add(1))).unwrap();
        writer.append(1, 1000, Envelope::encode(None, add(1))).unwrap(); // supersedes index 1
        writer.commit(2).unwrap();
        runtime.poll().unwrap();

        let compactor = Compactor::new(Arc::clone(&log), Arc::clone(&runtime), 0.5, Duration::from_secs(300));
        let compacted = compactor.run_minor().unwrap();
        assert!(compacted.is_some());

        // The superseded first `Add` is gone; the journal's addressing is untouched.
        assert!(matches!(log.get(1), Err(Error::OutOfBounds(1))));
        assert!(log.get(2).is_ok());
    }

    #[test]
    fn minor_compaction_skips_when_below_threshold() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, crate::raft::segment::HEADER_LEN + 64);
        let runtime = Arc::new(Runtime::new(Arc::clone(&log), KvStateMachine::new()));

        let writer = log.writer();
        writer.append(1, 1000, Envelope::encode(None, add(1))).unwrap();
        writer.commit(1).unwrap();
        runtime.poll().unwrap();

        let compactor = Compactor::new(Arc::clone(&log), Arc::clone(&runtime), 0.5, Duration::from_secs(300));
        // Only one segment exists and it's the tail: nothing sealed to compact.
        assert_eq!(compactor.run_minor().unwrap(), None);
    }

    /// Never keeps anything by content; exists to isolate the effect of
    /// `policy()` from `filter()` in major-pass tests below. Each body is a
    /// single byte: even means `Minor`, odd means `Major`.
    struct PolicyProbe;

    impl StateMachine for PolicyProbe {
        fn register(&mut self, _session: crate::raft::session::SessionId) {}
        fn expire(&mut self, _session: crate::raft::session::SessionId) {}
        fn close(&mut self, _session: crate::raft::session::SessionId) {}

        fn apply(&mut self, _commit: &Commit, _ctx: &crate::raft::state_machine::ApplyContext, _body: &[u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn filter(&self, _commit: &Commit, _ctx: &FilterContext, _body: &[u8]) -> Result<bool> {
            Ok(false)
        }

        fn policy(&self, body: &[u8]) -> CompactionPolicy {
            if body[0] % 2 == 0 { CompactionPolicy::Minor } else { CompactionPolicy::Major }
        }
    }

    #[test]
    fn major_compaction_merges_sealed_segments_and_respects_policy() {
        let dir = TempDir::new().unwrap();
        // Cap sized for exactly one record, so each append rolls into its
        // own segment.
        let payload_len = Envelope::encode(None, vec![0u8]).len() as u64;
        let record_len = 4 + 24 + payload_len + 4;
        let log = open(&dir, crate::raft::segment::HEADER_LEN + record_len);
        let runtime = Arc::new(Runtime::new(Arc::clone(&log), PolicyProbe));
        let writer = log.writer();

        writer.append(1, 1000, Envelope::encode(None, vec![0u8])).unwrap(); // index 1: Minor, survives
        writer.append(1, 1000, Envelope::encode(None, vec![1u8])).unwrap(); // index 2: Major, filtered out
        writer.append(1, 1000, Envelope::encode(None, vec![2u8])).unwrap(); // index 3: Minor, survives
        writer.append(1, 1000, Envelope::encode(None, vec![3u8])).unwrap(); // index 4: tail, untouched
        writer.commit(4).unwrap();

        let log_files = |dir: &Path| -> Vec<String> {
            std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .filter(|name| name.ends_with(".log"))
                .collect()
        };
        assert_eq!(log_files(dir.path()).len(), 4);

        let compactor = Compactor::new(Arc::clone(&log), Arc::clone(&runtime), 0.5, Duration::from_secs(300));
        let merged = compactor.run_major(4).unwrap();
        assert_eq!(merged, 3, "segments for indices 1-3 are all sealed and within the compaction range");

        assert!(log.get(1).is_ok(), "Minor-policy entry is never eligible for major-pass removal");
        assert!(matches!(log.get(2), Err(Error::OutOfBounds(2))), "Major-policy entry was filtered out");
        assert!(log.get(3).is_ok(), "Minor-policy entry is never eligible for major-pass removal");
        assert!(log.get(4).is_ok(), "tail segment is never touched by compaction");

        // Segments 1-3 collapsed into a single merged segment; the tail is untouched.
        assert_eq!(log_files(dir.path()).len(), 2, "three sealed segments merged into one, plus the untouched tail");
    }
}
