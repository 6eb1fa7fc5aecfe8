//! Fixed-maximum-size append-only segment files.
//!
//! On-disk format, little-endian throughout:
//!
//! ```text
//! header: magic:u32 version:u16 firstIndex:u64
//! record: length:u32 index:u64 term:u64 timestamp:i64 payload:[P bytes] crc32:u32
//! ```
//!
//! `length` is the byte count of everything in the record after itself
//! (index, term, timestamp, payload, crc32), so `P = length - 28`. End of
//! segment is the first record whose `length` is zero (never written) or
//! whose `crc32` fails to validate; any residual bytes are discarded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::raft::{Entry, Index};

pub const MAGIC: u32 = 0x5241_4654; // ASCII "RAFT", read as a little-endian u32
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 4 + 2 + 8;

/// Byte size of the fixed portion of a record: index, term, timestamp, crc32.
const RECORD_FIXED_LEN: usize = 8 + 8 + 8 + 4;

/// One append-only segment file covering a contiguous range of indexes.
///
/// `id` is the segment's creation ordinal, assigned by whoever creates it
/// (the journal). It is tracked only in memory and in the store's manifest
/// (see [`super::journal`]); the on-disk header carries only `firstIndex`,
/// matching the wire format above exactly. `id` exists purely to break ties
/// between overlapping segments left behind by a crash mid-compaction: the
/// segment with the higher id is canonical.
pub struct Segment {
    pub id: u64,
    pub first_index: Index,
    /// Highest index currently stored. `first_index - 1` when empty.
    pub last_index: Index,
    path: PathBuf,
    file: File,
    /// Current file length, i.e. the offset the next record will be written at.
    size: u64,
    pub cap: u64,
    /// `(index, offset)` for every entry physically present, sorted by
    /// index. Kept in memory only, rebuilt by the scan in [`load`]; lets
    /// `read(index)` seek directly instead of scanning the segment.
    ///
    /// This is sparse rather than `first_index`-indexed because compaction
    /// rewrites a segment keeping only some of its entries while
    /// `first_index`/`last_index` keep denoting the segment's full original
    /// addressing range, so neighboring segments stay contiguous.
    entries: Vec<(Index, u64)>,
}

impl Segment {
    /// Allocates a new segment file named `<firstIndex>.log` and writes its
    /// header. Fails if a file by that name already exists.
    pub fn create(dir: &Path, id: u64, first_index: Index, cap: u64) -> Result<Self> {
        let path = dir.join(Self::file_name(first_index));
        let mut file = OpenOptions::new().write(true).read(true).create_new(true).open(&path)?;
        file.write_all(&Self::encode_header(first_index))?;
        file.flush()?;
        Ok(Self {
            id,
            first_index,
            last_index: first_index.saturating_sub(1),
            path,
            file,
            size: HEADER_LEN,
            cap,
            entries: Vec::new(),
        })
    }

    /// Allocates a rewrite target for compaction: a sibling file named
    /// `<firstIndex>.log.tmp`, invisible to [`load`] until
    /// [`Segment::commit_tmp`] renames it over the final name.
    pub fn create_tmp(dir: &Path, id: u64, first_index: Index, cap: u64) -> Result<Self> {
        let path = dir.join(format!("{first_index}.log.tmp"));
        let mut file = OpenOptions::new().write(true).read(true).create_new(true).open(&path)?;
        file.write_all(&Self::encode_header(first_index))?;
        file.flush()?;
        Ok(Self {
            id,
            first_index,
            last_index: first_index.saturating_sub(1),
            path,
            file,
            size: HEADER_LEN,
            cap,
            entries: Vec::new(),
        })
    }

    /// Fsyncs the rewritten file and atomically renames it from
    /// `<firstIndex>.log.tmp` over `<firstIndex>.log`, replacing the
    /// segment being compacted. A crash before this call leaves only the
    /// harmless `.tmp` file, cleaned up by the next [`load`]; a crash after
    /// leaves the new segment fully in place.
    pub fn commit_tmp(mut self, dir: &Path) -> Result<Self> {
        self.flush()?;
        let final_path = dir.join(Self::file_name(self.first_index));
        std::fs::rename(&self.path, &final_path)?;
        File::open(dir)?.sync_all()?;
        self.path = final_path;
        Ok(self)
    }

    /// Opens an existing, already-validated segment file for append/read,
    /// without re-scanning it. Used by [`load`] after recovery.
    fn open(
        path: PathBuf,
        id: u64,
        first_index: Index,
        last_index: Index,
        size: u64,
        cap: u64,
        entries: Vec<(Index, u64)>,
    ) -> Result<Self> {
        let file = OpenOptions::new().write(true).read(true).open(&path)?;
        Ok(Self { id, first_index, last_index, path, file, size, cap, entries })
    }

    /// Byte offset of `index` within this segment, if physically present.
    /// Returns `None` both when `index` is out of range and when it fell
    /// within range but was dropped by compaction -- the caller treats
    /// both the same way, as "nothing to read here".
    pub fn offset_of(&self, index: Index) -> Option<u64> {
        if index < self.first_index || index > self.last_index {
            return None;
        }
        self.entries.binary_search_by_key(&index, |&(i, _)| i).ok().map(|pos| self.entries[pos].1)
    }

    /// Entries physically present in this segment, in index order. Used by
    /// the compactor to decide what to keep when rewriting.
    pub fn iter_indices(&self) -> impl Iterator<Item = Index> + '_ {
        self.entries.iter().map(|&(i, _)| i)
    }

    pub fn file_name(first_index: Index) -> String {
        format!("{first_index}.log")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_header(first_index: Index) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6..14].copy_from_slice(&first_index.to_le_bytes());
        buf
    }

    fn decode_header(buf: &[u8]) -> Result<Index> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::CorruptedLog(format!("bad segment magic {magic:#x}")));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::CorruptedLog(format!("unsupported segment version {version}")));
        }
        Ok(Index::from_le_bytes(buf[6..14].try_into().unwrap()))
    }

    fn encode_record(entry: &Entry) -> Vec<u8> {
        let mut body = Vec::with_capacity(24 + entry.payload.len());
        body.extend_from_slice(&entry.index.to_le_bytes());
        body.extend_from_slice(&entry.term.to_le_bytes());
        body.extend_from_slice(&entry.timestamp.to_le_bytes());
        body.extend_from_slice(&entry.payload);
        let crc = crc32fast::hash(&body);

        let length = (body.len() + 4) as u32;
        let mut record = Vec::with_capacity(4 + body.len() + 4);
        record.extend_from_slice(&length.to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Decodes one record from `buf`, which must hold at least the record's
    /// `length` bytes after the length field. Validates the CRC.
    fn decode_record(length: u32, buf: &[u8]) -> Result<Entry> {
        if (length as usize) < RECORD_FIXED_LEN {
            return Err(Error::Corrupted(format!("record length {length} too short")));
        }
        let body = &buf[..length as usize - 4];
        let stored_crc = u32::from_le_bytes(buf[length as usize - 4..length as usize].try_into().unwrap());
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(Error::Corrupted(format!(
                "crc mismatch: stored {stored_crc:#x} actual {actual_crc:#x}"
            )));
        }
        let index = Index::from_le_bytes(body[0..8].try_into().unwrap());
        let term = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let timestamp = i64::from_le_bytes(body[16..24].try_into().unwrap());
        let payload = body[24..].to_vec();
        Ok(Entry { index, term, timestamp, payload })
    }

    /// Appends `entry` to the segment, returning its byte offset. Fails with
    /// `SegmentFull` if it would exceed `cap`; the caller then rolls to a new
    /// segment and retries there.
    pub fn append(&mut self, entry: &Entry) -> Result<u64> {
        let record = Self::encode_record(entry);
        let total_len = record.len() as u64;
        if self.size + total_len > self.cap {
            return Err(Error::SegmentFull);
        }
        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        self.size += total_len;
        self.last_index = entry.index;
        self.entries.push((entry.index, offset));
        Ok(offset)
    }

    /// Overrides the segment's addressing range without touching its
    /// physical entries. Used only by the compactor, which rewrites a
    /// segment (or merges several into one) keeping fewer entries than the
    /// result originally addressed, but must preserve the combined
    /// `first_index..=last_index` span so that neighboring segments stay
    /// contiguous.
    pub(crate) fn set_range(&mut self, first_index: Index, last_index: Index) {
        self.first_index = first_index;
        self.last_index = last_index;
    }

    /// Reads the entry at `offset`. Only entries beyond the caller's
    /// commit index may legally be rejected as corrupted.
    ///
    /// Takes `&self`: `&File` implements `Read`/`Seek` in terms of
    /// positioned syscalls that don't need Rust-level exclusivity, so reads
    /// can run concurrently with each other under the journal's read lock.
    pub fn read(&self, offset: u64) -> Result<Entry> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut length_buf = [0u8; 4];
        file.read_exact(&mut length_buf)?;
        let length = u32::from_le_bytes(length_buf);
        if length == 0 {
            return Err(Error::Corrupted(format!("no record at offset {offset}")));
        }
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Self::decode_record(length, &buf)
    }

    /// Zeroes bytes from `offset` to the current end of file. Used by the
    /// journal's explicit `truncate(index)`, as distinct from crash
    /// recovery (see [`load`], which shrinks the file instead since there is
    /// no valid data after the recovered tail to preserve).
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        if offset >= self.size {
            return Ok(());
        }
        let remaining = self.size - offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&vec![0u8; remaining as usize])?;
        self.file.flush()?;
        self.size = offset;
        let keep = self.entries.partition_point(|&(_, o)| o < offset);
        self.entries.truncate(keep);
        self.last_index =
            self.entries.last().map(|&(i, _)| i).unwrap_or_else(|| self.first_index.saturating_sub(1));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Segment size caps aren't persisted in the header (they're a runtime
    /// policy, not part of the durable format); the journal reapplies the
    /// configured cap to the tail segment after [`load`].
    pub fn set_cap(&mut self, cap: u64) {
        self.cap = cap;
    }
}

/// Loads all segments from `dir`, sorted by `first_index`, validating that
/// they're contiguous. On the tail segment, scans forward from the header
/// and stops at the first record that fails to decode, shrinking the file to
/// the last valid record's end -- this is the crash-recovery path for a
/// torn write left behind by a crash mid-append.
pub fn load(dir: &Path) -> Result<Vec<Segment>> {
    std::fs::create_dir_all(dir)?;

    let mut candidates: Vec<(Index, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if let Some(stripped) = name.strip_suffix(".log") {
            if let Ok(first_index) = stripped.parse::<Index>() {
                candidates.push((first_index, path));
            }
        }
        // `.log.tmp` files are incomplete compaction artifacts; a crash
        // between writing and renaming them never made them canonical, so
        // they're simply removed.
        if name.ends_with(".log.tmp") {
            std::fs::remove_file(&path)?;
        }
    }
    candidates.sort_by_key(|(first_index, _)| *first_index);

    let mut segments = Vec::with_capacity(candidates.len());
    let mut expected_next: Option<Index> = None;
    let last_i = candidates.len().saturating_sub(1);
    for (i, (first_index, path)) in candidates.into_iter().enumerate() {
        if let Some(expected) = expected_next {
            if first_index != expected {
                return Err(Error::CorruptedLog(format!(
                    "gap in segment log: expected next segment to start at {expected}, found {first_index}"
                )));
            }
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(Error::CorruptedLog(format!("segment {path:?} shorter than its header")));
        }
        let mut header_buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header_buf)?;
        let header_first_index = Segment::decode_header(&header_buf)?;
        if header_first_index != first_index {
            return Err(Error::CorruptedLog(format!(
                "segment file name {first_index} does not match header first index {header_first_index}"
            )));
        }

        // Scan forward to find the last valid record, repairing a torn tail.
        let mut offset = HEADER_LEN;
        let mut last_index = first_index.saturating_sub(1);
        let mut entries = Vec::new();
        loop {
            if offset + 4 > file_len {
                break;
            }
            let record_start = offset;
            file.seek(SeekFrom::Start(offset))?;
            let mut length_buf = [0u8; 4];
            file.read_exact(&mut length_buf)?;
            let length = u32::from_le_bytes(length_buf);
            if length == 0 || offset + 4 + length as u64 > file_len {
                break;
            }
            let mut body = vec![0u8; length as usize];
            file.read_exact(&mut body)?;
            match Segment::decode_record(length, &body) {
                Ok(entry) => {
                    last_index = last_index.max(entry.index);
                    entries.push((entry.index, record_start));
                    offset += 4 + length as u64;
                }
                Err(_) => break,
            }
        }

        let is_tail = i == last_i;
        if offset < file_len {
            if !is_tail {
                return Err(Error::CorruptedLog(format!(
                    "segment {path:?} has trailing corruption but is not the tail segment"
                )));
            }
            log::warn!(
                "discarding {} trailing corrupted byte(s) at the tail of segment {path:?} past the last valid record",
                file_len - offset,
            );
            file.set_len(offset)?;
            file.sync_all()?;
        }

        expected_next = Some(last_index + 1);
        segments.push(Segment::open(path, i as u64, first_index, last_index, offset, u64::MAX, entries)?);
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn entry(index: Index, term: Term, payload: &[u8]) -> Entry {
        Entry { index, term, timestamp: 1000, payload: payload.to_vec() }
    }

    use crate::raft::Term;

    #[test]
    fn append_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 0, 1, u64::MAX).unwrap();
        let e1 = entry(1, 1, b"A");
        let off1 = segment.append(&e1).unwrap();
        let e2 = entry(2, 1, b"BB");
        let off2 = segment.append(&e2).unwrap();

        assert_eq!(segment.read(off1).unwrap(), e1);
        assert_eq!(segment.read(off2).unwrap(), e2);
        assert_eq!(segment.last_index, 2);
    }

    #[test]
    fn segment_full_when_cap_exceeded() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 0, 1, HEADER_LEN + 10).unwrap();
        let result = segment.append(&entry(1, 1, b"this payload is too large for the cap"));
        assert!(matches!(result, Err(Error::SegmentFull)));
    }

    #[test]
    fn load_recovers_from_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let mut segment = Segment::create(dir.path(), 0, 1, u64::MAX).unwrap();
            segment.append(&entry(1, 1, b"A")).unwrap();
            segment.append(&entry(2, 1, b"B")).unwrap();
            segment.flush().unwrap();
        }
        // Simulate a crash mid-write: append four garbage bytes that look
        // like the start of a length-prefixed record but never complete.
        {
            let path = dir.path().join(Segment::file_name(1));
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&99u32.to_le_bytes()).unwrap();
            file.write_all(b"short").unwrap();
        }

        let segments = load(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].last_index, 2);
    }

    #[test]
    fn load_rejects_gaps_between_segments() {
        let dir = TempDir::new().unwrap();
        Segment::create(dir.path(), 0, 1, u64::MAX).unwrap();
        Segment::create(dir.path(), 1, 10, u64::MAX).unwrap();
        // Segment starting at 10 with no entries implies a gap after index 0.
        let result = load(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn truncate_discards_tail() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 0, 1, u64::MAX).unwrap();
        let off1 = segment.append(&entry(1, 1, b"A")).unwrap();
        segment.append(&entry(2, 1, b"B")).unwrap();
        segment.truncate(off1).unwrap();
        assert_eq!(segment.last_index, 0);
    }
}
