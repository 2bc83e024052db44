//! Per-partition replication log
//!
//! An append-only sequence of entries indexed by offset, with a commit
//! watermark. Truncation only ever touches the uncommitted suffix;
//! compaction only ever drops the committed prefix. Each mutation is
//! recorded in a per-partition log file so the log survives restart.
//!
//! Record format: [MAGIC][LEN][BODY][CRC32] where BODY is a bincode
//! `LogRecord`. Replay stops at the first corrupted record.

use crate::common::{crc32, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x48, 0x4C, 0x47, 0x31]; // "HLG1"
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

/// One replicated entry. The checksum covers the payload and travels
/// with the entry on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub offset: u64,
    pub payload: Vec<u8>,
    pub crc: u32,
}

impl LogEntry {
    pub fn new(term: u64, offset: u64, payload: Vec<u8>) -> Self {
        let crc = crc32(&payload);
        Self {
            term,
            offset,
            payload,
            crc,
        }
    }

    pub fn verify(&self) -> bool {
        crc32(&self.payload) == self.crc
    }
}

/// Outcome of a follower-side append attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Accepted { last_offset: u64 },
    /// The log diverges; the leader should resend from `conflict_offset`
    Conflict { conflict_offset: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Append(LogEntry),
    Truncate { offset: u64 },
    Commit { offset: u64 },
    Reset { offset: u64, term: u64 },
}

/// In-memory log window plus its record file
pub struct ReplicationLog {
    partition: u64,
    entries: VecDeque<LogEntry>,
    /// Offset the next appended entry will get
    next_offset: u64,
    /// Term of the entry just below the retained window
    base_term: u64,
    commit_offset: u64,
    retain: usize,
    file: Option<LogFile>,
}

impl ReplicationLog {
    /// Open the log, replaying the record file when a path is given.
    pub fn open(partition: u64, path: Option<PathBuf>, retain: usize) -> Result<Self> {
        let mut log = Self {
            partition,
            entries: VecDeque::new(),
            next_offset: 1,
            base_term: 0,
            commit_offset: 0,
            retain,
            file: None,
        };

        if let Some(path) = path {
            for record in LogFile::replay(&path)? {
                log.apply_record(record);
            }
            log.file = Some(LogFile::open(&path)?);
        }

        Ok(log)
    }

    fn apply_record(&mut self, record: LogRecord) {
        match record {
            LogRecord::Append(entry) => {
                if entry.offset < self.next_offset {
                    self.rewind_to(entry.offset);
                }
                if entry.offset == self.next_offset {
                    self.next_offset += 1;
                    self.entries.push_back(entry);
                }
            }
            LogRecord::Truncate { offset } => self.rewind_to(offset),
            LogRecord::Commit { offset } => {
                self.commit_offset = offset.min(self.last_offset());
            }
            LogRecord::Reset { offset, term } => {
                self.entries.clear();
                self.next_offset = offset + 1;
                self.base_term = term;
                self.commit_offset = offset;
            }
        }
    }

    fn rewind_to(&mut self, offset: u64) {
        while self.last_offset() >= offset && !self.entries.is_empty() {
            self.entries.pop_back();
            self.next_offset -= 1;
        }
    }

    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn last_offset(&self) -> u64 {
        self.next_offset - 1
    }

    /// First offset still held in the in-memory window
    pub fn start_offset(&self) -> u64 {
        self.next_offset - self.entries.len() as u64
    }

    pub fn commit_offset(&self) -> u64 {
        self.commit_offset
    }

    pub fn last_term(&self) -> u64 {
        self.term_at(self.last_offset()).unwrap_or(0)
    }

    /// Term of the entry at `offset`, if known. Offset 0 is the empty
    /// sentinel with term 0.
    pub fn term_at(&self, offset: u64) -> Option<u64> {
        if offset == 0 {
            return Some(0);
        }
        let start = self.start_offset();
        if offset + 1 == start {
            return Some(self.base_term);
        }
        if offset >= start && offset <= self.last_offset() {
            return Some(self.entries[(offset - start) as usize].term);
        }
        None
    }

    pub fn entry(&self, offset: u64) -> Option<&LogEntry> {
        let start = self.start_offset();
        if offset >= start && offset <= self.last_offset() {
            Some(&self.entries[(offset - start) as usize])
        } else {
            None
        }
    }

    /// Clone up to `max` entries starting at `from` (clamped to the
    /// retained window).
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = self.start_offset();
        if from < start {
            return Vec::new();
        }
        (from..=self.last_offset())
            .take(max)
            .filter_map(|o| self.entry(o).cloned())
            .collect()
    }

    /// Like `entries_from`, but never beyond the commit watermark.
    pub fn committed_entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.entries_from(from, max)
            .into_iter()
            .filter(|e| e.offset <= self.commit_offset)
            .collect()
    }

    /// Leader-side append: assign the next offset in `term`.
    pub fn append(&mut self, term: u64, payload: Vec<u8>) -> Result<u64> {
        let offset = self.next_offset;
        let entry = LogEntry::new(term, offset, payload);
        if let Some(file) = &mut self.file {
            file.write_record(&LogRecord::Append(entry.clone()))?;
        }
        self.entries.push_back(entry);
        self.next_offset += 1;
        Ok(offset)
    }

    /// Follower-side append with log matching. `prev_offset`/`prev_term`
    /// identify the entry the batch chains onto.
    pub fn try_append(
        &mut self,
        prev_offset: u64,
        prev_term: u64,
        new_entries: &[LogEntry],
    ) -> Result<AppendOutcome> {
        if prev_offset > self.last_offset() {
            return Ok(AppendOutcome::Conflict {
                conflict_offset: self.last_offset() + 1,
            });
        }

        // Linkage check; below the retained window the committed prefix
        // is identical by invariant, so only verifiable offsets matter.
        if let Some(t) = self.term_at(prev_offset) {
            if t != prev_term {
                if prev_offset <= self.commit_offset {
                    return Err(Error::Corrupt(format!(
                        "log conflict below commit watermark at offset {} (partition {})",
                        prev_offset, self.partition
                    )));
                }
                self.truncate_from(prev_offset)?;
                return Ok(AppendOutcome::Conflict {
                    conflict_offset: prev_offset,
                });
            }
        }

        for e in new_entries {
            if !e.verify() {
                return Err(Error::Corrupt(format!(
                    "entry checksum mismatch at offset {} (partition {})",
                    e.offset, self.partition
                )));
            }
            if e.offset <= self.commit_offset {
                continue;
            }
            match self.term_at(e.offset) {
                Some(t) if t == e.term => continue,
                Some(_) => {
                    self.truncate_from(e.offset)?;
                    self.push(e.clone())?;
                }
                None if e.offset == self.next_offset => self.push(e.clone())?,
                None => {
                    return Ok(AppendOutcome::Conflict {
                        conflict_offset: self.last_offset() + 1,
                    })
                }
            }
        }

        Ok(AppendOutcome::Accepted {
            last_offset: self.last_offset(),
        })
    }

    fn push(&mut self, entry: LogEntry) -> Result<()> {
        debug_assert_eq!(entry.offset, self.next_offset);
        if let Some(file) = &mut self.file {
            file.write_record(&LogRecord::Append(entry.clone()))?;
        }
        self.entries.push_back(entry);
        self.next_offset += 1;
        Ok(())
    }

    /// Drop entries at `offset` and above. Committed entries are never
    /// truncated.
    pub fn truncate_from(&mut self, offset: u64) -> Result<()> {
        if offset <= self.commit_offset {
            return Err(Error::Corrupt(format!(
                "refusing to truncate committed entries at offset {} (commit {})",
                offset, self.commit_offset
            )));
        }
        if offset > self.last_offset() {
            return Ok(());
        }
        if let Some(file) = &mut self.file {
            file.write_record(&LogRecord::Truncate { offset })?;
        }
        self.rewind_to(offset);
        Ok(())
    }

    /// Advance the commit watermark; returns the newly committed entries
    /// in order, for application to the storage engine.
    pub fn set_commit(&mut self, target: u64) -> Result<Vec<LogEntry>> {
        let new_commit = target.min(self.last_offset());
        if new_commit <= self.commit_offset {
            return Ok(Vec::new());
        }
        let newly: Vec<LogEntry> = ((self.commit_offset + 1)..=new_commit)
            .filter_map(|o| self.entry(o).cloned())
            .collect();
        if let Some(file) = &mut self.file {
            file.write_record(&LogRecord::Commit { offset: new_commit })?;
        }
        self.commit_offset = new_commit;
        self.compact();
        Ok(newly)
    }

    /// Drop committed prefix beyond the retention window.
    fn compact(&mut self) {
        while self.entries.len() > self.retain {
            match self.entries.front() {
                Some(front) if front.offset <= self.commit_offset => {
                    let e = self.entries.pop_front().unwrap();
                    self.base_term = e.term;
                }
                _ => break,
            }
        }
    }

    /// Adopt a snapshot boundary: everything at or below `offset` is
    /// covered by restored state.
    pub fn reset_to(&mut self, offset: u64, term: u64) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.write_record(&LogRecord::Reset { offset, term })?;
        }
        self.entries.clear();
        self.next_offset = offset + 1;
        self.base_term = term;
        self.commit_offset = offset;
        Ok(())
    }
}

/// Append-side handle to the record file
struct LogFile {
    writer: BufWriter<File>,
}

impl LogFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let body = bincode::serialize(record)
            .map_err(|e| Error::Wal(format!("encode record: {}", e)))?;
        self.writer.write_all(&LOG_MAGIC)?;
        self.writer
            .write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.write_all(&crc32(&body).to_le_bytes())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay all intact records; stops at the first corrupted or
    /// truncated tail.
    fn replay(path: &Path) -> Result<Vec<LogRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("log replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok(records)
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogRecord>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Wal("invalid record magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_BYTES {
            return Err(Error::Wal(format!("record too large: {} bytes", len)));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body)?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        if crc32(&body) != u32::from_le_bytes(crc_bytes) {
            return Err(Error::Wal("record checksum mismatch".into()));
        }

        let record = bincode::deserialize(&body)
            .map_err(|e| Error::Wal(format!("decode record: {}", e)))?;
        Ok(Some(record))
    }
}
