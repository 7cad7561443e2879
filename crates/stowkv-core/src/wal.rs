//! Write-Ahead Log implementation for StowKV
//!
//! Records are applied to the in-memory stores first (under record locks) and
//! reach the WAL when their transaction commits: the whole transaction is
//! appended as one batch, terminated by a `Commit` record, then synced.
//! Recovery applies only transactions whose `Commit` record survived.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::error::{StoreError, StoreResult};
use crate::format::{
    deserialize_record, find_next_magic, framed_len, serialize_record, LogRecord, Operation, SizeLimits,
    HEADER_SIZE, FRAME_MAGIC,
};
use crate::platform_durability::durable_sync;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".stow";

fn segment_name(sequence: u64) -> String {
    format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// List WAL segments in `wal_dir`, sorted by sequence number.
fn list_segments(wal_dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    let entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(StoreError::io(wal_dir, "Failed to read WAL directory", e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(wal_dir, "Failed to read directory entry", e))?;
        let path = entry.path();
        if let Some(sequence) = path.file_name().and_then(|n| n.to_str()).and_then(parse_segment_name) {
            segments.push((sequence, path));
        }
    }
    segments.sort_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

/// WAL writer: appends committed transactions and rotates segments.
pub struct WalWriter {
    /// Current segment file handle
    file: File,
    /// Path to current segment (for error context)
    path: PathBuf,
    /// Current segment size in bytes (tracked to avoid stat calls)
    size: u64,
    /// WAL directory for segment rotation
    wal_dir: PathBuf,
    /// Sequence number of the current segment
    sequence: u64,
    /// Rotate once a segment would grow past this many bytes
    rotation_size: u64,
    /// Key/value size limits enforced on serialization
    limits: SizeLimits,
}

impl WalWriter {
    /// Open a WAL writer in `wal_dir`, resuming the highest existing segment.
    pub fn new<P: AsRef<Path>>(wal_dir: P, limits: SizeLimits, rotation_size: u64) -> StoreResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io(&wal_dir, "Failed to create WAL directory", e))?;

        let sequence = list_segments(&wal_dir)?.last().map_or(0, |(sequence, _)| *sequence);
        let (file, path, size) = Self::open_segment(&wal_dir, sequence)?;

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size, limits })
    }

    fn open_segment(wal_dir: &Path, sequence: u64) -> StoreResult<(File, PathBuf, u64)> {
        let path = wal_dir.join(segment_name(sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, "Failed to open WAL segment", e))?;
        let size = file
            .metadata()
            .map_err(|e| StoreError::io(&path, "Failed to stat WAL segment", e))?
            .len();
        Ok((file, path, size))
    }

    /// Append a batch of records as one write, optionally syncing afterwards.
    ///
    /// Every record is serialized before anything is written, so an oversized
    /// record rejects the whole batch without touching the file.
    pub fn append_batch(&mut self, records: &[LogRecord], sync: bool) -> StoreResult<()> {
        let mut batch = Vec::new();
        for record in records {
            batch.extend_from_slice(&serialize_record(record, self.limits)?);
        }
        if batch.is_empty() {
            return Ok(());
        }

        if self.size > 0 && self.size + batch.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&batch)
            .map_err(|e| StoreError::io(&self.path, "WAL write failed", e))?;
        self.size += batch.len() as u64;

        if sync {
            self.sync()?;
        }
        Ok(())
    }

    /// Sync the current segment, then continue in a fresh one.
    fn rotate(&mut self) -> StoreResult<()> {
        self.sync()?;
        let (file, path, size) = Self::open_segment(&self.wal_dir, self.sequence + 1)?;
        self.sequence += 1;
        self.file = file;
        self.path = path;
        self.size = size;
        Ok(())
    }

    /// Start a new segment and return its sequence number.
    ///
    /// Everything logged before the call lives in segments with a lower
    /// sequence, which a checkpoint may later retire.
    pub fn start_new_segment(&mut self) -> StoreResult<u64> {
        self.rotate()?;
        Ok(self.sequence)
    }

    /// Delete every segment whose sequence is below `sequence`.
    pub fn retire_segments_before(&self, sequence: u64) -> StoreResult<usize> {
        let mut retired = 0;
        for (seq, path) in list_segments(&self.wal_dir)? {
            if seq >= sequence {
                break;
            }
            std::fs::remove_file(&path).map_err(|e| StoreError::io(&path, "Failed to retire WAL segment", e))?;
            retired += 1;
        }
        Ok(retired)
    }

    /// Get the current segment path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Get the current segment size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }

    /// Sequence number of the current segment
    pub fn current_sequence(&self) -> u64 {
        self.sequence
    }

    /// Durably sync the current segment without writing anything.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::io(&self.path, "WAL sync failed", e))
    }
}

/// WAL reader: replays segments during recovery.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    /// Create a reader for the specified directory.
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Read every intact record from segments numbered `from_sequence` or higher.
    ///
    /// Per segment:
    /// 1. Check the magic bytes at the current offset; resync on mismatch
    /// 2. An entry running past end of file is a torn write: stop this segment
    /// 3. Verify the CRC32C; on mismatch skip ahead to the next magic
    pub fn recover_records(&self, from_sequence: u64) -> StoreResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        for (sequence, path) in list_segments(&self.wal_dir)? {
            if sequence < from_sequence {
                continue;
            }
            records.extend(Self::recover_from_file(&path)?);
        }
        Ok(records)
    }

    /// Group recovered records into committed transactions, in commit order.
    ///
    /// Records of a transaction without a surviving `Commit` are dropped.
    pub fn committed_transactions(&self, from_sequence: u64) -> StoreResult<Vec<Vec<LogRecord>>> {
        let mut pending: HashMap<u64, Vec<LogRecord>> = HashMap::new();
        let mut committed = Vec::new();

        for record in self.recover_records(from_sequence)? {
            if record.operation == Operation::Commit {
                committed.push(pending.remove(&record.txn_id).unwrap_or_default());
            } else {
                pending.entry(record.txn_id).or_default().push(record);
            }
        }

        if !pending.is_empty() {
            tracing::info!(
                discarded = pending.len(),
                "discarding uncommitted transactions found in WAL"
            );
        }
        Ok(committed)
    }

    fn recover_from_file(path: &Path) -> StoreResult<Vec<LogRecord>> {
        let mut file = File::open(path).map_err(|e| StoreError::io(path, "Failed to open WAL segment for recovery", e))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| StoreError::io(path, "Failed to read WAL segment", e))?;

        let mut records = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != FRAME_MAGIC {
                tracing::warn!(path = %path.display(), offset, "bad magic in WAL, scanning for next entry");
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let total = match framed_len(&buffer[offset..]) {
                Some(total) => total,
                None => break,
            };
            if offset + total > buffer.len() {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    needed = total,
                    available = buffer.len() - offset,
                    "torn write at WAL tail, stopping replay of segment"
                );
                break;
            }

            match deserialize_record(&buffer[offset..offset + total], path, offset as u64) {
                Ok(record) => {
                    records.push(record);
                    offset += total;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), offset, error = %e, "corrupt WAL entry skipped");
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LIMITS: SizeLimits = SizeLimits { max_key_size: 128, max_value_size: 1024 };
    const ROTATION: u64 = 1024 * 1024;

    fn writer(dir: &TempDir) -> WalWriter {
        WalWriter::new(dir.path(), LIMITS, ROTATION).unwrap()
    }

    #[test]
    fn test_committed_batch_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        wal.append_batch(
            &[
                LogRecord::put(1, "s", b"key1", b"value1"),
                LogRecord::put(1, "s", b"key2", b"value2"),
                LogRecord::commit(1),
            ],
            true,
        )
        .unwrap();
        drop(wal);

        let txns = WalReader::new(temp.path()).committed_transactions(0).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].len(), 2);
        assert_eq!(txns[0][0].key, b"key1");
        assert_eq!(txns[0][1].value, b"value2");
    }

    #[test]
    fn test_uncommitted_transaction_discarded() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        wal.append_batch(&[LogRecord::put(1, "s", b"a", b"1"), LogRecord::commit(1)], false).unwrap();
        wal.append_batch(&[LogRecord::put(2, "s", b"b", b"2")], false).unwrap();
        drop(wal);

        let txns = WalReader::new(temp.path()).committed_transactions(0).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0][0].key, b"a");
    }

    #[test]
    fn test_corruption_recovery_skips_bad_entry() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        wal.append_batch(&[LogRecord::put(1, "s", b"good1", b"val1"), LogRecord::commit(1)], true).unwrap();
        let first_len = wal.current_size() as usize;
        wal.append_batch(&[LogRecord::put(2, "s", b"good2", b"val2"), LogRecord::commit(2)], true).unwrap();
        let path = wal.current_path().to_path_buf();
        drop(wal);

        // Flip a payload byte of the second transaction's put
        let mut data = std::fs::read(&path).unwrap();
        data[first_len + HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover_records(0).unwrap();
        assert_eq!(records[0].key, b"good1");
        assert!(records.iter().all(|r| r.key != b"good2"));

        // The second transaction's commit survives, but it commits nothing
        let txns = WalReader::new(temp.path()).committed_transactions(0).unwrap();
        assert_eq!(txns.len(), 2);
        assert!(txns[1].is_empty());
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        wal.append_batch(&[LogRecord::put(1, "s", b"complete", b"entry"), LogRecord::commit(1)], true).unwrap();
        let path = wal.current_path().to_path_buf();
        drop(wal);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&FRAME_MAGIC);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 24]);
        std::fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover_records(0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, b"complete");
    }

    #[test]
    fn test_empty_wal_directory() {
        let temp = TempDir::new().unwrap();
        let records = WalReader::new(temp.path().join("missing")).recover_records(0).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_segment_naming_and_retirement() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        let name = wal.current_path().file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(parse_segment_name(&name), Some(0));

        wal.append_batch(&[LogRecord::put(1, "s", b"old", b"1"), LogRecord::commit(1)], true).unwrap();
        let next = wal.start_new_segment().unwrap();
        assert_eq!(next, 1);
        wal.append_batch(&[LogRecord::put(2, "s", b"new", b"2"), LogRecord::commit(2)], true).unwrap();

        assert_eq!(wal.retire_segments_before(next).unwrap(), 1);
        let records = WalReader::new(temp.path()).recover_records(0).unwrap();
        assert_eq!(records[0].key, b"new");
    }

    #[test]
    fn test_resume_highest_segment() {
        let temp = TempDir::new().unwrap();
        let mut wal = writer(&temp);
        wal.start_new_segment().unwrap();
        wal.start_new_segment().unwrap();
        drop(wal);

        let wal = writer(&temp);
        assert_eq!(wal.current_sequence(), 2);
    }
}
