//! Checkpoint snapshots
//!
//! A snapshot holds every store's records as of a checkpoint, so WAL
//! segments written before it can be retired. Layout:
//!
//! ```text
//!   [0..4]   magic:        "STSN"
//!   [4..8]   version:      u32
//!   [8..16]  wal_sequence: u64 - first WAL segment NOT covered
//!   [16..20] stores:       u32
//!   [20..24] crc:          u32 - CRC32C of bytes [0..20]
//!   [24..]   framed records: CreateStore, then one Put per record
//! ```
//!
//! Replacement is atomic: write `snapshot.stow.tmp`, durably sync it, rename
//! it over `snapshot.stow`, then sync the directory. A crash before the
//! rename leaves the previous snapshot intact.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::format::{
    deserialize_record, framed_len, serialize_record, LogRecord, Operation, SizeLimits, NO_TXN,
};
use crate::platform_durability::{durable_sync, sync_directory};

/// Snapshot file name inside the environment directory
pub const SNAPSHOT_FILE: &str = "snapshot.stow";

const SNAPSHOT_MAGIC: [u8; 4] = *b"STSN";
const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_HEADER_SIZE: usize = 24;

/// One store's contents
pub type StoreImage = (String, Vec<(Vec<u8>, Vec<u8>)>);

/// Contents of a snapshot file
#[derive(Debug, Default)]
pub struct Snapshot {
    /// First WAL segment written after the snapshot
    pub wal_sequence: u64,
    /// Stores in the snapshot
    pub stores: Vec<StoreImage>,
}

/// Result of writing a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    /// Path of the snapshot file
    pub path: PathBuf,
    /// Number of stores written
    pub stores: usize,
    /// Number of records written
    pub records: usize,
    /// Size of the snapshot file
    pub bytes: u64,
    /// First WAL segment not covered
    pub wal_sequence: u64,
}

fn header(wal_sequence: u64, stores: u32) -> [u8; SNAPSHOT_HEADER_SIZE] {
    let mut buf = [0u8; SNAPSHOT_HEADER_SIZE];
    buf[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
    buf[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&wal_sequence.to_le_bytes());
    buf[16..20].copy_from_slice(&stores.to_le_bytes());
    let crc = crc32c::crc32c(&buf[0..20]);
    buf[20..24].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Write a snapshot of `stores` into `dir`, replacing any previous one.
pub fn write_snapshot(
    dir: &Path,
    wal_sequence: u64,
    stores: &[StoreImage],
    limits: SizeLimits,
) -> StoreResult<SnapshotResult> {
    let path = dir.join(SNAPSHOT_FILE);
    let tmp_path = dir.join(format!("{}.tmp", SNAPSHOT_FILE));

    let mut buffer = Vec::new();
    buffer.extend_from_slice(&header(wal_sequence, stores.len() as u32));
    let mut records = 0;
    for (name, contents) in stores {
        buffer.extend_from_slice(&serialize_record(&LogRecord::create_store(NO_TXN, name), limits)?);
        for (key, value) in contents {
            buffer.extend_from_slice(&serialize_record(&LogRecord::put(NO_TXN, name, key, value), limits)?);
            records += 1;
        }
    }

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| StoreError::io(&tmp_path, "Failed to create snapshot file", e))?;
        file.write_all(&buffer)
            .map_err(|e| StoreError::io(&tmp_path, "Failed to write snapshot", e))?;
        durable_sync(&file).map_err(|e| StoreError::io(&tmp_path, "Failed to sync snapshot", e))?;
    }

    fs::rename(&tmp_path, &path).map_err(|e| StoreError::io(&path, "Failed to install snapshot", e))?;
    sync_directory(dir).map_err(|e| StoreError::io(dir, "Failed to sync directory after snapshot", e))?;

    Ok(SnapshotResult { path, stores: stores.len(), records, bytes: buffer.len() as u64, wal_sequence })
}

/// Load the snapshot in `dir`, if there is one.
///
/// Snapshots are installed atomically, so any damage is reported as
/// corruption rather than skipped.
pub fn read_snapshot(dir: &Path) -> StoreResult<Option<Snapshot>> {
    let path = dir.join(SNAPSHOT_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(&path, "Failed to read snapshot", e)),
    };

    let corrupted = |offset: usize, reason: &str| StoreError::WalCorrupted {
        path: path.clone(),
        offset: offset as u64,
        reason: reason.to_string(),
    };

    if data.len() < SNAPSHOT_HEADER_SIZE || data[0..4] != SNAPSHOT_MAGIC {
        return Err(corrupted(0, "missing snapshot header"));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&data[20..24]);
    if crc32c::crc32c(&data[0..20]) != u32::from_le_bytes(word) {
        return Err(corrupted(0, "snapshot header checksum mismatch"));
    }
    word.copy_from_slice(&data[4..8]);
    if u32::from_le_bytes(word) != SNAPSHOT_VERSION {
        return Err(corrupted(4, "unsupported snapshot version"));
    }
    let mut long = [0u8; 8];
    long.copy_from_slice(&data[8..16]);
    let wal_sequence = u64::from_le_bytes(long);
    word.copy_from_slice(&data[16..20]);
    let expected_stores = u32::from_le_bytes(word) as usize;

    let mut snapshot = Snapshot { wal_sequence, stores: Vec::with_capacity(expected_stores) };
    let mut offset = SNAPSHOT_HEADER_SIZE;
    while offset < data.len() {
        let total = framed_len(&data[offset..]).ok_or_else(|| corrupted(offset, "truncated entry header"))?;
        if offset + total > data.len() {
            return Err(corrupted(offset, "truncated entry"));
        }
        let record = deserialize_record(&data[offset..offset + total], &path, offset as u64)?;
        match record.operation {
            Operation::CreateStore => snapshot.stores.push((record.store, Vec::new())),
            Operation::Put => match snapshot.stores.last_mut() {
                Some((name, contents)) if *name == record.store => contents.push((record.key, record.value)),
                _ => return Err(corrupted(offset, "record outside its store section")),
            },
            _ => return Err(corrupted(offset, "unexpected operation in snapshot")),
        }
        offset += total;
    }

    if snapshot.stores.len() != expected_stores {
        return Err(corrupted(offset, "store count does not match header"));
    }
    Ok(Some(snapshot))
}
