//! Binary format definitions for StowKV log and snapshot entries
//!
//! Every entry follows the same framing:
//! FrameHeader (32 bytes) + payload
//!
//! Payload:
//! txn_id(u64 LE) + operation(u8) + padding(u8) + name_len(u16 LE) + key_len(u32 LE) +
//! value_len(u32 LE) + name_bytes + key_bytes + value_bytes

use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Magic bytes identifying StowKV entries: "STOW" in ASCII
pub const FRAME_MAGIC: [u8; 4] = [0x53, 0x54, 0x4F, 0x57];

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed part of the payload preceding the variable-length fields
pub const PAYLOAD_FIXED_SIZE: usize = 8 + 1 + 1 + 2 + 4 + 4;

/// Transaction id written for records that are not part of a transaction
/// (snapshot contents).
pub const NO_TXN: u64 = 0;

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair in `name`
    Put = 1,
    /// Delete a key from `name`
    Delete = 2,
    /// Create an empty store called `name`
    CreateStore = 3,
    /// Rename store `name` to the UTF-8 string held in `value`
    RenameStore = 4,
    /// Drop store `name` with all of its records
    DropStore = 5,
    /// All earlier records of this transaction are durable and may be applied
    Commit = 6,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::CreateStore),
            4 => Some(Operation::RenameStore),
            5 => Some(Operation::DropStore),
            6 => Some(Operation::Commit),
            _ => None,
        }
    }
}

/// Fixed-size header for each entry
/// Size: 32 bytes, alignment: 4
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "STOW"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     op_code:    u8     - operation type
///   [13..16] reserved:   [u8;3]
///   [16..32] padding:    [u8;16]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FrameHeader {
    /// Magic bytes for entry identification and corruption recovery
    pub magic: [u8; 4],
    /// Total length of the entry payload (excluding this header)
    pub length: u32,
    /// CRC32C checksum of the payload bytes
    pub checksum: u32,
    /// Operation type, duplicated from the payload for cheap scanning
    pub op_code: u8,
    /// Reserved for future use, must be zero
    pub reserved: [u8; 3],
    /// Padding to reach 32 bytes
    pub _padding: [u8; 16],
}

impl FrameHeader {
    /// Create a new header with the given parameters
    pub fn new(length: u32, checksum: u32, operation: Operation) -> Self {
        Self {
            magic: FRAME_MAGIC,
            length,
            checksum,
            op_code: operation as u8,
            reserved: [0; 3],
            _padding: [0; 16],
        }
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.op_code;
        buf[13..16].copy_from_slice(&self.reserved);
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut padding = [0u8; 16];
        padding.copy_from_slice(&bytes[16..32]);

        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            op_code: bytes[12],
            reserved: [bytes[13], bytes[14], bytes[15]],
            _padding: padding,
        }
    }
}

/// One logical log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning transaction, or [`NO_TXN`]
    pub txn_id: u64,
    /// What the record does
    pub operation: Operation,
    /// Store the record applies to (empty for `Commit`)
    pub store: String,
    /// Record key (empty for catalog operations)
    pub key: Vec<u8>,
    /// Record value, or the new name for `RenameStore`
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Record a put of `key` in `store`
    pub fn put(txn_id: u64, store: &str, key: &[u8], value: &[u8]) -> Self {
        Self { txn_id, operation: Operation::Put, store: store.to_string(), key: key.to_vec(), value: value.to_vec() }
    }

    /// Record a delete of `key` in `store`
    pub fn delete(txn_id: u64, store: &str, key: &[u8]) -> Self {
        Self { txn_id, operation: Operation::Delete, store: store.to_string(), key: key.to_vec(), value: Vec::new() }
    }

    /// Record creation of `store`
    pub fn create_store(txn_id: u64, store: &str) -> Self {
        Self { txn_id, operation: Operation::CreateStore, store: store.to_string(), key: Vec::new(), value: Vec::new() }
    }

    /// Record a rename of `store` to `to`
    pub fn rename_store(txn_id: u64, store: &str, to: &str) -> Self {
        Self { txn_id, operation: Operation::RenameStore, store: store.to_string(), key: Vec::new(), value: to.as_bytes().to_vec() }
    }

    /// Record a drop of `store`
    pub fn drop_store(txn_id: u64, store: &str) -> Self {
        Self { txn_id, operation: Operation::DropStore, store: store.to_string(), key: Vec::new(), value: Vec::new() }
    }

    /// Record the commit of `txn_id`
    pub fn commit(txn_id: u64) -> Self {
        Self { txn_id, operation: Operation::Commit, store: String::new(), key: Vec::new(), value: Vec::new() }
    }
}

/// Size limits enforced when serializing
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

/// Serialize a log record into a complete framed entry
pub fn serialize_record(record: &LogRecord, limits: SizeLimits) -> StoreResult<Vec<u8>> {
    // Validate input sizes BEFORE any allocation
    if record.key.len() > limits.max_key_size {
        return Err(StoreError::OversizedEntry {
            entry_size: record.key.len() as u64,
            max_size: limits.max_key_size as u64,
            component: "key",
        });
    }
    if record.value.len() > limits.max_value_size {
        return Err(StoreError::OversizedEntry {
            entry_size: record.value.len() as u64,
            max_size: limits.max_value_size as u64,
            component: "value",
        });
    }
    if record.store.len() > u16::MAX as usize {
        return Err(StoreError::OversizedEntry {
            entry_size: record.store.len() as u64,
            max_size: u16::MAX as u64,
            component: "store name",
        });
    }

    let payload_size = PAYLOAD_FIXED_SIZE + record.store.len() + record.key.len() + record.value.len();
    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&record.txn_id.to_le_bytes());
    payload.push(record.operation as u8);
    payload.push(0); // padding byte
    payload.extend_from_slice(&(record.store.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(record.value.len() as u32).to_le_bytes());
    payload.extend_from_slice(record.store.as_bytes());
    payload.extend_from_slice(&record.key);
    payload.extend_from_slice(&record.value);

    let checksum = crc32c::crc32c(&payload);
    let header = FrameHeader::new(payload.len() as u32, checksum, record.operation);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Deserialize one framed entry from the start of `data`.
///
/// `path` and `base_offset` only decorate errors.
pub fn deserialize_record(data: &[u8], path: &std::path::Path, base_offset: u64) -> StoreResult<LogRecord> {
    let path_buf = || PathBuf::from(path);

    let header_bytes: &[u8; HEADER_SIZE] = match data.get(..HEADER_SIZE).and_then(|h| h.try_into().ok()) {
        Some(h) => h,
        None => {
            return Err(StoreError::WalCorrupted {
                path: path_buf(),
                offset: base_offset,
                reason: format!("entry too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
            })
        }
    };
    let header = FrameHeader::from_bytes(header_bytes);

    if header.magic != FRAME_MAGIC {
        return Err(StoreError::NoMagicFound { path: path_buf(), offset: base_offset, found_bytes: header.magic });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(StoreError::TornWrite {
            path: path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: base_offset + HEADER_SIZE as u64,
        });
    }
    let payload = &data[HEADER_SIZE..payload_end];

    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(StoreError::ChecksumMismatch {
            path: path_buf(),
            expected: header.checksum,
            actual: computed,
            offset: base_offset + HEADER_SIZE as u64,
        });
    }

    let corrupted = |reason: String| StoreError::WalCorrupted {
        path: path_buf(),
        offset: base_offset + HEADER_SIZE as u64,
        reason,
    };

    if payload.len() < PAYLOAD_FIXED_SIZE {
        return Err(corrupted("payload too short for fixed fields".to_string()));
    }

    let mut txn_bytes = [0u8; 8];
    txn_bytes.copy_from_slice(&payload[0..8]);
    let txn_id = u64::from_le_bytes(txn_bytes);
    let operation = Operation::from_byte(payload[8])
        .ok_or_else(|| corrupted(format!("invalid operation type: {}", payload[8])))?;
    let name_len = u16::from_le_bytes([payload[10], payload[11]]) as usize;
    let key_len = u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
    let value_len = u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]) as usize;

    let name_end = PAYLOAD_FIXED_SIZE + name_len;
    let key_end = name_end + key_len;
    let value_end = key_end + value_len;
    if payload.len() < value_end {
        return Err(corrupted(format!(
            "payload too short: need {} bytes for name({}) + key({}) + value({})",
            value_end, name_len, key_len, value_len
        )));
    }

    let store = std::str::from_utf8(&payload[PAYLOAD_FIXED_SIZE..name_end])
        .map_err(|e| corrupted(format!("store name is not UTF-8: {}", e)))?
        .to_string();

    Ok(LogRecord {
        txn_id,
        operation,
        store,
        key: payload[name_end..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    })
}

/// Total framed length of the entry starting at `data`, if its header is readable.
pub fn framed_len(data: &[u8]) -> Option<usize> {
    let length = u32::from_le_bytes([*data.get(4)?, *data.get(5)?, *data.get(6)?, *data.get(7)?]);
    Some(HEADER_SIZE + length as usize)
}

/// Scan forward from `start` for the next occurrence of the magic bytes.
/// Used to resynchronize after a corrupt entry.
pub fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if buffer.len() < FRAME_MAGIC.len() {
        return None;
    }
    (start..=buffer.len() - FRAME_MAGIC.len()).find(|&i| buffer[i..i + FRAME_MAGIC.len()] == FRAME_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const LIMITS: SizeLimits = SizeLimits { max_key_size: 128, max_value_size: 1024 };

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_put_roundtrip() {
        let record = LogRecord::put(42, "accounts", b"test_key", b"test_value_data");
        let bytes = serialize_record(&record, LIMITS).unwrap();
        let decoded = deserialize_record(&bytes, Path::new("<buffer>"), 0).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(framed_len(&bytes), Some(bytes.len()));
    }

    #[test]
    fn test_rename_carries_new_name_in_value() {
        let record = LogRecord::rename_store(3, "old", "new");
        let bytes = serialize_record(&record, LIMITS).unwrap();
        let decoded = deserialize_record(&bytes, Path::new("<buffer>"), 0).unwrap();
        assert_eq!(decoded.operation, Operation::RenameStore);
        assert_eq!(decoded.value, b"new");
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; LIMITS.max_key_size + 1];
        let result = serialize_record(&LogRecord::put(1, "s", &key, b"v"), LIMITS);
        assert!(matches!(result, Err(StoreError::OversizedEntry { component: "key", .. })));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let value = vec![0u8; LIMITS.max_value_size + 1];
        let result = serialize_record(&LogRecord::put(1, "s", b"k", &value), LIMITS);
        assert!(matches!(result, Err(StoreError::OversizedEntry { component: "value", .. })));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = serialize_record(&LogRecord::put(1, "s", b"key", b"value"), LIMITS).unwrap();
        data[0] = 0xFF;
        let result = deserialize_record(&data, Path::new("<buffer>"), 0);
        assert!(matches!(result, Err(StoreError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = serialize_record(&LogRecord::put(1, "s", b"key", b"value"), LIMITS).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let result = deserialize_record(&data, Path::new("<buffer>"), 0);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_entry_is_torn() {
        let data = serialize_record(&LogRecord::commit(9), LIMITS).unwrap();
        let result = deserialize_record(&data[..data.len() - 2], Path::new("<buffer>"), 0);
        assert!(matches!(result, Err(StoreError::TornWrite { .. })));
    }

    #[test]
    fn test_find_next_magic() {
        let mut buffer = vec![0u8; 10];
        buffer.extend_from_slice(&FRAME_MAGIC);
        assert_eq!(find_next_magic(&buffer, 0), Some(10));
        assert_eq!(find_next_magic(&buffer, 11), None);
        assert_eq!(find_next_magic(&[0u8; 2], 0), None);
    }
}
