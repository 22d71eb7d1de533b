//! Summary: Log record types and serialization with CRC32 checksums.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every write accepted by the log backend becomes exactly one record, so a
//! batch is replayed all-or-nothing.
//!
//! ```text
//! [len: u32][type: u8][crc32: u32][payload...]
//! ```
//!
//! The CRC32 covers the type byte and the payload.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::operation::Operation;

/// Record header size: length (4) + type (1) + crc32 (4).
pub const RECORD_HEADER_SIZE: usize = 9;

/// Maximum allowed record payload size (64MB).
pub const MAX_RECORD_PAYLOAD: usize = 64 * 1024 * 1024;

/// Maximum key size (64KB).
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Batches with at least this many operations are encoded on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 100;

/// Entry tags inside a batch payload.
const ENTRY_PUT: u8 = 1;
const ENTRY_DELETE: u8 = 2;

/// Log record types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Put = 1,
    Delete = 2,
    Batch = 3,
}

impl RecordType {
    /// Converts a byte to RecordType.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Put),
            2 => Some(RecordType::Delete),
            3 => Some(RecordType::Batch),
            _ => None,
        }
    }
}

/// A record in the append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A single put or delete.
    Single(Operation),
    /// An ordered group of operations applied atomically.
    Batch(Vec<Operation>),
}

impl LogRecord {
    /// Returns the record type byte for this record.
    pub fn record_type(&self) -> u8 {
        match self {
            LogRecord::Single(Operation::Put { .. }) => RecordType::Put as u8,
            LogRecord::Single(Operation::Delete { .. }) => RecordType::Delete as u8,
            LogRecord::Batch(_) => RecordType::Batch as u8,
        }
    }

    /// Returns the operations carried by this record, in apply order.
    pub fn into_operations(self) -> Vec<Operation> {
        match self {
            LogRecord::Single(op) => vec![op],
            LogRecord::Batch(ops) => ops,
        }
    }

    /// Encodes the record to bytes with its header and checksum.
    ///
    /// # Errors
    ///
    /// Returns `RecordTooLarge` if a key or the payload exceeds what
    /// [`decode`](Self::decode) accepts. Nothing is encoded in that case.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.check_keys()?;
        let payload = self.encode_payload();
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(Error::RecordTooLarge {
                what: "payload",
                size: payload.len(),
                max: MAX_RECORD_PAYLOAD,
            });
        }
        let record_type = self.record_type();
        // Bounded by MAX_RECORD_PAYLOAD, so the length fits in the u32 field.
        let total_len = RECORD_HEADER_SIZE + payload.len();

        let mut result = Vec::with_capacity(total_len);
        result.extend_from_slice(&(total_len as u32).to_le_bytes());
        result.push(record_type);
        result.extend_from_slice(&checksum(record_type, &payload).to_le_bytes());
        result.extend_from_slice(&payload);
        Ok(result)
    }

    fn check_keys(&self) -> Result<()> {
        let ops = match self {
            LogRecord::Single(op) => std::slice::from_ref(op),
            LogRecord::Batch(ops) => ops.as_slice(),
        };
        match ops.iter().find(|op| op.key().len() > MAX_KEY_SIZE) {
            Some(op) => Err(Error::RecordTooLarge {
                what: "key",
                size: op.key().len(),
                max: MAX_KEY_SIZE,
            }),
            None => Ok(()),
        }
    }

    /// Decodes a record from the start of `data`, validating its checksum.
    ///
    /// `offset` is the record's position in the log and is only used for
    /// error reporting. Returns the record and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `RecordInvalid` if the header is truncated, the type is
    /// unknown, the checksum does not match or the payload is malformed.
    pub fn decode(data: &[u8], offset: u64) -> Result<(Self, usize)> {
        let invalid = |reason: String| Error::RecordInvalid { offset, reason };

        if data.len() < RECORD_HEADER_SIZE {
            return Err(invalid(format!(
                "buffer too small: {} bytes, need at least {RECORD_HEADER_SIZE}",
                data.len()
            )));
        }

        let total_len = read_u32(data, 0).unwrap_or_default() as usize;
        let record_type = data[4];
        let stored_crc = read_u32(data, 5).unwrap_or_default();

        if total_len < RECORD_HEADER_SIZE {
            return Err(invalid(format!("invalid record length: {total_len}")));
        }
        if total_len > data.len() {
            return Err(invalid(format!(
                "record length {total_len} exceeds buffer size {}",
                data.len()
            )));
        }
        let payload_len = total_len - RECORD_HEADER_SIZE;
        if payload_len > MAX_RECORD_PAYLOAD {
            return Err(invalid(format!(
                "payload size {payload_len} exceeds maximum {MAX_RECORD_PAYLOAD}"
            )));
        }

        let rtype = RecordType::from_u8(record_type)
            .ok_or_else(|| invalid(format!("invalid record type: {record_type}")))?;

        let payload = &data[RECORD_HEADER_SIZE..total_len];
        if cfg!(not(feature = "no_checksum")) {
            let computed_crc = checksum(record_type, payload);
            if computed_crc != stored_crc {
                return Err(invalid(format!(
                    "CRC mismatch: stored {stored_crc:#x}, computed {computed_crc:#x}"
                )));
            }
        }

        let record = Self::decode_payload(rtype, payload).map_err(invalid)?;
        Ok((record, total_len))
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            LogRecord::Single(Operation::Put { key, value }) => {
                let mut buf = Vec::with_capacity(8 + key.len() + value.len());
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, value);
                buf
            }
            LogRecord::Single(Operation::Delete { key }) => {
                let mut buf = Vec::with_capacity(4 + key.len());
                put_bytes(&mut buf, key);
                buf
            }
            LogRecord::Batch(ops) => encode_batch_payload(ops),
        }
    }

    fn decode_payload(rtype: RecordType, payload: &[u8]) -> std::result::Result<Self, String> {
        let mut cursor = Cursor::new(payload);
        let record = match rtype {
            RecordType::Put => {
                let key = cursor.key()?;
                let value = cursor.bytes("value")?;
                LogRecord::Single(Operation::Put { key, value })
            }
            RecordType::Delete => LogRecord::Single(Operation::Delete { key: cursor.key()? }),
            RecordType::Batch => {
                let count = cursor.u32("batch count")? as usize;
                // Every entry needs at least a tag and a key length.
                if count > cursor.remaining() / 5 {
                    return Err(format!("batch count {count} exceeds payload size"));
                }
                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    let op = match cursor.u8("entry tag")? {
                        ENTRY_PUT => {
                            let key = cursor.key()?;
                            let value = cursor.bytes("value")?;
                            Operation::Put { key, value }
                        }
                        ENTRY_DELETE => Operation::Delete { key: cursor.key()? },
                        tag => return Err(format!("invalid batch entry tag: {tag}")),
                    };
                    ops.push(op);
                }
                LogRecord::Batch(ops)
            }
        };

        if cursor.remaining() != 0 {
            return Err(format!("{} trailing payload bytes", cursor.remaining()));
        }
        Ok(record)
    }
}

/// Encodes a batch payload, serializing entries on the rayon pool for large
/// batches. Entry order is preserved either way.
fn encode_batch_payload(ops: &[Operation]) -> Vec<u8> {
    let entries: Vec<Vec<u8>> = if ops.len() < PARALLEL_THRESHOLD {
        ops.iter().map(encode_entry).collect()
    } else {
        ops.par_iter().map(encode_entry).collect()
    };

    let total: usize = entries.iter().map(Vec::len).sum();
    let mut buf = Vec::with_capacity(4 + total);
    buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for entry in &entries {
        buf.extend_from_slice(entry);
    }
    buf
}

/// Encodes one batch entry: `[tag][key_len][key]([value_len][value])`.
#[inline]
fn encode_entry(op: &Operation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + op.size_hint());
    match op {
        Operation::Put { key, value } => {
            buf.push(ENTRY_PUT);
            put_bytes(&mut buf, key);
            put_bytes(&mut buf, value);
        }
        Operation::Delete { key } => {
            buf.push(ENTRY_DELETE);
            put_bytes(&mut buf, key);
        }
    }
    buf
}

#[inline]
fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

#[cfg(not(feature = "no_checksum"))]
fn checksum(record_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(feature = "no_checksum")]
fn checksum(_record_type: u8, _payload: &[u8]) -> u32 {
    0
}

/// Bounds-checked reader over a record payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> std::result::Result<&'a [u8], String> {
        if self.remaining() < len {
            return Err(format!("{what} truncated"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> std::result::Result<u8, String> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> std::result::Result<u32, String> {
        let raw = self.take(4, what)?;
        read_u32(raw, 0).ok_or_else(|| format!("{what} truncated"))
    }

    fn bytes(&mut self, what: &str) -> std::result::Result<Vec<u8>, String> {
        let len = self.u32(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    fn key(&mut self) -> std::result::Result<Vec<u8>, String> {
        let len = self.u32("key")? as usize;
        if len > MAX_KEY_SIZE {
            return Err(format!("key size {len} exceeds maximum {MAX_KEY_SIZE}"));
        }
        Ok(self.take(len, "key")?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_from_u8() {
        for t in [RecordType::Put, RecordType::Delete, RecordType::Batch] {
            assert_eq!(RecordType::from_u8(t as u8), Some(t));
        }
        assert!(RecordType::from_u8(0).is_none());
        assert!(RecordType::from_u8(4).is_none());
    }

    #[test]
    fn test_single_records_decode() {
        for record in [
            LogRecord::Single(Operation::put("test_key", "test_value")),
            LogRecord::Single(Operation::delete("deleted_key")),
            LogRecord::Single(Operation::put(Vec::new(), Vec::new())),
        ] {
            let encoded = record.encode().unwrap();
            let (decoded, consumed) = LogRecord::decode(&encoded, 0).expect("decode");
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn test_batch_preserves_order_and_kinds() {
        let ops = vec![
            Operation::put("a", "1"),
            Operation::delete("b"),
            Operation::put("a", "2"),
        ];
        let record = LogRecord::Batch(ops.clone());
        let (decoded, _) = LogRecord::decode(&record.encode().unwrap(), 0).expect("decode");
        assert_eq!(decoded.into_operations(), ops);
    }

    #[test]
    fn test_large_batch_encodes_in_parallel_identically() {
        let ops: Vec<_> = (0..PARALLEL_THRESHOLD * 3)
            .map(|i| {
                if i % 7 == 0 {
                    Operation::delete(format!("key{i:05}"))
                } else {
                    Operation::put(format!("key{i:05}"), format!("value{i}"))
                }
            })
            .collect();

        let sequential: Vec<u8> = ops.iter().flat_map(encode_entry).collect();
        let payload = encode_batch_payload(&ops);
        assert_eq!(&payload[4..], sequential.as_slice());

        let (decoded, _) = LogRecord::decode(&LogRecord::Batch(ops.clone()).encode().unwrap(), 0).unwrap();
        assert_eq!(decoded.into_operations(), ops);
    }

    #[test]
    #[cfg(not(feature = "no_checksum"))]
    fn test_crc_corruption_detected() {
        let mut encoded = LogRecord::Single(Operation::put("key", "value")).encode().unwrap();
        encoded[RECORD_HEADER_SIZE + 2] ^= 0xFF;

        let err = LogRecord::decode(&encoded, 128).unwrap_err();
        match err {
            Error::RecordInvalid { offset, reason } => {
                assert_eq!(offset, 128);
                assert!(reason.contains("CRC mismatch"), "unexpected reason: {reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let encoded = LogRecord::Batch(vec![Operation::put("key", "value")]).encode().unwrap();
        for len in 0..encoded.len() {
            assert!(
                LogRecord::decode(&encoded[..len], 0).is_err(),
                "truncated at {len} should fail"
            );
        }
    }

    #[test]
    fn test_oversized_batch_count_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(LogRecord::decode_payload(RecordType::Batch, &payload).is_err());
    }

    #[test]
    fn test_consecutive_records_decode_in_sequence() {
        let first = LogRecord::Single(Operation::put("k1", "v1"));
        let second = LogRecord::Batch(vec![Operation::delete("k1"), Operation::put("k2", "v2")]);

        let mut log = first.encode().unwrap();
        log.extend_from_slice(&second.encode().unwrap());

        let (a, used) = LogRecord::decode(&log, 0).unwrap();
        let (b, rest) = LogRecord::decode(&log[used..], used as u64).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(used + rest, log.len());
    }

    #[test]
    fn test_oversized_key_is_not_encoded() {
        let big = vec![b'k'; MAX_KEY_SIZE + 1];
        let largest = vec![b'k'; MAX_KEY_SIZE];

        let err = LogRecord::Single(Operation::put(big.clone(), "v"))
            .encode()
            .unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { what: "key", .. }));

        let batch = LogRecord::Batch(vec![Operation::put("a", "1"), Operation::delete(big)]);
        assert!(matches!(
            batch.encode(),
            Err(Error::RecordTooLarge { what: "key", .. })
        ));

        // The limit itself is accepted and decodes back.
        let record = LogRecord::Single(Operation::delete(largest));
        let (decoded, _) = LogRecord::decode(&record.encode().unwrap(), 0).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_oversized_payload_is_not_encoded() {
        let value = vec![0u8; MAX_RECORD_PAYLOAD];
        let err = LogRecord::Single(Operation::put("k", value)).encode().unwrap_err();
        match err {
            Error::RecordTooLarge { what, size, max } => {
                assert_eq!(what, "payload");
                assert!(size > max);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
