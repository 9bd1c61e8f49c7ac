//! Internal key and write-batch formats.
//!
//! An internal key is a user key with an appended 8-byte tag packing a
//! 56-bit sequence number and an entry kind:
//!
//! ```text
//! [user_key bytes][fixed64-LE(sequence << 8 | kind)]
//! ```
//!
//! A write batch is an opaque blob:
//!
//! ```text
//! [sequence (fixed64-LE)][count (fixed32-LE)]
//! [record]*   record = kind (1 byte)
//!                      | varint32 key_len | key
//!                      [| varint32 value_len | value]   (kind = Value only)
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::memtable::MemTable;
use crate::util::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed, put_fixed64, put_length_prefixed,
};
use crate::{Error, Result};

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

/// Byte length of the sequence + count batch header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// Kind of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone.
    Deletion = 0,
    /// Normal value.
    Value = 1,
}

/// Kind used when building internal keys for lookups. `Value` is the
/// numerically largest kind, so a seek key positions before every entry
/// carrying the same (user key, sequence).
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Pack a sequence number and kind into the 8-byte internal-key tag.
pub fn pack_sequence_and_type(sequence: u64, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | value_type.to_byte() as u64
}

/// The user-key prefix of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// Split an encoded internal key into (user key, sequence, kind).
pub fn parse_internal_key(internal_key: &[u8]) -> Result<(&[u8], u64, ValueType)> {
    if internal_key.len() < 8 {
        return Err(Error::corruption("internal key too short"));
    }
    let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
    let value_type = ValueType::from_byte((tag & 0xFF) as u8)
        .ok_or_else(|| Error::corruption("invalid internal key kind"))?;
    Ok((extract_user_key(internal_key), tag >> 8, value_type))
}

/// A decoded (user key, sequence, kind) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: u64,
    value_type: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: u64, value_type: ValueType) -> Self {
        debug_assert!(sequence <= MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Internal key positioned at the newest possible entry for `user_key`.
    pub fn for_seek(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, VALUE_TYPE_FOR_SEEK)
    }

    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_deletion(&self) -> bool {
        self.value_type.is_deletion()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.user_key.len() + 8);
        buf.extend_from_slice(&self.user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(self.sequence, self.value_type));
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (user_key, sequence, value_type) = parse_internal_key(data)?;
        Ok(Self {
            user_key: Bytes::copy_from_slice(user_key),
            sequence,
            value_type,
        })
    }
}

/// Pre-encoded key for point lookups at a read sequence.
#[derive(Debug, Clone)]
pub struct LookupKey {
    data: Bytes,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        let mut buf = BytesMut::with_capacity(user_key.len() + 8);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK));
        Self { data: buf.freeze() }
    }

    /// The full internal key form.
    pub fn internal_key(&self) -> &[u8] {
        &self.data
    }

    /// The user-key prefix.
    pub fn user_key(&self) -> &[u8] {
        &self.data[..self.data.len() - 8]
    }

    /// The read sequence this lookup was built for.
    pub fn sequence(&self) -> u64 {
        decode_fixed64(&self.data[self.data.len() - 8..]) >> 8
    }
}

/// Receiver for [`WriteBatch::iterate`].
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// An atomically applied group of put/delete operations.
///
/// The batch is kept in its serialized form; appending a batch to another
/// is a payload copy plus a count update, and the bytes written to the
/// write-ahead log are exactly the bytes held here.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: BytesMut,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        let mut rep = BytesMut::with_capacity(64);
        rep.resize(BATCH_HEADER_SIZE, 0);
        Self { rep }
    }

    /// Record a put of `key` to `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.extend_from_slice(&[ValueType::Value.to_byte()]);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
    }

    /// Record a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.extend_from_slice(&[ValueType::Deletion.to_byte()]);
        put_length_prefixed(&mut self.rep, key);
    }

    /// Drop all operations, keeping the reserved header.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of operations in the batch.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// The sequence number the first operation commits at.
    pub fn sequence(&self) -> u64 {
        decode_fixed64(&self.rep[..8])
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Bytes held by the serialized form.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The serialized batch, as written to the log.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Adopt a serialized batch, e.g. one replayed from the log.
    pub fn from_contents(data: &[u8]) -> Result<Self> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("write batch header truncated"));
        }
        let batch = Self {
            rep: BytesMut::from(data),
        };
        // Validate record structure and the count invariant up front.
        let mut counter = CountingHandler::default();
        batch.iterate(&mut counter)?;
        if counter.count != batch.count() {
            return Err(Error::corruption("write batch count mismatch"));
        }
        Ok(batch)
    }

    /// Concatenate `other`'s operations onto this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep
            .extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Visit every operation in insertion order.
    pub fn iterate<H: BatchHandler + ?Sized>(&self, handler: &mut H) -> Result<()> {
        let mut cursor = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;

        while !cursor.is_empty() {
            let tag = cursor.get_u8();
            match ValueType::from_byte(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed(&mut cursor)?;
                    let value = get_length_prefixed(&mut cursor)?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed(&mut cursor)?;
                    handler.delete(key);
                }
                None => return Err(Error::corruption("unknown write batch record tag")),
            }
            found += 1;
        }

        if found != self.count() {
            return Err(Error::corruption("write batch has wrong count"));
        }
        Ok(())
    }

    /// Apply the batch to a memtable, assigning consecutive sequence
    /// numbers starting at the batch's stored base.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

#[derive(Default)]
struct CountingHandler {
    count: u32,
}

impl BatchHandler for CountingHandler {
    fn put(&mut self, _key: &[u8], _value: &[u8]) {
        self.count += 1;
    }

    fn delete(&mut self, _key: &[u8]) {
        self.count += 1;
    }
}

struct MemTableInserter<'a> {
    sequence: u64,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type() {
        assert_eq!(ValueType::from_byte(0), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_byte(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_byte(2), None);
        assert!(ValueType::Deletion.is_deletion());
        assert!(!ValueType::Value.is_deletion());
    }

    #[test]
    fn test_internal_key_roundtrip() {
        let key = InternalKey::new(Bytes::from("hello"), 12345, ValueType::Value);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 5 + 8);

        let decoded = InternalKey::decode(&encoded).unwrap();
        assert_eq!(decoded.user_key(), b"hello");
        assert_eq!(decoded.sequence(), 12345);
        assert_eq!(decoded.value_type(), ValueType::Value);
    }

    #[test]
    fn test_internal_key_tag_is_little_endian() {
        let key = InternalKey::new(Bytes::from("k"), 1, ValueType::Value);
        let encoded = key.encode();
        // tag = (1 << 8) | 1 = 0x0101, little-endian.
        assert_eq!(&encoded[1..], &[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_internal_key_rejects_short() {
        assert!(parse_internal_key(b"short").is_err());
    }

    #[test]
    fn test_lookup_key() {
        let lkey = LookupKey::new(b"user", 99);
        assert_eq!(lkey.user_key(), b"user");
        assert_eq!(lkey.sequence(), 99);

        let (ukey, seq, t) = parse_internal_key(lkey.internal_key()).unwrap();
        assert_eq!(ukey, b"user");
        assert_eq!(seq, 99);
        assert_eq!(t, VALUE_TYPE_FOR_SEEK);
    }

    #[test]
    fn test_batch_header_reserved_when_empty() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.contents().len(), BATCH_HEADER_SIZE);
    }

    #[test]
    fn test_batch_put_delete_iterate() {
        let mut batch = WriteBatch::new();
        batch.put(b"key1", b"value1");
        batch.delete(b"key2");
        batch.put(b"key3", b"value3");
        assert_eq!(batch.count(), 3);

        #[derive(Default)]
        struct Collector {
            ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
        }
        impl BatchHandler for Collector {
            fn put(&mut self, key: &[u8], value: &[u8]) {
                self.ops.push((key.to_vec(), Some(value.to_vec())));
            }
            fn delete(&mut self, key: &[u8]) {
                self.ops.push((key.to_vec(), None));
            }
        }

        let mut collector = Collector::default();
        batch.iterate(&mut collector).unwrap();
        assert_eq!(collector.ops.len(), 3);
        assert_eq!(collector.ops[0], (b"key1".to_vec(), Some(b"value1".to_vec())));
        assert_eq!(collector.ops[1], (b"key2".to_vec(), None));
        assert_eq!(collector.ops[2], (b"key3".to_vec(), Some(b"value3".to_vec())));
    }

    #[test]
    fn test_batch_sequence() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.sequence(), 0);
        batch.set_sequence(1000);
        assert_eq!(batch.sequence(), 1000);
    }

    #[test]
    fn test_batch_append() {
        let mut a = WriteBatch::new();
        a.put(b"k1", b"v1");

        let mut b = WriteBatch::new();
        b.put(b"k2", b"v2");
        b.delete(b"k3");

        a.append(&b);
        assert_eq!(a.count(), 3);

        let mut counter = CountingHandler::default();
        a.iterate(&mut counter).unwrap();
        assert_eq!(counter.count, 3);
    }

    #[test]
    fn test_batch_contents_roundtrip() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(42);
        batch.put(b"alpha", b"1");
        batch.delete(b"beta");

        let restored = WriteBatch::from_contents(batch.contents()).unwrap();
        assert_eq!(restored.sequence(), 42);
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.contents(), batch.contents());
    }

    #[test]
    fn test_batch_from_contents_rejects_bad_count() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        let mut data = batch.contents().to_vec();
        data[8] = 5; // claim five records
        assert!(WriteBatch::from_contents(&data).is_err());
    }

    #[test]
    fn test_batch_clear() {
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.contents().len(), BATCH_HEADER_SIZE);
    }
}
