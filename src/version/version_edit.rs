//! Version edits: deltas between consecutive versions.
//!
//! The manifest is an append-only log of serialized edits. Each record is
//! a sequence of tagged fields; every field is optional and a record may
//! carry any subset.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::options::NUM_LEVELS;
use crate::types::InternalKey;
use crate::util::coding::{get_length_prefixed, get_varint, put_length_prefixed, put_varint};
use crate::version::FileMetadata;
use crate::{Error, Result};

// Field tags in the manifest record.
const TAG_COMPARATOR: u8 = 1;
const TAG_LOG_NUMBER: u8 = 2;
const TAG_NEXT_FILE_NUMBER: u8 = 3;
const TAG_LAST_SEQUENCE: u8 = 4;
const TAG_COMPACT_POINTER: u8 = 5;
const TAG_DELETED_FILE: u8 = 6;
const TAG_NEW_FILE: u8 = 7;
const TAG_PREV_LOG_NUMBER: u8 = 9;

/// Changes applied atop one version to produce the next.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    /// Per-level resume points for the round-robin compaction cursor.
    pub compact_pointers: Vec<(usize, InternalKey)>,
    /// Files removed: (level, file number).
    pub deleted_files: HashSet<(usize, u64)>,
    /// Files added: (level, metadata).
    pub new_files: Vec<(usize, NewFileEntry)>,
}

/// File fields as they travel through an edit.
#[derive(Debug, Clone)]
pub struct NewFileEntry {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

impl NewFileEntry {
    pub fn to_metadata(&self) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            self.number,
            self.file_size,
            self.smallest.clone(),
            self.largest.clone(),
        ))
    }
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFileEntry {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);

        if let Some(ref name) = self.comparator {
            buf.extend_from_slice(&[TAG_COMPARATOR]);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(num) = self.log_number {
            buf.extend_from_slice(&[TAG_LOG_NUMBER]);
            put_varint(&mut buf, num);
        }
        if let Some(num) = self.prev_log_number {
            buf.extend_from_slice(&[TAG_PREV_LOG_NUMBER]);
            put_varint(&mut buf, num);
        }
        if let Some(num) = self.next_file_number {
            buf.extend_from_slice(&[TAG_NEXT_FILE_NUMBER]);
            put_varint(&mut buf, num);
        }
        if let Some(seq) = self.last_sequence {
            buf.extend_from_slice(&[TAG_LAST_SEQUENCE]);
            put_varint(&mut buf, seq);
        }
        for (level, key) in &self.compact_pointers {
            buf.extend_from_slice(&[TAG_COMPACT_POINTER]);
            put_varint(&mut buf, *level as u64);
            put_length_prefixed(&mut buf, &key.encode());
        }
        for &(level, number) in &self.deleted_files {
            buf.extend_from_slice(&[TAG_DELETED_FILE]);
            put_varint(&mut buf, level as u64);
            put_varint(&mut buf, number);
        }
        for (level, file) in &self.new_files {
            buf.extend_from_slice(&[TAG_NEW_FILE]);
            put_varint(&mut buf, *level as u64);
            put_varint(&mut buf, file.number);
            put_varint(&mut buf, file.file_size);
            put_length_prefixed(&mut buf, &file.smallest.encode());
            put_length_prefixed(&mut buf, &file.largest.encode());
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut cursor = data;

        while !cursor.is_empty() {
            let tag = cursor.get_u8();
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed(&mut cursor)?;
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("comparator name not utf-8"))?,
                    );
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint(&mut cursor)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint(&mut cursor)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint(&mut cursor)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint(&mut cursor)?),
                TAG_COMPACT_POINTER => {
                    let level = decode_level(&mut cursor)?;
                    let key_bytes = get_length_prefixed(&mut cursor)?;
                    let key = InternalKey::decode(key_bytes)?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = decode_level(&mut cursor)?;
                    let number = get_varint(&mut cursor)?;
                    edit.deleted_files.insert((level, number));
                }
                TAG_NEW_FILE => {
                    let level = decode_level(&mut cursor)?;
                    let number = get_varint(&mut cursor)?;
                    let file_size = get_varint(&mut cursor)?;
                    let smallest = InternalKey::decode(get_length_prefixed(&mut cursor)?)?;
                    let largest = InternalKey::decode(get_length_prefixed(&mut cursor)?)?;
                    edit.new_files.push((
                        level,
                        NewFileEntry {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                _ => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag: {}",
                        tag
                    )))
                }
            }
        }

        Ok(edit)
    }
}

fn decode_level(cursor: &mut &[u8]) -> Result<usize> {
    let level = get_varint(cursor)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption("level out of range in version edit"));
    }
    Ok(level)
}
