//! Log reader.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytes::Bytes;

use crate::util::crc::verify_masked_crc;
use crate::Result;

use super::{CorruptionReporter, RecordType, BLOCK_SIZE, HEADER_SIZE};

enum Physical {
    Record(RecordType, Vec<u8>),
    /// Bad header or checksum; the rest of the block was dropped.
    Bad,
    Eof,
}

/// Sequentially reads records written by [`super::LogWriter`].
///
/// On corruption the reader skips to the next block boundary and reports
/// the dropped byte count, so a damaged region loses at most the records
/// that touch it.
pub struct LogReader<'r> {
    reader: File,
    buffer: Vec<u8>,
    buffer_offset: usize,
    buffer_size: usize,
    eof: bool,
    reporter: Option<&'r mut dyn CorruptionReporter>,
}

impl<'r> LogReader<'r> {
    pub fn new(path: &Path, reporter: Option<&'r mut dyn CorruptionReporter>) -> Result<Self> {
        let reader = File::open(path)?;

        Ok(Self {
            reader,
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
            reporter,
        })
    }

    fn report(&mut self, bytes: u64, reason: &str) {
        if let Some(reporter) = self.reporter.as_deref_mut() {
            reporter.corruption(bytes, reason);
        }
    }

    /// Read the next logical record. `None` at end of log.
    pub fn read_record(&mut self) -> Result<Option<Bytes>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Physical::Record(RecordType::Full, data) => {
                    if in_fragmented_record {
                        self.report(scratch.len() as u64, "partial record without end");
                        scratch.clear();
                    }
                    return Ok(Some(Bytes::from(data)));
                }
                Physical::Record(RecordType::First, data) => {
                    if in_fragmented_record {
                        self.report(scratch.len() as u64, "partial record without end");
                        scratch.clear();
                    }
                    scratch = data;
                    in_fragmented_record = true;
                }
                Physical::Record(RecordType::Middle, data) => {
                    if !in_fragmented_record {
                        self.report(data.len() as u64, "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&data);
                    }
                }
                Physical::Record(RecordType::Last, data) => {
                    if !in_fragmented_record {
                        self.report(data.len() as u64, "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&data);
                        return Ok(Some(Bytes::from(scratch)));
                    }
                }
                Physical::Record(RecordType::Zero, _) => {
                    // Padding from pre-allocated file space.
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
                Physical::Eof => {
                    // A fragmented record cut off by EOF means the writer
                    // died mid-append; the tail is simply dropped.
                    return Ok(None);
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.buffer_size - self.buffer_offset < HEADER_SIZE {
                if !self.eof {
                    // Tail of the block is header padding.
                    if !self.read_block()? {
                        return Ok(Physical::Eof);
                    }
                    continue;
                }
                return Ok(Physical::Eof);
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];
            let masked_crc = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let length = u16::from_le_bytes(header[4..6].try_into().unwrap()) as usize;
            let type_byte = header[6];

            if self.buffer_offset + HEADER_SIZE + length > self.buffer_size {
                let dropped = (self.buffer_size - self.buffer_offset) as u64;
                self.buffer_offset = self.buffer_size;
                if !self.eof {
                    self.report(dropped, "bad record length");
                    return Ok(Physical::Bad);
                }
                // Truncated tail record from a crash mid-write.
                return Ok(Physical::Eof);
            }

            let record_type = match RecordType::from_byte(type_byte) {
                Some(rt) => rt,
                None => {
                    let dropped = (self.buffer_size - self.buffer_offset) as u64;
                    self.buffer_offset = self.buffer_size;
                    self.report(dropped, "unknown record type");
                    return Ok(Physical::Bad);
                }
            };

            if record_type == RecordType::Zero && length == 0 {
                // Zero-filled block tail.
                self.buffer_offset = self.buffer_size;
                return Ok(Physical::Bad);
            }

            let data_start = self.buffer_offset + HEADER_SIZE;
            let data = &self.buffer[data_start..data_start + length];

            let mut checked = Vec::with_capacity(1 + length);
            checked.push(type_byte);
            checked.extend_from_slice(data);
            if !verify_masked_crc(&checked, masked_crc) {
                let dropped = (self.buffer_size - self.buffer_offset) as u64;
                self.buffer_offset = self.buffer_size;
                self.report(dropped, "checksum mismatch");
                return Ok(Physical::Bad);
            }

            let data = data.to_vec();
            self.buffer_offset = data_start + length;
            return Ok(Physical::Record(record_type, data));
        }
    }

    fn read_block(&mut self) -> Result<bool> {
        self.buffer_offset = 0;
        self.buffer_size = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.buffer[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }

        self.buffer_size = filled;
        Ok(filled > 0)
    }
}
