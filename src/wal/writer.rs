//! Log writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::util::crc::{crc32, crc32_extend, mask_crc};
use crate::Result;

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends framed records to a log file.
pub struct LogWriter {
    writer: BufWriter<File>,
    /// Offset within the current block.
    block_offset: usize,
}

impl LogWriter {
    /// Create a fresh log file, truncating any existing one.
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset: 0,
        })
    }

    /// Open an existing log for appending, resuming mid-block.
    pub fn open_for_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let block_offset = file.metadata()?.len() as usize % BLOCK_SIZE;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset,
        })
    }

    /// Append one record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        // An empty record still emits one zero-length Full fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;
            if left == 0 {
                break;
            }
        }

        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let crc = mask_crc(crc32_extend(crc32(&[record_type.to_byte()]), data));

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type.to_byte();

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    /// Flush buffered records to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");

        let mut writer = LogWriter::new(&path).unwrap();
        writer.add_record(b"hello").unwrap();
        writer.sync().unwrap();

        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_writer_spanning_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");

        let mut writer = LogWriter::new(&path).unwrap();
        writer.add_record(&vec![b'x'; BLOCK_SIZE * 2]).unwrap();
        writer.sync().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len >= (BLOCK_SIZE * 2) as u64);
    }

    #[test]
    fn test_writer_empty_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.log");

        let mut writer = LogWriter::new(&path).unwrap();
        writer.add_record(b"").unwrap();
        writer.sync().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
    }
}
