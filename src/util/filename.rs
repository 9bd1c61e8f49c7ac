//! Database file naming.
//!
//! Layout under the database directory:
//!
//! ```text
//! CURRENT          names the live manifest, newline-terminated
//! LOCK             held for the lifetime of the process
//! LOG, LOG.old     info log and its rotated predecessor
//! MANIFEST-NNNNNN  append-only log of version edits
//! NNNNNN.log       write-ahead log for one memtable generation
//! NNNNNN.ldb       table file (legacy .sst still recognized)
//! NNNNNN.dbtmp     temporary file used while replacing CURRENT
//! ```
//!
//! Numbered files share one monotonic allocator and are zero-padded to six
//! digits.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

/// Classification of a file in the database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log: `NNNNNN.log`.
    Log,
    /// The `LOCK` file.
    Lock,
    /// Table file: `NNNNNN.ldb` or legacy `NNNNNN.sst`.
    Table,
    /// Version-edit log: `MANIFEST-NNNNNN`.
    Manifest,
    /// The `CURRENT` pointer file.
    Current,
    /// Temporary file: `NNNNNN.dbtmp`.
    Temp,
    /// The `LOG` / `LOG.old` info log.
    InfoLog,
}

pub fn current_file_path(db_path: &Path) -> PathBuf {
    db_path.join("CURRENT")
}

pub fn lock_file_path(db_path: &Path) -> PathBuf {
    db_path.join("LOCK")
}

pub fn info_log_path(db_path: &Path) -> PathBuf {
    db_path.join("LOG")
}

pub fn old_info_log_path(db_path: &Path) -> PathBuf {
    db_path.join("LOG.old")
}

pub fn manifest_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("MANIFEST-{:06}", number))
}

pub fn log_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.log", number))
}

pub fn table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.ldb", number))
}

/// Path of a table file under the legacy suffix.
pub fn legacy_table_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.sst", number))
}

pub fn temp_file_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("{:06}.dbtmp", number))
}

/// Parse a file name into its type and number.
///
/// Non-numbered files report number 0. Returns `None` for names the engine
/// does not own.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    if name == "CURRENT" {
        return Some((FileType::Current, 0));
    }
    if name == "LOCK" {
        return Some((FileType::Lock, 0));
    }
    if name == "LOG" || name == "LOG.old" {
        return Some((FileType::InfoLog, 0));
    }

    if let Some(suffix) = name.strip_prefix("MANIFEST-") {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(number) = suffix.parse::<u64>() {
                return Some((FileType::Manifest, number));
            }
        }
        return None;
    }

    let dot = name.rfind('.')?;
    let (num_str, ext) = name.split_at(dot);
    if num_str.is_empty() || !num_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number = num_str.parse::<u64>().ok()?;

    let file_type = match &ext[1..] {
        "log" => FileType::Log,
        "ldb" | "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((file_type, number))
}

/// Point `CURRENT` at manifest `manifest_number`.
///
/// The name is written to `NNNNNN.dbtmp`, synced, and renamed over
/// `CURRENT` so the swap is atomic. Stale temp files are removed on
/// failure.
pub fn set_current_file(db_path: &Path, manifest_number: u64) -> Result<()> {
    let temp_path = temp_file_path(db_path, manifest_number);

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp_path)?;
        writeln!(file, "MANIFEST-{:06}", manifest_number)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, current_file_path(db_path))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Read the manifest name out of `CURRENT`.
pub fn read_current_file(db_path: &Path) -> Result<String> {
    let content = fs::read_to_string(current_file_path(db_path))?;
    if !content.ends_with('\n') {
        return Err(crate::Error::corruption(
            "CURRENT file does not end with newline",
        ));
    }
    Ok(content.trim_end().to_string())
}

/// Extract the manifest number from a `MANIFEST-NNNNNN` name.
pub fn parse_manifest_name(name: &str) -> Option<u64> {
    match parse_file_name(name) {
        Some((FileType::Manifest, number)) => Some(number),
        _ => None,
    }
}

/// Enumerate `(file name, type, number)` for every engine-owned file.
pub fn list_db_files(db_path: &Path) -> Result<Vec<(String, FileType, u64)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(db_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some((file_type, number)) = parse_file_name(&name) {
            files.push((name.into_owned(), file_type, number));
        }
    }
    Ok(files)
}

/// Delete a file, treating "not found" as success.
pub fn delete_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths() {
        let db_path = Path::new("/data/db");

        assert_eq!(current_file_path(db_path), Path::new("/data/db/CURRENT"));
        assert_eq!(lock_file_path(db_path), Path::new("/data/db/LOCK"));
        assert_eq!(
            manifest_file_path(db_path, 123),
            Path::new("/data/db/MANIFEST-000123")
        );
        assert_eq!(log_file_path(db_path, 7), Path::new("/data/db/000007.log"));
        assert_eq!(
            table_file_path(db_path, 456),
            Path::new("/data/db/000456.ldb")
        );
        assert_eq!(
            temp_file_path(db_path, 9),
            Path::new("/data/db/000009.dbtmp")
        );
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileType::Lock, 0)));
        assert_eq!(parse_file_name("LOG"), Some((FileType::InfoLog, 0)));
        assert_eq!(parse_file_name("LOG.old"), Some((FileType::InfoLog, 0)));
        assert_eq!(
            parse_file_name("MANIFEST-000005"),
            Some((FileType::Manifest, 5))
        );
        assert_eq!(parse_file_name("000123.log"), Some((FileType::Log, 123)));
        assert_eq!(parse_file_name("000456.ldb"), Some((FileType::Table, 456)));
        assert_eq!(parse_file_name("000456.sst"), Some((FileType::Table, 456)));
        assert_eq!(parse_file_name("000789.dbtmp"), Some((FileType::Temp, 789)));

        assert_eq!(parse_file_name("MANIFEST-"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
        assert_eq!(parse_file_name("abc.log"), None);
        assert_eq!(parse_file_name("000123.txt"), None);
        assert_eq!(parse_file_name("random"), None);
    }

    #[test]
    fn test_set_and_read_current() {
        let dir = tempdir().unwrap();

        set_current_file(dir.path(), 42).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), "MANIFEST-000042");
        assert_eq!(parse_manifest_name("MANIFEST-000042"), Some(42));

        // Swap again; the temp file must not linger.
        set_current_file(dir.path(), 43).unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), "MANIFEST-000043");
        assert!(!temp_file_path(dir.path(), 43).exists());
    }

    #[test]
    fn test_list_db_files() {
        let dir = tempdir().unwrap();
        fs::write(log_file_path(dir.path(), 3), "").unwrap();
        fs::write(table_file_path(dir.path(), 4), "").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "").unwrap();

        let mut files = list_db_files(dir.path()).unwrap();
        files.sort_by_key(|(_, _, n)| *n);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].1, FileType::Log);
        assert_eq!(files[1].1, FileType::Table);
    }

    #[test]
    fn test_delete_file_missing_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(delete_file(&path).is_ok());

        fs::write(&path, "x").unwrap();
        delete_file(&path).unwrap();
        assert!(!path.exists());
    }
}
