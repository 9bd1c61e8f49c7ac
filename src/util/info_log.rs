//! The on-disk info log (`LOG`).
//!
//! Every line written here is also emitted as a `tracing` event, so the
//! file stays useful for post-mortems while live diagnostics flow through
//! the subscriber.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::util::filename::{info_log_path, old_info_log_path};
use crate::Result;

/// Append-only event log for one open database.
pub struct InfoLog {
    file: Mutex<File>,
}

impl InfoLog {
    /// Rotate `LOG` to `LOG.old` and open a fresh info log.
    pub fn open(db_path: &Path) -> Result<Self> {
        let log_path = info_log_path(db_path);
        if log_path.exists() {
            let _ = fs::rename(&log_path, old_info_log_path(db_path));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event line, prefixed with a coarse timestamp.
    pub fn log(&self, message: &str) {
        tracing::debug!(target: "stratumdb", "{}", message);

        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let mut file = self.file.lock();
        let _ = writeln!(file, "{}.{:06} {}", micros / 1_000_000, micros % 1_000_000, message);
    }
}
