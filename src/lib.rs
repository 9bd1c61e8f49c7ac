//! # stratumdb
//!
//! An embedded, single-process, ordered key-value storage engine built on
//! a log-structured merge tree.
//!
//! - **Ordered byte keys**: point lookups and bidirectional range
//!   iteration under a pluggable comparator
//! - **Atomic batches**: multi-key writes commit as one unit through a
//!   group-committed write-ahead log
//! - **Snapshots**: cheap, pinned read points with repeatable reads
//! - **Crash recovery**: log replay restores every acknowledged write
//! - **Background compaction**: leveled tables merged off the write path
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use stratumdb::{Database, ReadOptions, WriteOptions};
//!
//! let db = Database::open("./data")?;
//!
//! db.put(&WriteOptions::default(), b"hello", b"world")?;
//! let value = db.get(&ReadOptions::new(), b"hello")?;
//! db.delete(&WriteOptions::default(), b"hello")?;
//!
//! for (key, value) in db.iter(&ReadOptions::new())? {
//!     println!("{:?} = {:?}", key, value);
//! }
//! ```

pub mod error;
pub mod options;
pub mod types;

mod db;

mod cache;
mod compaction;
mod iterator;
mod memtable;
mod snapshot;
mod sstable;
mod util;
mod version;
mod wal;

pub use error::{Error, Result};
pub use options::{Compression, Options, ReadOptions, WriteOptions};
pub use types::{InternalKey, ValueType, WriteBatch};

pub use db::{destroy_db, Database};
pub use iterator::DbIterator;
pub use snapshot::Snapshot;

pub use util::comparator::{BytewiseComparator, Comparator};
