//! emberdb is an embedded, ordered, persistent key/value store built as a
//! log-structured merge tree: batches commit through a write-ahead log and
//! an in-memory skiplist, immutable memtables flush to sorted table files,
//! and a manifest-backed version set tracks which tables constitute the
//! store at any moment. Readers get snapshot isolation from 56-bit
//! sequence numbers without blocking writers or background flushes.

pub mod batch;
pub mod coding;
pub mod commit;
pub mod config;
pub mod db;
pub mod error;
pub mod filenames;
pub mod flock;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod tmpfs;
pub mod version;

pub use batch::Batch;
pub use config::{Comparator, Options, BYTEWISE_COMPARATOR};
pub use db::{Db, Iter};
pub use error::{Error, Result};
pub use key::{InternalKey, InternalKeyKind};
