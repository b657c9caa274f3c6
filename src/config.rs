use std::cmp::Ordering;
use std::path::PathBuf;

/// Orders user keys. The name is persisted in the manifest; opening a store
/// with a different comparator than the one it was created with is a
/// corruption error.
#[derive(Clone, Copy)]
pub struct Comparator {
    pub name: &'static str,
    pub compare: fn(&[u8], &[u8]) -> Ordering,
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparator").field("name", &self.name).finish()
    }
}

fn bytewise_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// The default lexicographic byte comparator.
pub const BYTEWISE_COMPARATOR: Comparator = Comparator {
    name: "emberdb.BytewiseComparator",
    compare: bytewise_compare,
};

/// Combines a merge operand with the existing value for a key. Operands are
/// folded oldest first.
pub type MergeFn = fn(key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8>;

fn concat_merge(_key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
    out.extend_from_slice(operand);
    out
}

/// Configuration for an emberdb store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the store's files.
    pub dir: PathBuf,

    /// User-key comparator (default: bytewise).
    pub comparator: Comparator,

    /// Merge operator applied to Merge records (default: operand concatenation).
    pub merger: MergeFn,

    /// Soft cap on cached block bytes (default: 8 MB). Reserved for the block
    /// cache; table readers are bounded by `max_open_files`.
    pub cache_size: usize,

    /// Maximum number of simultaneously open table files (default: 1000).
    pub max_open_files: usize,

    /// Memtable arena capacity in bytes (default: 4 MB).
    pub memtable_size: usize,

    /// Maximum queued memtables (mutable plus immutables) before writes stall
    /// (default: 2).
    pub memtable_stop_writes_threshold: usize,

    /// L0 file count at which each write is delayed by 1 ms (default: 8).
    pub l0_slowdown_writes_threshold: usize,

    /// L0 file count at which writes stall until a flush retires files
    /// (default: 12).
    pub l0_stop_writes_threshold: usize,

    /// Number of LSM levels (default: 7).
    pub num_levels: usize,

    /// Target total byte size per level, indexed by level. Levels beyond the
    /// vector's length scale the last entry by 10x. Consulted by compaction
    /// scheduling.
    pub level_target_sizes: Vec<u64>,

    /// Target uncompressed size of an SST data block (default: 4096).
    pub block_size: usize,

    /// Number of entries between full (restart) keys in a block (default: 16).
    pub block_restart_interval: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            comparator: BYTEWISE_COMPARATOR,
            merger: concat_merge,
            cache_size: 8 * 1024 * 1024,
            max_open_files: 1000,
            memtable_size: 4 * 1024 * 1024,
            memtable_stop_writes_threshold: 2,
            l0_slowdown_writes_threshold: 8,
            l0_stop_writes_threshold: 12,
            num_levels: 7,
            level_target_sizes: vec![64 * 1024 * 1024],
            block_size: 4096,
            block_restart_interval: 16,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn merger(mut self, merger: MergeFn) -> Self {
        self.merger = merger;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn memtable_size(mut self, bytes: usize) -> Self {
        self.memtable_size = bytes;
        self
    }

    pub fn memtable_stop_writes_threshold(mut self, n: usize) -> Self {
        self.memtable_stop_writes_threshold = n;
        self
    }

    pub fn l0_slowdown_writes_threshold(mut self, n: usize) -> Self {
        self.l0_slowdown_writes_threshold = n;
        self
    }

    pub fn l0_stop_writes_threshold(mut self, n: usize) -> Self {
        self.l0_stop_writes_threshold = n;
        self
    }

    pub fn num_levels(mut self, n: usize) -> Self {
        self.num_levels = n;
        self
    }

    pub fn level_target_sizes(mut self, sizes: Vec<u64>) -> Self {
        self.level_target_sizes = sizes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn block_restart_interval(mut self, n: usize) -> Self {
        self.block_restart_interval = n;
        self
    }
}
