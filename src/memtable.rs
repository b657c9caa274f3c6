//! In-memory write buffer backed by a concurrent skip list.
//!
//! The memtable holds recent writes keyed by internal key until a flush
//! moves them into a level-0 table. `crossbeam-skiplist` provides lock-free
//! concurrent readers alongside the committing writers, and the re-ranging
//! iterator below gives bidirectional, seekable traversal over a live map.
//!
//! # Arena budget
//!
//! Rather than a bump allocator, the memtable carries a byte budget sized by
//! `Options::memtable_size`. [`MemTable::prepare`] reserves a batch's
//! serialized footprint and fails with [`Error::ArenaFull`] when it does not
//! fit, which is the signal for the write path to rotate memtables. The
//! outcome is deterministic in the arena capacity and the batch's encoded
//! length.
//!
//! # Reference counting
//!
//! Memory lifetime is managed by `Arc`; the explicit counter here tracks
//! *writers*. A memtable starts with one reference for the mutable slot;
//! `prepare` takes one per in-flight commit and `unref` releases it after
//! the records land. When rotation drops the mutable-slot reference, the
//! last finishing writer observes the count reach zero and schedules the
//! flush: an immutable memtable is only flushed once no writer can still
//! be inserting into it.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::batch::Batch;
use crate::config::Comparator;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{internal_compare, InternalKey, InternalKeyKind};

/// Skip-map key carrying the comparator so `Ord` honors the configured
/// user-key ordering (ties broken by descending trailer).
struct TableKey {
    ikey: InternalKey,
    comparator: Comparator,
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for TableKey {}
impl PartialOrd for TableKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TableKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        internal_compare(self.comparator.compare, &self.ikey, &other.ikey)
    }
}

pub struct MemTable {
    map: SkipMap<TableKey, Vec<u8>>,
    comparator: Comparator,
    arena_used: AtomicUsize,
    arena_capacity: usize,
    writer_refs: AtomicI32,
}

impl MemTable {
    pub fn new(comparator: Comparator, arena_capacity: usize) -> Self {
        Self {
            map: SkipMap::new(),
            comparator,
            arena_used: AtomicUsize::new(0),
            arena_capacity,
            writer_refs: AtomicI32::new(1),
        }
    }

    /// Reserves room for `batch` and registers the caller as a writer.
    /// Fails with [`Error::ArenaFull`] iff the batch does not fit, leaving
    /// the budget untouched.
    pub fn prepare(&self, batch: &Batch) -> Result<()> {
        let footprint = batch.data().len();
        let mut used = self.arena_used.load(Ordering::Relaxed);
        loop {
            if used + footprint > self.arena_capacity {
                return Err(Error::ArenaFull);
            }
            match self.arena_used.compare_exchange_weak(
                used,
                used + footprint,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        self.ref_();
        Ok(())
    }

    /// Inserts the batch's records under sequence numbers `base_seq + i`.
    /// LogData annotations consume their slot but are not stored.
    pub fn apply(&self, batch: &Batch, base_seq: u64) -> Result<()> {
        for (i, record) in batch.iter().enumerate() {
            let record = record?;
            if record.kind == InternalKeyKind::LogData {
                continue;
            }
            let ikey = InternalKey::new(record.key.to_vec(), base_seq + i as u64, record.kind);
            self.map.insert(
                TableKey {
                    ikey,
                    comparator: self.comparator,
                },
                record.value.unwrap_or_default().to_vec(),
            );
        }
        Ok(())
    }

    pub fn ref_(&self) {
        self.writer_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops a writer reference. Returns true when the count reaches zero,
    /// i.e. the memtable is immutable and ready to flush.
    pub fn unref(&self) -> bool {
        let prev = self.writer_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "memtable writer refcount underflow");
        prev == 1
    }

    /// True once no writer holds a reference; flushing is safe.
    pub fn ready_for_flush(&self) -> bool {
        self.writer_refs.load(Ordering::SeqCst) == 0
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.arena_used.load(Ordering::Relaxed)
    }

    pub fn new_iter(self: Arc<Self>) -> MemTableIter {
        MemTableIter {
            mem: self,
            current: None,
        }
    }

    fn probe(&self, ikey: &InternalKey) -> TableKey {
        TableKey {
            ikey: ikey.clone(),
            comparator: self.comparator,
        }
    }
}

/// Bidirectional iterator over a memtable. Positions are re-resolved
/// against the skip map on every step, which keeps the iterator valid under
/// concurrent inserts.
pub struct MemTableIter {
    mem: Arc<MemTable>,
    current: Option<(InternalKey, Vec<u8>)>,
}

impl MemTableIter {
    fn capture(
        entry: Option<crossbeam_skiplist::map::Entry<'_, TableKey, Vec<u8>>>,
    ) -> Option<(InternalKey, Vec<u8>)> {
        entry.map(|e| (e.key().ikey.clone(), e.value().clone()))
    }
}

impl InternalIterator for MemTableIter {
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        let probe = self.mem.probe(ikey);
        self.current =
            Self::capture(self.mem.map.lower_bound(std::ops::Bound::Included(&probe)));
        self.current.is_some()
    }

    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        let probe = self.mem.probe(ikey);
        self.current =
            Self::capture(self.mem.map.upper_bound(std::ops::Bound::Excluded(&probe)));
        self.current.is_some()
    }

    fn first(&mut self) -> bool {
        self.current = Self::capture(self.mem.map.front());
        self.current.is_some()
    }

    fn last(&mut self) -> bool {
        self.current = Self::capture(self.mem.map.back());
        self.current.is_some()
    }

    fn next(&mut self) -> bool {
        let Some((cur, _)) = &self.current else {
            return false;
        };
        let probe = self.mem.probe(cur);
        self.current =
            Self::capture(self.mem.map.lower_bound(std::ops::Bound::Excluded(&probe)));
        self.current.is_some()
    }

    fn prev(&mut self) -> bool {
        let Some((cur, _)) = &self.current else {
            return false;
        };
        let probe = self.mem.probe(cur);
        self.current =
            Self::capture(self.mem.map.upper_bound(std::ops::Bound::Excluded(&probe)));
        self.current.is_some()
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &InternalKey {
        &self.current.as_ref().expect("iterator is not positioned").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator is not positioned").1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BYTEWISE_COMPARATOR;
    use crate::iterator::InternalIterator;

    fn mem_with(entries: &[(&[u8], u64, InternalKeyKind, &[u8])]) -> Arc<MemTable> {
        let mem = Arc::new(MemTable::new(BYTEWISE_COMPARATOR, 1 << 20));
        for (key, seq, kind, value) in entries {
            let mut batch = Batch::new(BYTEWISE_COMPARATOR);
            match kind {
                InternalKeyKind::Set => batch.set(key, value),
                InternalKeyKind::Delete => batch.delete(key),
                InternalKeyKind::Merge => batch.merge(key, value),
                _ => unreachable!(),
            }
            mem.prepare(&batch).expect("prepare failed");
            mem.apply(&batch, *seq).expect("apply failed");
            mem.unref();
        }
        mem
    }

    #[test]
    fn test_apply_assigns_sequential_seqnums() {
        let mem = Arc::new(MemTable::new(BYTEWISE_COMPARATOR, 1 << 20));
        let mut batch = Batch::new(BYTEWISE_COMPARATOR);
        batch.set(b"a", b"1");
        batch.set(b"b", b"2");
        batch.set(b"c", b"3");
        mem.prepare(&batch).unwrap();
        mem.apply(&batch, 10).unwrap();

        let mut iter = mem.new_iter();
        assert!(iter.first());
        let mut seqs = vec![iter.key().seq_num()];
        while iter.next() {
            seqs.push(iter.key().seq_num());
        }
        assert_eq!(seqs, vec![10, 11, 12]);
    }

    #[test]
    fn test_newest_version_first() {
        let mem = mem_with(&[
            (b"k", 1, InternalKeyKind::Set, b"old"),
            (b"k", 2, InternalKeyKind::Set, b"new"),
        ]);

        let mut iter = mem.new_iter();
        assert!(iter.seek_ge(&InternalKey::search_key(b"k")));
        assert_eq!(iter.key().seq_num(), 2);
        assert_eq!(iter.value(), b"new");
        assert!(iter.next());
        assert_eq!(iter.key().seq_num(), 1);
    }

    #[test]
    fn test_arena_full_is_deterministic() {
        let mem = MemTable::new(BYTEWISE_COMPARATOR, 64);
        let mut batch = Batch::new(BYTEWISE_COMPARATOR);
        batch.set(b"key", b"value");
        let footprint = batch.data().len();

        let fits = 64 / footprint;
        for _ in 0..fits {
            mem.prepare(&batch).expect("batch must fit");
        }
        assert_eq!(mem.prepare(&batch), Err(Error::ArenaFull));
        // The failed reservation leaves the budget unchanged.
        assert_eq!(mem.approximate_size(), fits * footprint);
    }

    #[test]
    fn test_writer_refcount_signals_flush() {
        let mem = MemTable::new(BYTEWISE_COMPARATOR, 1 << 20);
        let batch = {
            let mut b = Batch::new(BYTEWISE_COMPARATOR);
            b.set(b"k", b"v");
            b
        };
        mem.prepare(&batch).unwrap();

        // Writer still holds a reference; rotating away the mutable-slot
        // reference must not report readiness yet.
        assert!(!mem.unref(), "mutable-slot unref with writer in flight");
        assert!(!mem.ready_for_flush());

        // Last writer drains: flush becomes schedulable.
        assert!(mem.unref());
        assert!(mem.ready_for_flush());
    }

    #[test]
    fn test_bidirectional_iteration() {
        let mem = mem_with(&[
            (b"a", 1, InternalKeyKind::Set, b"1"),
            (b"b", 2, InternalKeyKind::Set, b"2"),
            (b"c", 3, InternalKeyKind::Set, b"3"),
        ]);

        let mut iter = mem.new_iter();
        assert!(iter.last());
        assert_eq!(iter.key().user_key, b"c");
        assert!(iter.prev());
        assert_eq!(iter.key().user_key, b"b");
        assert!(iter.prev());
        assert_eq!(iter.key().user_key, b"a");
        assert!(!iter.prev());

        assert!(iter.seek_lt(&InternalKey::search_key(b"c")));
        assert_eq!(iter.key().user_key, b"b");
    }

    #[test]
    fn test_iterator_sees_concurrent_inserts() {
        let mem = mem_with(&[(b"a", 1, InternalKeyKind::Set, b"1")]);
        let mut iter = Arc::clone(&mem).new_iter();
        assert!(iter.first());

        // Insert behind the iterator's position; the re-ranging step picks
        // it up.
        let mut batch = Batch::new(BYTEWISE_COMPARATOR);
        batch.set(b"b", b"2");
        mem.prepare(&batch).unwrap();
        mem.apply(&batch, 5).unwrap();
        mem.unref();

        assert!(iter.next());
        assert_eq!(iter.key().user_key, b"b");
    }

    #[test]
    fn test_log_data_not_stored() {
        let mem = Arc::new(MemTable::new(BYTEWISE_COMPARATOR, 1 << 20));
        let mut batch = Batch::new(BYTEWISE_COMPARATOR);
        batch.log_data(b"annotation");
        batch.set(b"k", b"v");
        mem.prepare(&batch).unwrap();
        mem.apply(&batch, 3).unwrap();

        let mut iter = mem.new_iter();
        assert!(iter.first());
        assert_eq!(iter.key().user_key, b"k");
        // The Set record was the second in the batch, so it took base+1.
        assert_eq!(iter.key().seq_num(), 4);
        assert!(!iter.next());
    }
}
