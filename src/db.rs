//! The database: a concurrent, persistent, ordered key/value store.
//!
//! # Write path
//!
//! `apply` stamps the batch's sequence range and appends it to the WAL with
//! the DB lock held, inserts into the memtable with the lock released, and
//! publishes visibility through the commit pipeline. A full memtable is
//! rotated: a fresh WAL is created, the old memtable becomes immutable at
//! the back of the queue, and the flush worker moves it into a level-0
//! table once the last in-flight writer drains.
//!
//! # Read path
//!
//! Readers briefly take the DB lock to capture a snapshot (the visible
//! sequence number, a referenced current version, and the memtable queue)
//! and then operate entirely on that frozen view. Writers and flushes never
//! block readers.
//!
//! # Locking
//!
//! One coarse mutex guards the mutable state below; `mem_cond` wakes
//! rotation waiters and `compact_cond` wakes writers stalled on the
//! memtable queue or level-0 thresholds (and `close` waiting on background
//! work). Sequence-number atomics live in the commit pipeline and are read
//! without the lock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::batch::Batch;
use crate::commit::CommitPipeline;
use crate::config::{MergeFn, Options};
use crate::error::{Error, Result};
use crate::filenames::{make_filename, parse_filename, FileType};
use crate::flock::FileLock;
use crate::iterator::{DbIterator, InternalIterator, MergingIter, VecIter};
use crate::key::{is_visible, InternalKey, InternalKeyKind, SEQ_NUM_MAX};
use crate::memtable::MemTable;
use crate::record;
use crate::sstable::table::{TableCache, TableIter, TableWriter};
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::version::{FileMetadata, Version};

struct MemState {
    /// The current mutable memtable; also the last element of `queue`.
    mutable: Arc<MemTable>,
    /// All memtables, oldest first. Entries are immutable once the mutable
    /// slot moves past them, so a cloned queue is a safe read-side snapshot.
    queue: Vec<Arc<MemTable>>,
    /// True while a rotation has released the lock to create the new WAL.
    switching: bool,
}

struct CompactState {
    flushing: bool,
    /// Files being written by a flush; the garbage collector must not
    /// touch them before their version edit lands.
    pending_outputs: HashSet<u64>,
}

struct DbState {
    closed: bool,
    versions: VersionSet,
    /// File number of the current WAL.
    log_number: u64,
    /// Current WAL writer. Shared so a sync can run without the DB lock:
    /// a committer syncs whichever WAL was current when its record landed.
    log: Option<Arc<Mutex<record::Writer>>>,
    mem: MemState,
    compact: CompactState,
    /// A failed background flush parks its error here; the next write
    /// returns it.
    bg_error: Option<Error>,
}

struct DbInner {
    dirname: PathBuf,
    opts: Options,
    merger: MergeFn,
    cmp: fn(&[u8], &[u8]) -> CmpOrdering,
    table_cache: Arc<TableCache>,
    commit: CommitPipeline,
    mu: Mutex<DbState>,
    mem_cond: Condvar,
    compact_cond: Condvar,
}

/// A concurrent, persistent, ordered key/value store.
pub struct Db {
    inner: Arc<DbInner>,
    /// Held for the Db's lifetime; releasing it on drop (not on the last
    /// internal reference) keeps lock ownership deterministic even while a
    /// background thread winds down.
    _file_lock: FileLock,
}

impl Db {
    /// Opens the store in `opts.dir`, creating it if necessary and
    /// recovering any state a previous incarnation left behind.
    pub fn open(opts: Options) -> Result<Db> {
        let dirname = opts.dir.clone();
        fs::create_dir_all(&dirname)?;
        let file_lock = FileLock::lock(make_filename(&dirname, FileType::Lock, 0))?;

        if !make_filename(&dirname, FileType::Current, 0).exists() {
            VersionSet::create_initial(&dirname, &opts)?;
            tracing::info!(dir = %dirname.display(), "created new store");
        }
        let mut versions = VersionSet::load(&dirname, &opts)?;

        // Replay WALs the manifest has not retired, oldest first.
        let mut wal_nums: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dirname)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some((FileType::Log, num)) = parse_filename(name) {
                    if num >= versions.log_number || num == versions.prev_log_number {
                        wal_nums.push(num);
                    }
                }
            }
        }
        wal_nums.sort_unstable();

        let mut edit = VersionEdit::default();
        let mut next_seq = versions.last_sequence;
        for num in wal_nums {
            versions.mark_file_num_used(num);
            next_seq = replay_wal(&dirname, &opts, &mut versions, &mut edit, num, next_seq)?;
        }

        // Open the WAL for this incarnation and persist the cutover.
        let log_number = versions.next_file_num();
        let log_path = make_filename(&dirname, FileType::Log, log_number);
        let log = record::Writer::new(File::create(&log_path)?)?;
        edit.log_number = Some(log_number);
        versions.log_and_apply(&mut edit, next_seq)?;

        let mutable = Arc::new(MemTable::new(opts.comparator, opts.memtable_size));
        let state = DbState {
            closed: false,
            versions,
            log_number,
            log: Some(Arc::new(Mutex::new(log))),
            mem: MemState {
                queue: vec![Arc::clone(&mutable)],
                mutable,
                switching: false,
            },
            compact: CompactState {
                flushing: false,
                pending_outputs: HashSet::new(),
            },
            bg_error: None,
        };

        let inner = Arc::new(DbInner {
            table_cache: Arc::new(TableCache::new(
                dirname.clone(),
                opts.comparator.compare,
                opts.max_open_files,
            )),
            cmp: opts.comparator.compare,
            merger: opts.merger,
            commit: CommitPipeline::new(next_seq),
            mu: Mutex::new(state),
            mem_cond: Condvar::new(),
            compact_cond: Condvar::new(),
            dirname,
            opts,
        });

        // Clear out retired WALs, superseded manifests and orphaned tables
        // from a previous incarnation.
        inner.collect_garbage()?;

        Ok(Db {
            inner,
            _file_lock: file_lock,
        })
    }

    /// Gets the value for a key. Returns [`Error::NotFound`] if the store
    /// does not contain the key.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.get_inner(None, key)
    }

    /// Reads through an indexed batch: the batch's uncommitted records
    /// overlay the store's current snapshot.
    pub fn batch_get(&self, batch: &Batch, key: &[u8]) -> Result<Vec<u8>> {
        self.get_inner(Some(batch), key)
    }

    fn get_inner(&self, batch: Option<&Batch>, key: &[u8]) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let (snapshot, current, memtables) = {
            let state = inner.mu.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            let current = Arc::clone(state.versions.current());
            current.ref_();
            (
                inner.commit.visible_seq_num(),
                current,
                state.mem.queue.clone(),
            )
        };

        let result = inner.get_from_snapshot(batch, key, snapshot, &current, &memtables);
        if current.unref() {
            let _ = inner.collect_garbage();
        }
        result
    }

    /// Applies a batch atomically. When `sync` is set, the call returns
    /// only after the batch is durable in the WAL; it always returns only
    /// after the batch is visible to subsequent reads.
    pub fn apply(&self, batch: &mut Batch, sync: bool) -> Result<()> {
        let inner = &self.inner;
        if batch.count() == 0 {
            return Ok(());
        }
        if batch.data().len() > inner.opts.memtable_size {
            // Rotation could never make room for it.
            return Err(Error::Invariant(format!(
                "batch of {} bytes exceeds the {}-byte memtable arena",
                batch.data().len(),
                inner.opts.memtable_size
            )));
        }
        let count = u64::from(batch.count());

        // Crude backpressure: when L0 grows past the slowdown threshold,
        // delay each write by a millisecond to smooth latency rather than
        // stalling entirely at the stop threshold.
        {
            let state = inner.mu.lock()?;
            let slowdown =
                state.versions.current().files[0].len() > inner.opts.l0_slowdown_writes_threshold;
            drop(state);
            if slowdown {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let (mem, log, base) = {
            let mut state = inner.mu.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }

            state = DbInner::make_room_for_write(inner, state, Some(batch))?;
            // From here the mutable memtable holds our writer reference.

            let base = inner.commit.allocate(count)?;
            batch.set_seq_num(base);

            let wal_result = (|| -> Result<()> {
                let log = state.log.as_ref().ok_or(Error::Closed)?;
                let mut writer = log.lock()?;
                writer.add_record(batch.data())?;
                writer.flush()?;
                Ok(())
            })();
            if let Err(e) = wal_result {
                // A failed WAL append means lost durability; stop writes.
                // The sequence range is still published so later commits
                // do not stall behind a hole.
                state.bg_error = Some(e.clone());
                if state.mem.mutable.unref() {
                    DbInner::maybe_schedule_flush(inner, &mut state);
                }
                drop(state);
                let _ = inner.commit.publish(base, count);
                return Err(e);
            }

            let mem = Arc::clone(&state.mem.mutable);
            let log = Arc::clone(state.log.as_ref().expect("checked above"));
            (mem, log, base)
        };

        // Lock released: insert concurrently with other committers.
        let apply_result = mem.apply(batch, base);
        if mem.unref() {
            if let Ok(mut state) = inner.mu.lock() {
                DbInner::maybe_schedule_flush(inner, &mut state);
            }
        }

        let sync_result = if sync && apply_result.is_ok() {
            log.lock().map_err(Error::from).and_then(|mut w| w.sync())
        } else {
            Ok(())
        };

        // Publish unconditionally: later commits must not stall behind
        // this batch's slot in the pipeline.
        inner.commit.publish(base, count)?;
        apply_result?;
        sync_result
    }

    /// Sets the value for a key, overwriting any previous value.
    pub fn set(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let mut batch = self.new_batch();
        batch.set(key, value);
        self.apply(&mut batch, sync)
    }

    /// Deletes the value for a key. Deletes are blind: they succeed whether
    /// or not the key exists.
    pub fn delete(&self, key: &[u8], sync: bool) -> Result<()> {
        let mut batch = self.new_batch();
        batch.delete(key);
        self.apply(&mut batch, sync)
    }

    /// Writes a range tombstone covering `[start, end)`.
    pub fn delete_range(&self, start: &[u8], end: &[u8], sync: bool) -> Result<()> {
        let mut batch = self.new_batch();
        batch.delete_range(start, end);
        self.apply(&mut batch, sync)
    }

    /// Merges a value for a key using the configured merge operator.
    pub fn merge(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let mut batch = self.new_batch();
        batch.merge(key, value);
        self.apply(&mut batch, sync)
    }

    pub fn new_batch(&self) -> Batch {
        Batch::new(self.inner.opts.comparator)
    }

    /// A batch that indexes its own records, readable through
    /// [`Db::batch_get`] and [`Db::new_batch_iter`].
    pub fn new_indexed_batch(&self) -> Batch {
        Batch::new_indexed(self.inner.opts.comparator)
    }

    /// Returns an unpositioned iterator over the store's visible entries.
    pub fn new_iter(&self) -> Result<Iter> {
        self.new_iter_inner(None)
    }

    /// An iterator merging an indexed batch's uncommitted records over the
    /// store's snapshot.
    pub fn new_batch_iter(&self, batch: &Batch) -> Result<Iter> {
        self.new_iter_inner(Some(batch))
    }

    fn new_iter_inner(&self, batch: Option<&Batch>) -> Result<Iter> {
        let inner = &self.inner;
        let (snapshot, current, memtables) = {
            let state = inner.mu.lock()?;
            if state.closed {
                return Err(Error::Closed);
            }
            let current = Arc::clone(state.versions.current());
            current.ref_();
            (
                inner.commit.visible_seq_num(),
                current,
                state.mem.queue.clone(),
            )
        };

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        if let Some(batch) = batch {
            children.push(Box::new(VecIter::new(inner.cmp, batch.overlay())));
        }
        for mem in memtables.iter().rev() {
            children.push(Box::new(Arc::clone(mem).new_iter()));
        }
        let mut open_error = None;
        // Level-0 files overlap; each contributes its own child, newest
        // first. Deeper levels are disjoint and share one lazy iterator.
        for meta in &current.files[0] {
            match inner.table_cache.get(meta.file_num) {
                Ok(table) => children.push(Box::new(table.new_iter())),
                Err(e) => {
                    open_error = Some(e);
                    break;
                }
            }
        }
        for files in current.files.iter().skip(1) {
            if files.is_empty() {
                continue;
            }
            children.push(Box::new(LevelIter::new(
                Arc::clone(&inner.table_cache),
                inner.cmp,
                files.clone(),
            )));
        }

        if let Some(e) = open_error {
            if current.unref() {
                let _ = inner.collect_garbage();
            }
            return Err(e);
        }

        let merged = MergingIter::new(inner.cmp, children);
        Ok(Iter {
            iter: DbIterator::new(merged, inner.merger, snapshot),
            db: Arc::clone(inner),
            version: Some(current),
            _memtables: memtables,
        })
    }

    /// Forces the current mutable memtable out to a level-0 table and
    /// blocks until it lands.
    pub fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.mu.lock()?;
        if state.closed {
            return Err(Error::Closed);
        }
        let target = Arc::clone(&state.mem.mutable);
        state = DbInner::make_room_for_write(inner, state, None)?;

        while state.mem.queue.iter().any(|m| Arc::ptr_eq(m, &target)) {
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
            if state.closed {
                return Err(Error::Closed);
            }
            state = inner.compact_cond.wait(state)?;
        }
        Ok(())
    }

    /// Manual compaction of a key range.
    pub fn compact(&self, _start: &[u8], _end: &[u8]) -> Result<()> {
        Err(Error::Unimplemented)
    }

    /// Closes the store, waiting for background work to finish. Further
    /// calls on any API return [`Error::Closed`]; `close` itself is
    /// idempotent.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.mu.lock()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        // Wake anything parked on rotation or stall conditions so it can
        // observe the closed flag.
        inner.mem_cond.notify_all();
        inner.compact_cond.notify_all();
        while state.compact.flushing {
            state = inner.compact_cond.wait(state)?;
        }
        if let Some(log) = state.log.take() {
            log.lock()?.sync()?;
        }
        tracing::info!(dir = %inner.dirname.display(), "store closed");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl DbInner {
    /// Ensures the mutable memtable can take the batch, rotating memtables
    /// and WAL as needed. With `batch == None`, rotates once
    /// unconditionally (explicit flush). Returns with the lock held and,
    /// for a batch, with the reservation made and a writer reference taken.
    fn make_room_for_write<'a>(
        inner: &'a Arc<DbInner>,
        mut state: MutexGuard<'a, DbState>,
        batch: Option<&Batch>,
    ) -> Result<MutexGuard<'a, DbState>> {
        let mut force = batch.is_none();
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if state.mem.switching {
                state = inner.mem_cond.wait(state)?;
                continue;
            }
            if let Some(batch) = batch {
                match state.mem.mutable.prepare(batch) {
                    Ok(()) => return Ok(state),
                    Err(Error::ArenaFull) => {}
                    Err(e) => return Err(e),
                }
            } else if !force {
                return Ok(state);
            }
            if state.mem.queue.len() >= inner.opts.memtable_stop_writes_threshold {
                // The immutable queue is full; wait for a flush to retire
                // one.
                state = inner.compact_cond.wait(state)?;
                continue;
            }
            if state.versions.current().files[0].len() > inner.opts.l0_stop_writes_threshold {
                // Too many level-0 tables.
                state = inner.compact_cond.wait(state)?;
                continue;
            }

            let new_log_number = state.versions.next_file_num();
            state.mem.switching = true;
            drop(state);

            let log_path = make_filename(&inner.dirname, FileType::Log, new_log_number);
            let new_log = File::create(&log_path)
                .map_err(Error::from)
                .and_then(record::Writer::new);

            state = inner.mu.lock()?;
            state.mem.switching = false;
            inner.mem_cond.notify_all();

            let new_log = match new_log {
                Ok(w) => w,
                Err(e) => {
                    let _ = fs::remove_file(&log_path);
                    return Err(e);
                }
            };

            // The flush of the outgoing memtable will log an edit telling
            // the manifest that WALs below this number are retired.
            state.log_number = new_log_number;
            state.log = Some(Arc::new(Mutex::new(new_log)));
            let new_mutable = Arc::new(MemTable::new(
                inner.opts.comparator,
                inner.opts.memtable_size,
            ));
            let imm = std::mem::replace(&mut state.mem.mutable, Arc::clone(&new_mutable));
            state.mem.queue.push(new_mutable);
            tracing::debug!(log = new_log_number, "rotated memtable");
            if imm.unref() {
                DbInner::maybe_schedule_flush(inner, &mut state);
            }
            force = false;
        }
    }

    /// Starts the flush worker once every immutable memtable has drained
    /// its writers and no worker is running. Called with the DB lock held.
    fn maybe_schedule_flush(inner: &Arc<DbInner>, state: &mut DbState) {
        if state.compact.flushing || state.closed {
            return;
        }
        let immutables = state.mem.queue.len().saturating_sub(1);
        if immutables == 0 {
            return;
        }
        if !state.mem.queue[..immutables].iter().all(|m| m.ready_for_flush()) {
            return;
        }
        state.compact.flushing = true;
        let worker = Arc::clone(inner);
        std::thread::spawn(move || worker.flush_loop());
    }

    fn flush_loop(self: Arc<Self>) {
        let mut state = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let immutables = state.mem.queue.len().saturating_sub(1);
            if immutables == 0 {
                break;
            }
            // Retiring WALs below the current log number is only sound if
            // every memtable written under those WALs reaches level 0, so
            // the whole immutable prefix flushes under one version edit.
            if !state.mem.queue[..immutables].iter().all(|m| m.ready_for_flush()) {
                break;
            }
            let mems: Vec<Arc<MemTable>> = state.mem.queue[..immutables].to_vec();
            let (returned, result) = self.flush_mems(state, mems);
            state = returned;
            if let Err(e) = result {
                tracing::error!(error = %e, "memtable flush failed");
                state.bg_error = Some(e);
                break;
            }
        }
        state.compact.flushing = false;
        drop(state);
        self.compact_cond.notify_all();
        let _ = self.collect_garbage();
    }

    /// Flushes the given immutable memtables (the front of the queue) into
    /// level-0 tables and applies one version edit installing them and
    /// retiring their WALs. Releases the lock around the file I/O; on
    /// error every partial output is removed.
    fn flush_mems<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        mems: Vec<Arc<MemTable>>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        // WALs below the log number captured here hold exactly the records
        // of `mems`; a rotation during the I/O below only raises the live
        // log number.
        let log_number = state.log_number;

        let mut outputs: Vec<(u64, Arc<MemTable>)> = Vec::new();
        for mem in &mems {
            if mem.is_empty() {
                continue;
            }
            let file_num = state.versions.next_file_num();
            state.compact.pending_outputs.insert(file_num);
            outputs.push((file_num, Arc::clone(mem)));
        }
        drop(state);

        let mut built: Vec<FileMetadata> = Vec::new();
        let mut build_error = None;
        for (file_num, mem) in &outputs {
            match self.build_table(*file_num, mem) {
                Ok(meta) => built.push(meta),
                Err(e) => {
                    build_error = Some(e);
                    break;
                }
            }
        }

        let mut state = self.mu.lock().unwrap_or_else(|e| e.into_inner());
        let result = (|| {
            if let Some(e) = build_error {
                for (file_num, _) in &outputs {
                    state.compact.pending_outputs.remove(file_num);
                    let _ =
                        fs::remove_file(make_filename(&self.dirname, FileType::Table, *file_num));
                }
                return Err(e);
            }

            let mut edit = VersionEdit {
                log_number: Some(log_number),
                ..Default::default()
            };
            for meta in built {
                tracing::info!(
                    table = meta.file_num,
                    size = meta.size,
                    "flushed memtable to level 0"
                );
                edit.new_files.push((0, Arc::new(meta)));
            }
            let apply_result = state
                .versions
                .log_and_apply(&mut edit, self.commit.log_seq_num());
            for (file_num, _) in &outputs {
                state.compact.pending_outputs.remove(file_num);
            }
            apply_result?;
            state.mem.queue.drain(..mems.len());
            state.versions.purge_obsolete_versions();
            Ok(())
        })();
        self.compact_cond.notify_all();
        (state, result)
    }

    /// Writes the memtable's contents to a new table file, returning its
    /// metadata. Called without the DB lock.
    fn build_table(&self, file_num: u64, mem: &Arc<MemTable>) -> Result<FileMetadata> {
        let path = make_filename(&self.dirname, FileType::Table, file_num);
        let result = (|| {
            let mut writer = TableWriter::create(
                &path,
                self.opts.block_size,
                self.opts.block_restart_interval,
            )?;
            let mut iter = Arc::clone(mem).new_iter();
            if !iter.first() {
                return Err(Error::Invariant("flushing an empty memtable".to_string()));
            }
            let smallest = iter.key().clone();
            let mut largest;
            loop {
                largest = iter.key().clone();
                writer.add(&largest, iter.value())?;
                if !iter.next() {
                    break;
                }
            }
            let size = writer.finish()?;
            Ok(FileMetadata {
                file_num,
                size,
                smallest,
                largest,
            })
        })();
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result
    }

    /// Resolves a key against a captured snapshot: the optional batch
    /// overlay first, then memtables newest to oldest, then the version's
    /// tables. Merge operands accumulate newest-first across sources until
    /// a definitive record resolves them.
    fn get_from_snapshot(
        &self,
        batch: Option<&Batch>,
        key: &[u8],
        snapshot: u64,
        current: &Arc<Version>,
        memtables: &[Arc<MemTable>],
    ) -> Result<Vec<u8>> {
        let mut operands: Vec<Vec<u8>> = Vec::new();

        if let Some(batch) = batch {
            let mut overlay = VecIter::new(self.cmp, batch.overlay());
            // Overlay records carry the batch bit; probe above it.
            match internal_get(&mut overlay, self.cmp, key, SEQ_NUM_MAX, &mut operands)? {
                InternalGet::Value(v) => return Ok(self.fold(key, Some(v), &operands)),
                InternalGet::Deleted => return self.resolve_deleted(key, &operands),
                InternalGet::NotFound => {}
            }
        }

        for mem in memtables.iter().rev() {
            let mut iter = Arc::clone(mem).new_iter();
            match internal_get(&mut iter, self.cmp, key, snapshot, &mut operands)? {
                InternalGet::Value(v) => return Ok(self.fold(key, Some(v), &operands)),
                InternalGet::Deleted => return self.resolve_deleted(key, &operands),
                InternalGet::NotFound => {}
            }
        }

        // Level 0: files may overlap, walk newest first.
        for meta in &current.files[0] {
            if !meta.overlaps(self.cmp, key) {
                continue;
            }
            let table = self.table_cache.get(meta.file_num)?;
            let mut iter = table.new_iter();
            match internal_get(&mut iter, self.cmp, key, snapshot, &mut operands)? {
                InternalGet::Value(v) => return Ok(self.fold(key, Some(v), &operands)),
                InternalGet::Deleted => return self.resolve_deleted(key, &operands),
                InternalGet::NotFound => {}
            }
        }

        // Deeper levels: at most one file per level can hold the key.
        for level in 1..current.num_levels() {
            let Some(meta) = current.find_file(level, self.cmp, key) else {
                continue;
            };
            let table = self.table_cache.get(meta.file_num)?;
            let mut iter = table.new_iter();
            match internal_get(&mut iter, self.cmp, key, snapshot, &mut operands)? {
                InternalGet::Value(v) => return Ok(self.fold(key, Some(v), &operands)),
                InternalGet::Deleted => return self.resolve_deleted(key, &operands),
                InternalGet::NotFound => {}
            }
        }

        self.resolve_deleted(key, &operands)
    }

    fn fold(&self, key: &[u8], base: Option<Vec<u8>>, newest_first: &[Vec<u8>]) -> Vec<u8> {
        let mut acc = base;
        for op in newest_first.iter().rev() {
            acc = Some((self.merger)(key, acc.as_deref(), op));
        }
        acc.unwrap_or_default()
    }

    fn resolve_deleted(&self, key: &[u8], operands: &[Vec<u8>]) -> Result<Vec<u8>> {
        if operands.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(self.fold(key, None, operands))
        }
    }

    /// Deletes files no live version or pending output references. Takes
    /// and releases the DB lock; actual unlinking happens outside it.
    fn collect_garbage(&self) -> Result<()> {
        let doomed = {
            let mut state = self.mu.lock()?;
            if state.closed {
                // A later incarnation may own the directory already.
                return Ok(());
            }
            state.versions.purge_obsolete_versions();
            let live = state.versions.live_file_nums();
            let mut doomed: Vec<(PathBuf, Option<u64>)> = Vec::new();
            for entry in fs::read_dir(&self.dirname)? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                let Some((ftype, num)) = parse_filename(&name) else {
                    continue;
                };
                let keep = match ftype {
                    FileType::Current | FileType::Lock => true,
                    FileType::Manifest => num >= state.versions.manifest_file_number,
                    FileType::Log => {
                        num >= state.versions.log_number
                            || num == state.versions.prev_log_number
                    }
                    FileType::Table => {
                        live.contains(&num) || state.compact.pending_outputs.contains(&num)
                    }
                    FileType::Temp => false,
                };
                if !keep {
                    let table_num = (ftype == FileType::Table).then_some(num);
                    doomed.push((entry.path(), table_num));
                }
            }
            doomed
        };

        for (path, table_num) in doomed {
            if let Some(num) = table_num {
                self.table_cache.evict(num);
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(file = %path.display(), "removed obsolete file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "failed to remove obsolete file")
                }
            }
        }
        Ok(())
    }
}

/// Replays one WAL into level-0 tables (spilling when the replay memtable
/// fills), accumulating new files into `edit`. Returns the next sequence
/// number after the replayed records.
fn replay_wal(
    dirname: &std::path::Path,
    opts: &Options,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    wal_num: u64,
    mut next_seq: u64,
) -> Result<u64> {
    let path = make_filename(dirname, FileType::Log, wal_num);
    let file = File::open(&path)?;
    let mut reader = record::Reader::new(file);
    let mut mem = Arc::new(MemTable::new(opts.comparator, opts.memtable_size));
    let mut replayed = 0u64;

    while let Some(data) = reader.read_record()? {
        let batch = Batch::from_data(data)?;
        let base = batch.seq_num();
        let count = u64::from(batch.count());
        if mem.prepare(&batch).is_err() && !mem.is_empty() {
            spill_replay_memtable(dirname, opts, versions, edit, &mem)?;
            mem = Arc::new(MemTable::new(opts.comparator, opts.memtable_size));
            // An oversized batch simply overshoots the fresh budget.
            let _ = mem.prepare(&batch);
        }
        mem.apply(&batch, base)?;
        next_seq = next_seq.max(base + count);
        replayed += count;
    }

    if !mem.is_empty() {
        spill_replay_memtable(dirname, opts, versions, edit, &mem)?;
    }
    tracing::info!(wal = wal_num, records = replayed, "replayed write-ahead log");
    Ok(next_seq)
}

fn spill_replay_memtable(
    dirname: &std::path::Path,
    opts: &Options,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
    mem: &Arc<MemTable>,
) -> Result<()> {
    let file_num = versions.next_file_num();
    let path = make_filename(dirname, FileType::Table, file_num);
    let result = (|| {
        let mut writer = TableWriter::create(&path, opts.block_size, opts.block_restart_interval)?;
        let mut iter = Arc::clone(mem).new_iter();
        if !iter.first() {
            return Err(Error::Invariant("spilling an empty memtable".to_string()));
        }
        let smallest = iter.key().clone();
        let mut largest;
        loop {
            largest = iter.key().clone();
            writer.add(&largest, iter.value())?;
            if !iter.next() {
                break;
            }
        }
        let size = writer.finish()?;
        edit.new_files.push((
            0,
            Arc::new(FileMetadata {
                file_num,
                size,
                smallest,
                largest,
            }),
        ));
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&path);
    }
    result
}

enum InternalGet {
    Value(Vec<u8>),
    Deleted,
    NotFound,
}

/// Probes one source for the newest visible record of `user_key`. Merge
/// operands found on the way are appended (newest first) to `operands`;
/// the caller keeps scanning older sources until a definitive record.
fn internal_get<I: InternalIterator>(
    iter: &mut I,
    cmp: fn(&[u8], &[u8]) -> CmpOrdering,
    user_key: &[u8],
    snapshot: u64,
    operands: &mut Vec<Vec<u8>>,
) -> Result<InternalGet> {
    let probe = InternalKey::new(user_key.to_vec(), snapshot, InternalKeyKind::Max);
    let mut positioned = iter.seek_ge(&probe);
    while positioned {
        let ikey = iter.key();
        if cmp(&ikey.user_key, user_key) != CmpOrdering::Equal {
            break;
        }
        if !is_visible(ikey.seq_num(), snapshot) {
            positioned = iter.next();
            continue;
        }
        match ikey.kind()? {
            InternalKeyKind::Set => return Ok(InternalGet::Value(iter.value().to_vec())),
            InternalKeyKind::Delete => return Ok(InternalGet::Deleted),
            InternalKeyKind::Merge => {
                operands.push(iter.value().to_vec());
                positioned = iter.next();
            }
            // Range tombstones are not applied on point reads yet.
            _ => positioned = iter.next(),
        }
    }
    Ok(InternalGet::NotFound)
}

/// Iterates one level >= 1: files are disjoint and sorted, so a single
/// cursor walks file by file, opening tables through the cache on demand.
struct LevelIter {
    cache: Arc<TableCache>,
    cmp: fn(&[u8], &[u8]) -> CmpOrdering,
    files: Vec<Arc<FileMetadata>>,
    index: usize,
    table_iter: Option<TableIter>,
    err: Option<Error>,
}

impl LevelIter {
    fn new(
        cache: Arc<TableCache>,
        cmp: fn(&[u8], &[u8]) -> CmpOrdering,
        files: Vec<Arc<FileMetadata>>,
    ) -> Self {
        Self {
            cache,
            cmp,
            files,
            index: 0,
            table_iter: None,
            err: None,
        }
    }

    fn load(&mut self, index: usize) -> bool {
        match self.cache.get(self.files[index].file_num) {
            Ok(table) => {
                self.index = index;
                self.table_iter = Some(table.new_iter());
                true
            }
            Err(e) => {
                self.err = Some(e);
                self.table_iter = None;
                false
            }
        }
    }

    /// First file whose largest key is >= the probe.
    fn file_for(&self, ikey: &InternalKey) -> usize {
        self.files.partition_point(|f| {
            crate::key::internal_compare(self.cmp, &f.largest, ikey) == CmpOrdering::Less
        })
    }
}

impl InternalIterator for LevelIter {
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        let index = self.file_for(ikey);
        if index >= self.files.len() {
            self.table_iter = None;
            return false;
        }
        if !self.load(index) {
            return false;
        }
        if self
            .table_iter
            .as_mut()
            .map(|t| t.seek_ge(ikey))
            .unwrap_or(false)
        {
            return true;
        }
        // Nothing at or after the probe in this file; the next file's
        // first entry, if any, is the answer.
        if index + 1 >= self.files.len() {
            return false;
        }
        let next = index + 1;
        self.load(next) && self.table_iter.as_mut().map(|t| t.first()).unwrap_or(false)
    }

    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        if self.files.is_empty() {
            self.table_iter = None;
            return false;
        }
        let index = self.file_for(ikey);
        if index >= self.files.len() {
            return self.last();
        }
        if !self.load(index) {
            return false;
        }
        if self
            .table_iter
            .as_mut()
            .map(|t| t.seek_lt(ikey))
            .unwrap_or(false)
        {
            return true;
        }
        if index == 0 {
            self.table_iter = None;
            return false;
        }
        let prev = index - 1;
        self.load(prev) && self.table_iter.as_mut().map(|t| t.last()).unwrap_or(false)
    }

    fn first(&mut self) -> bool {
        if self.files.is_empty() {
            return false;
        }
        self.load(0) && self.table_iter.as_mut().map(|t| t.first()).unwrap_or(false)
    }

    fn last(&mut self) -> bool {
        if self.files.is_empty() {
            return false;
        }
        let last = self.files.len() - 1;
        self.load(last) && self.table_iter.as_mut().map(|t| t.last()).unwrap_or(false)
    }

    fn next(&mut self) -> bool {
        let Some(table_iter) = self.table_iter.as_mut() else {
            return false;
        };
        if table_iter.next() {
            return true;
        }
        if self.index + 1 >= self.files.len() {
            return false;
        }
        let next = self.index + 1;
        self.load(next) && self.table_iter.as_mut().map(|t| t.first()).unwrap_or(false)
    }

    fn prev(&mut self) -> bool {
        let Some(table_iter) = self.table_iter.as_mut() else {
            return false;
        };
        if table_iter.prev() {
            return true;
        }
        if self.index == 0 {
            return false;
        }
        let prev = self.index - 1;
        self.load(prev) && self.table_iter.as_mut().map(|t| t.last()).unwrap_or(false)
    }

    fn valid(&self) -> bool {
        self.table_iter.as_ref().map(|t| t.valid()).unwrap_or(false)
    }

    fn key(&self) -> &InternalKey {
        self.table_iter
            .as_ref()
            .expect("iterator is not positioned")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.table_iter
            .as_ref()
            .expect("iterator is not positioned")
            .value()
    }

    fn error(&self) -> Option<&Error> {
        self.err
            .as_ref()
            .or_else(|| self.table_iter.as_ref().and_then(|t| t.error()))
    }
}

/// A snapshot iterator over the store. Holds its version and memtables
/// alive; releasing the iterator releases them and may reclaim files.
pub struct Iter {
    iter: DbIterator,
    db: Arc<DbInner>,
    version: Option<Arc<Version>>,
    _memtables: Vec<Arc<MemTable>>,
}

impl Iter {
    pub fn seek_ge(&mut self, user_key: &[u8]) -> bool {
        self.iter.seek_ge(user_key)
    }

    pub fn seek_lt(&mut self, user_key: &[u8]) -> bool {
        self.iter.seek_lt(user_key)
    }

    pub fn first(&mut self) -> bool {
        self.iter.first()
    }

    pub fn last(&mut self) -> bool {
        self.iter.last()
    }

    pub fn next(&mut self) -> bool {
        self.iter.next()
    }

    pub fn prev(&mut self) -> bool {
        self.iter.prev()
    }

    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.iter.key()
    }

    pub fn value(&self) -> &[u8] {
        self.iter.value()
    }

    pub fn err(&self) -> Option<&Error> {
        self.iter.err()
    }
}

impl Drop for Iter {
    fn drop(&mut self) {
        if let Some(version) = self.version.take() {
            if version.unref() {
                let _ = self.db.collect_garbage();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn open_small(dir: &TempDir) -> Db {
        // A small arena forces frequent rotations. Without compaction the
        // level-0 count only grows, so the write-stall thresholds are
        // lifted well out of the way.
        let opts = Options::new(dir.path())
            .memtable_size(16 * 1024)
            .block_size(512)
            .l0_slowdown_writes_threshold(500)
            .l0_stop_writes_threshold(1_000);
        Db::open(opts).expect("open failed")
    }

    fn collect_all(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = db.new_iter().expect("iterator");
        let mut out = Vec::new();
        iter.first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert!(iter.err().is_none(), "iterator error: {:?}", iter.err());
        out
    }

    #[test]
    fn test_set_get_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"a", b"1", true).expect("set failed");
            assert_eq!(db.get(b"a").expect("get failed"), b"1");
            db.close().expect("close failed");
        }
        {
            let db = open_small(&dir);
            assert_eq!(db.get(b"a").expect("get after reopen"), b"1");
        }
    }

    #[test]
    fn test_delete_hides_key_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"k", b"v1", false).unwrap();
            db.delete(b"k", true).unwrap();
            assert_eq!(db.get(b"k"), Err(Error::NotFound));
            db.close().unwrap();
        }
        {
            let db = open_small(&dir);
            assert_eq!(db.get(b"k"), Err(Error::NotFound));
        }
    }

    #[test]
    fn test_overwrite_returns_newest() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.set(b"k", b"old", false).unwrap();
        db.set(b"k", b"new", false).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"new");
    }

    #[test]
    fn test_iteration_across_rotations() {
        const N: usize = 10_000;
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            for i in 0..N {
                let key = format!("key_{i:05}");
                let value = format!("value_{i}");
                db.set(key.as_bytes(), value.as_bytes(), false).unwrap();
            }

            // The writes crossed several rotations and flushes.
            {
                let state = db.inner.mu.lock().unwrap();
                assert!(
                    state.versions.current().files[0].len() > 1
                        || state.mem.queue.len() > 1,
                    "expected rotations to have happened"
                );
            }

            let entries = collect_all(&db);
            assert_eq!(entries.len(), N);
            for (i, (key, value)) in entries.iter().enumerate() {
                assert_eq!(key, format!("key_{i:05}").as_bytes());
                assert_eq!(value, format!("value_{i}").as_bytes());
            }
            db.close().unwrap();
        }

        // Recovery sees the same view: flushed tables plus replayed WAL.
        let db = open_small(&dir);
        let entries = collect_all(&db);
        assert_eq!(entries.len(), N);
        assert_eq!(entries[0].0, b"key_00000");
        assert_eq!(entries[N - 1].0, format!("key_{:05}", N - 1).as_bytes());
    }

    #[test]
    fn test_snapshot_isolation_and_version_gc() {
        let dir = TempDir::new().unwrap();
        let db = std::sync::Arc::new(open_small(&dir));

        for i in 0..100 {
            let key = format!("key_{i:03}");
            db.set(key.as_bytes(), b"old", false).unwrap();
        }
        db.flush().expect("flush failed");

        // The reader pins the pre-write view.
        let mut iter = db.new_iter().expect("iterator");

        let writer = {
            let db = std::sync::Arc::clone(&db);
            std::thread::spawn(move || {
                for i in 0..1_000 {
                    let key = format!("key_{:03}", i % 200);
                    db.set(key.as_bytes(), b"new", false).unwrap();
                }
            })
        };
        writer.join().unwrap();
        db.flush().expect("flush failed");

        // The iterator still sees exactly the original 100 keys, all with
        // their original value.
        let mut count = 0;
        iter.first();
        while iter.valid() {
            assert_eq!(iter.value(), b"old");
            count += 1;
            iter.next();
        }
        assert_eq!(count, 100);
        drop(iter);

        // With the reader gone, superseded versions unlink.
        let state = db.inner.mu.lock().unwrap();
        assert_eq!(state.versions.version_count(), 1);
        drop(state);

        // And the current view reflects the writes.
        assert_eq!(db.get(b"key_000").unwrap(), b"new");
        assert_eq!(db.get(b"key_150").unwrap(), b"new");
    }

    #[test]
    fn test_orphan_table_removed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"a", b"1", true).unwrap();
            db.flush().unwrap();
            db.close().unwrap();
        }

        // A table written by a flush whose manifest edit never landed: on
        // recovery it is unreferenced and harmless.
        let orphan = make_filename(dir.path(), FileType::Table, 999);
        fs::write(&orphan, b"half-installed table").unwrap();

        {
            let db = open_small(&dir);
            assert!(!orphan.exists(), "orphan table must be collected");
            assert_eq!(db.get(b"a").unwrap(), b"1");
        }
    }

    #[test]
    fn test_batch_atomicity_across_torn_wal() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"before", b"1", true).unwrap();

            let mut batch = db.new_batch();
            batch.set(b"x", b"1");
            batch.set(b"y", b"2");
            batch.set(b"z", b"3");
            db.apply(&mut batch, true).unwrap();
            db.close().unwrap();
        }

        // Tear the tail of the WAL mid-record, as a crash mid-write would.
        let mut wal_path = None;
        let mut max_num = 0;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let entry = entry.unwrap();
            if let Some((FileType::Log, num)) =
                parse_filename(entry.file_name().to_str().unwrap())
            {
                if num >= max_num {
                    max_num = num;
                    wal_path = Some(entry.path());
                }
            }
        }
        let wal_path = wal_path.expect("store has a WAL");
        let len = fs::metadata(&wal_path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        file.set_len(len - 5).unwrap();

        // All three records vanish together; earlier writes survive.
        let db = open_small(&dir);
        assert_eq!(db.get(b"before").unwrap(), b"1");
        assert_eq!(db.get(b"x"), Err(Error::NotFound));
        assert_eq!(db.get(b"y"), Err(Error::NotFound));
        assert_eq!(db.get(b"z"), Err(Error::NotFound));
    }

    #[test]
    fn test_merge_end_to_end() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"k", b"a", false).unwrap();
            db.merge(b"k", b"b", false).unwrap();
            // Push the base and first operand into a table, then add one
            // more operand in the memtable.
            db.flush().unwrap();
            db.merge(b"k", b"c", false).unwrap();

            assert_eq!(db.get(b"k").unwrap(), b"abc");
            let entries = collect_all(&db);
            assert_eq!(entries, vec![(b"k".to_vec(), b"abc".to_vec())]);
            db.close().unwrap();
        }
        let db = open_small(&dir);
        assert_eq!(db.get(b"k").unwrap(), b"abc");
    }

    #[test]
    fn test_merge_without_base() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.merge(b"k", b"solo", false).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"solo");
    }

    #[test]
    fn test_indexed_batch_read_through() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.set(b"a", b"committed", false).unwrap();
        db.set(b"b", b"committed", false).unwrap();

        let mut batch = db.new_indexed_batch();
        batch.set(b"a", b"pending");
        batch.delete(b"b");
        batch.set(b"c", b"pending");

        // Reads through the batch overlay its records...
        assert_eq!(db.batch_get(&batch, b"a").unwrap(), b"pending");
        assert_eq!(db.batch_get(&batch, b"b"), Err(Error::NotFound));
        assert_eq!(db.batch_get(&batch, b"c").unwrap(), b"pending");

        let mut iter = db.new_batch_iter(&batch).expect("batch iterator");
        let mut seen = Vec::new();
        iter.first();
        while iter.valid() {
            seen.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"pending".to_vec()),
                (b"c".to_vec(), b"pending".to_vec()),
            ]
        );

        // ...while the store itself is untouched until commit.
        assert_eq!(db.get(b"a").unwrap(), b"committed");
        db.apply(&mut batch, true).unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"pending");
        assert_eq!(db.get(b"b"), Err(Error::NotFound));
    }

    #[test]
    fn test_flush_moves_data_to_tables() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        for i in 0..50 {
            db.set(format!("key_{i:02}").as_bytes(), b"v", false).unwrap();
        }
        db.flush().expect("flush failed");

        {
            let state = db.inner.mu.lock().unwrap();
            assert!(
                !state.versions.current().files[0].is_empty(),
                "flush must produce a level-0 table"
            );
            assert_eq!(state.mem.queue.len(), 1, "immutables must be drained");
        }
        for i in 0..50 {
            assert_eq!(db.get(format!("key_{i:02}").as_bytes()).unwrap(), b"v");
        }
    }

    #[test]
    fn test_second_open_fails_while_locked() {
        let dir = TempDir::new().unwrap();
        let _db = open_small(&dir);
        assert!(Db::open(Options::new(dir.path())).is_err());
    }

    #[test]
    fn test_apis_fail_after_close() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.set(b"a", b"1", false).unwrap();
        db.close().unwrap();
        db.close().expect("close is idempotent");

        assert_eq!(db.get(b"a"), Err(Error::Closed));
        assert_eq!(db.set(b"b", b"2", false), Err(Error::Closed));
        assert_eq!(db.flush(), Err(Error::Closed));
        assert!(matches!(db.new_iter(), Err(Error::Closed)));
    }

    #[test]
    fn test_compact_is_unimplemented() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        assert_eq!(db.compact(b"a", b"z"), Err(Error::Unimplemented));
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        let huge = vec![0u8; 64 * 1024];
        assert!(matches!(
            db.set(b"k", &huge, false),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn test_delete_range_is_logged_and_replayed() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_small(&dir);
            db.set(b"a", b"1", false).unwrap();
            db.delete_range(b"a", b"m", true).unwrap();
            // Point reads do not apply range tombstones yet; the record
            // must still survive the WAL round trip without corrupting
            // recovery.
            assert_eq!(db.get(b"a").unwrap(), b"1");
            db.close().unwrap();
        }
        let db = open_small(&dir);
        assert_eq!(db.get(b"a").unwrap(), b"1");
    }

    #[test]
    fn test_concurrent_writers_unique_seqnums() {
        let dir = TempDir::new().unwrap();
        let db = std::sync::Arc::new(open_small(&dir));

        let mut handles = Vec::new();
        for t in 0..4 {
            let db = std::sync::Arc::clone(&db);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    let key = format!("t{t}_k{i:03}");
                    db.set(key.as_bytes(), b"v", false).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Every committed record is present and visibility caught up with
        // allocation.
        assert_eq!(collect_all(&db).len(), 1_000);
        assert_eq!(
            db.inner.commit.visible_seq_num(),
            db.inner.commit.log_seq_num()
        );
    }

    #[test]
    fn test_wal_retired_after_flush() {
        let dir = TempDir::new().unwrap();
        let db = open_small(&dir);
        db.set(b"a", b"1", true).unwrap();

        let old_log = {
            let state = db.inner.mu.lock().unwrap();
            state.log_number
        };
        db.flush().unwrap();
        // The worker sweeps asynchronously; force a pass so the assertion
        // is deterministic.
        db.inner.collect_garbage().unwrap();

        let old_wal = make_filename(dir.path(), FileType::Log, old_log);
        assert!(!old_wal.exists(), "flushed WAL must be deleted");
        assert_eq!(db.get(b"a").unwrap(), b"1");
    }
}
