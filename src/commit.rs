//! Commit pipeline: sequence-number allocation and ordered visibility.
//!
//! Batches allocate a contiguous sequence range while the DB lock is held,
//! then insert into the memtable concurrently. Visibility is published in
//! allocation order: a batch's sequence numbers become visible only once
//! every batch with a lower base has finished its memtable insertion, so a
//! reader that captures the visible boundary never observes a half-applied
//! history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::Result;

struct Pending {
    base: u64,
    count: u64,
    applied: bool,
}

pub struct CommitPipeline {
    /// Next sequence number to allocate.
    log_seq_num: AtomicU64,
    /// Boundary of published visibility: all sequence numbers below it are
    /// visible to readers.
    visible_seq_num: AtomicU64,
    /// In-flight commits, ordered by base sequence number.
    pending: Mutex<VecDeque<Pending>>,
    published: Condvar,
}

impl CommitPipeline {
    /// `next_seq` is the first unused sequence number: zero for a fresh
    /// store, or the boundary recovered from the manifest and WAL replay.
    pub fn new(next_seq: u64) -> Self {
        Self {
            log_seq_num: AtomicU64::new(next_seq),
            visible_seq_num: AtomicU64::new(next_seq),
            pending: Mutex::new(VecDeque::new()),
            published: Condvar::new(),
        }
    }

    /// Allocates `count` sequence numbers and registers the commit for
    /// ordered publication. The registration queue stays ordered by base:
    /// allocation and registration happen under the pipeline lock.
    pub fn allocate(&self, count: u64) -> Result<u64> {
        let mut pending = self.pending.lock()?;
        let base = self.log_seq_num.fetch_add(count, Ordering::SeqCst);
        pending.push_back(Pending {
            base,
            count,
            applied: false,
        });
        Ok(base)
    }

    /// Marks the batch as applied and blocks until its range is visible.
    /// Visibility advances across the contiguous prefix of applied commits,
    /// so batches publish in base order regardless of apply order.
    pub fn publish(&self, base: u64, count: u64) -> Result<()> {
        let mut pending = self.pending.lock()?;
        if let Some(entry) = pending.iter_mut().find(|p| p.base == base) {
            entry.applied = true;
        }
        let mut boundary = None;
        while pending.front().map(|p| p.applied).unwrap_or(false) {
            let done = pending.pop_front().expect("checked front");
            boundary = Some(done.base + done.count);
        }
        if let Some(boundary) = boundary {
            self.visible_seq_num.store(boundary, Ordering::Release);
            self.published.notify_all();
        }

        let target = base + count;
        while self.visible_seq_num.load(Ordering::Acquire) < target {
            pending = self.published.wait(pending)?;
        }
        Ok(())
    }

    /// The current visibility boundary; sequence numbers below it are
    /// visible. Safe to read without the DB lock.
    pub fn visible_seq_num(&self) -> u64 {
        self.visible_seq_num.load(Ordering::Acquire)
    }

    /// The next unallocated sequence number.
    pub fn log_seq_num(&self) -> u64 {
        self.log_seq_num.load(Ordering::Acquire)
    }
}
