//! Iterators over internal keys, and the user-facing iterator that
//! collapses MVCC history into the visible view.

use std::cmp::Ordering;

use crate::config::MergeFn;
use crate::error::Error;
use crate::key::{internal_compare, is_visible, InternalKey, InternalKeyKind};

/// A seekable, bidirectional cursor over (internal key, value) entries in
/// internal-key order. Positioning methods return whether the iterator
/// landed on an entry; `key`/`value` may only be called while positioned.
pub trait InternalIterator {
    /// Positions at the first entry >= `ikey`.
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool;
    /// Positions at the last entry < `ikey`.
    fn seek_lt(&mut self, ikey: &InternalKey) -> bool;
    fn first(&mut self) -> bool;
    fn last(&mut self) -> bool;
    fn next(&mut self) -> bool;
    fn prev(&mut self) -> bool;
    fn valid(&self) -> bool;
    fn key(&self) -> &InternalKey;
    fn value(&self) -> &[u8];
    /// The error that invalidated this iterator, if any.
    fn error(&self) -> Option<&Error> {
        None
    }
}

/// An already-materialized run of entries, used for indexed-batch overlays.
pub struct VecIter {
    cmp: fn(&[u8], &[u8]) -> Ordering,
    entries: Vec<(InternalKey, Vec<u8>)>,
    /// Current index; `entries.len()` means unpositioned.
    pos: usize,
}

impl VecIter {
    /// `entries` must be sorted by internal key under `cmp`.
    pub fn new(cmp: fn(&[u8], &[u8]) -> Ordering, entries: Vec<(InternalKey, Vec<u8>)>) -> Self {
        let pos = entries.len();
        Self { cmp, entries, pos }
    }

    fn lower_bound(&self, ikey: &InternalKey) -> usize {
        self.entries
            .partition_point(|(k, _)| internal_compare(self.cmp, k, ikey) == Ordering::Less)
    }
}

impl InternalIterator for VecIter {
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        self.pos = self.lower_bound(ikey);
        self.valid()
    }

    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        let lb = self.lower_bound(ikey);
        self.pos = if lb == 0 { self.entries.len() } else { lb - 1 };
        self.valid()
    }

    fn first(&mut self) -> bool {
        self.pos = 0;
        self.valid()
    }

    fn last(&mut self) -> bool {
        self.pos = if self.entries.is_empty() {
            0
        } else {
            self.entries.len() - 1
        };
        self.valid()
    }

    fn next(&mut self) -> bool {
        if self.pos >= self.entries.len() {
            return false;
        }
        self.pos += 1;
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if self.pos >= self.entries.len() {
            return false;
        }
        if self.pos == 0 {
            self.pos = self.entries.len();
            return false;
        }
        self.pos -= 1;
        true
    }

    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> &InternalKey {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

/// Merges child iterators into a single internal-key-ordered stream.
/// Children must be supplied newest source first: when two sources carry
/// the same internal key (possible only for batch-overlay entries), the
/// lower index wins.
pub struct MergingIter {
    cmp: fn(&[u8], &[u8]) -> Ordering,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIter {
    pub fn new(cmp: fn(&[u8], &[u8]) -> Ordering, children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) -> bool {
        let mut best: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b)
                    if internal_compare(self.cmp, child.key(), self.children[b].key())
                        == Ordering::Less =>
                {
                    Some(i)
                }
                Some(b) => Some(b),
            };
        }
        self.current = best;
        best.is_some()
    }

    fn find_largest(&mut self) -> bool {
        let mut best: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b)
                    if internal_compare(self.cmp, child.key(), self.children[b].key())
                        == Ordering::Greater =>
                {
                    Some(i)
                }
                Some(b) => Some(b),
            };
        }
        self.current = best;
        best.is_some()
    }

    /// Re-aims every child for forward iteration from the current entry.
    fn switch_forward(&mut self) {
        let key = self.key().clone();
        for child in &mut self.children {
            if child.seek_ge(&key) && internal_compare(self.cmp, child.key(), &key) == Ordering::Equal
            {
                child.next();
            }
        }
        self.direction = Direction::Forward;
    }

    fn switch_backward(&mut self) {
        let key = self.key().clone();
        for child in &mut self.children {
            child.seek_lt(&key);
        }
        self.direction = Direction::Backward;
    }
}

impl InternalIterator for MergingIter {
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        for child in &mut self.children {
            child.seek_ge(ikey);
        }
        self.direction = Direction::Forward;
        self.find_smallest()
    }

    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        for child in &mut self.children {
            child.seek_lt(ikey);
        }
        self.direction = Direction::Backward;
        self.find_largest()
    }

    fn first(&mut self) -> bool {
        for child in &mut self.children {
            child.first();
        }
        self.direction = Direction::Forward;
        self.find_smallest()
    }

    fn last(&mut self) -> bool {
        for child in &mut self.children {
            child.last();
        }
        self.direction = Direction::Backward;
        self.find_largest()
    }

    fn next(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        if self.direction == Direction::Backward {
            self.switch_forward();
        } else {
            self.children[current].next();
        }
        self.find_smallest()
    }

    fn prev(&mut self) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        if self.direction == Direction::Forward {
            self.switch_backward();
        } else {
            self.children[current].prev();
        }
        self.find_largest()
    }

    fn valid(&self) -> bool {
        self.current.map(|i| self.children[i].valid()).unwrap_or(false)
    }

    fn key(&self) -> &InternalKey {
        self.children[self.current.expect("iterator is not positioned")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator is not positioned")].value()
    }

    fn error(&self) -> Option<&Error> {
        self.children.iter().find_map(|c| c.error())
    }
}

/// What a user-key group resolved to while scanning backward.
struct PrevGroup {
    user_key: Vec<u8>,
    /// Newest visible Set/Delete seen so far; `None` until one appears.
    base: Option<Option<Vec<u8>>>,
    /// Visible merge operands newer than `base`, oldest first.
    operands: Vec<Vec<u8>>,
}

/// The user-facing iterator: filters records above the snapshot, collapses
/// per-key history to the newest visible record, hides tombstones, and
/// applies the merge operator.
pub struct DbIterator {
    iter: MergingIter,
    cmp: fn(&[u8], &[u8]) -> Ordering,
    merger: MergeFn,
    snapshot: u64,
    direction: Direction,
    valid: bool,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    /// First error observed while resolving entries, surfaced via `err`.
    err: Option<Error>,
}

impl DbIterator {
    pub fn new(iter: MergingIter, merger: MergeFn, snapshot: u64) -> Self {
        let cmp = iter.cmp;
        Self {
            iter,
            cmp,
            merger,
            snapshot,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            err: None,
        }
    }

    /// Positions at the first visible entry with user key >= `user_key`.
    pub fn seek_ge(&mut self, user_key: &[u8]) -> bool {
        self.iter.seek_ge(&InternalKey::search_key(user_key));
        self.direction = Direction::Forward;
        self.find_next_entry()
    }

    /// Positions at the last visible entry with user key < `user_key`.
    pub fn seek_lt(&mut self, user_key: &[u8]) -> bool {
        self.iter.seek_lt(&InternalKey::search_key(user_key));
        self.direction = Direction::Backward;
        self.find_prev_entry()
    }

    pub fn first(&mut self) -> bool {
        self.iter.first();
        self.direction = Direction::Forward;
        self.find_next_entry()
    }

    pub fn last(&mut self) -> bool {
        self.iter.last();
        self.direction = Direction::Backward;
        self.find_prev_entry()
    }

    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.direction == Direction::Backward {
            // Jump past every version of the current user key. No live
            // entry carries a zero trailer, so this probe sits between
            // user keys.
            let probe = InternalKey {
                user_key: self.saved_key.clone(),
                trailer: 0,
            };
            self.iter.seek_ge(&probe);
            self.direction = Direction::Forward;
        } else {
            // Drain the remaining (older) versions of the yielded key.
            while self.iter.valid()
                && (self.cmp)(&self.iter.key().user_key, &self.saved_key) == Ordering::Equal
            {
                self.iter.next();
            }
        }
        self.find_next_entry()
    }

    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        if self.direction == Direction::Forward {
            self.iter.seek_lt(&InternalKey::search_key(&self.saved_key));
            self.direction = Direction::Backward;
        }
        self.find_prev_entry()
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        &self.saved_key
    }

    pub fn value(&self) -> &[u8] {
        &self.saved_value
    }

    /// The first error encountered while resolving entries, including any
    /// that invalidated an underlying source.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref().or_else(|| self.iter.error())
    }

    fn fold_operands(&self, key: &[u8], base: Option<Vec<u8>>, operands: &[Vec<u8>]) -> Vec<u8> {
        let mut acc = base;
        for op in operands {
            acc = Some((self.merger)(key, acc.as_deref(), op));
        }
        acc.unwrap_or_default()
    }

    /// Forward resolution: the first visible record of a user key decides.
    fn find_next_entry(&mut self) -> bool {
        self.valid = false;
        while self.iter.valid() {
            let ikey = self.iter.key().clone();
            if !is_visible(ikey.seq_num(), self.snapshot) {
                self.iter.next();
                continue;
            }
            let kind = match ikey.kind() {
                Ok(kind) => kind,
                Err(e) => {
                    self.err.get_or_insert(e);
                    self.iter.next();
                    continue;
                }
            };
            match kind {
                InternalKeyKind::Delete => {
                    self.skip_forward_past(&ikey.user_key);
                }
                InternalKeyKind::Set => {
                    self.saved_key = ikey.user_key.clone();
                    self.saved_value = self.iter.value().to_vec();
                    self.valid = true;
                    return true;
                }
                InternalKeyKind::Merge => {
                    // Newest-first operands; fold happens against whatever
                    // older record terminates the run.
                    let mut newest_first = vec![self.iter.value().to_vec()];
                    let user_key = ikey.user_key.clone();
                    let mut base: Option<Vec<u8>> = None;
                    self.iter.next();
                    while self.iter.valid() {
                        let k = self.iter.key().clone();
                        if (self.cmp)(&k.user_key, &user_key) != Ordering::Equal {
                            break;
                        }
                        if !is_visible(k.seq_num(), self.snapshot) {
                            self.iter.next();
                            continue;
                        }
                        match k.kind() {
                            Ok(InternalKeyKind::Merge) => {
                                newest_first.push(self.iter.value().to_vec());
                                self.iter.next();
                            }
                            Ok(InternalKeyKind::Set) => {
                                base = Some(self.iter.value().to_vec());
                                self.skip_forward_past(&user_key);
                                break;
                            }
                            Ok(InternalKeyKind::Delete) => {
                                self.skip_forward_past(&user_key);
                                break;
                            }
                            Ok(_) => self.skip_one(),
                            Err(e) => {
                                self.err.get_or_insert(e);
                                self.iter.next();
                            }
                        }
                    }
                    let oldest_first: Vec<_> = newest_first.into_iter().rev().collect();
                    self.saved_value = self.fold_operands(&user_key, base, &oldest_first);
                    self.saved_key = user_key;
                    self.valid = true;
                    return true;
                }
                // Range tombstones are not yet applied on reads; LogData
                // never reaches storage.
                InternalKeyKind::RangeDelete | InternalKeyKind::LogData | InternalKeyKind::Max => {
                    self.iter.next();
                }
            }
        }
        false
    }

    fn skip_one(&mut self) {
        self.iter.next();
    }

    fn skip_forward_past(&mut self, user_key: &[u8]) {
        while self.iter.valid()
            && (self.cmp)(&self.iter.key().user_key, user_key) == Ordering::Equal
        {
            self.iter.next();
        }
    }

    /// Backward resolution: scan a whole user-key group (visited oldest
    /// first), resolve it, and emit if it produced a live value.
    fn find_prev_entry(&mut self) -> bool {
        self.valid = false;
        let mut group: Option<PrevGroup> = None;

        while self.iter.valid() {
            let ikey = self.iter.key().clone();

            if let Some(g) = &group {
                if (self.cmp)(&ikey.user_key, &g.user_key) != Ordering::Equal {
                    // Finished the previous group; emit or move on. The
                    // iterator stays put so the new group is processed next.
                    let g = group.take().unwrap();
                    if self.emit_group(g) {
                        return true;
                    }
                    continue;
                }
            }

            if group.is_none() {
                group = Some(PrevGroup {
                    user_key: ikey.user_key.clone(),
                    base: None,
                    operands: Vec::new(),
                });
            }

            if is_visible(ikey.seq_num(), self.snapshot) {
                let g = group.as_mut().unwrap();
                match ikey.kind() {
                    // Each record seen is newer than everything before it.
                    Ok(InternalKeyKind::Set) => {
                        g.base = Some(Some(self.iter.value().to_vec()));
                        g.operands.clear();
                    }
                    Ok(InternalKeyKind::Delete) => {
                        g.base = Some(None);
                        g.operands.clear();
                    }
                    Ok(InternalKeyKind::Merge) => {
                        g.operands.push(self.iter.value().to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.err.get_or_insert(e);
                    }
                }
            }
            self.iter.prev();
        }

        if let Some(g) = group {
            return self.emit_group(g);
        }
        false
    }

    /// Resolves a finished group; true if it produced a visible entry.
    fn emit_group(&mut self, group: PrevGroup) -> bool {
        let value = match group.base {
            Some(Some(v)) => Some(self.fold_operands(&group.user_key, Some(v), &group.operands)),
            // Deleted, unless newer merge operands revive the key.
            Some(None) if group.operands.is_empty() => None,
            Some(None) => Some(self.fold_operands(&group.user_key, None, &group.operands)),
            None if group.operands.is_empty() => None,
            None => Some(self.fold_operands(&group.user_key, None, &group.operands)),
        };
        match value {
            Some(v) => {
                self.saved_key = group.user_key;
                self.saved_value = v;
                self.valid = true;
                true
            }
            None => false,
        }
    }
}
