//! Prefix-compressed key/value blocks.
//!
//! A block is a sequence of entries followed by a restart table and a
//! trailer:
//!
//! ```text
//! entry:   uvarint shared | uvarint unshared | uvarint value-len
//!          | key suffix (unshared bytes) | value
//! ...
//! restart table: num_restarts x u32 LE entry offsets
//! trailer:       u32 LE num_restarts
//! ```
//!
//! Every `restart_interval`-th entry stores its key in full (`shared == 0`);
//! entries in between share a prefix with their predecessor. Keys are
//! encoded internal keys and must be added in non-decreasing internal-key
//! order. A block with zero entries still carries one restart at offset 0.
//!
//! The iterator is bidirectional. Forward iteration is sequential; backward
//! iteration re-scans from the preceding restart point, caching the interval
//! so a run of `prev` calls costs one scan per restart interval. Decoding
//! uses bounds-checked slice indexing throughout.

use std::cmp::Ordering;

use crate::coding::{get_uvarint, put_uvarint};
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::{internal_compare, shared_prefix_len, InternalKey};

/// Builds a single block.
pub struct BlockWriter {
    restart_interval: usize,
    n_entries: usize,
    buf: Vec<u8>,
    restarts: Vec<u32>,
    prev_key: Vec<u8>,
}

impl BlockWriter {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1, "restart interval must be positive");
        Self {
            restart_interval,
            n_entries: 0,
            buf: Vec::new(),
            restarts: Vec::new(),
            prev_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in non-decreasing internal-key
    /// order.
    pub fn add(&mut self, ikey: &InternalKey, value: &[u8]) {
        let cur = ikey.encode();
        let shared = if self.n_entries % self.restart_interval == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&cur, &self.prev_key)
        };

        put_uvarint(&mut self.buf, shared as u64);
        put_uvarint(&mut self.buf, (cur.len() - shared) as u64);
        put_uvarint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(&cur[shared..]);
        self.buf.extend_from_slice(value);

        self.prev_key = cur;
        self.n_entries += 1;
    }

    /// Appends the restart table and trailer, returning the finished block
    /// and resetting the writer.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.n_entries == 0 {
            // Every block carries at least one restart point.
            self.restarts.push(0);
        }
        for &offset in &self.restarts {
            self.buf.extend_from_slice(&offset.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        let block = std::mem::take(&mut self.buf);
        self.restarts.clear();
        self.prev_key.clear();
        self.n_entries = 0;
        block
    }

    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    pub fn entry_count(&self) -> usize {
        self.n_entries
    }

    /// Size of the block once finished.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + 4 * (self.restarts.len().max(1) + 1)
    }
}

/// A backward-iteration cache slot: one decoded entry of the current
/// restart interval.
#[derive(Clone)]
struct CachedEntry {
    offset: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
}

/// Bidirectional iterator over a block buffer.
pub struct BlockIter {
    cmp: fn(&[u8], &[u8]) -> Ordering,
    data: Vec<u8>,
    /// Offset of the restart table; entries live in `data[..restarts]`.
    restarts: usize,
    num_restarts: usize,
    /// When nonzero, every decoded key reports this sequence number
    /// (ingested tables carry one global seqnum for all entries).
    global_seq_num: u64,
    /// Current entry offset; negative or >= `restarts` means unpositioned.
    offset: i64,
    next_offset: usize,
    /// Raw encoded internal key of the current entry.
    raw_key: Vec<u8>,
    value_range: (usize, usize),
    ikey: InternalKey,
    cached: Vec<CachedEntry>,
    err: Option<Error>,
}

impl BlockIter {
    pub fn new(cmp: fn(&[u8], &[u8]) -> Ordering, data: Vec<u8>) -> Result<Self> {
        Self::with_global_seq_num(cmp, data, 0)
    }

    pub fn with_global_seq_num(
        cmp: fn(&[u8], &[u8]) -> Ordering,
        data: Vec<u8>,
        global_seq_num: u64,
    ) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too short for trailer".to_string()));
        }
        let num_restarts =
            u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
        if num_restarts == 0 {
            return Err(Error::Corruption("block has no restart points".to_string()));
        }
        let table_len = 4 * (1 + num_restarts);
        if data.len() < table_len {
            return Err(Error::Corruption(
                "block too short for restart table".to_string(),
            ));
        }
        Ok(Self {
            cmp,
            restarts: data.len() - table_len,
            data,
            num_restarts,
            global_seq_num,
            offset: -1,
            next_offset: 0,
            raw_key: Vec::new(),
            value_range: (0, 0),
            ikey: InternalKey::new(Vec::new(), 0, crate::key::InternalKeyKind::Set),
            cached: Vec::new(),
            err: None,
        })
    }

    fn restart_offset(&self, index: usize) -> usize {
        let pos = self.restarts + 4 * index;
        u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize
    }

    /// Decodes the full key stored at a restart point (restart entries share
    /// no prefix).
    fn restart_key(&self, index: usize) -> Result<InternalKey> {
        let mut pos = self.restart_offset(index);
        let entries = &self.data[..self.restarts];
        let (shared, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        if shared != 0 {
            return Err(Error::Corruption(
                "restart entry shares a prefix".to_string(),
            ));
        }
        let (unshared, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        let (_value_len, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        let end = pos
            .checked_add(unshared as usize)
            .filter(|&end| end <= entries.len())
            .ok_or_else(|| Error::Corruption("restart key out of bounds".to_string()))?;
        InternalKey::decode(&entries[pos..end])
    }

    /// Parses the entry at `self.offset`, rebuilding the raw key from the
    /// shared prefix and advancing `next_offset`.
    fn read_entry(&mut self) -> Result<()> {
        let mut pos = self.offset as usize;
        let entries = &self.data[..self.restarts];
        let (shared, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        let (unshared, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        let (value_len, n) = get_uvarint(&entries[pos..])?;
        pos += n;
        let (shared, unshared, value_len) =
            (shared as usize, unshared as usize, value_len as usize);

        let end = pos
            .checked_add(unshared)
            .and_then(|p| p.checked_add(value_len))
            .filter(|&end| end <= entries.len());
        let Some(end) = end else {
            return Err(Error::Corruption("block entry out of bounds".to_string()));
        };
        if shared > self.raw_key.len() {
            return Err(Error::Corruption("block entry out of bounds".to_string()));
        }

        self.raw_key.truncate(shared);
        self.raw_key.extend_from_slice(&entries[pos..pos + unshared]);
        pos += unshared;
        self.value_range = (pos, end);
        self.next_offset = end;
        Ok(())
    }

    fn decode_internal_key(&mut self) -> Result<()> {
        self.ikey = InternalKey::decode(&self.raw_key)?;
        if self.global_seq_num != 0 {
            self.ikey.set_seq_num(self.global_seq_num);
        }
        Ok(())
    }

    fn load_entry(&mut self) -> Result<()> {
        self.read_entry()?;
        self.decode_internal_key()
    }

    fn cache_entry(&mut self) {
        self.cached.push(CachedEntry {
            offset: self.offset as usize,
            key: self.raw_key.clone(),
            value_range: self.value_range,
        });
    }

    fn mark_invalid(&mut self, err: Error) -> bool {
        self.err = Some(err);
        self.offset = -1;
        self.next_offset = 0;
        false
    }

    /// Index of the first restart point whose key satisfies `pred`, or
    /// `num_restarts` if none. Restart keys are sorted, so this is a binary
    /// search.
    fn search_restart_keys(
        &self,
        mut pred: impl FnMut(&InternalKey) -> bool,
    ) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.num_restarts);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(&self.restart_key(mid)?) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Index of the first restart point at or past the given entry offset.
    fn search_restart_offsets(&self, target: usize) -> usize {
        let (mut lo, mut hi) = (0usize, self.num_restarts);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.restart_offset(mid) >= target {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }
}

impl InternalIterator for BlockIter {
    /// Positions at the first entry with key >= `ikey`.
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        if self.restarts == 0 {
            // No entries, only the mandatory restart point.
            self.offset = -1;
            self.next_offset = 0;
            return false;
        }
        let cmp = self.cmp;
        // Smallest restart whose key is strictly greater than the target;
        // the interval to scan starts at the restart before it.
        let index =
            match self.search_restart_keys(|rk| internal_compare(cmp, ikey, rk) == Ordering::Less)
            {
                Ok(index) => index,
                Err(e) => return self.mark_invalid(e),
            };

        self.offset = if index > 0 {
            self.restart_offset(index - 1) as i64
        } else {
            0
        };
        self.raw_key.clear();
        self.cached.clear();
        if !self.valid() {
            return false;
        }
        if let Err(e) = self.load_entry() {
            return self.mark_invalid(e);
        }

        loop {
            if internal_compare(cmp, &self.ikey, ikey) != Ordering::Less {
                return true;
            }
            if !self.next() {
                return false;
            }
        }
    }

    /// Positions at the last entry with key < `ikey`.
    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        if self.restarts == 0 {
            self.offset = -1;
            self.next_offset = 0;
            return false;
        }
        let cmp = self.cmp;
        // Smallest restart whose key is >= the target; scan starts one
        // restart earlier.
        let index = match self
            .search_restart_keys(|rk| internal_compare(cmp, ikey, rk) != Ordering::Greater)
        {
            Ok(index) => index,
            Err(e) => return self.mark_invalid(e),
        };

        if index == 0 {
            // Everything in the block is >= the target.
            self.offset = -1;
            self.next_offset = 0;
            return false;
        }
        self.offset = self.restart_offset(index - 1) as i64;
        self.raw_key.clear();
        self.cached.clear();
        self.next_offset = self.offset as usize;

        loop {
            self.offset = self.next_offset as i64;
            if let Err(e) = self.load_entry() {
                return self.mark_invalid(e);
            }
            if internal_compare(cmp, &self.ikey, ikey) != Ordering::Less {
                // Stepped onto the first entry >= target; back up one.
                return self.prev();
            }
            self.cache_entry();
            if self.next_offset >= self.restarts {
                // Target is past the last entry; it is the answer.
                return true;
            }
        }
    }

    fn first(&mut self) -> bool {
        self.offset = 0;
        self.next_offset = 0;
        self.raw_key.clear();
        self.cached.clear();
        if !self.valid() {
            return false;
        }
        if let Err(e) = self.load_entry() {
            return self.mark_invalid(e);
        }
        true
    }

    fn last(&mut self) -> bool {
        // Scan forward from the final restart point, caching the interval.
        self.offset = self.restart_offset(self.num_restarts - 1) as i64;
        self.raw_key.clear();
        self.cached.clear();
        if !self.valid() {
            return false;
        }
        if let Err(e) = self.read_entry() {
            return self.mark_invalid(e);
        }
        self.cache_entry();

        while self.next_offset < self.restarts {
            self.offset = self.next_offset as i64;
            if let Err(e) = self.read_entry() {
                return self.mark_invalid(e);
            }
            self.cache_entry();
        }
        if let Err(e) = self.decode_internal_key() {
            return self.mark_invalid(e);
        }
        true
    }

    fn next(&mut self) -> bool {
        self.offset = self.next_offset as i64;
        if !self.valid() {
            return false;
        }
        if let Err(e) = self.load_entry() {
            return self.mark_invalid(e);
        }
        true
    }

    fn prev(&mut self) -> bool {
        // Fast path: the previous entry is already cached from the forward
        // sweep that reached this one.
        if let Some(n) = self.cached.len().checked_sub(1) {
            if n > 0 && self.cached[n].offset == self.offset as usize {
                self.next_offset = self.offset as usize;
                let entry = self.cached[n - 1].clone();
                self.offset = entry.offset as i64;
                self.raw_key = entry.key;
                self.value_range = entry.value_range;
                self.cached.truncate(n);
                if let Err(e) = self.decode_internal_key() {
                    return self.mark_invalid(e);
                }
                return true;
            }
        }

        if self.offset <= 0 {
            self.offset = -1;
            self.next_offset = 0;
            return false;
        }

        // Re-scan from the restart point preceding the current entry,
        // caching every entry on the way.
        let target = self.offset as usize;
        let index = self.search_restart_offsets(target);
        self.offset = if index > 0 {
            self.restart_offset(index - 1) as i64
        } else {
            0
        };
        self.raw_key.clear();
        self.cached.clear();

        if let Err(e) = self.read_entry() {
            return self.mark_invalid(e);
        }
        self.cache_entry();
        while self.next_offset < target {
            self.offset = self.next_offset as i64;
            if let Err(e) = self.read_entry() {
                return self.mark_invalid(e);
            }
            self.cache_entry();
        }
        if let Err(e) = self.decode_internal_key() {
            return self.mark_invalid(e);
        }
        true
    }

    fn valid(&self) -> bool {
        self.offset >= 0 && (self.offset as usize) < self.restarts
    }

    fn key(&self) -> &InternalKey {
        &self.ikey
    }

    fn value(&self) -> &[u8] {
        &self.data[self.value_range.0..self.value_range.1]
    }

    fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::InternalIterator;
    use crate::key::InternalKeyKind;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn ikey(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key.to_vec(), seq, InternalKeyKind::Set)
    }

    fn sample_entries() -> Vec<(InternalKey, Vec<u8>)> {
        vec![
            (ikey(b"apple", 9), b"fruit".to_vec()),
            (ikey(b"apple", 3), b"old-fruit".to_vec()),
            (ikey(b"application", 5), b"software".to_vec()),
            (ikey(b"banana", 8), b"fruit".to_vec()),
            (ikey(b"band", 2), b"music".to_vec()),
            (ikey(b"bandana", 7), b"clothing".to_vec()),
        ]
    }

    fn build_block(entries: &[(InternalKey, Vec<u8>)], restart_interval: usize) -> Vec<u8> {
        let mut w = BlockWriter::new(restart_interval);
        for (k, v) in entries {
            w.add(k, v);
        }
        w.finish()
    }

    #[test]
    fn test_forward_roundtrip() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::new(bytewise, block).expect("iter init");

        assert!(iter.first());
        for (k, v) in &entries {
            assert_eq!(iter.key(), k);
            assert_eq!(iter.value(), &v[..]);
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_backward_roundtrip() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::new(bytewise, block).expect("iter init");

        assert!(iter.last());
        for (k, v) in entries.iter().rev() {
            assert_eq!(iter.key(), k);
            assert_eq!(iter.value(), &v[..]);
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_restart_interval_invariance() {
        let entries = sample_entries();
        for interval in [1, 2, 3, 16, 64] {
            let block = build_block(&entries, interval);
            let mut iter = BlockIter::new(bytewise, block).expect("iter init");
            let mut decoded = Vec::new();
            iter.first();
            while iter.valid() {
                decoded.push((iter.key().clone(), iter.value().to_vec()));
                iter.next();
            }
            assert_eq!(decoded, entries, "restart interval {interval}");
        }
    }

    #[test]
    fn test_seek_ge() {
        let entries = sample_entries();
        let mut iter = BlockIter::new(bytewise, build_block(&entries, 2)).expect("iter init");

        // Probes position at the smallest entry >= (user_key, MaxSeq, Max),
        // i.e. the newest version of the first user key >= the probe.
        assert!(iter.seek_ge(&InternalKey::search_key(b"apple")));
        assert_eq!(iter.key(), &ikey(b"apple", 9));

        assert!(iter.seek_ge(&InternalKey::search_key(b"appz")));
        assert_eq!(iter.key(), &ikey(b"banana", 8));

        assert!(iter.seek_ge(&InternalKey::search_key(b"")));
        assert_eq!(iter.key(), &ikey(b"apple", 9));

        assert!(!iter.seek_ge(&InternalKey::search_key(b"zzz")));
    }

    #[test]
    fn test_seek_ge_between_versions() {
        let entries = sample_entries();
        let mut iter = BlockIter::new(bytewise, build_block(&entries, 2)).expect("iter init");

        // A probe at seq 5 skips the newer apple@9 but finds apple@3.
        let probe = InternalKey::new(b"apple".to_vec(), 5, InternalKeyKind::Max);
        assert!(iter.seek_ge(&probe));
        assert_eq!(iter.key(), &ikey(b"apple", 3));
    }

    #[test]
    fn test_seek_lt() {
        let entries = sample_entries();
        let mut iter = BlockIter::new(bytewise, build_block(&entries, 2)).expect("iter init");

        assert!(iter.seek_lt(&InternalKey::search_key(b"band")));
        assert_eq!(iter.key(), &ikey(b"banana", 8));

        // Probe past the end lands on the final entry.
        assert!(iter.seek_lt(&InternalKey::search_key(b"zzz")));
        assert_eq!(iter.key(), &ikey(b"bandana", 7));

        // Nothing sorts before the first key.
        assert!(!iter.seek_lt(&InternalKey::search_key(b"apple")));
    }

    #[test]
    fn test_prev_across_restarts() {
        // One entry per restart forces the slow path on every step back.
        let entries = sample_entries();
        let mut iter = BlockIter::new(bytewise, build_block(&entries, 1)).expect("iter init");

        assert!(iter.last());
        let mut reversed = vec![iter.key().clone()];
        while iter.prev() {
            reversed.push(iter.key().clone());
        }
        let expected: Vec<_> = entries.iter().rev().map(|(k, _)| k.clone()).collect();
        assert_eq!(reversed, expected);
    }

    #[test]
    fn test_mixed_direction() {
        let entries = sample_entries();
        let mut iter = BlockIter::new(bytewise, build_block(&entries, 2)).expect("iter init");

        assert!(iter.seek_ge(&InternalKey::search_key(b"band")));
        assert_eq!(iter.key(), &ikey(b"band", 2));
        assert!(iter.prev());
        assert_eq!(iter.key(), &ikey(b"banana", 8));
        assert!(iter.next());
        assert_eq!(iter.key(), &ikey(b"band", 2));
        assert!(iter.next());
        assert_eq!(iter.key(), &ikey(b"bandana", 7));
        assert!(!iter.next());
    }

    #[test]
    fn test_global_seq_num_override() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = BlockIter::with_global_seq_num(bytewise, block, 1234).expect("iter init");

        iter.first();
        let mut n = 0;
        while iter.valid() {
            assert_eq!(iter.key().seq_num(), 1234);
            n += 1;
            iter.next();
        }
        assert_eq!(n, entries.len());
    }

    #[test]
    fn test_empty_block() {
        let mut w = BlockWriter::new(16);
        let block = w.finish();
        // One restart at offset zero plus the trailer.
        assert_eq!(block.len(), 8);
        let mut iter = BlockIter::new(bytewise, block).expect("iter init");
        assert!(!iter.first());
        assert!(!iter.seek_ge(&InternalKey::search_key(b"x")));
    }

    #[test]
    fn test_corrupt_trailer() {
        // A zeroed restart count is a corruption, not a silent empty block.
        let data = vec![0u8; 8];
        assert!(matches!(
            BlockIter::new(bytewise, data),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            BlockIter::new(bytewise, vec![1, 2]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_writer_reset_after_finish() {
        let mut w = BlockWriter::new(4);
        w.add(&ikey(b"a", 1), b"1");
        let first = w.finish();
        assert!(w.is_empty());
        w.add(&ikey(b"a", 1), b"1");
        let second = w.finish();
        assert_eq!(first, second);
    }
}
