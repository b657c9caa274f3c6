//! Write batches.
//!
//! A batch is a contiguous byte buffer, written to the WAL verbatim:
//!
//! ```text
//! +--------------------+---------------+----------------------------+
//! | base seqnum (u64)  | count (u32)   | records...                 |
//! +--------------------+---------------+----------------------------+
//! ```
//!
//! Each record is `kind (u8) | uvarint key-len | key [| uvarint value-len |
//! value]`. The base sequence number is stamped at commit time; the i-th
//! record takes `base + i`, so a batch becomes visible atomically or not at
//! all.
//!
//! An *indexed* batch additionally maintains a skiplist over its own records
//! so reads through the batch can overlay uncommitted writes on a DB
//! snapshot. Overlay records carry the batch sequence bit instead of a real
//! sequence number.

use std::cmp::Ordering;

use crossbeam_skiplist::SkipMap;

use crate::coding::{get_uvarint, put_uvarint};
use crate::config::Comparator;
use crate::error::{Error, Result};
use crate::key::{InternalKey, InternalKeyKind, SEQ_NUM_BATCH_BIT};

pub const BATCH_HEADER_LEN: usize = 12;

/// A decoded batch record. The value is `None` for kinds that carry none.
#[derive(Debug, PartialEq)]
pub struct BatchRecord<'a> {
    pub kind: InternalKeyKind,
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
}

fn kind_has_value(kind: InternalKeyKind) -> bool {
    matches!(
        kind,
        InternalKeyKind::Set | InternalKeyKind::Merge | InternalKeyKind::RangeDelete
    )
}

/// Decodes the record starting at `offset`, returning it and the offset of
/// the next record.
fn decode_record_at(data: &[u8], offset: usize) -> Result<(BatchRecord<'_>, usize)> {
    let rest = data
        .get(offset..)
        .ok_or_else(|| Error::Corruption("batch record offset out of range".to_string()))?;
    if rest.is_empty() {
        return Err(Error::Corruption("empty batch record".to_string()));
    }
    let kind = InternalKeyKind::from_u8(rest[0])?;
    let mut pos = 1;

    let (key_len, n) = get_uvarint(&rest[pos..])?;
    pos += n;
    let key_end = pos
        .checked_add(key_len as usize)
        .filter(|&end| end <= rest.len())
        .ok_or_else(|| Error::Corruption("batch key truncated".to_string()))?;
    let key = &rest[pos..key_end];
    pos = key_end;

    let value = if kind_has_value(kind) {
        let (value_len, n) = get_uvarint(&rest[pos..])?;
        pos += n;
        let value_end = pos
            .checked_add(value_len as usize)
            .filter(|&end| end <= rest.len())
            .ok_or_else(|| Error::Corruption("batch value truncated".to_string()))?;
        let value = &rest[pos..value_end];
        pos = value_end;
        Some(value)
    } else {
        None
    };

    Ok((BatchRecord { kind, key, value }, offset + pos))
}

/// Index key for an indexed batch: user key ascending under the batch's
/// comparator, then record offset descending so the newest write to a key is
/// visited first.
struct OverlayKey {
    user_key: Vec<u8>,
    offset: u32,
    comparator: Comparator,
}

impl PartialEq for OverlayKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for OverlayKey {}
impl PartialOrd for OverlayKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OverlayKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator.compare)(&self.user_key, &other.user_key)
            .then_with(|| other.offset.cmp(&self.offset))
    }
}

/// A set of updates applied to the store atomically.
pub struct Batch {
    data: Vec<u8>,
    index: Option<SkipMap<OverlayKey, ()>>,
    comparator: Comparator,
}

impl Batch {
    pub fn new(comparator: Comparator) -> Self {
        Self {
            data: vec![0; BATCH_HEADER_LEN],
            index: None,
            comparator,
        }
    }

    /// A batch that also indexes its own records for read-through.
    pub fn new_indexed(comparator: Comparator) -> Self {
        Self {
            data: vec![0; BATCH_HEADER_LEN],
            index: Some(SkipMap::new()),
            comparator,
        }
    }

    /// Reconstructs a batch from its serialized form (WAL replay).
    pub fn from_data(data: Vec<u8>) -> Result<Self> {
        if data.len() < BATCH_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "batch shorter than header: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            data,
            index: None,
            comparator: crate::config::BYTEWISE_COMPARATOR,
        })
    }

    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    fn append_record(&mut self, kind: InternalKeyKind, key: &[u8], value: Option<&[u8]>) {
        let offset = self.data.len() as u32;
        self.data.push(kind as u8);
        put_uvarint(&mut self.data, key.len() as u64);
        self.data.extend_from_slice(key);
        if let Some(value) = value {
            put_uvarint(&mut self.data, value.len() as u64);
            self.data.extend_from_slice(value);
        }
        let count = self.count() + 1;
        self.data[8..12].copy_from_slice(&count.to_le_bytes());

        // LogData records are annotations and are not readable through the
        // batch.
        if kind != InternalKeyKind::LogData {
            if let Some(index) = &self.index {
                index.insert(
                    OverlayKey {
                        user_key: key.to_vec(),
                        offset,
                        comparator: self.comparator,
                    },
                    (),
                );
            }
        }
    }

    /// Sets the value for a key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.append_record(InternalKeyKind::Set, key, Some(value));
    }

    /// Writes a tombstone for a key. Deletes are blind: they succeed whether
    /// or not the key exists.
    pub fn delete(&mut self, key: &[u8]) {
        self.append_record(InternalKeyKind::Delete, key, None);
    }

    /// Writes a range tombstone covering `[start, end)`.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.append_record(InternalKeyKind::RangeDelete, start, Some(end));
    }

    /// Adds a merge operand for a key.
    pub fn merge(&mut self, key: &[u8], value: &[u8]) {
        self.append_record(InternalKeyKind::Merge, key, Some(value));
    }

    /// Adds opaque data that rides through the WAL but is never stored.
    pub fn log_data(&mut self, data: &[u8]) {
        self.append_record(InternalKeyKind::LogData, data, None);
    }

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.data[8..12].try_into().unwrap())
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == BATCH_HEADER_LEN
    }

    pub fn seq_num(&self) -> u64 {
        u64::from_le_bytes(self.data[0..8].try_into().unwrap())
    }

    /// Stamps the base sequence number. Called once, at commit.
    pub fn set_seq_num(&mut self, seq: u64) {
        self.data[0..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// The serialized bytes appended to the WAL.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            data: &self.data,
            offset: BATCH_HEADER_LEN,
        }
    }

    /// Reads a key through an indexed batch. Returns the newest record for
    /// the key, or `None` when the batch has no record for it (the caller
    /// falls through to the DB snapshot).
    pub fn get(&self, key: &[u8]) -> Option<BatchRecord<'_>> {
        let index = self.index.as_ref()?;
        let probe = OverlayKey {
            user_key: key.to_vec(),
            offset: u32::MAX,
            comparator: self.comparator,
        };
        let entry = index.lower_bound(std::ops::Bound::Included(&probe))?;
        if (self.comparator.compare)(&entry.key().user_key, key) != Ordering::Equal {
            return None;
        }
        let (record, _) = decode_record_at(&self.data, entry.key().offset as usize).ok()?;
        Some(record)
    }

    /// Iterates the indexed records as internal keys, newest-first per user
    /// key, with the batch sequence bit set. Used to overlay the batch on a
    /// DB snapshot.
    pub fn overlay(&self) -> Vec<(InternalKey, Vec<u8>)> {
        let Some(index) = self.index.as_ref() else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(index.len());
        for entry in index.iter() {
            let offset = entry.key().offset;
            if let Ok((record, _)) = decode_record_at(&self.data, offset as usize) {
                let ikey = InternalKey::new(
                    record.key.to_vec(),
                    SEQ_NUM_BATCH_BIT | u64::from(offset),
                    record.kind,
                );
                out.push((ikey, record.value.unwrap_or_default().to_vec()));
            }
        }
        out
    }
}

/// Walks a batch's records in insertion order.
pub struct BatchIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        match decode_record_at(self.data, self.offset) {
            Ok((record, next)) => {
                self.offset = next;
                Some(Ok(record))
            }
            Err(e) => {
                self.offset = self.data.len();
                Some(Err(e))
            }
        }
    }
}
