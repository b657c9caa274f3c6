//! Version edits: deltas applied to the file structure, persisted as
//! manifest records.
//!
//! An edit is encoded as a sequence of tagged fields:
//!
//! ```text
//! tag (u8) | payload
//!
//! 1 comparator-name    uvarint len | bytes
//! 2 log-number         uvarint
//! 3 prev-log-number    uvarint
//! 4 next-file-number   uvarint
//! 5 last-sequence      uvarint
//! 6 deleted-file       uvarint level | uvarint file-num
//! 7 new-file           uvarint level | uvarint file-num | uvarint size
//!                      | uvarint len | smallest | uvarint len | largest
//! ```
//!
//! Replaying a manifest accumulates edits into a [`BulkVersionEdit`], which
//! is then applied against a base version to produce the next one.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::coding::{get_uvarint, put_uvarint};
use crate::error::{Error, Result};
use crate::key::{internal_compare, InternalKey};
use crate::version::{FileMetadata, Version};

const TAG_COMPARATOR_NAME: u8 = 1;
const TAG_LOG_NUMBER: u8 = 2;
const TAG_PREV_LOG_NUMBER: u8 = 3;
const TAG_NEXT_FILE_NUMBER: u8 = 4;
const TAG_LAST_SEQUENCE: u8 = 5;
const TAG_DELETED_FILE: u8 = 6;
const TAG_NEW_FILE: u8 = 7;

#[derive(Debug, Default, Clone)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub deleted_files: BTreeSet<(usize, u64)>,
    pub new_files: Vec<(usize, Arc<FileMetadata>)>,
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u64(&mut self) -> Result<u64> {
        let (v, n) = get_uvarint(&self.data[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Corruption("version edit field truncated".to_string()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            buf.push(TAG_COMPARATOR_NAME);
            put_bytes(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            buf.push(TAG_LOG_NUMBER);
            put_uvarint(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            buf.push(TAG_PREV_LOG_NUMBER);
            put_uvarint(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            buf.push(TAG_NEXT_FILE_NUMBER);
            put_uvarint(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            buf.push(TAG_LAST_SEQUENCE);
            put_uvarint(&mut buf, n);
        }
        for &(level, file_num) in &self.deleted_files {
            buf.push(TAG_DELETED_FILE);
            put_uvarint(&mut buf, level as u64);
            put_uvarint(&mut buf, file_num);
        }
        for (level, meta) in &self.new_files {
            buf.push(TAG_NEW_FILE);
            put_uvarint(&mut buf, *level as u64);
            put_uvarint(&mut buf, meta.file_num);
            put_uvarint(&mut buf, meta.size);
            put_bytes(&mut buf, &meta.smallest.encode());
            put_bytes(&mut buf, &meta.largest.encode());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();
        let mut cursor = Cursor { data, pos: 0 };
        while cursor.pos < data.len() {
            let tag = data[cursor.pos];
            cursor.pos += 1;
            match tag {
                TAG_COMPARATOR_NAME => {
                    let name = cursor.bytes()?;
                    let name = std::str::from_utf8(name).map_err(|_| {
                        Error::Corruption("comparator name is not utf-8".to_string())
                    })?;
                    edit.comparator_name = Some(name.to_string());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(cursor.u64()?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(cursor.u64()?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(cursor.u64()?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(cursor.u64()?),
                TAG_DELETED_FILE => {
                    let level = cursor.u64()? as usize;
                    let file_num = cursor.u64()?;
                    edit.deleted_files.insert((level, file_num));
                }
                TAG_NEW_FILE => {
                    let level = cursor.u64()? as usize;
                    let file_num = cursor.u64()?;
                    let size = cursor.u64()?;
                    let smallest = InternalKey::decode(cursor.bytes()?)?;
                    let largest = InternalKey::decode(cursor.bytes()?)?;
                    edit.new_files.push((
                        level,
                        Arc::new(FileMetadata {
                            file_num,
                            size,
                            smallest,
                            largest,
                        }),
                    ));
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag {tag}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

/// Accumulates a run of edits so they can be applied in one pass.
#[derive(Default)]
pub struct BulkVersionEdit {
    deleted: HashSet<(usize, u64)>,
    added: Vec<(usize, Arc<FileMetadata>)>,
}

impl BulkVersionEdit {
    pub fn accumulate(&mut self, edit: &VersionEdit) {
        for &(level, file_num) in &edit.deleted_files {
            // A file added and deleted within the accumulated run vanishes.
            let before = self.added.len();
            self.added
                .retain(|(l, m)| !(*l == level && m.file_num == file_num));
            if self.added.len() == before {
                self.deleted.insert((level, file_num));
            }
        }
        for (level, meta) in &edit.new_files {
            self.deleted.remove(&(*level, meta.file_num));
            self.added.push((*level, Arc::clone(meta)));
        }
    }

    /// Produces the version resulting from applying the accumulated edits
    /// to `base` (or to an empty version). Fails if the result violates the
    /// level invariants.
    pub fn apply(
        &self,
        base: Option<&Version>,
        num_levels: usize,
        cmp: fn(&[u8], &[u8]) -> std::cmp::Ordering,
    ) -> Result<Version> {
        let mut version = Version::new(num_levels);

        if let Some(base) = base {
            for (level, files) in base.files.iter().enumerate() {
                for file in files {
                    if !self.deleted.contains(&(level, file.file_num)) {
                        version.files[level].push(Arc::clone(file));
                    }
                }
            }
        }
        for (level, meta) in &self.added {
            if *level >= num_levels {
                return Err(Error::Corruption(format!(
                    "version edit names level {level}, store has {num_levels}"
                )));
            }
            version.files[*level].push(Arc::clone(meta));
        }

        version.files[0].sort_by(|a, b| b.file_num.cmp(&a.file_num));
        for files in version.files.iter_mut().skip(1) {
            files.sort_by(|a, b| internal_compare(cmp, &a.smallest, &b.smallest));
        }

        version.check_ordering(cmp)?;
        Ok(version)
    }
}
