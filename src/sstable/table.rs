//! Sorted table files.
//!
//! ```text
//! +-------------------+
//! | data block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | data block N      |
//! +-------------------+
//! | index block       |
//! +-------------------+
//! | footer (24 bytes) |
//! +-------------------+
//! ```
//!
//! Data and index blocks share the codec in [`super::block`]. Each index
//! entry maps the largest internal key of a data block to that block's
//! handle (offset and length as uvarints), so the index key is >= every key
//! in the block. The footer is fixed-size: index offset (u64 LE), index
//! length (u64 LE), magic (u64 LE).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::coding::{get_uvarint, put_uvarint};
use crate::error::{Error, Result};
use crate::filenames::{make_filename, FileType};
use crate::iterator::InternalIterator;
use crate::key::{internal_compare, InternalKey};
use crate::sstable::block::{BlockIter, BlockWriter};

const FOOTER_LEN: u64 = 24;
const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"EMBERTBL");

/// Location of a block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        put_uvarint(&mut buf, self.offset);
        put_uvarint(&mut buf, self.length);
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let (offset, n) = get_uvarint(data)?;
        let (length, _) = get_uvarint(&data[n..])?;
        Ok(Self { offset, length })
    }
}

/// Streams internal keys in sorted order into a new table file.
pub struct TableWriter {
    file: File,
    block: BlockWriter,
    index: Vec<(InternalKey, BlockHandle)>,
    offset: u64,
    block_size: usize,
    restart_interval: usize,
    /// Largest key added to the in-progress block.
    last_key: Option<InternalKey>,
    entry_count: u64,
}

impl TableWriter {
    pub fn create(path: &Path, block_size: usize, restart_interval: usize) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            block: BlockWriter::new(restart_interval),
            index: Vec::new(),
            offset: 0,
            block_size,
            restart_interval,
            last_key: None,
            entry_count: 0,
        })
    }

    /// Appends an entry. Keys must arrive in non-decreasing internal-key
    /// order.
    pub fn add(&mut self, ikey: &InternalKey, value: &[u8]) -> Result<()> {
        self.block.add(ikey, value);
        self.last_key = Some(ikey.clone());
        self.entry_count += 1;
        if self.block.estimated_size() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let data = self.block.finish();
        let handle = BlockHandle {
            offset: self.offset,
            length: data.len() as u64,
        };
        self.file.write_all(&data)?;
        self.offset += data.len() as u64;

        let last_key = self
            .last_key
            .take()
            .ok_or_else(|| Error::Invariant("flushed block without a key".to_string()))?;
        self.index.push((last_key, handle));
        Ok(())
    }

    /// Writes the index block and footer, syncs, and returns the final file
    /// size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_block()?;

        // Index entries are full keys: restart every entry.
        let mut index_block = BlockWriter::new(1);
        for (key, handle) in &self.index {
            index_block.add(key, &handle.encode());
        }
        let index_data = index_block.finish();
        let index_handle = BlockHandle {
            offset: self.offset,
            length: index_data.len() as u64,
        };
        self.file.write_all(&index_data)?;

        self.file.write_u64::<LittleEndian>(index_handle.offset)?;
        self.file.write_u64::<LittleEndian>(index_handle.length)?;
        self.file.write_u64::<LittleEndian>(TABLE_MAGIC)?;
        self.file.flush()?;
        self.file.sync_all()?;

        Ok(self.offset + index_data.len() as u64 + FOOTER_LEN)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Restart interval data blocks are built with.
    pub fn restart_interval(&self) -> usize {
        self.restart_interval
    }
}

/// An open, readable table: the decoded index plus the backing file.
pub struct Table {
    file: File,
    cmp: fn(&[u8], &[u8]) -> Ordering,
    /// One entry per data block: (largest key in block, handle).
    index: Vec<(InternalKey, BlockHandle)>,
    /// Sequence number override applied to every key, for ingested tables.
    global_seq_num: u64,
}

impl Table {
    pub fn open(path: &Path, cmp: fn(&[u8], &[u8]) -> Ordering) -> Result<Self> {
        Self::open_with_global_seq_num(path, cmp, 0)
    }

    pub fn open_with_global_seq_num(
        path: &Path,
        cmp: fn(&[u8], &[u8]) -> Ordering,
        global_seq_num: u64,
    ) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_LEN {
            return Err(Error::Corruption(format!(
                "table {} too short for footer",
                path.display()
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let index_offset = file.read_u64::<LittleEndian>()?;
        let index_length = file.read_u64::<LittleEndian>()?;
        let magic = file.read_u64::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic in {}",
                path.display()
            )));
        }
        if index_offset
            .checked_add(index_length)
            .map(|end| end > size - FOOTER_LEN)
            .unwrap_or(true)
        {
            return Err(Error::Corruption(format!(
                "index handle out of bounds in {}",
                path.display()
            )));
        }

        let mut table = Self {
            file,
            cmp,
            index: Vec::new(),
            global_seq_num,
        };
        let index_data = table.read_raw(BlockHandle {
            offset: index_offset,
            length: index_length,
        })?;
        let mut index_iter = BlockIter::new(cmp, index_data)?;
        index_iter.first();
        while index_iter.valid() {
            let handle = BlockHandle::decode(index_iter.value())?;
            table.index.push((index_iter.key().clone(), handle));
            index_iter.next();
        }
        Ok(table)
    }

    fn read_raw(&self, handle: BlockHandle) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; handle.length as usize];
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(handle.offset))?;
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_block(&self, handle: BlockHandle) -> Result<BlockIter> {
        let data = self.read_raw(handle)?;
        BlockIter::with_global_seq_num(self.cmp, data, self.global_seq_num)
    }

    /// Index of the first block whose largest key is >= `ikey`; that block
    /// is the only one that can contain an entry >= `ikey` yet <= its
    /// separator.
    fn block_for(&self, ikey: &InternalKey) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, self.index.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if internal_compare(self.cmp, &self.index[mid].0, ikey) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo < self.index.len()).then_some(lo)
    }

    pub fn new_iter(self: Arc<Self>) -> TableIter {
        TableIter {
            table: self,
            block_index: 0,
            block_iter: None,
            err: None,
        }
    }
}

/// Two-level iterator: the table index above, one data block below.
pub struct TableIter {
    table: Arc<Table>,
    block_index: usize,
    block_iter: Option<BlockIter>,
    err: Option<Error>,
}

impl TableIter {
    fn load_block(&mut self, index: usize) -> bool {
        match self.table.read_block(self.table.index[index].1) {
            Ok(iter) => {
                self.block_index = index;
                self.block_iter = Some(iter);
                true
            }
            Err(e) => {
                self.err = Some(e);
                self.block_iter = None;
                false
            }
        }
    }
}

impl InternalIterator for TableIter {
    fn seek_ge(&mut self, ikey: &InternalKey) -> bool {
        let Some(index) = self.table.block_for(ikey) else {
            self.block_iter = None;
            return false;
        };
        if !self.load_block(index) {
            return false;
        }
        // The block's separator is >= ikey, so the target, if any, is here.
        self.block_iter.as_mut().map(|b| b.seek_ge(ikey)).unwrap_or(false)
    }

    fn seek_lt(&mut self, ikey: &InternalKey) -> bool {
        // Start from the block that could contain keys around the probe; if
        // every key there is >= the probe, the answer is the previous
        // block's last entry.
        let index = match self.table.block_for(ikey) {
            Some(index) => index,
            None if self.table.index.is_empty() => {
                self.block_iter = None;
                return false;
            }
            // Probe is past the last separator: the last entry wins.
            None => return self.last(),
        };
        if !self.load_block(index) {
            return false;
        }
        if self.block_iter.as_mut().map(|b| b.seek_lt(ikey)).unwrap_or(false) {
            return true;
        }
        if index == 0 {
            self.block_iter = None;
            return false;
        }
        if !self.load_block(index - 1) {
            return false;
        }
        self.block_iter.as_mut().map(|b| b.last()).unwrap_or(false)
    }

    fn first(&mut self) -> bool {
        if self.table.index.is_empty() {
            self.block_iter = None;
            return false;
        }
        if !self.load_block(0) {
            return false;
        }
        self.block_iter.as_mut().map(|b| b.first()).unwrap_or(false)
    }

    fn last(&mut self) -> bool {
        if self.table.index.is_empty() {
            self.block_iter = None;
            return false;
        }
        if !self.load_block(self.table.index.len() - 1) {
            return false;
        }
        self.block_iter.as_mut().map(|b| b.last()).unwrap_or(false)
    }

    fn next(&mut self) -> bool {
        let Some(block) = self.block_iter.as_mut() else {
            return false;
        };
        if block.next() {
            return true;
        }
        if self.block_index + 1 >= self.table.index.len() {
            return false;
        }
        let next_index = self.block_index + 1;
        if !self.load_block(next_index) {
            return false;
        }
        self.block_iter.as_mut().map(|b| b.first()).unwrap_or(false)
    }

    fn prev(&mut self) -> bool {
        let Some(block) = self.block_iter.as_mut() else {
            return false;
        };
        if block.prev() {
            return true;
        }
        if self.block_index == 0 {
            return false;
        }
        let prev_index = self.block_index - 1;
        if !self.load_block(prev_index) {
            return false;
        }
        self.block_iter.as_mut().map(|b| b.last()).unwrap_or(false)
    }

    fn valid(&self) -> bool {
        self.block_iter.as_ref().map(|b| b.valid()).unwrap_or(false)
    }

    fn key(&self) -> &InternalKey {
        self.block_iter
            .as_ref()
            .expect("iterator is not positioned")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.block_iter
            .as_ref()
            .expect("iterator is not positioned")
            .value()
    }

    fn error(&self) -> Option<&Error> {
        self.err
            .as_ref()
            .or_else(|| self.block_iter.as_ref().and_then(|b| b.error()))
    }
}

/// Open table readers keyed by file number, bounded by `max_open_files`.
/// Eviction is least-recently-opened; a table still referenced elsewhere
/// stays alive through its `Arc`.
pub struct TableCache {
    dir: PathBuf,
    cmp: fn(&[u8], &[u8]) -> Ordering,
    max_open: usize,
    inner: Mutex<TableCacheInner>,
}

struct TableCacheInner {
    tables: HashMap<u64, Arc<Table>>,
    order: Vec<u64>,
}

impl TableCache {
    pub fn new(dir: PathBuf, cmp: fn(&[u8], &[u8]) -> Ordering, max_open: usize) -> Self {
        Self {
            dir,
            cmp,
            max_open: max_open.max(1),
            inner: Mutex::new(TableCacheInner {
                tables: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn get(&self, file_num: u64) -> Result<Arc<Table>> {
        let mut inner = self.inner.lock()?;
        if let Some(table) = inner.tables.get(&file_num) {
            let table = Arc::clone(table);
            inner.order.retain(|&n| n != file_num);
            inner.order.push(file_num);
            return Ok(table);
        }

        let path = make_filename(&self.dir, FileType::Table, file_num);
        let table = Arc::new(Table::open(&path, self.cmp)?);
        inner.tables.insert(file_num, Arc::clone(&table));
        inner.order.push(file_num);
        while inner.order.len() > self.max_open {
            let evicted = inner.order.remove(0);
            inner.tables.remove(&evicted);
        }
        Ok(table)
    }

    /// Drops a table whose file is being deleted.
    pub fn evict(&self, file_num: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tables.remove(&file_num);
            inner.order.retain(|&n| n != file_num);
        }
    }
}
