//! Record-oriented log framing, shared by the write-ahead log and the
//! manifest.
//!
//! The log is a sequence of 32 KiB blocks. A record is split into one or
//! more fragments, each carried in a single block:
//!
//! ```text
//! +--------------+---------------+----------+------------------+
//! | crc32c (u32) | length (u16)  | type(u8) | payload          |
//! +--------------+---------------+----------+------------------+
//! ```
//!
//! `type` is FULL for an unfragmented record, or FIRST/MIDDLE/LAST for a
//! record spanning blocks. A block tail too small for a fragment header is
//! zero-padded. The checksum covers the type byte and the payload.
//!
//! The reader resynchronizes after a crash: a record torn at the end of the
//! file is silently dropped (clean EOF), while a damaged fragment in the
//! middle of the file is reported as corruption.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
const HEADER_SIZE: usize = 7;

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn fragment_crc(typ: u8, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[typ]);
    digest.update(payload);
    digest.finalize()
}

/// Appends length-framed records to a log file.
pub struct Writer {
    file: File,
    writer: BufWriter<File>,
    block_offset: usize,
}

impl Writer {
    pub fn new(file: File) -> Result<Self> {
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            block_offset: 0,
        })
    }

    /// Appends one record, fragmenting it across block boundaries as needed.
    pub fn add_record(&mut self, mut payload: &[u8]) -> Result<()> {
        let mut first = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not enough room for a header: pad out the block.
                const ZEROS: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
                self.writer.write_all(&ZEROS[..leftover])?;
                self.block_offset = 0;
                continue;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let frag_len = payload.len().min(avail);
            let last = frag_len == payload.len();
            let typ = match (first, last) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };

            let (frag, rest) = payload.split_at(frag_len);
            self.writer
                .write_u32::<LittleEndian>(fragment_crc(typ, frag))?;
            self.writer.write_u16::<LittleEndian>(frag.len() as u16)?;
            self.writer.write_u8(typ)?;
            self.writer.write_all(frag)?;
            self.block_offset += HEADER_SIZE + frag.len();

            if last {
                return Ok(());
            }
            payload = rest;
            first = false;
        }
    }

    /// Flushes buffered fragments to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and syncs the file to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Reads back records written by [`Writer`].
pub struct Reader {
    reader: BufReader<File>,
    block: Vec<u8>,
    pos: usize,
    len: usize,
    /// True once the final (short) block of the file has been loaded.
    last_block: bool,
}

impl Reader {
    pub fn new(file: File) -> Self {
        Self {
            reader: BufReader::new(file),
            block: vec![0; BLOCK_SIZE],
            pos: 0,
            len: 0,
            last_block: false,
        }
    }

    /// Returns the next record, `None` at a clean end of log, or a
    /// corruption error for a fragment damaged in the middle of the file.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        let mut in_fragment = false;

        loop {
            if self.len - self.pos < HEADER_SIZE {
                // Remainder of the block is padding; move to the next one.
                if !self.load_block()? {
                    // A record torn at the tail of the file is dropped.
                    return Ok(None);
                }
                continue;
            }

            let header = &self.block[self.pos..self.pos + HEADER_SIZE];
            let crc = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let length = u16::from_le_bytes(header[4..6].try_into().unwrap()) as usize;
            let typ = header[6];

            if crc == 0 && length == 0 && typ == 0 {
                // Zero fill (crash during block padding). Skip to next block.
                self.pos = self.len;
                continue;
            }

            let frag_start = self.pos + HEADER_SIZE;
            if frag_start + length > self.len {
                if self.last_block {
                    // Truncated trailing fragment: dropped.
                    return Ok(None);
                }
                return Err(Error::Corruption(
                    "log fragment overruns block".to_string(),
                ));
            }

            let payload = &self.block[frag_start..frag_start + length];
            if fragment_crc(typ, payload) != crc {
                if self.last_block && frag_start + length == self.len {
                    // Torn write at the end of the file: dropped.
                    return Ok(None);
                }
                return Err(Error::Corruption("log fragment checksum mismatch".to_string()));
            }

            self.pos = frag_start + length;

            match typ {
                FULL if !in_fragment => return Ok(Some(payload.to_vec())),
                FIRST if !in_fragment => {
                    record.extend_from_slice(payload);
                    in_fragment = true;
                }
                MIDDLE if in_fragment => record.extend_from_slice(payload),
                LAST if in_fragment => {
                    record.extend_from_slice(payload);
                    return Ok(Some(record));
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unexpected log fragment type {typ}"
                    )))
                }
            }
        }
    }

    /// Loads the next block. Returns false at end of file.
    fn load_block(&mut self) -> Result<bool> {
        self.pos = 0;
        self.len = 0;
        while self.len < BLOCK_SIZE {
            let n = self.reader.read(&mut self.block[self.len..])?;
            if n == 0 {
                break;
            }
            self.len += n;
        }
        if self.len < BLOCK_SIZE {
            self.last_block = true;
        }
        Ok(self.len > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::fs::OpenOptions;

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .expect("open failed")
    }

    fn write_records(path: &std::path::Path, records: &[Vec<u8>]) {
        let mut w = Writer::new(open_rw(path)).expect("writer");
        for r in records {
            w.add_record(r).expect("add_record");
        }
        w.sync().expect("sync");
    }

    fn read_all(path: &std::path::Path) -> Vec<Vec<u8>> {
        let mut r = Reader::new(File::open(path).expect("open"));
        let mut out = Vec::new();
        while let Some(rec) = r.read_record().expect("read_record") {
            out.push(rec);
        }
        out
    }

    #[test]
    fn test_roundtrip_small_records() {
        let f = NamedTempFile::new().unwrap();
        let records = vec![b"alpha".to_vec(), b"".to_vec(), b"gamma".to_vec()];
        write_records(f.path(), &records);
        assert_eq!(read_all(f.path()), records);
    }

    #[test]
    fn test_record_spanning_blocks() {
        let f = NamedTempFile::new().unwrap();
        // Three blocks worth of payload forces FIRST/MIDDLE/LAST framing.
        let big = vec![0xabu8; 3 * BLOCK_SIZE];
        let records = vec![b"head".to_vec(), big.clone(), b"tail".to_vec()];
        write_records(f.path(), &records);
        assert_eq!(read_all(f.path()), records);
    }

    #[test]
    fn test_block_trailer_padding() {
        let f = NamedTempFile::new().unwrap();
        // Leave fewer than 7 bytes at the end of the first block so the
        // writer must pad and restart.
        let first = vec![1u8; BLOCK_SIZE - HEADER_SIZE - 3];
        let records = vec![first, b"after-pad".to_vec()];
        write_records(f.path(), &records);
        assert_eq!(read_all(f.path()), records);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let f = NamedTempFile::new().unwrap();
        let records = vec![b"kept".to_vec(), vec![7u8; 500]];
        write_records(f.path(), &records);

        // Chop off the middle of the second record.
        let file = open_rw(f.path());
        let len = file.metadata().unwrap().len();
        file.set_len(len - 100).unwrap();

        let got = read_all(f.path());
        assert_eq!(got, vec![b"kept".to_vec()]);
    }

    #[test]
    fn test_corrupt_fragment_mid_file() {
        let f = NamedTempFile::new().unwrap();
        // Two blocks of records so the damage is not in the last block.
        let records = vec![vec![1u8; BLOCK_SIZE], vec![2u8; BLOCK_SIZE]];
        write_records(f.path(), &records);

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = open_rw(f.path());
            file.seek(SeekFrom::Start(64)).unwrap();
            file.write_all(&[0xff; 8]).unwrap();
            file.sync_all().unwrap();
        }

        let mut r = Reader::new(File::open(f.path()).unwrap());
        let mut saw_corruption = false;
        loop {
            match r.read_record() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(Error::Corruption(_)) => {
                    saw_corruption = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(saw_corruption, "damage in a middle block must surface");
    }

    #[test]
    fn test_empty_log() {
        let f = NamedTempFile::new().unwrap();
        drop(open_rw(f.path()));
        assert!(read_all(f.path()).is_empty());
    }
}
