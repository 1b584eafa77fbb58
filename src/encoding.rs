//! Framed append-only journal encoding.
//!
//! Both the manifest and the id journal store records in the same frame
//! format:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32c:u32 |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! All fixed-width integers are big-endian; the checksum is CRC-32/ISCSI
//! (CRC32C) over the payload bytes only.
//!
//! A frame that ends before its checksum landed on disk is a torn write from
//! a crash mid-append: the reader stops there and the journal is usable up to
//! the last intact frame. A *complete* frame whose checksum does not match is
//! real corruption and surfaces as an error.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::error::Result;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Appends CRC-framed records to a journal file.
pub struct FrameWriter {
    file: File,
}

impl FrameWriter {
    /// Creates a fresh journal, truncating anything already at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens a journal for appending, creating it if absent.
    pub fn append_to(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Writes one frame. Call [`FrameWriter::sync`] to make it durable.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        self.file.write_u32::<BigEndian>(payload.len() as u32)?;
        self.file.write_all(payload)?;
        self.file.write_u32::<BigEndian>(CRC32C.checksum(payload))?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Iterates the intact frames of a journal file.
///
/// Yields each payload in order. Iteration ends silently at a torn trailing
/// frame; a checksum mismatch on a complete frame yields an error.
pub struct FrameReader {
    reader: BufReader<File>,
    done: bool,
}

impl FrameReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            done: false,
        })
    }

    /// Reads exactly `buf.len()` bytes unless the file ends first.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.reader.read(&mut buf[read..])?;
            if n == 0 {
                return Ok(false);
            }
            read += n;
        }
        Ok(true)
    }
}

impl Iterator for FrameReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut len_buf = [0u8; 4];
        match self.fill(&mut len_buf) {
            Ok(true) => {}
            Ok(false) => {
                // Clean EOF or a torn length word; either way the journal
                // ends here.
                self.done = true;
                return None;
            }
            Err(e) => return Some(Err(e)),
        }
        let len = match (&len_buf[..]).read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) => return Some(Err(e.into())),
        };

        let mut payload = vec![0u8; len];
        match self.fill(&mut payload) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(frame_len = len, "discarding torn trailing frame");
                self.done = true;
                return None;
            }
            Err(e) => return Some(Err(e)),
        }

        let mut crc_buf = [0u8; 4];
        match self.fill(&mut crc_buf) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(frame_len = len, "discarding torn trailing frame");
                self.done = true;
                return None;
            }
            Err(e) => return Some(Err(e)),
        }
        let stored = u32::from_be_bytes(crc_buf);

        if CRC32C.checksum(&payload) != stored {
            self.done = true;
            return Some(errdata!("frame checksum mismatch"));
        }

        Some(Ok(payload))
    }
}
