//! Edit logs: atomically-applied batches of file-level mutations.
//!
//! An edit log belongs to one family (or to the store itself, family id
//! [`STORE_FAMILY_ID`]) and is marshalled into a manifest frame payload:
//!
//! ```text
//! family_id: varint (zigzag, STORE_FAMILY_ID = -1)
//! edit_count: varint
//! edits:
//!   0x01 NewFile        level + file_number + min_key + max_key + size
//!   0x02 DeleteFile     level + file_number
//!   0x03 NextFileNumber next file number
//! ```
//!
//! Integers are varints; byte strings are varint-length-prefixed.

use integer_encoding::VarInt;

use crate::errdata;
use crate::error::Result;
use crate::kv::version::version::FileMeta;

/// Family id of store-level edit logs.
pub const STORE_FAMILY_ID: i64 = -1;

const NEW_FILE: u8 = 0x01;
const DELETE_FILE: u8 = 0x02;
const NEXT_FILE_NUMBER: u8 = 0x03;

#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    NewFile { level: i32, file: FileMeta },
    DeleteFile { level: i32, file_number: i64 },
    NextFileNumber(i64),
}

/// An ordered batch of edits for one family, persisted once, applied once.
#[derive(Debug, Clone, PartialEq)]
pub struct EditLog {
    family_id: i64,
    edits: Vec<Edit>,
}

impl EditLog {
    pub fn new(family_id: i64) -> Self {
        Self {
            family_id,
            edits: Vec::new(),
        }
    }

    pub fn family_id(&self) -> i64 {
        self.family_id
    }

    pub fn add(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, self.family_id);
        put_varint(&mut buf, self.edits.len() as u64);

        for edit in &self.edits {
            match edit {
                Edit::NewFile { level, file } => {
                    buf.push(NEW_FILE);
                    put_varint(&mut buf, *level);
                    put_varint(&mut buf, file.file_number);
                    put_bytes(&mut buf, &file.min_key);
                    put_bytes(&mut buf, &file.max_key);
                    put_varint(&mut buf, file.size);
                }
                Edit::DeleteFile { level, file_number } => {
                    buf.push(DELETE_FILE);
                    put_varint(&mut buf, *level);
                    put_varint(&mut buf, *file_number);
                }
                Edit::NextFileNumber(next) => {
                    buf.push(NEXT_FILE_NUMBER);
                    put_varint(&mut buf, *next);
                }
            }
        }

        buf
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut buf = buf;
        let family_id: i64 = take_varint(&mut buf)?;
        let edit_count: u64 = take_varint(&mut buf)?;

        let mut edits = Vec::with_capacity(edit_count as usize);
        for _ in 0..edit_count {
            let (tag, rest) = match buf.split_first() {
                Some(split) => split,
                None => return errdata!("truncated edit log"),
            };
            buf = rest;

            let edit = match *tag {
                NEW_FILE => {
                    let level: i32 = take_varint(&mut buf)?;
                    let file_number: i64 = take_varint(&mut buf)?;
                    let min_key = take_bytes(&mut buf)?;
                    let max_key = take_bytes(&mut buf)?;
                    let size: i64 = take_varint(&mut buf)?;
                    Edit::NewFile {
                        level,
                        file: FileMeta {
                            file_number,
                            min_key,
                            max_key,
                            size,
                        },
                    }
                }
                DELETE_FILE => {
                    let level: i32 = take_varint(&mut buf)?;
                    let file_number: i64 = take_varint(&mut buf)?;
                    Edit::DeleteFile { level, file_number }
                }
                NEXT_FILE_NUMBER => {
                    let next: i64 = take_varint(&mut buf)?;
                    Edit::NextFileNumber(next)
                }
                other => return errdata!("unknown edit tag: {:#04x}", other),
            };
            edits.push(edit);
        }

        Ok(Self { family_id, edits })
    }
}

fn put_varint<T: VarInt>(buf: &mut Vec<u8>, v: T) {
    buf.extend_from_slice(&v.encode_var_vec());
}

fn take_varint<T: VarInt>(buf: &mut &[u8]) -> Result<T> {
    let (v, n) = match T::decode_var(*buf) {
        Some(decoded) => decoded,
        None => return errdata!("truncated varint"),
    };
    *buf = &buf[n..];
    Ok(v)
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len: u64 = take_varint(buf)?;
    let len = len as usize;
    if buf.len() < len {
        return errdata!("truncated byte string");
    }
    let (bytes, rest) = buf.split_at(len);
    let bytes = bytes.to_vec();
    *buf = rest;
    Ok(bytes)
}
