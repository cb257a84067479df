// SPDX-License-Identifier: MPL-2.0

//! Piece-field packing.
//!
//! Every piece-field of a dentry serializes to a self-describing tagged
//! stream: a version marker, then `(field_id: u8, type_tag: u8, payload)`
//! fields, then a terminator. Readers dispatch on the type tag, so fields
//! can be added without breaking old readers.

use spin::Mutex;

use crate::{
    meta::{dentry::Dentry, types::PieceField},
    prelude::*,
};

// Stable on-disk field IDs.
pub const FIELD_ID_INODE: u8 = 1;
pub const FIELD_ID_PARENT: u8 = 2;
pub const FIELD_ID_SUBNAME: u8 = 3;
pub const FIELD_ID_SRC_INODE: u8 = 5;
pub const FIELD_ID_LINK: u8 = 6;
pub const FIELD_ID_MODE: u8 = 10;
pub const FIELD_ID_ATIME: u8 = 11;
pub const FIELD_ID_BTIME: u8 = 12;
pub const FIELD_ID_CTIME: u8 = 13;
pub const FIELD_ID_MTIME: u8 = 14;
pub const FIELD_ID_UID: u8 = 15;
pub const FIELD_ID_GID: u8 = 16;
pub const FIELD_ID_FILE_SIZE: u8 = 17;
pub const FIELD_ID_ALLOC_SIZE: u8 = 18;
pub const FIELD_ID_SPACE_END: u8 = 19;
pub const FIELD_ID_NLINK: u8 = 20;
pub const FIELD_ID_XATTR: u8 = 30;
pub const FIELD_ID_HASH_CODE: u8 = 40;
pub const FIELD_ID_CHILDREN: u8 = 50;

const PACK_VERSION: u8 = 1;
const FIELD_ID_END: u8 = 0;

const TAG_INT32: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_INT64_ARRAY: u8 = 4;
const TAG_MAP: u8 = 5;

/// Buffers returned to the pool shrink back to this capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Pool of packed-field buffers.
#[derive(Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn acquire(&self) -> Vec<u8> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if buffer.capacity() > DEFAULT_BUFFER_CAPACITY {
            buffer.shrink_to(DEFAULT_BUFFER_CAPACITY);
        }
        self.free.lock().push(buffer);
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

pub fn pack_begin(buf: &mut Vec<u8>) {
    buf.push(PACK_VERSION);
}

pub fn pack_end(buf: &mut Vec<u8>) {
    buf.push(FIELD_ID_END);
}

pub fn pack_int32(buf: &mut Vec<u8>, id: u8, value: i32) {
    buf.push(id);
    buf.push(TAG_INT32);
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn pack_int64(buf: &mut Vec<u8>, id: u8, value: i64) {
    buf.push(id);
    buf.push(TAG_INT64);
    buf.extend_from_slice(&value.to_le_bytes());
}

fn pack_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

pub fn pack_string(buf: &mut Vec<u8>, id: u8, value: &str) {
    buf.push(id);
    buf.push(TAG_STRING);
    pack_bytes(buf, value.as_bytes());
}

pub fn pack_int64_array(buf: &mut Vec<u8>, id: u8, values: &[i64]) {
    buf.push(id);
    buf.push(TAG_INT64_ARRAY);
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub fn pack_map(buf: &mut Vec<u8>, id: u8, pairs: &[(String, String)]) {
    buf.push(id);
    buf.push(TAG_MAP);
    buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for (key, value) in pairs {
        pack_bytes(buf, key.as_bytes());
        pack_bytes(buf, value.as_bytes());
    }
}

/// One decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    Str(String),
    Int64Array(Vec<i64>),
    Map(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedField {
    pub id: u8,
    pub value: FieldValue,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return_errno_with_message!(Errno::EINVAL, "truncated packed buffer");
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::with_message(Errno::EINVAL, "invalid utf-8 in packed buffer"))
    }
}

/// Decodes a packed piece-field buffer back into tagged fields.
pub fn unpack(data: &[u8]) -> Result<Vec<PackedField>> {
    let mut cursor = Cursor { data, pos: 0 };
    if cursor.u8()? != PACK_VERSION {
        return_errno_with_message!(Errno::EINVAL, "unknown pack version");
    }

    let mut fields = Vec::new();
    loop {
        let id = cursor.u8()?;
        if id == FIELD_ID_END {
            break;
        }
        let value = match cursor.u8()? {
            TAG_INT32 => FieldValue::Int32(cursor.i32()?),
            TAG_INT64 => FieldValue::Int64(cursor.i64()?),
            TAG_STRING => FieldValue::Str(cursor.string()?),
            TAG_INT64_ARRAY => {
                let count = cursor.u32()? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.i64()?);
                }
                FieldValue::Int64Array(values)
            }
            TAG_MAP => {
                let count = cursor.u32()? as usize;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = cursor.string()?;
                    let value = cursor.string()?;
                    pairs.push((key, value));
                }
                FieldValue::Map(pairs)
            }
            _ => return_errno_with_message!(Errno::EINVAL, "unknown type tag"),
        };
        fields.push(PackedField { id, value });
    }
    if cursor.pos != data.len() {
        return_errno_with_message!(Errno::EINVAL, "trailing bytes in packed buffer");
    }
    Ok(fields)
}

fn pack_basic(dentry: &Dentry, buf: &mut Vec<u8>) {
    let stat = dentry.stat();

    pack_int64(buf, FIELD_ID_INODE, dentry.inode() as i64);
    let parent_inode = dentry.parent().map_or(0, |p| p.inode() as i64);
    pack_int64(buf, FIELD_ID_PARENT, parent_inode);
    pack_string(buf, FIELD_ID_SUBNAME, &dentry.name());

    if let Some(src) = dentry.src_dentry() {
        pack_int64(buf, FIELD_ID_SRC_INODE, src.inode() as i64);
    } else if let Some(target) = dentry.link_target() {
        pack_string(buf, FIELD_ID_LINK, target);
    }

    pack_int32(buf, FIELD_ID_MODE, stat.mode as i32);
    pack_int64(buf, FIELD_ID_ATIME, stat.atime);
    pack_int64(buf, FIELD_ID_BTIME, stat.btime);
    pack_int64(buf, FIELD_ID_CTIME, stat.ctime);
    pack_int64(buf, FIELD_ID_MTIME, stat.mtime);
    pack_int32(buf, FIELD_ID_UID, stat.uid as i32);
    pack_int32(buf, FIELD_ID_GID, stat.gid as i32);
    pack_int64(buf, FIELD_ID_FILE_SIZE, stat.size);
    pack_int64(buf, FIELD_ID_ALLOC_SIZE, stat.alloc);
    pack_int64(buf, FIELD_ID_SPACE_END, stat.space_end);
    pack_int32(buf, FIELD_ID_NLINK, stat.nlink as i32);
    pack_int32(buf, FIELD_ID_HASH_CODE, dentry.hash_code() as i32);
}

/// Packs one piece-field of `dentry` into a pooled buffer. Empty
/// children/xattr produce no buffer at all.
pub fn pack(dentry: &Dentry, field: PieceField, pool: &BufferPool) -> Result<Option<Vec<u8>>> {
    match field {
        PieceField::Children => {
            if !dentry.is_dir() {
                return_errno_with_message!(Errno::EINVAL, "children of a non-directory");
            }
            if dentry.children_empty() {
                return Ok(None);
            }
        }
        PieceField::Xattr => {
            if dentry.xattrs().read().is_empty() {
                return Ok(None);
            }
        }
        PieceField::Basic => {}
    }

    let mut buf = pool.acquire();
    pack_begin(&mut buf);
    match field {
        PieceField::Basic => pack_basic(dentry, &mut buf),
        PieceField::Children => {
            pack_int64_array(&mut buf, FIELD_ID_CHILDREN, &dentry.child_inodes())
        }
        PieceField::Xattr => pack_map(&mut buf, FIELD_ID_XATTR, &dentry.xattrs().read()),
    }
    pack_end(&mut buf);
    Ok(Some(buf))
}
