// SPDX-License-Identifier: MPL-2.0

//! Persistence types: merged per-dentry updates, piece-field updates and
//! the compact redo-log record codecs.

use hashbrown::HashMap;
use spin::Mutex;

use crate::{
    meta::{
        dentry::Dentry,
        types::{OpType, PieceField, PIECE_FIELD_COUNT},
    },
    prelude::*,
};

/// Every redo-log record fits in this many bytes.
pub const MAX_RECORD_SIZE: usize = 128;

/// One merged dentry update flowing from change notify into data sync:
/// at most one buffer per piece-field.
pub struct DbUpdateDentry {
    pub version: u64,
    pub inode: u64,
    /// Highest event id merged in; orders updates of the same inode.
    pub event_id: u64,
    pub op: OpType,
    pub fields: [Option<Vec<u8>>; PIECE_FIELD_COUNT],
    pub msg_count: usize,
    pub merge_count: usize,
    pub alloc_delta: i64,
    /// Dentry references held until persistence is done; released
    /// through the owning shard's immediate-free queue.
    pub holds: Vec<Arc<Dentry>>,
}

impl DbUpdateDentry {
    pub fn new(version: u64, inode: u64, event_id: u64) -> Self {
        Self {
            version,
            inode,
            event_id,
            op: OpType::Update,
            fields: Default::default(),
            msg_count: 0,
            merge_count: 0,
            alloc_delta: 0,
            holds: Vec::new(),
        }
    }
}

/// One piece-field update bound for the inode binlog writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceFieldInfo {
    pub inode: u64,
    pub field: PieceField,
    pub op: OpType,
    pub version: u64,
    pub buffer: Option<Vec<u8>>,
}

/// One trunk-space mutation bound for the space log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceLogRecord {
    pub version: u64,
    pub trunk_id: u64,
    pub offset: u64,
    pub size: u64,
    pub op: OpType,
}

/// The per-inode piece-field version index gating redo-log writes.
pub trait SegmentIndex: Send + Sync {
    /// Applies `field` and returns the version it was stored under, or
    /// 0 when the update is older than what the index already holds.
    fn update(&self, field: &PieceFieldInfo) -> Result<u64>;
}

/// In-memory segment index: per (inode, field) versions.
#[derive(Default)]
pub struct MemSegmentIndex {
    map: Mutex<HashMap<(u64, u8), u64>>,
}

impl SegmentIndex for MemSegmentIndex {
    fn update(&self, field: &PieceFieldInfo) -> Result<u64> {
        let mut map = self.map.lock();
        if field.op == OpType::Remove {
            // Removal retires every piece-field of the inode.
            map.retain(|(inode, _), _| *inode != field.inode);
            return Ok(field.version);
        }

        let key = (field.inode, field.field as u8);
        match map.get(&key) {
            Some(stored) if *stored >= field.version => Ok(0),
            _ => {
                map.insert(key, field.version);
                Ok(field.version)
            }
        }
    }
}

fn op_from_u8(value: u8) -> Result<OpType> {
    match value {
        b'c' => Ok(OpType::Create),
        b'u' => Ok(OpType::Update),
        b'd' => Ok(OpType::Remove),
        _ => return_errno_with_message!(Errno::EINVAL, "bad op type in redo record"),
    }
}

fn field_from_u8(value: u8) -> Result<PieceField> {
    match value {
        0 => Ok(PieceField::Basic),
        1 => Ok(PieceField::Children),
        2 => Ok(PieceField::Xattr),
        _ => return_errno_with_message!(Errno::EINVAL, "bad field index in redo record"),
    }
}

/// Appends one length-prefixed field-redo record to `out`.
pub fn encode_field_redo(out: &mut Vec<u8>, field: &PieceFieldInfo) {
    let payload_len = 8 + 8 + 1 + 1;
    out.extend_from_slice(&(payload_len as u16).to_le_bytes());
    out.extend_from_slice(&field.inode.to_le_bytes());
    out.extend_from_slice(&field.version.to_le_bytes());
    out.push(field.field as u8);
    out.push(field.op as u8);
    debug_assert!(2 + payload_len <= MAX_RECORD_SIZE);
}

/// Appends one length-prefixed space-redo record to `out`.
pub fn encode_space_redo(out: &mut Vec<u8>, record: &SpaceLogRecord) {
    let payload_len = 8 * 4 + 1;
    out.extend_from_slice(&(payload_len as u16).to_le_bytes());
    out.extend_from_slice(&record.version.to_le_bytes());
    out.extend_from_slice(&record.trunk_id.to_le_bytes());
    out.extend_from_slice(&record.offset.to_le_bytes());
    out.extend_from_slice(&record.size.to_le_bytes());
    out.push(record.op as u8);
    debug_assert!(2 + payload_len <= MAX_RECORD_SIZE);
}

struct RedoCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RedoCursor<'a> {
    fn next_payload(&mut self) -> Result<Option<&'a [u8]>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.pos + 2 > self.data.len() {
            return_errno_with_message!(Errno::EINVAL, "truncated redo length");
        }
        let len =
            u16::from_le_bytes(self.data[self.pos..self.pos + 2].try_into().unwrap()) as usize;
        self.pos += 2;
        if len > MAX_RECORD_SIZE || self.pos + len > self.data.len() {
            return_errno_with_message!(Errno::EINVAL, "truncated redo record");
        }
        let payload = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(Some(payload))
    }
}

fn u64_at(payload: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(payload[at..at + 8].try_into().unwrap())
}

/// Decodes a whole field-redo file.
pub fn decode_field_redo(data: &[u8]) -> Result<Vec<PieceFieldInfo>> {
    let mut cursor = RedoCursor { data, pos: 0 };
    let mut records = Vec::new();
    while let Some(payload) = cursor.next_payload()? {
        if payload.len() != 18 {
            return_errno_with_message!(Errno::EINVAL, "bad field redo record size");
        }
        records.push(PieceFieldInfo {
            inode: u64_at(payload, 0),
            version: u64_at(payload, 8),
            field: field_from_u8(payload[16])?,
            op: op_from_u8(payload[17])?,
            buffer: None,
        });
    }
    Ok(records)
}

/// Decodes a whole space-redo file.
pub fn decode_space_redo(data: &[u8]) -> Result<Vec<SpaceLogRecord>> {
    let mut cursor = RedoCursor { data, pos: 0 };
    let mut records = Vec::new();
    while let Some(payload) = cursor.next_payload()? {
        if payload.len() != 33 {
            return_errno_with_message!(Errno::EINVAL, "bad space redo record size");
        }
        records.push(SpaceLogRecord {
            version: u64_at(payload, 0),
            trunk_id: u64_at(payload, 8),
            offset: u64_at(payload, 16),
            size: u64_at(payload, 24),
            op: op_from_u8(payload[32])?,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_redo_roundtrip() {
        let mut buf = Vec::new();
        let records = [
            PieceFieldInfo {
                inode: 42,
                field: PieceField::Basic,
                op: OpType::Create,
                version: 100,
                buffer: None,
            },
            PieceFieldInfo {
                inode: 43,
                field: PieceField::Xattr,
                op: OpType::Update,
                version: 101,
                buffer: None,
            },
        ];
        for record in &records {
            encode_field_redo(&mut buf, record);
        }

        let decoded = decode_field_redo(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], records[0]);
        assert_eq!(decoded[1], records[1]);
    }

    #[test]
    fn space_redo_roundtrip() {
        let record = SpaceLogRecord {
            version: 7,
            trunk_id: 3,
            offset: 4096,
            size: 512,
            op: OpType::Update,
        };
        let mut buf = Vec::new();
        encode_space_redo(&mut buf, &record);
        assert_eq!(decode_space_redo(&buf).unwrap(), vec![record]);
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut buf = Vec::new();
        encode_space_redo(
            &mut buf,
            &SpaceLogRecord {
                version: 1,
                trunk_id: 1,
                offset: 0,
                size: 1,
                op: OpType::Create,
            },
        );
        buf.pop();
        assert!(decode_space_redo(&buf).is_err());
    }

    #[test]
    fn segment_index_gates_stale_versions() {
        let index = MemSegmentIndex::default();
        let mut field = PieceFieldInfo {
            inode: 9,
            field: PieceField::Basic,
            op: OpType::Create,
            version: 10,
            buffer: None,
        };
        assert_eq!(index.update(&field).unwrap(), 10);

        // Older version is a no-op.
        field.version = 8;
        assert_eq!(index.update(&field).unwrap(), 0);

        field.version = 11;
        assert_eq!(index.update(&field).unwrap(), 11);

        // Removal retires the inode; re-adding starts fresh.
        field.op = OpType::Remove;
        field.version = 12;
        assert_eq!(index.update(&field).unwrap(), 12);
        field.op = OpType::Update;
        field.version = 5;
        assert_eq!(index.update(&field).unwrap(), 5);
    }
}
