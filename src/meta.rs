use std::io::{Error, ErrorKind, Result};

use serde::Serialize;

/// Number of hash tables, selected by the low byte of the key hash.
pub const TABLE_COUNT: usize = 256;

/// Size in bytes of one `(u32, u32)` little-endian pair.
pub const PAIR_SIZE: u64 = 8;

fn encode_pair(first: u32, second: u32) -> [u8; PAIR_SIZE as usize] {
    let mut buf = [0u8; PAIR_SIZE as usize];
    buf[..4].copy_from_slice(&first.to_le_bytes());
    buf[4..].copy_from_slice(&second.to_le_bytes());
    buf
}

/// Decodes a little-endian `(u32, u32)` pair.
///
/// Fails with `ErrorKind::UnexpectedEof` when fewer than eight bytes are
/// available, which indicates a truncated file.
pub fn decode_pair(data: &[u8]) -> Result<(u32, u32)> {
    if data.len() < PAIR_SIZE as usize {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", PAIR_SIZE, data.len()),
        ));
    }
    let first = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let second = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok((first, second))
}

/// Location of one hash table inside a cdb file.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CdbTable {
    /// Absolute file offset of the first slot.
    pub position: u32,
    /// Number of slots; zero for an empty table.
    pub slots: u32,
}

impl CdbTable {
    pub fn serialize(&self) -> [u8; PAIR_SIZE as usize] {
        encode_pair(self.position, self.slots)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (position, slots) = decode_pair(data)?;
        Ok(CdbTable { position, slots })
    }

    /// Offset one past the last slot of this table.
    pub fn end(&self) -> u64 {
        self.position as u64 + self.slots as u64 * PAIR_SIZE
    }
}

/// The fixed 2048-byte header at offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdbHeader {
    pub tables: [CdbTable; TABLE_COUNT],
}

impl Default for CdbHeader {
    fn default() -> Self {
        CdbHeader {
            tables: [CdbTable::default(); TABLE_COUNT],
        }
    }
}

impl CdbHeader {
    pub const SIZE: usize = TABLE_COUNT * PAIR_SIZE as usize;

    /// Byte offset of the header entry for table `index`.
    pub fn entry_offset(index: usize) -> u64 {
        index as u64 * PAIR_SIZE
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        for table in &self.tables {
            buf.extend_from_slice(&table.serialize());
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("cdb header requires {} bytes, got {}", Self::SIZE, data.len()),
            ));
        }
        let mut header = CdbHeader::default();
        for (table, chunk) in header
            .tables
            .iter_mut()
            .zip(data.chunks_exact(PAIR_SIZE as usize))
        {
            *table = CdbTable::deserialize(chunk)?;
        }
        Ok(header)
    }
}

/// One `(hash, record_position)` entry of a hash table.
///
/// A slot whose position is zero is empty: offset zero lies inside the header
/// and never holds a record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CdbSlot {
    pub hash: u32,
    pub position: u32,
}

impl CdbSlot {
    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    pub fn serialize(&self) -> [u8; PAIR_SIZE as usize] {
        encode_pair(self.hash, self.position)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (hash, position) = decode_pair(data)?;
        Ok(CdbSlot { hash, position })
    }
}

/// Length prefix preceding the key and value bytes of every record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CdbRecordHeader {
    pub key_length: u32,
    pub value_length: u32,
}

impl CdbRecordHeader {
    pub fn serialize(&self) -> [u8; PAIR_SIZE as usize] {
        encode_pair(self.key_length, self.value_length)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (key_length, value_length) = decode_pair(data)?;
        Ok(CdbRecordHeader {
            key_length,
            value_length,
        })
    }

    /// Total on-disk size of the record including this header.
    pub fn record_length(&self) -> u64 {
        PAIR_SIZE + self.key_length as u64 + self.value_length as u64
    }
}

/// Summary returned by [`CdbBuilder::build`](crate::CdbBuilder::build) and
/// [`Cdb::info`](crate::Cdb::info).
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
pub struct CdbInfo {
    /// Size of the database file in bytes.
    pub file_length: u64,
    /// Number of records stored.
    pub record_count: u64,
    /// Number of hash tables holding at least one record.
    pub occupied_tables: usize,
    /// Sum of slots across all hash tables.
    pub slot_count: u64,
    /// Slot count of the largest hash table.
    pub max_table_slots: u32,
}

impl CdbInfo {
    /// Derives the summary from a parsed header.
    pub fn from_header(header: &CdbHeader) -> Self {
        let mut info = CdbInfo {
            file_length: CdbHeader::SIZE as u64,
            ..Default::default()
        };
        for table in &header.tables {
            info.file_length = info.file_length.max(table.end());
            if table.slots == 0 {
                continue;
            }
            info.occupied_tables += 1;
            info.slot_count += table.slots as u64;
            info.max_table_slots = info.max_table_slots.max(table.slots);
        }
        info.record_count = info.slot_count / 2;
        info
    }
}
