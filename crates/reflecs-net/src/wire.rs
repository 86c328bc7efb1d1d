//! Snapshot wire format.
//!
//! ```text
//! u32 count
//! count x { u32 type_id, u32 len, len bytes }
//! ```
//!
//! All integers are little endian. Records are in strictly ascending
//! `type_id` order, so a type appears at most once per snapshot.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ReplicationError, Result};

/// Bytes taken by the count prefix.
pub const COUNT_LEN: usize = 4;
/// Bytes taken by one record header.
pub const RECORD_HEADER_LEN: usize = 8;

/// One component's payload, keyed by the type's stable id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub type_id: u32,
    pub payload: Vec<u8>,
}

/// A decoded record borrowing the input buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordRef<'a> {
    pub type_id: u32,
    pub payload: &'a [u8],
}

impl RecordRef<'_> {
    /// Bytes this record occupies on the wire, header included.
    #[must_use]
    pub const fn wire_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload.len()
    }
}

/// Encode `records`, sorting them by type id first.
pub fn encode(records: &mut [Record]) -> Result<Vec<u8>> {
    records.sort_unstable_by_key(|r| r.type_id);
    let total = COUNT_LEN
        + records
            .iter()
            .map(|r| RECORD_HEADER_LEN + r.payload.len())
            .sum::<usize>();
    let mut out = Vec::with_capacity(total);
    encode_into(&mut out, records)?;
    Ok(out)
}

/// Write already-sorted records to `writer`.
pub fn encode_into<W: Write>(writer: &mut W, records: &[Record]) -> Result<()> {
    let count = u32::try_from(records.len()).map_err(|_| ReplicationError::RecordTooLarge(records.len()))?;
    writer.write_u32::<LittleEndian>(count)?;

    let mut previous: Option<u32> = None;
    for record in records {
        if previous.is_some_and(|p| p >= record.type_id) {
            return Err(ReplicationError::OutOfOrder {
                type_id: record.type_id,
            });
        }
        previous = Some(record.type_id);

        let len = u32::try_from(record.payload.len())
            .map_err(|_| ReplicationError::RecordTooLarge(record.payload.len()))?;
        writer.write_u32::<LittleEndian>(record.type_id)?;
        writer.write_u32::<LittleEndian>(len)?;
        writer.write_all(&record.payload)?;
    }
    Ok(())
}

/// Split a snapshot into records. Framing problems reject the whole buffer.
pub fn decode(bytes: &[u8]) -> Result<Vec<RecordRef<'_>>> {
    let mut cursor = Cursor { bytes, offset: 0 };
    let count = cursor.read_u32()? as usize;

    // every record needs at least a header; don't trust the prefix for allocation
    let plausible = cursor.remaining() / RECORD_HEADER_LEN;
    let mut records = Vec::with_capacity(count.min(plausible));

    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let type_id = cursor.read_u32()?;
        let len = cursor.read_u32()? as usize;
        let payload = cursor.take(len)?;

        if previous.is_some_and(|p| p >= type_id) {
            return Err(ReplicationError::OutOfOrder { type_id });
        }
        previous = Some(type_id);
        records.push(RecordRef { type_id, payload });
    }

    if cursor.remaining() > 0 {
        return Err(ReplicationError::TrailingBytes(cursor.remaining()));
    }
    Ok(records)
}

/// Record count of a snapshot without decoding it.
pub fn peek_count(bytes: &[u8]) -> Result<u32> {
    let mut head = bytes;
    head.read_u32::<LittleEndian>()
        .map_err(|_| ReplicationError::Malformed {
            offset: 0,
            needed: COUNT_LEN.saturating_sub(bytes.len()),
        })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut slice = self.take(4)?;
        slice
            .read_u32::<LittleEndian>()
            .map_err(|_| ReplicationError::Malformed {
                offset: self.offset,
                needed: 4,
            })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ReplicationError::Malformed {
                offset: self.offset,
                needed: len - self.remaining(),
            });
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..self.offset])
    }
}
