use crate::catalog::schema::{ColumnId, IndexId, TableId};
use crate::catalog::types::Datum;
use crate::error::{ShiftError, decode_err, encode_err};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";
const TABLE_PREFIX: u8 = b't';
const ENCODED_I64_LEN: usize = 8;

/// Memcomparable key bytes: byte order equals value order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    pub fn from_datums(values: &[Datum]) -> Self {
        let mut out = SmallVec::<[u8; 64]>::new();
        for value in values {
            encode_datum(value, &mut out);
        }
        Self { bytes: out }
    }
}

pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

/// Smallest key strictly greater than `key`.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

fn encode_i64(v: i64, out: &mut impl Extend<u8>) {
    let shifted = (v as u64) ^ 0x8000_0000_0000_0000;
    out.extend(shifted.to_be_bytes());
}

fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; ENCODED_I64_LEN] = bytes.get(..ENCODED_I64_LEN)?.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ 0x8000_0000_0000_0000) as i64)
}

fn encode_datum(v: &Datum, out: &mut SmallVec<[u8; 64]>) {
    match v {
        Datum::Null => out.push(0x00),
        Datum::Int(i) => {
            out.push(0x10);
            encode_i64(*i, out);
        }
        Datum::UInt(u) => {
            out.push(0x11);
            out.extend_from_slice(&u.to_be_bytes());
        }
        Datum::Float(f) => {
            out.push(0x12);
            let bits = f.to_bits();
            let mapped = if (bits >> 63) == 1 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&mapped.to_be_bytes());
        }
        Datum::Time(t) => {
            out.push(0x13);
            encode_i64(*t, out);
        }
        Datum::Text(s) => {
            out.push(0x14);
            append_escaped(s.as_bytes(), out);
        }
        Datum::Json(s) => {
            out.push(0x15);
            append_escaped(s.as_bytes(), out);
        }
        Datum::Bytes(b) => {
            out.push(0x16);
            append_escaped(b, out);
        }
    }
}

fn append_escaped(bytes: &[u8], out: &mut SmallVec<[u8; 64]>) {
    for byte in bytes {
        if *byte == 0 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(*byte);
        }
    }
    out.push(0x00);
}

fn table_prefix(table_id: TableId, sep: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ENCODED_I64_LEN + sep.len() + ENCODED_I64_LEN);
    key.push(TABLE_PREFIX);
    encode_i64(table_id, &mut key);
    key.extend_from_slice(sep);
    key
}

/// Prefix of every row key of one physical table.
pub fn record_prefix(physical_id: TableId) -> Vec<u8> {
    table_prefix(physical_id, RECORD_SEP)
}

pub fn record_key(physical_id: TableId, handle: i64) -> Vec<u8> {
    let mut key = record_prefix(physical_id);
    encode_i64(handle, &mut key);
    key
}

/// `[start, end)` covering all row keys of one physical table.
pub fn record_range(physical_id: TableId) -> (Vec<u8>, Vec<u8>) {
    let start = record_prefix(physical_id);
    let end = prefix_successor(&start).unwrap_or_default();
    (start, end)
}

pub fn decode_record_handle(key: &[u8]) -> Result<i64, ShiftError> {
    let prefix_len = 1 + ENCODED_I64_LEN + RECORD_SEP.len();
    key.get(prefix_len..)
        .and_then(decode_i64)
        .ok_or_else(|| ShiftError::Corruption {
            message: format!("malformed record key of {} bytes", key.len()),
        })
}

pub fn index_prefix(table_id: TableId, index_id: IndexId) -> Vec<u8> {
    let mut key = table_prefix(table_id, INDEX_SEP);
    encode_i64(index_id, &mut key);
    key
}

pub fn index_range(table_id: TableId, index_id: IndexId) -> (Vec<u8>, Vec<u8>) {
    let start = index_prefix(table_id, index_id);
    let end = prefix_successor(&start).unwrap_or_default();
    (start, end)
}

/// Index entry key. Unique entries without NULLs omit the handle so a second
/// row with the same values collides on the key.
pub fn index_key(
    table_id: TableId,
    index_id: IndexId,
    values: &[Datum],
    handle: Option<i64>,
) -> Vec<u8> {
    let mut key = index_prefix(table_id, index_id);
    key.extend_from_slice(EncodedKey::from_datums(values).as_slice());
    if let Some(handle) = handle {
        encode_i64(handle, &mut key);
    }
    key
}

pub fn encode_handle_value(handle: i64) -> Vec<u8> {
    handle.to_be_bytes().to_vec()
}

pub fn decode_handle_value(bytes: &[u8]) -> Result<i64, ShiftError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| ShiftError::Corruption {
        message: format!("malformed index handle of {} bytes", bytes.len()),
    })?;
    Ok(i64::from_be_bytes(raw))
}

/// Stored row: cells keyed by column id. Cells of dropped columns are ignored
/// on read; columns added later fall back to their origin default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowData {
    pub cells: BTreeMap<ColumnId, Datum>,
}

impl RowData {
    pub fn encode(&self) -> Result<Vec<u8>, ShiftError> {
        rmp_serde::to_vec(self).map_err(encode_err)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShiftError> {
        rmp_serde::from_slice(bytes).map_err(decode_err)
    }

    pub fn get(&self, column: ColumnId) -> Option<&Datum> {
        self.cells.get(&column)
    }

    pub fn set(&mut self, column: ColumnId, value: Datum) {
        self.cells.insert(column, value);
    }
}
