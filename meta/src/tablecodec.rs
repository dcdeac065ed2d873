//! Stable key/value layout for rows and index entries.
//!
//! Row key:   `t{table_id}_r{handle}`
//! Index key: `t{table_id}_i{index_id}{values}` plus `{handle}` when the entry
//! is not distinct (non-unique index, or a unique index over a NULL value).
//!
//! Integers are 8 bytes big-endian with the sign bit flipped, so byte order
//! matches numeric order. Index values use a memcomparable encoding where
//! `NULL` sorts before integers and integers before strings.

use crate::model::Datum;
use crate::model::IndexInfo;
use std::collections::BTreeMap;
use thiserror::Error;

const TABLE_PREFIX: u8 = b't';
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";

const NIL_FLAG: u8 = 0x00;
const INT_FLAG: u8 = 0x03;
const BYTES_FLAG: u8 = 0x04;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xff;
const ENC_PAD: u8 = 0x00;

/// Value stored for non-distinct index entries; the handle lives in the key.
const NON_UNIQUE_VALUE: &[u8] = b"0";

const RECORD_KEY_LEN: usize = 1 + 8 + 2 + 8;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("key too short to hold {what}")]
    Truncated { what: &'static str },

    #[error("not a record key")]
    NotRecordKey,

    #[error("row value is not valid json: {0}")]
    Row(#[from] serde_json::Error),
}

pub fn encode_int_cmp(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_int_cmp(bytes: &[u8]) -> Result<i64, CodecError> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(CodecError::Truncated { what: "integer" })?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

pub fn table_prefix(table_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&encode_int_cmp(table_id));
    key
}

pub fn record_prefix(table_id: i64) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(RECORD_SEP);
    key
}

pub fn record_key(table_id: i64, handle: i64) -> Vec<u8> {
    let mut key = record_prefix(table_id);
    key.extend_from_slice(&encode_int_cmp(handle));
    key
}

/// Splits a row key into `(table_id, handle)`.
pub fn decode_record_key(key: &[u8]) -> Result<(i64, i64), CodecError> {
    if key.len() != RECORD_KEY_LEN || key[0] != TABLE_PREFIX || &key[9..11] != RECORD_SEP {
        return Err(CodecError::NotRecordKey);
    }
    let table_id = decode_int_cmp(&key[1..9])?;
    let handle = decode_int_cmp(&key[11..])?;
    Ok((table_id, handle))
}

pub fn index_prefix(table_id: i64, index_id: i64) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(INDEX_SEP);
    key.extend_from_slice(&encode_int_cmp(index_id));
    key
}

/// `[start, end)` covering every index entry of `table_id`.
pub fn index_range(table_id: i64) -> (Vec<u8>, Vec<u8>) {
    let mut start = table_prefix(table_id);
    start.extend_from_slice(INDEX_SEP);
    let end = prefix_end(&start);
    (start, end)
}

/// One physical index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Distinct entries are keyed by value only, so a second handle collides.
    pub distinct: bool,
}

pub fn index_entry(table_id: i64, index: &IndexInfo, values: &[Datum], handle: i64) -> IndexEntry {
    let distinct = index.unique && !values.iter().any(Datum::is_null);
    let mut key = index_prefix(table_id, index.id);
    encode_datums(&mut key, values);
    if distinct {
        IndexEntry {
            key,
            value: encode_int_cmp(handle).to_vec(),
            distinct,
        }
    } else {
        key.extend_from_slice(&encode_int_cmp(handle));
        IndexEntry {
            key,
            value: NON_UNIQUE_VALUE.to_vec(),
            distinct,
        }
    }
}

/// Handle referenced by an index entry.
pub fn index_entry_handle(key: &[u8], value: &[u8]) -> Result<i64, CodecError> {
    if value.len() == 8 {
        return decode_int_cmp(value);
    }
    let start = key
        .len()
        .checked_sub(8)
        .ok_or(CodecError::Truncated { what: "index handle" })?;
    decode_int_cmp(&key[start..])
}

pub fn encode_datums(buf: &mut Vec<u8>, values: &[Datum]) {
    for value in values {
        match value {
            Datum::Null => buf.push(NIL_FLAG),
            Datum::Int(value) => {
                buf.push(INT_FLAG);
                buf.extend_from_slice(&encode_int_cmp(*value));
            }
            Datum::Text(value) => {
                buf.push(BYTES_FLAG);
                encode_bytes(buf, value.as_bytes());
            }
        }
    }
}

/// Groups of 8 bytes, each followed by a marker counting the padding, so
/// prefixes of a string sort before the string.
fn encode_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(ENC_GROUP_SIZE) {
        buf.extend_from_slice(chunk);
        let pad = ENC_GROUP_SIZE - chunk.len();
        buf.extend(std::iter::repeat_n(ENC_PAD, pad));
        buf.push(ENC_MARKER - pad as u8);
    }
    if data.len() % ENC_GROUP_SIZE == 0 {
        buf.extend_from_slice(&[ENC_PAD; ENC_GROUP_SIZE]);
        buf.push(ENC_MARKER - ENC_GROUP_SIZE as u8);
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: no finite upper bound shorter than the prefix itself.
    let mut end = prefix.to_vec();
    end.push(0);
    end
}

/// Smallest key strictly greater than `key`.
pub fn key_next(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

pub fn encode_row(row: &BTreeMap<i64, Datum>) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(row)?)
}

pub fn decode_row(value: &[u8]) -> Result<BTreeMap<i64, Datum>, CodecError> {
    Ok(serde_json::from_slice(value)?)
}
