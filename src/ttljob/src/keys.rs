//! Order-preserving primary index key codec.
//!
//! An index key is the index prefix followed by one tagged payload per key
//! column:
//!
//! ```text
//! [0x20][table_id: u64 BE][index_id: u64 BE]([tag][payload])*
//! ```
//!
//! Byte-wise comparison of two encoded keys matches the tuple order of the
//! decoded columns, honouring each column's direction. Descending columns store
//! the bitwise complement of the ascending payload; tags are never inverted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INDEX_KEY_PREFIX: u8 = 0x20;
const INDEX_PREFIX_LEN: usize = 1 + 8 + 8;

const TAG_BOOL: u8 = 0x10;
const TAG_INT: u8 = 0x12;
const TAG_TIMESTAMP: u8 = 0x14;
const TAG_STRING: u8 = 0x16;
const TAG_BYTES: u8 = 0x17;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

const SIGN_FLIP_MASK: u64 = 1u64 << 63;

/// Identifier of a table in the catalog.
pub type TableId = u64;

/// Identifier of an index within its table.
pub type IndexId = u64;

/// Type of a primary key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int,
    Timestamp,
    String,
    Bytes,
}

impl ColumnType {
    fn tag(self) -> u8 {
        match self {
            ColumnType::Bool => TAG_BOOL,
            ColumnType::Int => TAG_INT,
            ColumnType::Timestamp => TAG_TIMESTAMP,
            ColumnType::String => TAG_STRING,
            ColumnType::Bytes => TAG_BYTES,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "BOOL",
            ColumnType::Int => "INT8",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::String => "STRING",
            ColumnType::Bytes => "BYTES",
        };
        f.write_str(name)
    }
}

/// Sort direction of an index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// A single primary key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Datum {
    Bool(bool),
    Int(i64),
    Timestamp(DateTime<Utc>),
    String(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Datum::Bool(_) => ColumnType::Bool,
            Datum::Int(_) => ColumnType::Int,
            Datum::Timestamp(_) => ColumnType::Timestamp,
            Datum::String(_) => ColumnType::String,
            Datum::Bytes(_) => ColumnType::Bytes,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Bool(v) => write!(f, "{v}"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Timestamp(v) => write!(f, "'{}'", v.to_rfc3339()),
            Datum::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Datum::Bytes(v) => write!(f, "'\\x{}'", hex::encode(v)),
        }
    }
}

/// Errors produced while decoding an index key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("key too short for index prefix ({0} bytes)")]
    TruncatedPrefix(usize),

    #[error("invalid index key marker {0:#04x}")]
    InvalidMarker(u8),

    #[error("key belongs to table {found}, expected table {expected}")]
    TableMismatch { expected: TableId, found: TableId },

    #[error("column {column}: expected {expected} tag {expected_tag:#04x}, found {found:#04x}")]
    TagMismatch {
        column: usize,
        expected: ColumnType,
        expected_tag: u8,
        found: u8,
    },

    #[error("column {column}: truncated {column_type} payload")]
    TruncatedColumn { column: usize, column_type: ColumnType },

    #[error("column {column}: invalid {column_type} payload")]
    InvalidPayload { column: usize, column_type: ColumnType },

    #[error("{0} trailing bytes after the last key column")]
    TrailingBytes(usize),
}

/// Error produced while encoding an index key.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyEncodeError {
    #[error("column {column}: datum of type {found} does not match column type {expected}")]
    TypeMismatch {
        column: usize,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("{datums} datums for {directions} key column directions")]
    ArityMismatch { datums: usize, directions: usize },
}

fn encode_i64_ordered(value: i64) -> [u8; 8] {
    (value as u64 ^ SIGN_FLIP_MASK).to_be_bytes()
}

fn decode_i64_ordered(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_FLIP_MASK) as i64
}

/// Prefix shared by every key of the given index.
pub fn index_prefix(table_id: TableId, index_id: IndexId) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_PREFIX_LEN);
    out.push(INDEX_KEY_PREFIX);
    out.extend_from_slice(&table_id.to_be_bytes());
    out.extend_from_slice(&index_id.to_be_bytes());
    out
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns an empty key when no such key exists (all bytes are `0xFF`).
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }
    end
}

fn push_escaped(out: &mut Vec<u8>, payload: &[u8], dir: Direction) {
    let start = out.len();
    for &b in payload {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_ZERO);
        } else {
            out.push(b);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
    if dir == Direction::Desc {
        invert(&mut out[start..]);
    }
}

fn invert(bytes: &mut [u8]) {
    for b in bytes {
        *b = !*b;
    }
}

/// Append the encoding of a single column value.
pub fn encode_datum(out: &mut Vec<u8>, datum: &Datum, dir: Direction) {
    out.push(datum.column_type().tag());
    match datum {
        Datum::Bool(v) => {
            let b = u8::from(*v);
            out.push(if dir == Direction::Desc { !b } else { b });
        }
        Datum::Int(v) => push_fixed(out, encode_i64_ordered(*v), dir),
        Datum::Timestamp(v) => push_fixed(out, encode_i64_ordered(v.timestamp_micros()), dir),
        Datum::String(v) => push_escaped(out, v.as_bytes(), dir),
        Datum::Bytes(v) => push_escaped(out, v, dir),
    }
}

fn push_fixed(out: &mut Vec<u8>, mut bytes: [u8; 8], dir: Direction) {
    if dir == Direction::Desc {
        invert(&mut bytes);
    }
    out.extend_from_slice(&bytes);
}

/// Encode a (possibly partial) primary key tuple under the index prefix.
///
/// `types` may be longer than `datums`; a shorter tuple encodes a key prefix.
pub fn encode_index_key(
    table_id: TableId,
    index_id: IndexId,
    types: &[ColumnType],
    dirs: &[Direction],
    datums: &[Datum],
) -> Result<Vec<u8>, KeyEncodeError> {
    let mut out = index_prefix(table_id, index_id);
    encode_key_suffix(&mut out, types, dirs, datums)?;
    Ok(out)
}

/// Append the column portion of a key (without index prefix).
pub fn encode_key_suffix(
    out: &mut Vec<u8>,
    types: &[ColumnType],
    dirs: &[Direction],
    datums: &[Datum],
) -> Result<(), KeyEncodeError> {
    if datums.len() > dirs.len() || datums.len() > types.len() {
        return Err(KeyEncodeError::ArityMismatch {
            datums: datums.len(),
            directions: dirs.len().min(types.len()),
        });
    }
    for (column, datum) in datums.iter().enumerate() {
        if datum.column_type() != types[column] {
            return Err(KeyEncodeError::TypeMismatch {
                column,
                expected: types[column],
                found: datum.column_type(),
            });
        }
        encode_datum(out, datum, dirs[column]);
    }
    Ok(())
}

/// Decode a raw index key into primary key datums.
///
/// Decodes as many columns as the key holds. An empty key, or a key that is
/// exactly an index prefix, decodes to an empty tuple. The index id is not
/// checked so that the end of a primary index span (the next index's prefix)
/// decodes as unbounded.
pub fn decode_index_key_to_datums(
    table_id: TableId,
    types: &[ColumnType],
    dirs: &[Direction],
    key: &[u8],
) -> Result<Vec<Datum>, KeyDecodeError> {
    if key.is_empty() {
        return Ok(Vec::new());
    }
    if key.len() < INDEX_PREFIX_LEN {
        return Err(KeyDecodeError::TruncatedPrefix(key.len()));
    }
    if key[0] != INDEX_KEY_PREFIX {
        return Err(KeyDecodeError::InvalidMarker(key[0]));
    }
    let mut table_bytes = [0u8; 8];
    table_bytes.copy_from_slice(&key[1..9]);
    let found = u64::from_be_bytes(table_bytes);
    if found != table_id {
        return Err(KeyDecodeError::TableMismatch {
            expected: table_id,
            found,
        });
    }

    let mut rest = &key[INDEX_PREFIX_LEN..];
    let mut datums = Vec::new();
    for (column, (&column_type, &dir)) in types.iter().zip(dirs).enumerate() {
        if rest.is_empty() {
            break;
        }
        let (datum, remaining) = decode_datum(rest, column, column_type, dir)?;
        datums.push(datum);
        rest = remaining;
    }
    if !rest.is_empty() {
        return Err(KeyDecodeError::TrailingBytes(rest.len()));
    }
    Ok(datums)
}

fn decode_datum(
    buf: &[u8],
    column: usize,
    column_type: ColumnType,
    dir: Direction,
) -> Result<(Datum, &[u8]), KeyDecodeError> {
    let expected_tag = column_type.tag();
    if buf[0] != expected_tag {
        return Err(KeyDecodeError::TagMismatch {
            column,
            expected: column_type,
            expected_tag,
            found: buf[0],
        });
    }
    let buf = &buf[1..];
    let truncated = KeyDecodeError::TruncatedColumn {
        column,
        column_type,
    };
    let maybe_invert = |b: u8| if dir == Direction::Desc { !b } else { b };

    match column_type {
        ColumnType::Bool => {
            let b = maybe_invert(*buf.first().ok_or(truncated)?);
            let v = match b {
                0 => false,
                1 => true,
                _ => {
                    return Err(KeyDecodeError::InvalidPayload {
                        column,
                        column_type,
                    });
                }
            };
            Ok((Datum::Bool(v), &buf[1..]))
        }
        ColumnType::Int | ColumnType::Timestamp => {
            if buf.len() < 8 {
                return Err(truncated);
            }
            let mut raw = [0u8; 8];
            for (dst, src) in raw.iter_mut().zip(&buf[..8]) {
                *dst = maybe_invert(*src);
            }
            let v = decode_i64_ordered(raw);
            let datum = if column_type == ColumnType::Int {
                Datum::Int(v)
            } else {
                let ts = DateTime::<Utc>::from_timestamp_micros(v).ok_or(
                    KeyDecodeError::InvalidPayload {
                        column,
                        column_type,
                    },
                )?;
                Datum::Timestamp(ts)
            };
            Ok((datum, &buf[8..]))
        }
        ColumnType::String | ColumnType::Bytes => {
            let mut payload = Vec::new();
            let mut i = 0;
            loop {
                let b = maybe_invert(*buf.get(i).ok_or_else(|| truncated.clone())?);
                if b != ESCAPE {
                    payload.push(b);
                    i += 1;
                    continue;
                }
                let next = maybe_invert(*buf.get(i + 1).ok_or_else(|| truncated.clone())?);
                i += 2;
                match next {
                    TERMINATOR => break,
                    ESCAPED_ZERO => payload.push(0),
                    _ => {
                        return Err(KeyDecodeError::InvalidPayload {
                            column,
                            column_type,
                        });
                    }
                }
            }
            let datum = if column_type == ColumnType::String {
                Datum::String(String::from_utf8(payload).map_err(|_| {
                    KeyDecodeError::InvalidPayload {
                        column,
                        column_type,
                    }
                })?)
            } else {
                Datum::Bytes(payload)
            };
            Ok((datum, &buf[i..]))
        }
    }
}
