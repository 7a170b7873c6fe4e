//! Key spans assigned to a processor and the primary key bounds derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys::{
    ColumnType, Datum, Direction, KeyDecodeError, KeyEncodeError, TableId,
    decode_index_key_to_datums, encode_key_suffix,
};

/// Raw key range `[key, end_key)` over a table's primary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end_key: Vec<u8>,
}

impl Span {
    pub fn new(key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Which end of a span failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanBoundary {
    Start,
    End,
}

impl fmt::Display for SpanBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanBoundary::Start => f.write_str("startKey"),
            SpanBoundary::End => f.write_str("endKey"),
        }
    }
}

/// Decoding failure for one span boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundsDecodeError {
    pub boundary: SpanBoundary,
    pub key: Vec<u8>,
    pub source: KeyDecodeError,
}

/// Half-open primary key range `[start, end)` scanned by one worker.
///
/// Either side may be a key prefix; an empty tuple leaves that side
/// unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBounds {
    pub start: Vec<Datum>,
    pub end: Vec<Datum>,
}

impl QueryBounds {
    /// Decode both ends of a span against the primary index layout.
    pub fn from_span(
        table_id: TableId,
        types: &[ColumnType],
        dirs: &[Direction],
        span: &Span,
    ) -> Result<Self, BoundsDecodeError> {
        let decode = |boundary, key: &[u8]| {
            decode_index_key_to_datums(table_id, types, dirs, key).map_err(|source| {
                BoundsDecodeError {
                    boundary,
                    key: key.to_vec(),
                    source,
                }
            })
        };
        Ok(Self {
            start: decode(SpanBoundary::Start, span.key.as_slice())?,
            end: decode(SpanBoundary::End, span.end_key.as_slice())?,
        })
    }

    /// Encoded forms of both ends, suffix only (no index prefix).
    ///
    /// Comparing an encoded row key suffix against these with
    /// [`EncodedBounds::contains`] yields the same answer as a tuple
    /// comparison under the index's column directions.
    pub fn encode(
        &self,
        types: &[ColumnType],
        dirs: &[Direction],
    ) -> Result<EncodedBounds, KeyEncodeError> {
        let mut start = Vec::new();
        encode_key_suffix(&mut start, types, dirs, &self.start)?;
        let mut end = Vec::new();
        encode_key_suffix(&mut end, types, dirs, &self.end)?;
        Ok(EncodedBounds {
            start,
            end: (!self.end.is_empty()).then_some(end),
        })
    }
}

impl fmt::Display for QueryBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tuple = |datums: &[Datum]| {
            datums
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "[({}), ({}))", tuple(&self.start), tuple(&self.end))
    }
}

/// Byte-comparable form of [`QueryBounds`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBounds {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl EncodedBounds {
    /// Whether an encoded key suffix lies in `[start, end)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.start.as_slice() {
            return false;
        }
        match &self.end {
            Some(end) => key < end.as_slice(),
            None => true,
        }
    }
}
