//! Generic CBOR tree for verified payloads and the typed views the
//! revocation service publishes.
//!
//! Decoded payload shapes:
//! - kid list: `{ kid(bstr) => { variant(bstr,1) => count } }`
//! - index: `{ byte1(bstr,1) => [timestamp, count, { byte2(bstr,1) => [timestamp, count] }] }`
//! - chunk list: `[ bstr(16), ... ]`

use std::collections::BTreeMap;
use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::types::{Byte2Entry, HashPrefix, IndexEntry, Kid, KidEntry, RevocationIndex};

const MAX_DEPTH: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed payload: {0}")]
pub struct PayloadError(pub String);

impl PayloadError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<minicbor::decode::Error> for PayloadError {
    fn from(e: minicbor::decode::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<minicbor::encode::Error<Infallible>> for PayloadError {
    fn from(e: minicbor::encode::Error<Infallible>) -> Self {
        Self(e.to_string())
    }
}

/// Structured binary object decoded from a verified envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CborValue {
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
    Bool(bool),
    Null,
}

impl CborValue {
    /// Decode a single CBOR item. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut dec = Decoder::new(bytes);
        let value = decode_value(&mut dec, 0)?;
        if dec.position() != bytes.len() {
            return Err(PayloadError::new("trailing bytes after payload"));
        }
        Ok(value)
    }

    /// Encode this value as definite-length CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut out = Vec::new();
        encode_value(&mut Encoder::new(&mut out), self)?;
        Ok(out)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CborValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CborValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CborValue]> {
        match self {
            CborValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CborValue, CborValue)]> {
        match self {
            CborValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a map entry by integer key.
    pub fn get_int_key(&self, key: i64) -> Option<&CborValue> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_int() == Some(key))
            .map(|(_, v)| v)
    }
}

fn decode_value(dec: &mut Decoder<'_>, depth: usize) -> Result<CborValue, PayloadError> {
    if depth > MAX_DEPTH {
        return Err(PayloadError::new("payload nesting too deep"));
    }

    match dec.datatype()? {
        Type::Null | Type::Undefined => {
            dec.skip()?;
            Ok(CborValue::Null)
        }
        Type::Bool => Ok(CborValue::Bool(dec.bool()?)),
        Type::Bytes => Ok(CborValue::Bytes(dec.bytes()?.to_vec())),
        Type::String => Ok(CborValue::Text(dec.str()?.to_string())),
        Type::I8
        | Type::I16
        | Type::I32
        | Type::I64
        | Type::Int
        | Type::U8
        | Type::U16
        | Type::U32
        | Type::U64 => Ok(CborValue::Int(dec.i64()?)),
        Type::Tag => {
            dec.tag()?;
            decode_value(dec, depth + 1)
        }
        Type::Array => {
            let len = dec
                .array()?
                .ok_or_else(|| PayloadError::new("indefinite-length arrays are not supported"))?;
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(decode_value(dec, depth + 1)?);
            }
            Ok(CborValue::Array(items))
        }
        Type::Map => {
            let len = dec
                .map()?
                .ok_or_else(|| PayloadError::new("indefinite-length maps are not supported"))?;
            let mut entries = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                let key = decode_value(dec, depth + 1)?;
                let value = decode_value(dec, depth + 1)?;
                entries.push((key, value));
            }
            Ok(CborValue::Map(entries))
        }
        other => Err(PayloadError::new(format!(
            "unsupported CBOR item: {other:?}"
        ))),
    }
}

fn encode_value<W: minicbor::encode::Write>(
    enc: &mut Encoder<W>,
    value: &CborValue,
) -> Result<(), minicbor::encode::Error<W::Error>> {
    match value {
        CborValue::Int(i) => {
            enc.i64(*i)?;
        }
        CborValue::Bytes(b) => {
            enc.bytes(b)?;
        }
        CborValue::Text(s) => {
            enc.str(s)?;
        }
        CborValue::Bool(b) => {
            enc.bool(*b)?;
        }
        CborValue::Null => {
            enc.null()?;
        }
        CborValue::Array(items) => {
            enc.array(items.len() as u64)?;
            for item in items {
                encode_value(enc, item)?;
            }
        }
        CborValue::Map(entries) => {
            enc.map(entries.len() as u64)?;
            for (k, v) in entries {
                encode_value(enc, k)?;
                encode_value(enc, v)?;
            }
        }
    }
    Ok(())
}

fn byte_key(value: &CborValue, what: &str) -> Result<u8, PayloadError> {
    value
        .as_bytes()
        .and_then(|b| b.first().copied())
        .ok_or_else(|| PayloadError::new(format!("{what} key is not a non-empty byte string")))
}

fn count(value: &CborValue, what: &str) -> Result<u32, PayloadError> {
    value
        .as_int()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| PayloadError::new(format!("{what} count is not a non-negative integer")))
}

fn timestamp(value: &CborValue, what: &str) -> Result<i64, PayloadError> {
    value
        .as_int()
        .ok_or_else(|| PayloadError::new(format!("{what} timestamp is not an integer")))
}

/// Decode `kid.lst`.
pub fn decode_kid_list(value: &CborValue) -> Result<Vec<KidEntry>, PayloadError> {
    let entries = value
        .as_map()
        .ok_or_else(|| PayloadError::new("kid list is not a map"))?;

    entries
        .iter()
        .map(|(kid, variants)| {
            let kid = kid
                .as_bytes()
                .filter(|b| !b.is_empty())
                .map(Kid::new)
                .ok_or_else(|| PayloadError::new("kid is not a non-empty byte string"))?;
            let variants = variants
                .as_map()
                .ok_or_else(|| PayloadError::new(format!("hash variants of {kid} are not a map")))?;

            let mut hash_variants = BTreeMap::new();
            for (variant, n) in variants {
                hash_variants.insert(byte_key(variant, "hash variant")?, count(n, "hash variant")?);
            }
            Ok(KidEntry { kid, hash_variants })
        })
        .collect()
}

/// Decode `<kid><variant>/index.lst`.
pub fn decode_index(value: &CborValue) -> Result<RevocationIndex, PayloadError> {
    let entries = value
        .as_map()
        .ok_or_else(|| PayloadError::new("index is not a map"))?;

    let mut index = RevocationIndex::new();
    for (byte1, entry) in entries {
        let byte1 = byte_key(byte1, "byte1")?;
        let fields = entry
            .as_array()
            .filter(|f| f.len() >= 3)
            .ok_or_else(|| PayloadError::new(format!("index entry {byte1:02x} is not [ts, n, map]")))?;

        let byte2_entries = fields[2]
            .as_map()
            .ok_or_else(|| PayloadError::new(format!("byte2 map of {byte1:02x} is not a map")))?;

        let mut byte2 = BTreeMap::new();
        for (key, sub) in byte2_entries {
            let key = byte_key(key, "byte2")?;
            let sub_fields = sub
                .as_array()
                .filter(|f| f.len() >= 2)
                .ok_or_else(|| PayloadError::new(format!("byte2 entry {key:02x} is not [ts, n]")))?;
            byte2.insert(
                key,
                Byte2Entry {
                    timestamp: timestamp(&sub_fields[0], "byte2")?,
                    count: count(&sub_fields[1], "byte2")?,
                },
            );
        }

        index.insert(
            byte1,
            IndexEntry {
                timestamp: timestamp(&fields[0], "byte1")?,
                count: count(&fields[1], "byte1")?,
                byte2,
            },
        );
    }
    Ok(index)
}

/// Decode `.../chunk.lst`. Every entry must be exactly 16 bytes.
pub fn decode_chunk_list(value: &CborValue) -> Result<Vec<HashPrefix>, PayloadError> {
    let items = value
        .as_array()
        .ok_or_else(|| PayloadError::new("chunk list is not an array"))?;

    items
        .iter()
        .map(|item| {
            item.as_bytes()
                .and_then(HashPrefix::from_slice)
                .ok_or_else(|| PayloadError::new("chunk entry is not a 16-byte string"))
        })
        .collect()
}
