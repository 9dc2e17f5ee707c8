//! The value codec boundary. Parameters are serialized to a compact
//! binary representation before transmission; page values arrive as byte
//! sequences the codec decodes back into domain values. A default
//! implementation is provided so callers are not forced to bring their own
//! just to get started.

use thiserror::Error;

use crate::transport::EncodedValue;

/// A decoded ledger value. Deliberately small and self-describing; the
/// driver core only needs enough structure to support table-name
/// enumeration (`get_table_names`) and to hand values back to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// Injectable encode/decode seam between domain [`Value`]s and the wire
/// binary form the transport moves around.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<EncodedValue, CodecError>;
    fn decode(&self, bytes: &EncodedValue) -> Result<Value, CodecError>;
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;

/// A tagged binary encoding: one tag byte, then a type-specific body
/// (fixed-width for scalars, a 4-byte big-endian length prefix for
/// variable-width values). Good enough to round-trip every [`Value`]
/// variant without depending on an external serialization crate the rest
/// of the driver has no other use for.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValueCodec;

impl DefaultValueCodec {
    fn encode_into(value: &Value, out: &mut Vec<u8>) {
        match value {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_be_bytes());
            }
            Value::String(s) => {
                out.push(TAG_STRING);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(TAG_LIST);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    Self::encode_into(item, out);
                }
            }
        }
    }

    fn decode_from(bytes: &[u8], pos: &mut usize) -> Result<Value, CodecError> {
        let tag = *bytes
            .get(*pos)
            .ok_or_else(|| CodecError::Decode("truncated tag".into()))?;
        *pos += 1;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => {
                let b = *bytes
                    .get(*pos)
                    .ok_or_else(|| CodecError::Decode("truncated bool".into()))?;
                *pos += 1;
                Ok(Value::Bool(b != 0))
            }
            TAG_INT => {
                let slice = bytes
                    .get(*pos..*pos + 8)
                    .ok_or_else(|| CodecError::Decode("truncated int".into()))?;
                *pos += 8;
                Ok(Value::Int(i64::from_be_bytes(slice.try_into().unwrap())))
            }
            TAG_FLOAT => {
                let slice = bytes
                    .get(*pos..*pos + 8)
                    .ok_or_else(|| CodecError::Decode("truncated float".into()))?;
                *pos += 8;
                Ok(Value::Float(f64::from_be_bytes(slice.try_into().unwrap())))
            }
            TAG_STRING => {
                let len = Self::read_len(bytes, pos)?;
                let slice = bytes
                    .get(*pos..*pos + len)
                    .ok_or_else(|| CodecError::Decode("truncated string".into()))?;
                *pos += len;
                let s = String::from_utf8(slice.to_vec())
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                Ok(Value::String(s))
            }
            TAG_BYTES => {
                let len = Self::read_len(bytes, pos)?;
                let slice = bytes
                    .get(*pos..*pos + len)
                    .ok_or_else(|| CodecError::Decode("truncated bytes".into()))?;
                *pos += len;
                Ok(Value::Bytes(slice.to_vec()))
            }
            TAG_LIST => {
                let len = Self::read_len(bytes, pos)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Self::decode_from(bytes, pos)?);
                }
                Ok(Value::List(items))
            }
            other => Err(CodecError::Decode(format!("unknown tag {other}"))),
        }
    }

    fn read_len(bytes: &[u8], pos: &mut usize) -> Result<usize, CodecError> {
        let slice = bytes
            .get(*pos..*pos + 4)
            .ok_or_else(|| CodecError::Decode("truncated length".into()))?;
        *pos += 4;
        Ok(u32::from_be_bytes(slice.try_into().unwrap()) as usize)
    }
}

impl ValueCodec for DefaultValueCodec {
    fn encode(&self, value: &Value) -> Result<EncodedValue, CodecError> {
        let mut out = Vec::new();
        Self::encode_into(value, &mut out);
        Ok(EncodedValue(out))
    }

    fn decode(&self, bytes: &EncodedValue) -> Result<Value, CodecError> {
        let mut pos = 0;
        let value = Self::decode_from(&bytes.0, &mut pos)?;
        if pos != bytes.0.len() {
            return Err(CodecError::Decode("trailing bytes after value".into()));
        }
        Ok(value)
    }
}
