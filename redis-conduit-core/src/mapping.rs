//! Per-type representation choices for decoded replies
//!
//! A [`TypeMapping`] is a small immutable value. The client holds a default
//! one from its configuration; derived views (and individual commands) can
//! carry a different one without affecting anybody else.

use crate::error::{RedisError, RedisResult};
use crate::types::RedisValue;
use crate::value::RespValue;

/// How RESP3 maps (and RESP2 pair lists turned into maps) are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapRepr {
    /// [`RedisValue::Record`], keys converted to text
    #[default]
    Record,
    /// [`RedisValue::Map`], keys kept as values
    Map,
    /// [`RedisValue::Array`] of alternating keys and values
    Array,
}

/// How blob strings are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobRepr {
    /// UTF-8 text; payloads that are not valid UTF-8 stay as bytes
    #[default]
    Text,
    /// Raw bytes
    Bytes,
}

/// How RESP3 sets are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetRepr {
    /// [`RedisValue::Array`]
    #[default]
    Array,
    /// [`RedisValue::Set`]
    Set,
}

/// How RESP3 doubles are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoubleRepr {
    /// [`RedisValue::Double`]
    #[default]
    Number,
    /// The textual form, as RESP2 would have sent it
    Text,
}

/// How RESP3 big numbers are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BigNumberRepr {
    /// [`RedisValue::BigNumber`] holding the digits
    #[default]
    Text,
    /// [`RedisValue::Int`]; values out of `i64` range are an error
    Integer,
}

/// How RESP3 verbatim strings are represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerbatimRepr {
    /// Plain [`RedisValue::String`], the format tag is dropped
    #[default]
    Text,
    /// [`RedisValue::Verbatim`] keeping the format tag
    Verbatim,
}

/// Representation choice for every tag that has more than one sensible form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeMapping {
    /// Maps
    pub map: MapRepr,
    /// Blob strings
    pub blob_string: BlobRepr,
    /// Sets
    pub set: SetRepr,
    /// Doubles
    pub double: DoubleRepr,
    /// Big numbers
    pub big_number: BigNumberRepr,
    /// Verbatim strings
    pub verbatim_string: VerbatimRepr,
}

impl TypeMapping {
    /// Override the map representation
    #[must_use]
    pub const fn with_map(mut self, repr: MapRepr) -> Self {
        self.map = repr;
        self
    }

    /// Override the blob string representation
    #[must_use]
    pub const fn with_blob_string(mut self, repr: BlobRepr) -> Self {
        self.blob_string = repr;
        self
    }

    /// Override the set representation
    #[must_use]
    pub const fn with_set(mut self, repr: SetRepr) -> Self {
        self.set = repr;
        self
    }

    /// Override the double representation
    #[must_use]
    pub const fn with_double(mut self, repr: DoubleRepr) -> Self {
        self.double = repr;
        self
    }

    /// Override the big number representation
    #[must_use]
    pub const fn with_big_number(mut self, repr: BigNumberRepr) -> Self {
        self.big_number = repr;
        self
    }

    /// Override the verbatim string representation
    #[must_use]
    pub const fn with_verbatim_string(mut self, repr: VerbatimRepr) -> Self {
        self.verbatim_string = repr;
        self
    }

    /// Convert a decoded frame into the caller-visible value.
    ///
    /// Error frames, including ones nested inside aggregates, become errors.
    ///
    /// # Errors
    ///
    /// Returns the server error carried by an error frame, or a type error
    /// when a value cannot take the requested representation.
    pub fn apply(&self, frame: RespValue) -> RedisResult<RedisValue> {
        Ok(match frame {
            RespValue::SimpleString(s) => RedisValue::String(s),
            RespValue::Error(msg) => return Err(RedisError::from_server_message(&msg)),
            RespValue::Integer(i) => RedisValue::Int(i),
            RespValue::BulkString(b) => match self.blob_string {
                BlobRepr::Bytes => RedisValue::Bytes(b),
                BlobRepr::Text => match std::str::from_utf8(&b) {
                    Ok(s) => RedisValue::String(s.to_string()),
                    Err(_) => RedisValue::Bytes(b),
                },
            },
            RespValue::Null => RedisValue::Nil,
            RespValue::Array(items) | RespValue::Push(items) => {
                RedisValue::Array(self.apply_all(items)?)
            }
            RespValue::Map(pairs) => self.apply_pairs(pairs)?,
            RespValue::Set(items) => {
                let items = self.apply_all(items)?;
                match self.set {
                    SetRepr::Array => RedisValue::Array(items),
                    SetRepr::Set => RedisValue::Set(items),
                }
            }
            RespValue::Double(d) => match self.double {
                DoubleRepr::Number => RedisValue::Double(d),
                DoubleRepr::Text => RedisValue::String(format_double(d)),
            },
            RespValue::Boolean(b) => RedisValue::Bool(b),
            RespValue::BigNumber(digits) => match self.big_number {
                BigNumberRepr::Text => RedisValue::BigNumber(digits),
                BigNumberRepr::Integer => RedisValue::Int(digits.parse::<i64>().map_err(|e| {
                    RedisError::Type(format!("Big number {digits} does not fit in i64: {e}"))
                })?),
            },
            RespValue::VerbatimString { format, text } => {
                let text = String::from_utf8(text.to_vec())
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))?;
                match self.verbatim_string {
                    VerbatimRepr::Text => RedisValue::String(text),
                    VerbatimRepr::Verbatim => RedisValue::Verbatim { format, text },
                }
            }
        })
    }

    /// Convert a list of key/value frames according to the map representation.
    ///
    /// Used both for RESP3 maps and for RESP2 replies that are logically maps
    /// but arrive as flat arrays.
    ///
    /// # Errors
    ///
    /// Returns an error if any key or value fails to convert.
    pub fn apply_pairs(&self, pairs: Vec<(RespValue, RespValue)>) -> RedisResult<RedisValue> {
        match self.map {
            MapRepr::Record => {
                let mut fields = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    fields.push((record_key(k)?, self.apply(v)?));
                }
                Ok(RedisValue::Record(fields))
            }
            MapRepr::Map => {
                let mut entries = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    entries.push((self.apply(k)?, self.apply(v)?));
                }
                Ok(RedisValue::Map(entries))
            }
            MapRepr::Array => {
                let mut flat = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    flat.push(self.apply(k)?);
                    flat.push(self.apply(v)?);
                }
                Ok(RedisValue::Array(flat))
            }
        }
    }

    fn apply_all(&self, items: Vec<RespValue>) -> RedisResult<Vec<RedisValue>> {
        items.into_iter().map(|item| self.apply(item)).collect()
    }
}

fn record_key(key: RespValue) -> RedisResult<String> {
    match key {
        RespValue::Boolean(b) => Ok(b.to_string()),
        RespValue::Array(_) | RespValue::Map(_) | RespValue::Set(_) | RespValue::Push(_) => Err(
            RedisError::Type(format!("A {} cannot be a record key", key.type_name())),
        ),
        other => other.as_string(),
    }
}

/// Text form of a double, matching what RESP2 servers send.
#[must_use]
pub fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        if d > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        d.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_map() -> RespValue {
        RespValue::Map(vec![
            (RespValue::SimpleString("name".into()), RespValue::from("alice")),
            (RespValue::SimpleString("score".into()), RespValue::Double(1.5)),
        ])
    }

    #[test]
    fn test_default_map_is_record() {
        let value = TypeMapping::default().apply(sample_map()).unwrap();
        assert_eq!(
            value,
            RedisValue::Record(vec![
                ("name".to_string(), RedisValue::String("alice".into())),
                ("score".to_string(), RedisValue::Double(1.5)),
            ])
        );
    }

    #[test]
    fn test_map_as_array_keeps_order() {
        let mapping = TypeMapping::default()
            .with_map(MapRepr::Array)
            .with_double(DoubleRepr::Text);
        let value = mapping.apply(sample_map()).unwrap();
        assert_eq!(
            value,
            RedisValue::Array(vec![
                RedisValue::String("name".into()),
                RedisValue::String("alice".into()),
                RedisValue::String("score".into()),
                RedisValue::String("1.5".into()),
            ])
        );
    }

    #[test]
    fn test_blob_as_bytes() {
        let mapping = TypeMapping::default().with_blob_string(BlobRepr::Bytes);
        let value = mapping.apply(RespValue::from("abc")).unwrap();
        assert_eq!(value, RedisValue::Bytes(Bytes::from_static(b"abc")));
    }

    #[test]
    fn test_invalid_utf8_stays_bytes() {
        let value = TypeMapping::default()
            .apply(RespValue::BulkString(Bytes::from_static(&[0xff, 0xfe])))
            .unwrap();
        assert!(matches!(value, RedisValue::Bytes(_)));
    }

    #[test]
    fn test_nested_error_fails() {
        let frame = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::Error("WRONGTYPE Operation against a key".into()),
        ]);
        assert!(TypeMapping::default().apply(frame).is_err());
    }

    #[test]
    fn test_big_number_as_integer() {
        let mapping = TypeMapping::default().with_big_number(BigNumberRepr::Integer);
        assert_eq!(
            mapping.apply(RespValue::BigNumber("42".into())).unwrap(),
            RedisValue::Int(42)
        );
        assert!(mapping
            .apply(RespValue::BigNumber("3492890328409238509324850943850943825024385".into()))
            .is_err());
    }

    #[test]
    fn test_verbatim() {
        let frame = RespValue::VerbatimString {
            format: "txt".into(),
            text: Bytes::from_static(b"hello"),
        };
        assert_eq!(
            TypeMapping::default().apply(frame.clone()).unwrap(),
            RedisValue::String("hello".into())
        );
        let mapping = TypeMapping::default().with_verbatim_string(VerbatimRepr::Verbatim);
        assert_eq!(
            mapping.apply(frame).unwrap(),
            RedisValue::Verbatim {
                format: "txt".into(),
                text: "hello".into()
            }
        );
    }
}
