//! RESP (`REdis` Serialization Protocol) value types

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;

/// One decoded RESP frame, RESP2 and RESP3 kinds alike.
///
/// Frames are what the codec produces; callers normally see them only after
/// a [`TypeMapping`](crate::mapping::TypeMapping) has turned them into a
/// [`RedisValue`](crate::types::RedisValue).
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(String),
    /// Error: -ERR message\r\n, or a RESP3 blob error !<len>\r\n...
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// Null bulk string ($-1), null array (*-1) or RESP3 null (_)
    Null,
    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
    /// RESP3 map: %1\r\n+key\r\n:1\r\n, pairs kept in wire order
    Map(Vec<(RespValue, RespValue)>),
    /// RESP3 set: ~2\r\n+a\r\n+b\r\n
    Set(Vec<RespValue>),
    /// RESP3 double: ,3.14\r\n
    Double(f64),
    /// RESP3 boolean: #t\r\n
    Boolean(bool),
    /// RESP3 big number: (3492890328409238509324850943850943825024385\r\n
    BigNumber(String),
    /// RESP3 verbatim string: =15\r\ntxt:Some string\r\n
    VerbatimString {
        /// Three-letter format, e.g. `txt` or `mkd`
        format: String,
        /// The text after the `format:` prefix
        text: Bytes,
    },
    /// RESP3 push: >3\r\n$7\r\nmessage\r\n...
    Push(Vec<RespValue>),
}

impl RespValue {
    /// Convert to a string if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a string.
    pub fn as_string(&self) -> RedisResult<String> {
        match self {
            Self::SimpleString(s) | Self::BigNumber(s) => Ok(s.clone()),
            Self::BulkString(b) | Self::VerbatimString { text: b, .. } => {
                String::from_utf8(b.to_vec())
                    .map_err(|e| RedisError::Type(format!("Invalid UTF-8: {e}")))
            }
            Self::Integer(i) => Ok(i.to_string()),
            Self::Double(d) => Ok(d.to_string()),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to string"
            ))),
        }
    }

    /// Convert to an integer if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an integer.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Boolean(b) => Ok(i64::from(*b)),
            Self::BulkString(_) | Self::SimpleString(_) | Self::BigNumber(_) => {
                let s = self.as_string()?;
                s.parse::<i64>()
                    .map_err(|e| RedisError::Type(format!("Cannot parse integer: {e}")))
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to integer"
            ))),
        }
    }

    /// Convert to a float if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to a float.
    pub fn as_double(&self) -> RedisResult<f64> {
        match self {
            Self::Double(d) => Ok(*d),
            Self::Integer(i) => Ok(*i as f64),
            Self::BulkString(_) | Self::SimpleString(_) => {
                let s = self.as_string()?;
                parse_double(&s)
            }
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to double"
            ))),
        }
    }

    /// Convert to bytes if possible
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to bytes.
    pub fn as_bytes(&self) -> RedisResult<Bytes> {
        match self {
            Self::BulkString(b) | Self::VerbatimString { text: b, .. } => Ok(b.clone()),
            Self::SimpleString(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
            Self::Null => Err(RedisError::Type("Value is null".to_string())),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {self:?} to bytes"
            ))),
        }
    }

    /// Convert to an array if possible; sets and pushes count as arrays
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to an array.
    pub fn into_array(self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(arr) | Self::Set(arr) | Self::Push(arr) => Ok(arr),
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to array"
            ))),
        }
    }

    /// Key/value pairs of a RESP3 map, or of a RESP2 flat array of alternating entries
    ///
    /// # Errors
    ///
    /// Returns an error for odd-length arrays and non-aggregate values.
    pub fn into_pairs(self) -> RedisResult<Vec<(Self, Self)>> {
        match self {
            Self::Map(pairs) => Ok(pairs),
            Self::Array(items) => {
                if items.len() % 2 != 0 {
                    return Err(RedisError::Type(format!(
                        "Cannot pair an array of odd length {}",
                        items.len()
                    )));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Ok(pairs)
            }
            other => Err(RedisError::Type(format!(
                "Cannot convert {other:?} to key/value pairs"
            ))),
        }
    }

    /// Check if this is a null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is an error
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Check if this is a RESP3 push frame
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(self, Self::Push(_))
    }

    /// Extract error message if this is an error
    #[must_use]
    pub fn into_error(self) -> Option<String> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Turn an error frame into a [`RedisError`], passing any other frame through.
    ///
    /// # Errors
    ///
    /// Returns the decoded server error when the frame is an error.
    pub fn into_result(self) -> RedisResult<Self> {
        match self {
            Self::Error(msg) => Err(RedisError::from_server_message(&msg)),
            other => Ok(other),
        }
    }

    /// Short tag for logs and error messages
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple-string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "blob-string",
            Self::Null => "null",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Set(_) => "set",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::BigNumber(_) => "big-number",
            Self::VerbatimString { .. } => "verbatim-string",
            Self::Push(_) => "push",
        }
    }
}

/// Parse a RESP double, including the `inf`/`-inf`/`nan` spellings.
///
/// # Errors
///
/// Returns [`RedisError::Type`] when the text is not a number.
pub fn parse_double(s: &str) -> RedisResult<f64> {
    match s {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" | "-nan" => Ok(f64::NAN),
        _ => s
            .parse::<f64>()
            .map_err(|e| RedisError::Type(format!("Cannot parse double '{s}': {e}"))),
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}
impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}
impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}
impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}

impl TryFrom<RespValue> for String {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_string()
    }
}

impl TryFrom<RespValue> for i64 {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        value.as_int()
    }
}

impl TryFrom<RespValue> for bool {
    type Error = RedisError;

    fn try_from(value: RespValue) -> Result<Self, Self::Error> {
        match value {
            RespValue::Boolean(b) => Ok(b),
            RespValue::Integer(1) => Ok(true),
            RespValue::Integer(0) => Ok(false),
            RespValue::SimpleString(s) if s == "OK" => Ok(true),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {:?} to bool",
                value
            ))),
        }
    }
}
