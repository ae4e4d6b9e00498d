//! Common types used throughout the library

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reply as the caller sees it, after type mapping.
///
/// Which variant a given frame turns into depends on the active
/// [`TypeMapping`](crate::mapping::TypeMapping): a RESP3 map can become a
/// [`RedisValue::Record`] or a [`RedisValue::Map`], a blob string can become
/// a [`RedisValue::String`] or [`RedisValue::Bytes`], and so on.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    /// Null value
    Nil,
    /// String value
    String(String),
    /// Binary data
    Bytes(Bytes),
    /// Integer value
    Int(i64),
    /// Floating point value
    Double(f64),
    /// Boolean value
    Bool(bool),
    /// Arbitrary precision number kept as text
    BigNumber(String),
    /// Array of values
    Array(Vec<RedisValue>),
    /// Key/value pairs with text keys, in server order
    Record(Vec<(String, RedisValue)>),
    /// Key/value pairs with arbitrary keys, in server order
    Map(Vec<(RedisValue, RedisValue)>),
    /// Unordered collection
    Set(Vec<RedisValue>),
    /// Verbatim string with its format tag
    Verbatim {
        /// Three-letter format, e.g. `txt`
        format: String,
        /// Text content
        text: String,
    },
}

impl RedisValue {
    /// Borrow the text of a string value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::BigNumber(s) => Some(s),
            Self::Verbatim { text, .. } => Some(text),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Integer value, if this is one
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Check if this is the null value
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Look up a field of a record or map by its text key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Record(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            Self::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<String> for RedisValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RedisValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<Vec<u8>> for RedisValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<i64> for RedisValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for RedisValue {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<Vec<Self>> for RedisValue {
    fn from(arr: Vec<Self>) -> Self {
        Self::Array(arr)
    }
}

/// Address of a server node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Host name or IP address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl NodeAddr {
    /// Create a new node address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<(String, u16)> for NodeAddr {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

/// Represents a slot range in a Redis cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }
}

/// Node information in a Redis cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID, empty when the server did not report one
    pub id: String,
    /// Node address
    pub addr: NodeAddr,
    /// Slot ranges served by this node
    pub slots: Vec<SlotRange>,
    /// Whether this is a master node
    pub is_master: bool,
}

impl NodeInfo {
    /// Create a new node info
    #[must_use]
    pub const fn new(id: String, addr: NodeAddr) -> Self {
        Self {
            id,
            addr,
            slots: Vec::new(),
            is_master: true,
        }
    }

    /// Check if this node serves a given slot
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_addr_display() {
        assert_eq!(NodeAddr::new("10.0.0.1", 7000).to_string(), "10.0.0.1:7000");
        assert_eq!(NodeAddr::new("::1", 7000).to_string(), "[::1]:7000");
    }

    #[test]
    fn test_record_lookup() {
        let value = RedisValue::Record(vec![
            ("name".to_string(), RedisValue::from("alice")),
            ("age".to_string(), RedisValue::Int(30)),
        ]);
        assert_eq!(value.get("age"), Some(&RedisValue::Int(30)));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_slot_range() {
        let range = SlotRange::new(0, 5460);
        assert!(range.contains(0));
        assert!(range.contains(5460));
        assert!(!range.contains(5461));
    }
}
