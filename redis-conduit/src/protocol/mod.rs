//! Redis protocol implementations
//!
//! This module contains the RESP2/RESP3 encoder, the resumable decoder and
//! the result of protocol negotiation during the connection handshake.

pub mod decoder;
pub mod encoder;

pub use crate::core::config::ProtocolVersion;
pub use decoder::{Decoded, RespDecoder};
pub use encoder::RespEncoder;

use crate::core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};

/// Protocol negotiation result
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolNegotiation {
    /// The negotiated protocol version
    pub version: ProtocolVersion,
    /// Server properties reported by `HELLO` (server, version, mode, role, ...)
    pub properties: Vec<(String, RespValue)>,
}

impl ProtocolNegotiation {
    /// Create a new protocol negotiation result
    #[must_use]
    pub const fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            properties: Vec::new(),
        }
    }

    /// Build from a `HELLO` reply, which is a map under RESP3 and a flat array under RESP2
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the reply is not a key/value structure.
    pub fn from_hello(version: ProtocolVersion, reply: RespValue) -> RedisResult<Self> {
        let pairs = reply
            .into_pairs()
            .map_err(|e| RedisError::Protocol(format!("Invalid HELLO response: {}", e)))?;
        let properties = pairs
            .into_iter()
            .filter_map(|(k, v)| k.as_string().ok().map(|k| (k, v)))
            .collect();
        Ok(Self {
            version,
            properties,
        })
    }

    /// Look up a server property
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&RespValue> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Server mode as reported by `HELLO` (`standalone`, `cluster`, `sentinel`)
    #[must_use]
    pub fn server_mode(&self) -> Option<String> {
        self.property("mode").and_then(|v| v.as_string().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_from_hello_map() {
        let reply = RespValue::Map(vec![
            (RespValue::from("server"), RespValue::from("redis")),
            (RespValue::from("proto"), RespValue::Integer(3)),
            (RespValue::from("mode"), RespValue::from("cluster")),
        ]);
        let negotiation = ProtocolNegotiation::from_hello(ProtocolVersion::Resp3, reply).unwrap();
        assert_eq!(negotiation.version, ProtocolVersion::Resp3);
        assert_eq!(negotiation.property("proto"), Some(&RespValue::Integer(3)));
        assert_eq!(negotiation.server_mode().as_deref(), Some("cluster"));
        assert!(negotiation.property("missing").is_none());
    }

    #[test]
    fn test_negotiation_rejects_scalar() {
        assert!(ProtocolNegotiation::from_hello(ProtocolVersion::Resp3, RespValue::Integer(1))
            .is_err());
    }
}
