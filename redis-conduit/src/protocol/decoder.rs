//! Resumable RESP decoder
//!
//! Network reads do not line up with frame boundaries, so the decoder keeps
//! the aggregates it has started (arrays, maps, sets, pushes) on a stack
//! between calls. Every call consumes as many complete elements as the
//! buffer holds and reports how many bytes it used; bytes of an element that
//! is still incomplete are left in the buffer for the next call.
//!
//! The accepted frame types depend on the protocol version negotiated during
//! the handshake. A RESP3 tag on a RESP2 connection is a protocol error.

use crate::core::{
    config::ProtocolVersion,
    error::{RedisError, RedisResult},
    value::{parse_double, RespValue},
};
use bytes::{Buf, Bytes, BytesMut};

/// Largest bulk payload accepted, matching the server's own limit
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Outcome of one decode step
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete top-level frame
    Frame(RespValue),
    /// The buffer ended inside a frame; call again with more bytes
    NeedMoreData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateKind {
    Array,
    Set,
    Push,
    Map,
    Attribute,
}

#[derive(Debug)]
struct Partial {
    kind: AggregateKind,
    expected: usize,
    items: Vec<RespValue>,
}

impl Partial {
    fn new(kind: AggregateKind, expected: usize) -> Self {
        Self {
            kind,
            expected,
            items: Vec::with_capacity(expected.min(1024)),
        }
    }

    /// The finished value, or `None` for attributes, which are dropped
    fn finish(self) -> Option<RespValue> {
        finish_aggregate(self.kind, self.items)
    }
}

fn finish_aggregate(kind: AggregateKind, items: Vec<RespValue>) -> Option<RespValue> {
    match kind {
        AggregateKind::Array => Some(RespValue::Array(items)),
        AggregateKind::Set => Some(RespValue::Set(items)),
        AggregateKind::Push => Some(RespValue::Push(items)),
        AggregateKind::Map => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Some(RespValue::Map(pairs))
        }
        AggregateKind::Attribute => None,
    }
}

enum Element {
    Value(RespValue),
    Begin(AggregateKind, usize),
}

/// Incremental decoder for one connection's inbound byte stream
#[derive(Debug)]
pub struct RespDecoder {
    version: ProtocolVersion,
    max_bulk_len: usize,
    stack: Vec<Partial>,
}

impl RespDecoder {
    /// Create a decoder for the given protocol version
    #[must_use]
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            stack: Vec::new(),
        }
    }

    /// Limit the declared length of bulk strings and aggregates
    #[must_use]
    pub fn with_max_bulk_len(mut self, max: usize) -> Self {
        self.max_bulk_len = max;
        self
    }

    /// Protocol version currently accepted
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switch protocol version; only valid between frames
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Whether a frame has been started but not completed
    #[must_use]
    pub fn is_mid_frame(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Drop any partially decoded frame
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Decode from a buffer, advancing it past the consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] on malformed input. The decoder must
    /// not be used on the same stream afterwards.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RedisResult<Option<RespValue>> {
        let (decoded, consumed) = self.decode_slice(&buf[..])?;
        buf.advance(consumed);
        Ok(match decoded {
            Decoded::Frame(frame) => Some(frame),
            Decoded::NeedMoreData => None,
        })
    }

    /// Decode from a byte slice, returning the outcome and the bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] on malformed input.
    pub fn decode_slice(&mut self, buf: &[u8]) -> RedisResult<(Decoded, usize)> {
        let mut consumed = 0;

        loop {
            let Some((element, used)) = self.parse_element(&buf[consumed..])? else {
                return Ok((Decoded::NeedMoreData, consumed));
            };
            consumed += used;

            let mut value = match element {
                Element::Value(value) => Some(value),
                Element::Begin(kind, 0) => finish_aggregate(kind, Vec::new()),
                Element::Begin(kind, len) => {
                    self.stack.push(Partial::new(kind, len));
                    continue;
                }
            };

            // Fold the completed element into its parents.
            while let Some(done) = value.take() {
                match self.stack.last_mut() {
                    None => return Ok((Decoded::Frame(done), consumed)),
                    Some(top) => {
                        top.items.push(done);
                        if top.items.len() == top.expected {
                            if let Some(finished) = self.stack.pop() {
                                value = finished.finish();
                            }
                        }
                    }
                }
            }
        }
    }

    fn parse_element(&self, buf: &[u8]) -> RedisResult<Option<(Element, usize)>> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };

        if self.version == ProtocolVersion::Resp2 && !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*')
        {
            return Err(RedisError::Protocol(format!(
                "Invalid RESP2 type byte: {:?}",
                tag as char
            )));
        }

        let Some((line, line_len)) = read_line(&buf[1..]) else {
            return Ok(None);
        };
        let header_len = 1 + line_len;

        let element = match tag {
            b'+' => Element::Value(RespValue::SimpleString(utf8(line)?)),
            b'-' => Element::Value(RespValue::Error(utf8(line)?)),
            b':' => Element::Value(RespValue::Integer(parse_int(line)?)),
            b',' => Element::Value(RespValue::Double(
                parse_double(&utf8(line)?).map_err(|e| RedisError::Protocol(e.to_string()))?,
            )),
            b'#' => match line {
                b"t" => Element::Value(RespValue::Boolean(true)),
                b"f" => Element::Value(RespValue::Boolean(false)),
                _ => {
                    return Err(RedisError::Protocol(format!(
                        "Invalid boolean: {}",
                        String::from_utf8_lossy(line)
                    )))
                }
            },
            b'(' => {
                let digits = utf8(line)?;
                let body = digits.strip_prefix('-').unwrap_or(&digits);
                if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(RedisError::Protocol(format!("Invalid big number: {digits}")));
                }
                Element::Value(RespValue::BigNumber(digits))
            }
            b'_' => {
                if !line.is_empty() {
                    return Err(RedisError::Protocol("Null frame with payload".to_string()));
                }
                Element::Value(RespValue::Null)
            }
            b'$' | b'!' | b'=' => {
                let len = parse_int(line)?;
                if len == -1 && tag == b'$' {
                    return Ok(Some((Element::Value(RespValue::Null), header_len)));
                }
                let len = self.checked_len(len)?;
                let total = header_len + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                if &buf[header_len + len..total] != b"\r\n" {
                    return Err(RedisError::Protocol(
                        "Bulk payload not terminated by CRLF".to_string(),
                    ));
                }
                let payload = &buf[header_len..header_len + len];
                let value = match tag {
                    b'$' => RespValue::BulkString(Bytes::copy_from_slice(payload)),
                    b'!' => RespValue::Error(utf8(payload)?),
                    _ => verbatim(payload)?,
                };
                return Ok(Some((Element::Value(value), total)));
            }
            b'*' | b'~' | b'>' | b'%' | b'|' => {
                let len = parse_int(line)?;
                if len == -1 && tag == b'*' {
                    return Ok(Some((Element::Value(RespValue::Null), header_len)));
                }
                let len = self.checked_len(len)?;
                let (kind, items) = match tag {
                    b'*' => (AggregateKind::Array, len),
                    b'~' => (AggregateKind::Set, len),
                    b'>' => (AggregateKind::Push, len),
                    b'%' => (AggregateKind::Map, len.saturating_mul(2)),
                    _ => (AggregateKind::Attribute, len.saturating_mul(2)),
                };
                Element::Begin(kind, items)
            }
            other => {
                return Err(RedisError::Protocol(format!(
                    "Invalid RESP type byte: {:?}",
                    other as char
                )))
            }
        };

        Ok(Some((element, header_len)))
    }

    fn checked_len(&self, len: i64) -> RedisResult<usize> {
        let len = usize::try_from(len)
            .map_err(|_| RedisError::Protocol(format!("Invalid length: {len}")))?;
        if len > self.max_bulk_len {
            return Err(RedisError::Protocol(format!(
                "Declared length {} exceeds limit {}",
                len, self.max_bulk_len
            )));
        }
        Ok(len)
    }
}

/// Returns the line without its CRLF and the number of bytes including it
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

fn utf8(bytes: &[u8]) -> RedisResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {}", e)))
}

fn parse_int(line: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RedisError::Protocol(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn verbatim(payload: &[u8]) -> RedisResult<RespValue> {
    if payload.len() < 4 || payload[3] != b':' {
        return Err(RedisError::Protocol(
            "Verbatim string without format prefix".to_string(),
        ));
    }
    Ok(RespValue::VerbatimString {
        format: utf8(&payload[..3])?,
        text: Bytes::copy_from_slice(&payload[4..]),
    })
}
