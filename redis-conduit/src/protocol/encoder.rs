//! RESP encoding
//!
//! Commands always go out as an array of bulk strings, whatever protocol
//! version the connection speaks. Encoding of reply values is here for
//! tooling and tests that need to play the server side.

use crate::core::{config::ProtocolVersion, mapping::format_double, value::RespValue};
use bytes::{BufMut, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Encodes RESP values into bytes
pub struct RespEncoder;

impl RespEncoder {
    /// Append a command (name first, then arguments) to `buf`
    pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
        let payload: usize = args.iter().map(|a| a.len() + 16).sum();
        buf.reserve(payload + 16);

        put_header(buf, b'*', args.len());
        for arg in args {
            put_blob(buf, b'$', arg);
        }
    }

    /// Encode a command into a fresh buffer
    #[must_use]
    pub fn command_bytes(args: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_command(args, &mut buf);
        buf.freeze()
    }

    /// Append a reply value to `buf`.
    ///
    /// Under RESP2 the null value is written as a null bulk string;
    /// under RESP3 it uses the dedicated `_` frame.
    pub fn encode(value: &RespValue, version: ProtocolVersion, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => put_line(buf, b'+', s.as_bytes()),
            RespValue::Error(e) => put_line(buf, b'-', e.as_bytes()),
            RespValue::Integer(i) => put_line(buf, b':', i.to_string().as_bytes()),
            RespValue::BulkString(data) => put_blob(buf, b'$', data),
            RespValue::Null => match version {
                ProtocolVersion::Resp2 => buf.put_slice(b"$-1\r\n"),
                ProtocolVersion::Resp3 => buf.put_slice(b"_\r\n"),
            },
            RespValue::Array(items) => Self::encode_aggregate(b'*', items, version, buf),
            RespValue::Set(items) => Self::encode_aggregate(b'~', items, version, buf),
            RespValue::Push(items) => Self::encode_aggregate(b'>', items, version, buf),
            RespValue::Map(pairs) => {
                put_header(buf, b'%', pairs.len());
                for (k, v) in pairs {
                    Self::encode(k, version, buf);
                    Self::encode(v, version, buf);
                }
            }
            RespValue::Double(d) => put_line(buf, b',', format_double(*d).as_bytes()),
            RespValue::Boolean(b) => put_line(buf, b'#', if *b { b"t" } else { b"f" }),
            RespValue::BigNumber(n) => put_line(buf, b'(', n.as_bytes()),
            RespValue::VerbatimString { format, text } => {
                put_header(buf, b'=', format.len() + 1 + text.len());
                buf.put_slice(format.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(text);
                buf.put_slice(CRLF);
            }
        }
    }

    fn encode_aggregate(
        tag: u8,
        items: &[RespValue],
        version: ProtocolVersion,
        buf: &mut BytesMut,
    ) {
        put_header(buf, tag, items.len());
        for item in items {
            Self::encode(item, version, buf);
        }
    }
}

fn put_header(buf: &mut BytesMut, tag: u8, len: usize) {
    buf.put_u8(tag);
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn put_line(buf: &mut BytesMut, tag: u8, line: &[u8]) {
    buf.put_u8(tag);
    buf.put_slice(line);
    buf.put_slice(CRLF);
}

fn put_blob(buf: &mut BytesMut, tag: u8, data: &[u8]) {
    put_header(buf, tag, data.len());
    buf.put_slice(data);
    buf.put_slice(CRLF);
}
