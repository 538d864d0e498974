//! Info protocol framing
//!
//! Info messages are the textual side-channel used for node identity, feature and
//! topology discovery. Every message is an 8-byte header followed by a UTF-8 body:
//!
//! ```text
//! ┌─────────┬──────┬──────────────────────────┐
//! │ version │ type │ body length (48-bit BE)  │  8 bytes
//! └─────────┴──────┴──────────────────────────┘
//! request body:   name\nname\n...
//! response body:  name\tvalue\nname\tvalue\n...
//! ```

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Info protocol version
pub const INFO_VERSION: u8 = 2;

/// Info message type
pub const INFO_TYPE: u8 = 1;

/// Header length in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest info body accepted from a server (topology replies for many
/// namespaces are big, but never this big)
pub const MAX_INFO_SIZE: usize = 64 * 1024 * 1024;

const SIZE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Encode an info header for a body of `len` bytes
pub fn encode_header(len: usize) -> [u8; HEADER_SIZE] {
    let word = ((INFO_VERSION as u64) << 56) | ((INFO_TYPE as u64) << 48) | (len as u64 & SIZE_MASK);
    word.to_be_bytes()
}

/// Decode an info header, returning the body length
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<usize> {
    let word = u64::from_be_bytes(*header);
    let version = (word >> 56) as u8;
    let msg_type = ((word >> 48) & 0xFF) as u8;

    if version != INFO_VERSION || msg_type != INFO_TYPE {
        return Err(ProtocolError::UnsupportedVersion { version, msg_type });
    }

    let len = (word & SIZE_MASK) as usize;
    if len > MAX_INFO_SIZE {
        return Err(ProtocolError::MessageTooLarge(len, MAX_INFO_SIZE));
    }
    Ok(len)
}

/// Encode a full info request (header + body) into `buf`
pub fn encode_request<S: AsRef<str>>(names: &[S], buf: &mut BytesMut) {
    let body_len: usize = names.iter().map(|n| n.as_ref().len() + 1).sum();
    buf.clear();
    buf.reserve(HEADER_SIZE + body_len);
    buf.put_slice(&encode_header(body_len));
    for name in names {
        buf.put_slice(name.as_ref().as_bytes());
        buf.put_u8(b'\n');
    }
}

/// Encode a full info response (header + body) into `buf`
pub fn encode_response<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)], buf: &mut BytesMut) {
    let body_len: usize = pairs
        .iter()
        .map(|(k, v)| k.as_ref().len() + v.as_ref().len() + 2)
        .sum();
    buf.clear();
    buf.reserve(HEADER_SIZE + body_len);
    buf.put_slice(&encode_header(body_len));
    for (name, value) in pairs {
        buf.put_slice(name.as_ref().as_bytes());
        buf.put_u8(b'\t');
        buf.put_slice(value.as_ref().as_bytes());
        buf.put_u8(b'\n');
    }
}

/// Decode a body as UTF-8 text
pub fn body_to_str(body: &[u8]) -> Result<&str> {
    std::str::from_utf8(body)
        .map_err(|e| ProtocolError::InvalidFormat(format!("info body is not UTF-8: {}", e)))
}

/// Split a request body into the requested names
pub fn parse_request(body: &str) -> Vec<String> {
    body.split('\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a response body into a name → value map
///
/// A line without a tab maps its name to an empty value.
pub fn parse_response(body: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in body.split('\n') {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => map.insert(name.to_string(), value.to_string()),
            None => map.insert(line.to_string(), String::new()),
        };
    }
    map
}
