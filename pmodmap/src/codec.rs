//! Encoder/decoder for the DMAP tagged-length binary wire format.
//!
//! Invariant: encoding of a node is
//! `code(4B) || big-endian length(4B) || body`; a container's body is the
//! concatenation of its children's encodings.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::node::{ContentNode, NodeValue, Version};

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("truncated node header")]
    TruncatedHeader,
    #[error("truncated node body (need {need} bytes, have {have})")]
    TruncatedBody { need: usize, have: usize },
    #[error("content code {0:?} is not a valid 4-byte ASCII tag")]
    InvalidCode(Vec<u8>),
    #[error("container {code}: declared length {declared} does not exactly cover its children (consumed {consumed})")]
    ContainerLengthMismatch {
        code: String,
        declared: usize,
        consumed: usize,
    },
    #[error("unknown content code {0:?}, cannot decode payload shape")]
    UnknownCode(String),
    #[error("trailing bytes after a complete node")]
    TrailingBytes,
}

/// Encodes a single node (and, recursively, its children) to DMAP bytes.
pub fn encode(node: &ContentNode) -> Bytes {
    let mut buf = BytesMut::with_capacity(node.encoded_len());
    encode_into(node, &mut buf);
    buf.freeze()
}

fn encode_into(node: &ContentNode, buf: &mut BytesMut) {
    let code_bytes = node.code.as_bytes();
    debug_assert_eq!(code_bytes.len(), 4, "content code must be 4 ASCII bytes");
    buf.put_slice(code_bytes);
    buf.put_u32(node.body_len() as u32);

    match &node.value {
        NodeValue::Uint8(v) => buf.put_u8(*v),
        NodeValue::Uint16(v) => buf.put_u16(*v),
        NodeValue::Uint32(v) => buf.put_u32(*v),
        NodeValue::Uint64(v) => buf.put_u64(*v),
        NodeValue::String(s) => buf.put_slice(s.as_bytes()),
        NodeValue::Bytes(b) => buf.put_slice(b),
        NodeValue::Timestamp(t) => buf.put_u32(*t),
        NodeValue::Version(v) => {
            buf.put_u16(v.major);
            buf.put_u16(v.minor);
        }
        NodeValue::Container(children) => {
            for child in children {
                encode_into(child, buf);
            }
        }
    }
}

/// Decodes a single node from a byte buffer. Not required by the server
/// core's write-only response path, but kept to let tests assert
/// round-trips.
///
/// `code_kind` resolves a 4-byte code to how its body should be
/// interpreted: leaf width/string/bytes, or container. Typically
/// `crate::codes::lookup`.
pub fn decode(
    input: &[u8],
    code_kind: impl Fn(&str) -> Option<crate::codes::DmapType> + Copy,
) -> Result<ContentNode, DecodeError> {
    let (node, consumed) = decode_one(input, code_kind)?;
    if consumed != input.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(node)
}

fn decode_one(
    input: &[u8],
    code_kind: impl Fn(&str) -> Option<crate::codes::DmapType> + Copy,
) -> Result<(ContentNode, usize), DecodeError> {
    if input.len() < 8 {
        return Err(DecodeError::TruncatedHeader);
    }
    let code_bytes = &input[0..4];
    let code_str = std::str::from_utf8(code_bytes)
        .ok()
        .filter(|s| s.len() == 4)
        .ok_or_else(|| DecodeError::InvalidCode(code_bytes.to_vec()))?;
    // Leak is fine: codes come from the static registry in practice; for
    // arbitrary decoded input we accept the one-time allocation cost.
    let code: &'static str = Box::leak(code_str.to_string().into_boxed_str());

    let len = u32::from_be_bytes(input[4..8].try_into().unwrap()) as usize;
    let body = input.get(8..8 + len).ok_or(DecodeError::TruncatedBody {
        need: len,
        have: input.len().saturating_sub(8),
    })?;

    let kind = code_kind(code_str).ok_or_else(|| DecodeError::UnknownCode(code_str.to_string()))?;

    let value = match kind {
        crate::codes::DmapType::UInt8 => {
            NodeValue::Uint8(*body.first().ok_or(DecodeError::TruncatedBody { need: 1, have: 0 })?)
        }
        crate::codes::DmapType::UInt16 => NodeValue::Uint16(u16::from_be_bytes(
            body.try_into().map_err(|_| DecodeError::TruncatedBody { need: 2, have: body.len() })?,
        )),
        crate::codes::DmapType::UInt32 => NodeValue::Uint32(u32::from_be_bytes(
            body.try_into().map_err(|_| DecodeError::TruncatedBody { need: 4, have: body.len() })?,
        )),
        crate::codes::DmapType::UInt64 => NodeValue::Uint64(u64::from_be_bytes(
            body.try_into().map_err(|_| DecodeError::TruncatedBody { need: 8, have: body.len() })?,
        )),
        crate::codes::DmapType::String => {
            NodeValue::String(String::from_utf8_lossy(body).into_owned())
        }
        crate::codes::DmapType::Bytes => NodeValue::Bytes(body.to_vec()),
        crate::codes::DmapType::Timestamp => NodeValue::Timestamp(u32::from_be_bytes(
            body.try_into().map_err(|_| DecodeError::TruncatedBody { need: 4, have: body.len() })?,
        )),
        crate::codes::DmapType::Version => {
            if body.len() != 4 {
                return Err(DecodeError::TruncatedBody { need: 4, have: body.len() });
            }
            NodeValue::Version(Version::new(
                u16::from_be_bytes([body[0], body[1]]),
                u16::from_be_bytes([body[2], body[3]]),
            ))
        }
        crate::codes::DmapType::Container => {
            let mut children = Vec::new();
            let mut offset = 0;
            // Stop as soon as fewer than 8 bytes remain: that can never be
            // another full (tag+length) header, so any leftover is a
            // declared length that overshoots the actual children.
            while offset + 8 <= body.len() {
                let (child, child_len) = decode_one(&body[offset..], code_kind)?;
                children.push(child);
                offset += child_len;
            }
            if offset != body.len() {
                return Err(DecodeError::ContainerLengthMismatch {
                    code: code_str.to_string(),
                    declared: body.len(),
                    consumed: offset,
                });
            }
            NodeValue::Container(children)
        }
    };

    Ok((ContentNode { code, value }, 8 + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;

    fn kind(code: &str) -> Option<codes::DmapType> {
        codes::lookup(code).map(|e| e.kind)
    }

    #[test]
    fn encodes_leaf_node_header_and_body() {
        let node = ContentNode::uint32("miid", 42);
        let bytes = encode(&node);
        assert_eq!(&bytes[0..4], b"miid");
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 4);
        assert_eq!(u32::from_be_bytes(bytes[8..12].try_into().unwrap()), 42);
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn container_length_equals_sum_of_children() {
        let node = ContentNode::container(
            "mlit",
            vec![ContentNode::uint32("miid", 1), ContentNode::string("minm", "Track")],
        );
        let bytes = encode(&node);
        let declared_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(declared_len, bytes.len() - 8);
        assert_eq!(node.encoded_len(), 8 + declared_len);
    }

    #[test]
    fn round_trips_string_node() {
        let node = ContentNode::string("minm", "Hello");
        let bytes = encode(&node);
        let decoded = decode(&bytes, kind).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn round_trips_nested_container() {
        let node = ContentNode::container(
            "mlog",
            vec![
                ContentNode::uint32("mstt", 200),
                ContentNode::uint32("mlid", 12345),
            ],
        );
        let bytes = encode(&node);
        let decoded = decode(&bytes, kind).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn rejects_container_whose_declared_length_overshoots_children() {
        // Hand-build a container claiming a longer body than its one 12-byte
        // child plus 4 bytes of trailing padding actually cover.
        let mut bytes = BytesMut::new();
        bytes.put_slice(b"mlcl");
        bytes.put_u32(16);
        let child = encode(&ContentNode::uint32("miid", 1));
        bytes.put_slice(&child);
        bytes.put_slice(&[0u8; 4]);
        let err = decode(&bytes, kind).unwrap_err();
        assert!(matches!(err, DecodeError::ContainerLengthMismatch { .. }));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = [b'm', b'i', b'i', b'd', 0, 0, 0];
        let err = decode(&bytes, kind).unwrap_err();
        assert_eq!(err, DecodeError::TruncatedHeader);
    }
}
