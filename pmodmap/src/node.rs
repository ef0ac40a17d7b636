//! The recursive content-tree node.
//!
//! Heterogeneous node payloads are carried as a tagged variant: the
//! encoder matches on the tag rather than on the runtime value's width.

/// A DMAP version quad, encoded as two big-endian `u16` halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// The payload carried by a [`ContentNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    String(String),
    Bytes(Vec<u8>),
    /// Seconds since the Unix epoch.
    Timestamp(u32),
    Version(Version),
    Container(Vec<ContentNode>),
}

/// A tagged, length-prefixed tree node: `(content-code, payload)`.
///
/// `code` is always a 4-byte ASCII tag (e.g. `mlit`, `miid`, `mstt`).
#[derive(Debug, Clone, PartialEq)]
pub struct ContentNode {
    pub code: &'static str,
    pub value: NodeValue,
}

impl ContentNode {
    pub fn uint8(code: &'static str, v: u8) -> Self {
        Self { code, value: NodeValue::Uint8(v) }
    }

    pub fn uint16(code: &'static str, v: u16) -> Self {
        Self { code, value: NodeValue::Uint16(v) }
    }

    pub fn uint32(code: &'static str, v: u32) -> Self {
        Self { code, value: NodeValue::Uint32(v) }
    }

    pub fn uint64(code: &'static str, v: u64) -> Self {
        Self { code, value: NodeValue::Uint64(v) }
    }

    pub fn string(code: &'static str, v: impl Into<String>) -> Self {
        Self { code, value: NodeValue::String(v.into()) }
    }

    pub fn bytes(code: &'static str, v: impl Into<Vec<u8>>) -> Self {
        Self { code, value: NodeValue::Bytes(v.into()) }
    }

    pub fn timestamp(code: &'static str, v: u32) -> Self {
        Self { code, value: NodeValue::Timestamp(v) }
    }

    pub fn version(code: &'static str, major: u16, minor: u16) -> Self {
        Self { code, value: NodeValue::Version(Version::new(major, minor)) }
    }

    pub fn container(code: &'static str, children: Vec<ContentNode>) -> Self {
        Self { code, value: NodeValue::Container(children) }
    }

    /// The encoded length of this node's body, not counting its own
    /// 8-byte tag+length header.
    pub fn body_len(&self) -> usize {
        match &self.value {
            NodeValue::Uint8(_) => 1,
            NodeValue::Uint16(_) => 2,
            NodeValue::Uint32(_) => 4,
            NodeValue::Uint64(_) => 8,
            NodeValue::String(s) => s.len(),
            NodeValue::Bytes(b) => b.len(),
            NodeValue::Timestamp(_) => 4,
            NodeValue::Version(_) => 4,
            NodeValue::Container(children) => {
                children.iter().map(ContentNode::encoded_len).sum()
            }
        }
    }

    /// The full encoded length of this node, header included.
    pub fn encoded_len(&self) -> usize {
        8 + self.body_len()
    }
}
