//! DMAP wire codec: the tagged, length-prefixed binary encoding used as
//! every non-audio DAAP response body.
//!
//! This crate covers the content node type, the content code registry,
//! and the encoder/decoder. Tree construction for specific endpoints
//! lives in `pmodaap::tree`, which depends on this crate.

pub mod codec;
pub mod codes;
pub mod node;

pub use codec::{decode, encode, DecodeError};
pub use codes::{CodeEntry, DmapType, CODE_BAG};
pub use node::{ContentNode, NodeValue, Version};
