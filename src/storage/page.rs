//! Page layout
//!
//! Every page on disk is a fixed-size block:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────────────────┬─────────┐
//! │ LSN (8)  │ CRC (4)  │ Len (4)  │ bincode(Node)      │ zeroes  │
//! └──────────┴──────────┴──────────┴────────────────────┴─────────┘
//! ```
//!
//! `Len = 0` marks a page that was never written (file holes, pages past
//! EOF). The CRC covers the node payload only.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::{AccessMethod, Duplicates};
use crate::error::{EmberError, Result};
use crate::wal::Lsn;

use super::PageId;

/// Page header: LSN (8) + CRC (4) + Len (4)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Magic number stored in every meta page ("EMBR")
pub const META_MAGIC: u32 = 0x454D_4252;

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Page 0 of every database file
pub const META_PAGE: PageId = 0;

/// A page as held by the buffer pool
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// LSN of the last WAL record applied to this page
    pub lsn: Lsn,
    pub node: Node,
}

/// Contents of a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Meta(MetaPage),
    Internal(InternalNode),
    Leaf(LeafNode),
    Overflow { next: Option<PageId>, data: Vec<u8> },
    Free { next: Option<PageId> },
}

/// Database header, always page 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaPage {
    pub magic: u32,
    pub version: u16,
    pub page_size: u32,
    pub access_method: AccessMethod,
    pub duplicates: Duplicates,
    pub comparator: Option<String>,
    pub root: PageId,
    /// Number of levels; a lone root leaf is height 1
    pub height: u32,
    /// Pages ever allocated (next fresh page id)
    pub page_count: u32,
    pub free_head: Option<PageId>,
}

/// Routing key in an internal node
///
/// `dup` carries the duplicate's value in sorted-duplicate databases so
/// runs of one key can span leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Separator {
    pub key: Vec<u8>,
    pub dup: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InternalNode {
    /// `children.len() == keys.len() + 1`
    pub keys: Vec<Separator>,
    pub children: Vec<PageId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
    pub prev: Option<PageId>,
    pub next: Option<PageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: StoredValue,
}

/// Value bytes, either in the leaf or in an overflow chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Inline(Vec<u8>),
    Overflow { head: PageId, len: u64 },
}

impl MetaPage {
    pub fn new(
        page_size: usize,
        access_method: AccessMethod,
        duplicates: Duplicates,
        comparator: Option<String>,
    ) -> Self {
        Self {
            magic: META_MAGIC,
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            access_method,
            duplicates,
            comparator,
            root: 1,
            height: 1,
            page_count: 2,
            free_head: None,
        }
    }
}

impl Node {
    /// Serialized payload size (excluding the page header)
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(bincode::serialized_size(self)? as usize)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Meta(_) => "meta",
            Node::Internal(_) => "internal",
            Node::Leaf(_) => "leaf",
            Node::Overflow { .. } => "overflow",
            Node::Free { .. } => "free",
        }
    }
}

impl StoredValue {
    /// Inline bytes, if the value lives in the leaf
    pub fn inline(&self) -> Option<&[u8]> {
        match self {
            StoredValue::Inline(v) => Some(v),
            StoredValue::Overflow { .. } => None,
        }
    }
}

/// Encode a page into exactly `page_size` bytes
pub fn encode_page(page: &Page, page_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(&page.node)?;
    if PAGE_HEADER_SIZE + payload.len() > page_size {
        return Err(EmberError::Corruption(format!(
            "{} node of {} bytes does not fit a {} byte page",
            page.node.kind(),
            payload.len(),
            page_size
        )));
    }

    let mut buf = BytesMut::with_capacity(page_size);
    buf.put_u64_le(page.lsn);
    buf.put_u32_le(crc32fast::hash(&payload));
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.resize(page_size, 0);

    Ok(buf.to_vec())
}

/// Decode a page; `Ok(None)` for a page that was never written
pub fn decode_page(bytes: &[u8], id: PageId) -> Result<Option<Page>> {
    if bytes.len() < PAGE_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &bytes[..PAGE_HEADER_SIZE];
    let lsn = header.get_u64_le();
    let crc = header.get_u32_le();
    let len = header.get_u32_le() as usize;

    if len == 0 {
        return Ok(None);
    }
    if PAGE_HEADER_SIZE + len > bytes.len() {
        return Err(EmberError::Corruption(format!(
            "page {} claims {} payload bytes",
            id, len
        )));
    }

    let payload = &bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len];
    if crc32fast::hash(payload) != crc {
        return Err(EmberError::Corruption(format!("checksum mismatch on page {}", id)));
    }

    let node = bincode::deserialize(payload)
        .map_err(|e| EmberError::Corruption(format!("page {} undecodable: {}", id, e)))?;

    Ok(Some(Page { lsn, node }))
}

