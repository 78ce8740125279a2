//! Codec between raw page images and in-memory tree nodes.
//!
//! Pages use a slotted layout: records grow forward from the fixed header,
//! the slot directory (offset, length per record) grows backward from the
//! page tail, and `free_start`/`free_end` bracket the unused middle. Slot
//! order is key order; the copy-on-write engine always rewrites whole
//! nodes, so the codec never edits a page in place.

use std::convert::TryFrom;

use smallvec::SmallVec;

use crate::bytes::{var, ByteReader};
use crate::error::{Error, Result};
use crate::types::page::{PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::PageId;

/// Size in bytes of a slot directory entry (offset + length).
pub const SLOT_ENTRY_LEN: usize = 4;

/// Branch record header length (`child:u64` + `sep_len:u16`).
pub const BRANCH_RECORD_HEADER_LEN: usize = 10;

/// Leaf record flag: the value lives in an overflow chain.
const LEAF_FLAG_SPILLED: u8 = 0x01;

const INLINE_SLOT_EXTENTS: usize = 32;

/// Value stored in a leaf entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafValue {
    /// Value bytes stored inline in the page.
    Inline(Vec<u8>),
    /// Value spilled to an overflow chain.
    Spilled {
        /// First page of the chain.
        head: PageId,
        /// Total value length in bytes.
        total_len: u64,
    },
}

impl LeafValue {
    /// Length of the logical value in bytes.
    pub fn len(&self) -> u64 {
        match self {
            LeafValue::Inline(bytes) => bytes.len() as u64,
            LeafValue::Spilled { total_len, .. } => *total_len,
        }
    }

    /// True when the logical value is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One key/value pair in a leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Full key bytes.
    pub key: Vec<u8>,
    /// Inline or spilled value.
    pub value: LeafValue,
}

/// One separator/child pair in a branch.
///
/// `sep` is the smallest key reachable through `child`; descent picks the
/// rightmost entry whose separator does not exceed the probe, defaulting to
/// the leftmost child for keys below every separator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchEntry {
    /// Smallest key in the child subtree.
    pub sep: Vec<u8>,
    /// Child page number.
    pub child: PageId,
}

/// Decoded tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Leaf holding key/value entries in key order.
    Leaf(Vec<LeafEntry>),
    /// Branch holding separator/child entries in key order.
    Branch(Vec<BranchEntry>),
}

impl Node {
    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Branch(entries) => entries.len(),
        }
    }

    /// True when the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Smallest key covered by this node.
    pub fn min_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(entries) => entries.first().map(|e| e.key.as_slice()),
            Node::Branch(entries) => entries.first().map(|e| e.sep.as_slice()),
        }
    }

    /// Total encoded size, header and slot directory included.
    pub fn encoded_len(&self) -> usize {
        let records: usize = match self {
            Node::Leaf(entries) => entries
                .iter()
                .map(|e| leaf_record_len(&e.key, &e.value))
                .sum(),
            Node::Branch(entries) => entries.iter().map(|e| branch_record_len(&e.sep)).sum(),
        };
        PAGE_HDR_LEN + records + self.len() * SLOT_ENTRY_LEN
    }

    /// True when the node encoding fits in one page.
    pub fn fits(&self, page_size: u32) -> bool {
        self.encoded_len() <= page_size as usize
    }

    /// Payload bytes the node occupies, used for fill-level policy.
    pub fn used_bytes(&self) -> usize {
        self.encoded_len() - PAGE_HDR_LEN
    }

    /// Encodes the node into a fresh page image (CRC not yet stamped).
    pub fn encode(&self, page_size: u32) -> Result<Vec<u8>> {
        if !self.fits(page_size) {
            return Err(Error::Invalid("node does not fit in a page"));
        }
        let page_size = page_size as usize;
        let mut image = vec![0u8; page_size];
        let nslots = self.len();

        let mut records: Vec<u8> = Vec::with_capacity(self.encoded_len() - PAGE_HDR_LEN);
        let mut slots: Vec<(u16, u16)> = Vec::with_capacity(nslots);
        match self {
            Node::Leaf(entries) => {
                for entry in entries {
                    let start = PAGE_HDR_LEN + records.len();
                    encode_leaf_record(&entry.key, &entry.value, &mut records)?;
                    let len = PAGE_HDR_LEN + records.len() - start;
                    slots.push((u16::try_from(start).unwrap(), u16::try_from(len).unwrap()));
                }
            }
            Node::Branch(entries) => {
                for entry in entries {
                    let start = PAGE_HDR_LEN + records.len();
                    encode_branch_record(&entry.sep, entry.child, &mut records)?;
                    let len = PAGE_HDR_LEN + records.len() - start;
                    slots.push((u16::try_from(start).unwrap(), u16::try_from(len).unwrap()));
                }
            }
        }

        let free_start = PAGE_HDR_LEN + records.len();
        let free_end = page_size - nslots * SLOT_ENTRY_LEN;
        debug_assert!(free_start <= free_end);

        let mut header = PageHeader::new(
            if self.is_leaf() {
                PageKind::Leaf
            } else {
                PageKind::Branch
            },
            page_size as u32,
        );
        header.nslots = u16::try_from(nslots).map_err(|_| Error::Invalid("too many slots"))?;
        header.free_start = free_start as u16;
        header.free_end = free_end as u16;
        header.encode(&mut image)?;

        image[PAGE_HDR_LEN..free_start].copy_from_slice(&records);
        for (idx, (start, len)) in slots.iter().enumerate() {
            let pos = free_end + idx * SLOT_ENTRY_LEN;
            image[pos..pos + 2].copy_from_slice(&start.to_be_bytes());
            image[pos + 2..pos + 4].copy_from_slice(&len.to_be_bytes());
        }
        Ok(image)
    }

    /// Decodes and structurally validates a page image.
    pub fn decode(image: &[u8]) -> Result<Node> {
        let header = PageHeader::decode(image)?;
        let kind = header.kind;
        if kind != PageKind::Leaf && kind != PageKind::Branch {
            return Err(Error::Corruption("expected a tree page"));
        }
        let page_len = image.len();
        let nslots = header.nslots as usize;
        let free_start = header.free_start as usize;
        let free_end = header.free_end as usize;
        let slot_bytes = nslots
            .checked_mul(SLOT_ENTRY_LEN)
            .ok_or(Error::Corruption("slot count overflow"))?;
        if free_start < PAGE_HDR_LEN
            || free_start > free_end
            || free_end > page_len
            || page_len - free_end != slot_bytes
        {
            return Err(Error::Corruption("tree page free-space pointers invalid"));
        }

        let mut extents: SmallVec<[(usize, usize); INLINE_SLOT_EXTENTS]> =
            SmallVec::with_capacity(nslots);
        for idx in 0..nslots {
            let pos = free_end + idx * SLOT_ENTRY_LEN;
            let start = u16::from_be_bytes([image[pos], image[pos + 1]]) as usize;
            let len = u16::from_be_bytes([image[pos + 2], image[pos + 3]]) as usize;
            if len == 0 {
                return Err(Error::Corruption("record length zero"));
            }
            let end = start
                .checked_add(len)
                .ok_or(Error::Corruption("record extent overflow"))?;
            if start < PAGE_HDR_LEN || end > free_start {
                return Err(Error::Corruption("record extent out of bounds"));
            }
            extents.push((start, end));
        }
        let mut ordered = extents.clone();
        ordered.sort_unstable_by_key(|e| e.0);
        let mut prev_end = PAGE_HDR_LEN;
        for (start, end) in ordered {
            if start < prev_end {
                return Err(Error::Corruption("record extents overlap"));
            }
            prev_end = end;
        }

        match kind {
            PageKind::Leaf => {
                let mut entries = Vec::with_capacity(nslots);
                for (start, end) in &extents {
                    entries.push(decode_leaf_record(&image[*start..*end])?);
                }
                Ok(Node::Leaf(entries))
            }
            _ => {
                let mut entries = Vec::with_capacity(nslots);
                for (start, end) in &extents {
                    entries.push(decode_branch_record(&image[*start..*end])?);
                }
                Ok(Node::Branch(entries))
            }
        }
    }
}

/// Encoded size of a leaf record.
pub fn leaf_record_len(key: &[u8], value: &LeafValue) -> usize {
    let body = match value {
        LeafValue::Inline(bytes) => bytes.len(),
        LeafValue::Spilled { .. } => 8,
    };
    1 + var::encoded_len_u64(key.len() as u64) + var::encoded_len_u64(value.len()) + key.len()
        + body
}

/// Encoded size of a branch record.
pub fn branch_record_len(sep: &[u8]) -> usize {
    BRANCH_RECORD_HEADER_LEN + sep.len()
}

fn encode_leaf_record(key: &[u8], value: &LeafValue, dst: &mut Vec<u8>) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Invalid("leaf key must be non-empty"));
    }
    match value {
        LeafValue::Inline(bytes) => {
            dst.push(0);
            var::encode_u64(key.len() as u64, dst);
            var::encode_u64(bytes.len() as u64, dst);
            dst.extend_from_slice(key);
            dst.extend_from_slice(bytes);
        }
        LeafValue::Spilled { head, total_len } => {
            dst.push(LEAF_FLAG_SPILLED);
            var::encode_u64(key.len() as u64, dst);
            var::encode_u64(*total_len, dst);
            dst.extend_from_slice(key);
            dst.extend_from_slice(&head.0.to_be_bytes());
        }
    }
    Ok(())
}

fn decode_leaf_record(buf: &[u8]) -> Result<LeafEntry> {
    let mut reader = ByteReader::new(buf);
    let flags = reader.take_u8()?;
    if flags & !LEAF_FLAG_SPILLED != 0 {
        return Err(Error::Corruption("unknown leaf record flags"));
    }
    let key_len = reader.read_var_u64("leaf key length truncated")?;
    if key_len == 0 {
        return Err(Error::Corruption("leaf key length zero"));
    }
    let val_len = reader.read_var_u64("leaf value length truncated")?;
    let key_len = usize::try_from(key_len)
        .map_err(|_| Error::Corruption("leaf key length exceeds usize"))?;
    let key = reader.take(key_len)?.to_vec();
    let value = if flags & LEAF_FLAG_SPILLED != 0 {
        let head = PageId(reader.take_u64()?);
        if !head.is_some() {
            return Err(Error::Corruption("spilled value without overflow head"));
        }
        LeafValue::Spilled {
            head,
            total_len: val_len,
        }
    } else {
        let val_len = usize::try_from(val_len)
            .map_err(|_| Error::Corruption("leaf value length exceeds usize"))?;
        LeafValue::Inline(reader.take(val_len)?.to_vec())
    };
    if reader.remaining() != 0 {
        return Err(Error::Corruption("leaf record has trailing bytes"));
    }
    Ok(LeafEntry { key, value })
}

fn encode_branch_record(sep: &[u8], child: PageId, dst: &mut Vec<u8>) -> Result<()> {
    if !child.is_some() {
        return Err(Error::Invalid("branch child must be a real page"));
    }
    let sep_len =
        u16::try_from(sep.len()).map_err(|_| Error::Invalid("separator longer than u16"))?;
    dst.extend_from_slice(&child.0.to_be_bytes());
    dst.extend_from_slice(&sep_len.to_be_bytes());
    dst.extend_from_slice(sep);
    Ok(())
}

fn decode_branch_record(buf: &[u8]) -> Result<BranchEntry> {
    let mut reader = ByteReader::new(buf);
    let child = PageId(reader.take_u64()?);
    if !child.is_some() {
        return Err(Error::Corruption("branch child is page zero"));
    }
    let sep_len = u16::from_be_bytes(reader.take(2)?.try_into().unwrap()) as usize;
    let sep = reader.take(sep_len)?.to_vec();
    if reader.remaining() != 0 {
        return Err(Error::Corruption("branch record has trailing bytes"));
    }
    Ok(BranchEntry { sep, child })
}
