//! Shared identifiers and the on-disk page header used by every component.

use std::convert::TryInto;
use std::fmt;

use crate::error::{Error, Result};

/// Index of a fixed-size page inside the backing file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Monotonic commit counter; one per successful mutating call.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

impl PageId {
    /// Sentinel meaning "no page".
    pub const NONE: PageId = PageId(0);

    /// Returns true if this id refers to an actual page.
    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared on-disk page header layout.
pub mod page {
    use super::*;

    /// Length in bytes of the fixed header at the start of every arena page.
    pub const PAGE_HDR_LEN: usize = 24;

    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 512;
    /// Largest supported page size (offsets inside a page are u16).
    pub const MAX_PAGE_SIZE: u32 = 32768;
    /// Page size used when the caller does not choose one.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;

    /// Byte offsets for fixed header fields.
    pub mod header {
        use std::ops::Range;

        pub const KIND: usize = 0;
        pub const FLAGS: usize = 1;
        pub const NSLOTS: Range<usize> = 2..4;
        pub const FREE_START: Range<usize> = 4..6;
        pub const FREE_END: Range<usize> = 6..8;
        pub const NEXT: Range<usize> = 8..16;
        pub const CRC32: Range<usize> = 16..20;
        pub const RESERVED: Range<usize> = 20..24;
    }

    /// Discriminates what a page stores.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Meta slot (pages 0 and 1 only).
        Meta = 1,
        /// Free-page list chain page.
        FreeList = 2,
        /// B+tree leaf page.
        Leaf = 3,
        /// B+tree branch page.
        Branch = 4,
        /// Overflow chain page for an oversized value.
        Overflow = 5,
    }

    impl PageKind {
        /// Decodes a kind byte, rejecting unknown values.
        pub fn from_u8(value: u8) -> Result<Self> {
            match value {
                1 => Ok(Self::Meta),
                2 => Ok(Self::FreeList),
                3 => Ok(Self::Leaf),
                4 => Ok(Self::Branch),
                5 => Ok(Self::Overflow),
                _ => Err(Error::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded fixed header of an arena page.
    #[derive(Clone, Copy, Debug)]
    pub struct PageHeader {
        /// What the page stores.
        pub kind: PageKind,
        /// Kind-specific flag bits.
        pub flags: u8,
        /// Number of entries in the slot directory.
        pub nslots: u16,
        /// First free byte after the record area (absolute page offset).
        pub free_start: u16,
        /// First byte of the slot directory region (absolute page offset).
        pub free_end: u16,
        /// Next page in a chain (overflow, free list); `PageId::NONE` ends it.
        pub next: PageId,
        /// Salted CRC over the page image.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Creates a header for a freshly initialized page.
        pub fn new(kind: PageKind, page_size: u32) -> Self {
            Self {
                kind,
                flags: 0,
                nslots: 0,
                free_start: PAGE_HDR_LEN as u16,
                free_end: page_size as u16,
                next: PageId::NONE,
                crc32: 0,
            }
        }

        /// Encodes the header into the first `PAGE_HDR_LEN` bytes of `buf`.
        pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
            if buf.len() < PAGE_HDR_LEN {
                return Err(Error::Invalid("page buffer shorter than header"));
            }
            buf[header::KIND] = self.kind as u8;
            buf[header::FLAGS] = self.flags;
            buf[header::NSLOTS].copy_from_slice(&self.nslots.to_be_bytes());
            buf[header::FREE_START].copy_from_slice(&self.free_start.to_be_bytes());
            buf[header::FREE_END].copy_from_slice(&self.free_end.to_be_bytes());
            buf[header::NEXT].copy_from_slice(&self.next.0.to_be_bytes());
            buf[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            buf[header::RESERVED].fill(0);
            Ok(())
        }

        /// Decodes and structurally validates a header.
        pub fn decode(buf: &[u8]) -> Result<Self> {
            if buf.len() < PAGE_HDR_LEN {
                return Err(Error::Corruption("page shorter than header"));
            }
            let kind = PageKind::from_u8(buf[header::KIND])?;
            let flags = buf[header::FLAGS];
            let nslots = u16::from_be_bytes(buf[header::NSLOTS].try_into().unwrap());
            let free_start = u16::from_be_bytes(buf[header::FREE_START].try_into().unwrap());
            let free_end = u16::from_be_bytes(buf[header::FREE_END].try_into().unwrap());
            let next = PageId(u64::from_be_bytes(buf[header::NEXT].try_into().unwrap()));
            let crc32 = u32::from_be_bytes(buf[header::CRC32].try_into().unwrap());
            if buf[header::RESERVED].iter().any(|b| *b != 0) {
                return Err(Error::Corruption("page header reserved field non-zero"));
            }
            Ok(Self {
                kind,
                flags,
                nslots,
                free_start,
                free_end,
                next,
                crc32,
            })
        }
    }

    /// Computes the CRC for a page image, bound to its page number and the
    /// database salt so a page read from the wrong offset fails verification.
    pub fn page_crc32(page_no: u64, salt: u64, image: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_no.to_be_bytes());
        hasher.update(&salt.to_be_bytes());
        hasher.update(image);
        hasher.finalize()
    }

    /// Zeroes the CRC field prior to computing or verifying a page checksum.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(Error::Invalid("page buffer shorter than header"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Stamps the salted CRC into a fully encoded page image.
    pub fn stamp_crc32(page_no: PageId, salt: u64, image: &mut [u8]) -> Result<()> {
        clear_crc32(image)?;
        let crc = page_crc32(page_no.0, salt, image);
        image[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verifies the salted CRC of a page image.
    pub fn verify_crc32(page_no: PageId, salt: u64, image: &[u8]) -> Result<()> {
        let header = PageHeader::decode(image)?;
        let mut scratch = image.to_vec();
        clear_crc32(&mut scratch)?;
        let crc = page_crc32(page_no.0, salt, &scratch);
        if crc != header.crc32 {
            return Err(Error::Corruption("page crc mismatch"));
        }
        Ok(())
    }
}
