//! Dual meta-page codec and slot selection.
//!
//! Two meta slots live at pages 0 and 1. A commit for transaction `t`
//! rewrites slot `t % 2`, so the previously current slot survives any
//! mid-commit crash; `open` adopts whichever valid slot carries the higher
//! transaction counter. The meta region is fixed-size and self-describing,
//! which lets `open` learn the page size before trusting anything else in
//! the file.

use std::convert::TryInto;
use std::ops::Range;

use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{PageId, TxnId};

const MAGIC: &[u8; 8] = b"UMBRADB\0";
const FORMAT_VERSION: u16 = 1;

const META_MAGIC: Range<usize> = 0..8;
const META_FORMAT_VERSION: Range<usize> = 8..10;
const META_FLAGS: Range<usize> = 10..12;
const META_PAGE_SIZE: Range<usize> = 12..16;
const META_SALT: Range<usize> = 16..24;
const META_ROOT: Range<usize> = 24..32;
const META_FREELIST_ROOT: Range<usize> = 32..40;
const META_NEXT_PAGE: Range<usize> = 40..48;
const META_TXNID: Range<usize> = 48..56;
const META_RESERVED: Range<usize> = 56..64;
const META_CRC32: Range<usize> = 64..68;

/// Size in bytes of the encoded meta region at the head of a meta page.
pub const META_LEN: usize = 68;

/// Flag bit recording that the tree was created with the reverse-byte
/// comparator.
pub const META_FLAG_REVERSE_KEY: u16 = 1 << 0;

/// Authoritative root state for one committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each page in bytes, fixed at creation.
    pub page_size: u32,
    /// Comparator and format flag bits.
    pub flags: u16,
    /// Random salt mixed into every page checksum.
    pub salt: u64,
    /// Root of the key tree; `PageId::NONE` for an empty tree.
    pub root: PageId,
    /// Head of the persisted free-page list chain.
    pub freelist_root: PageId,
    /// First page number past the end of the allocated arena.
    pub next_page: PageId,
    /// Commit counter of the transaction this meta describes.
    pub txnid: TxnId,
}

impl Meta {
    /// Meta for a freshly created, empty store.
    pub fn new(page_size: u32, salt: u64, flags: u16) -> Self {
        Self {
            page_size,
            flags,
            salt,
            root: PageId::NONE,
            freelist_root: PageId::NONE,
            next_page: PageId(2),
            txnid: TxnId(0),
        }
    }

    /// True when the tree orders keys by trailing bytes first.
    pub fn reverse_key(&self) -> bool {
        self.flags & META_FLAG_REVERSE_KEY != 0
    }

    /// Meta page number the next commit of this state must write.
    pub fn slot_for(txnid: TxnId) -> PageId {
        PageId(txnid.0 % 2)
    }
}

/// Encodes `meta` into the head of a meta-page buffer and stamps the CRC.
pub fn encode_meta(buf: &mut [u8], meta: &Meta) -> Result<()> {
    if buf.len() < META_LEN {
        return Err(Error::Invalid("meta buffer too small"));
    }
    buf.fill(0);
    buf[META_MAGIC].copy_from_slice(MAGIC);
    buf[META_FORMAT_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf[META_FLAGS].copy_from_slice(&meta.flags.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_ROOT].copy_from_slice(&meta.root.0.to_be_bytes());
    buf[META_FREELIST_ROOT].copy_from_slice(&meta.freelist_root.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_TXNID].copy_from_slice(&meta.txnid.0.to_be_bytes());
    buf[META_RESERVED].fill(0);
    let crc = crc32fast::hash(&buf[..META_CRC32.start]);
    buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decodes and validates one meta slot.
pub fn decode_meta(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_LEN {
        return Err(Error::Corruption("meta page truncated"));
    }
    if &buf[META_MAGIC] != MAGIC {
        return Err(Error::Corruption("bad meta magic"));
    }
    let version = u16::from_be_bytes(buf[META_FORMAT_VERSION].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::Corruption("unsupported meta format version"));
    }
    let stored_crc = u32::from_be_bytes(buf[META_CRC32].try_into().unwrap());
    let crc = crc32fast::hash(&buf[..META_CRC32.start]);
    if crc != stored_crc {
        return Err(Error::Corruption("meta crc mismatch"));
    }
    if buf[META_RESERVED].iter().any(|b| *b != 0) {
        return Err(Error::Corruption("meta reserved field non-zero"));
    }
    let flags = u16::from_be_bytes(buf[META_FLAGS].try_into().unwrap());
    let page_size = u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    let salt = u64::from_be_bytes(buf[META_SALT].try_into().unwrap());
    let root = PageId(u64::from_be_bytes(buf[META_ROOT].try_into().unwrap()));
    let freelist_root = PageId(u64::from_be_bytes(
        buf[META_FREELIST_ROOT].try_into().unwrap(),
    ));
    let next_page = PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap()));
    let txnid = TxnId(u64::from_be_bytes(buf[META_TXNID].try_into().unwrap()));
    if next_page.0 < 2 {
        return Err(Error::Corruption("meta next_page inside meta slots"));
    }
    if root.0 != 0 && root.0 >= next_page.0 {
        return Err(Error::Corruption("meta root outside arena"));
    }
    if freelist_root.0 != 0 && freelist_root.0 >= next_page.0 {
        return Err(Error::Corruption("meta freelist root outside arena"));
    }
    Ok(Meta {
        page_size,
        flags,
        salt,
        root,
        freelist_root,
        next_page,
        txnid,
    })
}

/// Picks the authoritative slot out of the two decode attempts.
///
/// One corrupt slot is tolerated (it is overwritten by the next commit);
/// both corrupt is unrecoverable.
pub fn select_meta(slot0: Result<Meta>, slot1: Result<Meta>) -> Result<Meta> {
    match (slot0, slot1) {
        (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
        (Ok(a), Err(err)) => {
            warn!(error = %err, slot = 1, "meta slot invalid, falling back");
            Ok(a)
        }
        (Err(err), Ok(b)) => {
            warn!(error = %err, slot = 0, "meta slot invalid, falling back");
            Ok(b)
        }
        (Err(_), Err(_)) => Err(Error::Corruption("both meta slots invalid")),
    }
}
