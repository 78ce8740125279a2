//! Open-time options, durability modes and the pluggable key comparator.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HDR_LEN};

/// Durability mode applied to every commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Force data pages and the meta flip to stable storage per commit.
    #[default]
    Full,
    /// Skip the per-commit fsync; visibility is in-process until a later
    /// synced commit or an explicit flush.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }

    /// Parses a mode from a string (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// Key ordering policy for the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyOrder {
    /// Plain lexicographic byte comparison.
    Forward,
    /// Compare bytes from the end of each key toward the start.
    Reverse,
}

impl KeyOrder {
    /// Compares two keys under this ordering.
    pub fn cmp(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Forward => a.cmp(b),
            KeyOrder::Reverse => {
                let mut ia = a.iter().rev();
                let mut ib = b.iter().rev();
                loop {
                    match (ia.next(), ib.next()) {
                        (Some(x), Some(y)) => match x.cmp(y) {
                            Ordering::Equal => continue,
                            other => return other,
                        },
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                    }
                }
            }
        }
    }
}

/// Flags accepted by [`crate::Database::put`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteFlags {
    /// Fail with [`Error::KeyExists`](crate::Error::KeyExists) instead of
    /// overwriting an existing entry.
    pub no_overwrite: bool,
}

impl WriteFlags {
    /// Flags for an insert-only put.
    pub const NO_OVERWRITE: WriteFlags = WriteFlags { no_overwrite: true };
}

/// Configuration for [`crate::Database::open`].
///
/// Page geometry fields apply at creation; reopening an existing file
/// validates them against the stored meta page instead.
#[derive(Clone, Debug)]
pub struct Options {
    /// Size of each page in bytes; power of two within the supported range.
    pub page_size: u32,
    /// Durability mode for commits.
    pub synchronous: Synchronous,
    /// Open without write access; mutating calls fail with `ReadOnly`.
    pub read_only: bool,
    /// Key ordering. `None` inherits the order stored in the file (or
    /// forward order when creating); `Some` requires that exact order.
    pub key_order: Option<KeyOrder>,
    /// Unix permission bits used when the backing file is created.
    pub create_mode: u32,
    /// Verify page checksums on every decode.
    pub verify_checksums: bool,
    /// Longest accepted key in bytes.
    pub max_key_len: usize,
    /// Longest accepted value in bytes.
    pub max_value_len: usize,
    /// Largest value stored inline in a leaf; `None` derives a quarter of
    /// the page payload. Longer values spill to overflow chains.
    pub inline_value_cap: Option<usize>,
    /// Minimum payload fill percentage before a page is rebalanced.
    pub min_fill_percent: u8,
    /// Decoded pages kept in the node cache.
    pub cache_pages: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            synchronous: Synchronous::Full,
            read_only: false,
            key_order: None,
            create_mode: 0o644,
            verify_checksums: true,
            max_key_len: 511,
            max_value_len: 1 << 30,
            inline_value_cap: None,
            min_fill_percent: 25,
            cache_pages: 128,
        }
    }
}

impl Options {
    /// Validates the option set before it is used to open a file.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::Invalid("page size out of range"));
        }
        if self.min_fill_percent == 0 || self.min_fill_percent > 50 {
            return Err(Error::Invalid("min fill percent out of range"));
        }
        if self.max_key_len == 0 {
            return Err(Error::Invalid("max key length must be non-zero"));
        }
        let payload = self.page_size as usize - PAGE_HDR_LEN;
        let inline_cap = self.inline_value_cap(self.page_size);
        // A single maximal record plus its slot entry must fit on a page.
        if self.max_key_len + inline_cap + 32 > payload {
            return Err(Error::Invalid("key/value limits exceed page capacity"));
        }
        if self.cache_pages == 0 {
            return Err(Error::Invalid("cache must hold at least one page"));
        }
        Ok(())
    }

    /// Resolved inline-value cutover for the given page size.
    pub fn inline_value_cap(&self, page_size: u32) -> usize {
        self.inline_value_cap
            .unwrap_or((page_size as usize - PAGE_HDR_LEN) / 4)
    }

    /// Resolved underflow threshold in payload bytes for the given page size.
    pub fn min_fill_bytes(&self, page_size: u32) -> usize {
        (page_size as usize - PAGE_HDR_LEN) * self.min_fill_percent as usize / 100
    }
}
