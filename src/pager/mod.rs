//! Page store and commit protocol.
//!
//! The pager owns the backing file, a read-only memory map for committed
//! pages, and the staging area for the in-flight transaction. Committed
//! pages are immutable; a mutation stages fresh page images under fresh
//! page numbers and [`Pager::commit`] makes them durable by writing the
//! images, then flipping the alternate meta slot. A crash at any point
//! leaves the previously current meta slot pointing at an intact tree.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use crate::config::{KeyOrder, Options, Synchronous};
use crate::error::{Error, Result};
use crate::io;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, TxnId};

pub mod freelist;
pub mod meta;

use freelist::FreeList;
use meta::{Meta, META_FLAG_REVERSE_KEY, META_LEN};

/// Byte length of the stream-length prefix on the first free-list page.
const FREELIST_STREAM_PREFIX: usize = 8;

/// Single-file page store with copy-on-write transaction staging.
#[derive(Debug)]
pub struct Pager {
    file: File,
    path: PathBuf,
    mmap: Option<Mmap>,
    options: Options,
    meta: Meta,
    dirty: BTreeMap<PageId, Vec<u8>>,
    next_page: PageId,
    pending_free: Vec<PageId>,
    freelist: FreeList,
    freelist_pages: Vec<PageId>,
    read_only: bool,
}

impl Pager {
    /// Opens or creates the backing file and loads the authoritative meta.
    pub fn open(path: &Path, options: &Options) -> Result<Self> {
        options.validate()?;
        let file = open_file(path, options)?;
        lock_file(&file, options.read_only)?;

        let len = file.metadata()?.len();
        let (meta, created) = if len == 0 {
            if options.read_only {
                return Err(Error::Invalid("cannot create a read-only database"));
            }
            (create_store(&file, options)?, true)
        } else {
            (load_meta_slots(&file, options)?, false)
        };

        if meta.page_size != options.page_size {
            return Err(Error::Invalid("page size disagrees with stored page size"));
        }
        let page_size = meta.page_size as u64;
        let len = file.metadata()?.len();
        if len < meta.next_page.0.saturating_mul(page_size) {
            return Err(Error::Corruption("file shorter than page count"));
        }

        let (freelist, freelist_pages) = load_freelist(&file, &meta, options)?;
        let mmap = map_file(&file, len)?;

        if created {
            info!(path = %path.display(), page_size = meta.page_size, "created database");
        } else {
            debug!(
                path = %path.display(),
                txnid = %meta.txnid,
                root = %meta.root,
                "opened database"
            );
        }

        let next_page = meta.next_page;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mmap,
            options: options.clone(),
            meta,
            dirty: BTreeMap::new(),
            next_page,
            pending_free: Vec::new(),
            freelist,
            freelist_pages,
            read_only: options.read_only,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size fixed at creation.
    pub fn page_size(&self) -> u32 {
        self.meta.page_size
    }

    /// Salt mixed into every page checksum.
    pub fn salt(&self) -> u64 {
        self.meta.salt
    }

    /// Last committed meta.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Key order recorded at creation.
    pub fn key_order(&self) -> KeyOrder {
        if self.meta.reverse_key() {
            KeyOrder::Reverse
        } else {
            KeyOrder::Forward
        }
    }

    /// Transaction id the in-flight mutation will commit under.
    pub fn next_txnid(&self) -> TxnId {
        TxnId(self.meta.txnid.0 + 1)
    }

    /// Number of reclaimable pages currently recorded.
    pub fn free_page_count(&self) -> usize {
        self.freelist.page_count()
    }

    /// True when `id` has a staged image in the in-flight transaction.
    pub fn is_dirty(&self, id: PageId) -> bool {
        self.dirty.contains_key(&id)
    }

    /// Returns a borrowed view of a page: the staged image if the in-flight
    /// transaction wrote one, otherwise the committed image in the map.
    pub fn read_page(&self, id: PageId) -> Result<&[u8]> {
        if id.0 < 2 {
            return Err(Error::Invalid("meta pages are not readable as arena pages"));
        }
        if let Some(image) = self.dirty.get(&id) {
            return Ok(image.as_slice());
        }
        let page_size = self.meta.page_size as usize;
        let offset = page_offset(id, self.meta.page_size)? as usize;
        let mmap = self
            .mmap
            .as_ref()
            .ok_or(Error::Corruption("page read from unmapped file"))?;
        let end = offset
            .checked_add(page_size)
            .ok_or(Error::Corruption("page offset overflow"))?;
        if end > mmap.len() {
            return Err(Error::Corruption("page read beyond end of file"));
        }
        Ok(&mmap[offset..end])
    }

    /// Returns a fresh page number, reusing an eligible freed page before
    /// growing the file.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(id) = self.freelist.take(self.meta.txnid) {
            debug_assert!(!self.dirty.contains_key(&id));
            return Ok(id);
        }
        let id = self.next_page;
        let next = id
            .0
            .checked_add(1)
            .ok_or(Error::Invalid("page number space exhausted"))?;
        page_offset(PageId(next), self.meta.page_size)?;
        self.next_page = PageId(next);
        Ok(id)
    }

    /// Stages a page image for the in-flight transaction.
    pub fn stage(&mut self, id: PageId, image: Vec<u8>) -> Result<()> {
        if image.len() != self.meta.page_size as usize {
            return Err(Error::Invalid("staged page has wrong size"));
        }
        if id.0 < 2 {
            return Err(Error::Invalid("meta pages cannot be staged"));
        }
        self.dirty.insert(id, image);
        Ok(())
    }

    /// Marks a committed page reclaimable once the in-flight transaction
    /// commits.
    pub fn free_page(&mut self, id: PageId) {
        debug_assert!(id.0 >= 2);
        debug_assert!(!self.dirty.contains_key(&id));
        self.pending_free.push(id);
    }

    /// Writes every staged page, then flips the alternate meta slot.
    ///
    /// `new_root` becomes the tree root of the committed transaction. On
    /// error nothing is adopted; the caller rolls back and the previous
    /// meta remains current.
    pub fn commit(&mut self, new_root: PageId) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let txnid = self.next_txnid();
        let page_size = self.meta.page_size;

        // Pages retired by this transaction: everything the tree freed plus
        // the previous free-list chain, which is rewritten wholesale below.
        let mut new_freelist = self.freelist.clone();
        new_freelist.record(
            txnid,
            self.pending_free
                .iter()
                .chain(self.freelist_pages.iter())
                .copied(),
        );

        // The chain length is fixed from the pre-take stream size, so taking
        // pages for the chain (which shrinks the stream) needs no second
        // pass; a trailing padding page is tolerated by the loader.
        let mut next_page = self.next_page;
        let (freelist_root, chain) = encode_freelist_chain(
            &mut new_freelist,
            self.meta.txnid,
            page_size,
            self.meta.salt,
            &mut next_page,
        )?;
        for (id, image) in &chain {
            self.dirty.insert(*id, image.clone());
        }

        let needed = page_offset(next_page, page_size)?;
        if needed > self.file.metadata()?.len() {
            self.file.set_len(needed)?;
        }
        for (id, image) in &self.dirty {
            io::write_all_at(&self.file, page_offset(*id, page_size)?, image)?;
        }
        if self.options.synchronous == Synchronous::Full {
            self.file.sync_all()?;
        }

        let new_meta = Meta {
            page_size,
            flags: self.meta.flags,
            salt: self.meta.salt,
            root: new_root,
            freelist_root,
            next_page,
            txnid,
        };
        let mut slot = vec![0u8; page_size as usize];
        meta::encode_meta(&mut slot, &new_meta)?;
        let slot_offset = Meta::slot_for(txnid).0 * page_size as u64;
        io::write_all_at(&self.file, slot_offset, &slot)?;
        if self.options.synchronous == Synchronous::Full {
            self.file.sync_all()?;
        }

        debug!(txnid = %txnid, root = %new_root, pages = self.dirty.len(), "committed");

        new_freelist.commit_taken();
        self.meta = new_meta;
        self.freelist = new_freelist;
        self.freelist_pages = chain.into_iter().map(|(id, _)| id).collect();
        self.pending_free.clear();
        self.dirty.clear();
        self.next_page = next_page;
        self.remap_if_grown()?;
        Ok(())
    }

    /// Discards every effect of the in-flight transaction.
    pub fn rollback(&mut self) {
        self.dirty.clear();
        self.pending_free.clear();
        self.freelist.rollback_taken();
        self.next_page = self.meta.next_page;
    }

    /// Forces all file content to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn remap_if_grown(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let mapped = self.mmap.as_ref().map_or(0, |m| m.len() as u64);
        if len != mapped {
            self.mmap = map_file(&self.file, len)?;
        }
        Ok(())
    }
}

fn open_file(path: &Path, options: &Options) -> Result<File> {
    let mut open_options = OpenOptions::new();
    open_options.read(true);
    if !options.read_only {
        open_options.write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_options.mode(options.create_mode);
        }
    }
    Ok(open_options.open(path)?)
}

fn lock_file(file: &File, read_only: bool) -> Result<()> {
    let locked = if read_only {
        FileExt::try_lock_shared(file)
    } else {
        FileExt::try_lock_exclusive(file)
    };
    match locked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            Err(Error::Busy("backing file is locked by another process"))
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn map_file(file: &File, len: u64) -> Result<Option<Mmap>> {
    if len == 0 {
        return Ok(None);
    }
    // Safety: the file is advisory-locked for the lifetime of the handle
    // and committed pages are never rewritten in place.
    let mmap = unsafe { Mmap::map(file)? };
    Ok(Some(mmap))
}

fn create_store(file: &File, options: &Options) -> Result<Meta> {
    let mut flags = 0u16;
    if options.key_order == Some(KeyOrder::Reverse) {
        flags |= META_FLAG_REVERSE_KEY;
    }
    let salt = OsRng.next_u64();
    let meta = Meta::new(options.page_size, salt, flags);
    let page_size = options.page_size as u64;
    file.set_len(2 * page_size)?;
    let mut slot = vec![0u8; options.page_size as usize];
    meta::encode_meta(&mut slot, &meta)?;
    io::write_all_at(file, 0, &slot)?;
    io::write_all_at(file, page_size, &slot)?;
    if options.synchronous == Synchronous::Full {
        file.sync_all()?;
    }
    Ok(meta)
}

fn load_meta_slots(file: &File, options: &Options) -> Result<Meta> {
    let slot0 = read_meta_slot(file, 0);
    let slot1_offset = slot0
        .as_ref()
        .map(|m| m.page_size as u64)
        .unwrap_or(options.page_size as u64);
    let slot1 = read_meta_slot(file, slot1_offset);
    meta::select_meta(slot0, slot1)
}

fn read_meta_slot(file: &File, offset: u64) -> Result<Meta> {
    let mut buf = [0u8; META_LEN];
    match io::read_exact_at(file, offset, &mut buf) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(Error::Corruption("meta page truncated"));
        }
        Err(err) => return Err(Error::Io(err)),
    }
    meta::decode_meta(&buf)
}

fn load_freelist(file: &File, meta: &Meta, options: &Options) -> Result<(FreeList, Vec<PageId>)> {
    if !meta.freelist_root.is_some() {
        return Ok((FreeList::new(), Vec::new()));
    }
    let page_size = meta.page_size as usize;
    let mut chain = Vec::new();
    let mut stream = Vec::new();
    let mut expected: Option<usize> = None;
    let mut next = meta.freelist_root;
    while next.is_some() {
        if chain.contains(&next) {
            return Err(Error::Corruption("free-list chain contains a cycle"));
        }
        let mut image = vec![0u8; page_size];
        io::read_exact_at(file, page_offset(next, meta.page_size)?, &mut image)
            .map_err(|_| Error::Corruption("free-list page truncated"))?;
        if options.verify_checksums {
            page::verify_crc32(next, meta.salt, &image)?;
        }
        let header = PageHeader::decode(&image)?;
        if header.kind != PageKind::FreeList {
            return Err(Error::Corruption("free-list chain page has wrong kind"));
        }
        let payload = &image[PAGE_HDR_LEN..];
        let body = if expected.is_none() {
            let total = u64::from_be_bytes(payload[..FREELIST_STREAM_PREFIX].try_into().unwrap());
            let total = usize::try_from(total)
                .map_err(|_| Error::Corruption("free-list stream length overflow"))?;
            expected = Some(total);
            &payload[FREELIST_STREAM_PREFIX..]
        } else {
            payload
        };
        let expected_len = expected.unwrap_or(0);
        // Trailing chain pages past the stream length are padding left by
        // the fixed-count encoder; they still belong to the chain.
        let want = expected_len.saturating_sub(stream.len());
        stream.extend_from_slice(&body[..want.min(body.len())]);
        chain.push(next);
        next = header.next;
    }
    let expected_len = expected.unwrap_or(0);
    if stream.len() != expected_len {
        return Err(Error::Corruption("free-list stream truncated"));
    }
    let freelist = FreeList::from_stream(&stream)?;
    Ok((freelist, chain))
}

fn encode_freelist_chain(
    freelist: &mut FreeList,
    committed: TxnId,
    page_size: u32,
    salt: u64,
    next_page: &mut PageId,
) -> Result<(PageId, Vec<(PageId, Vec<u8>)>)> {
    let payload_cap = page_size as usize - PAGE_HDR_LEN;
    let first_cap = payload_cap - FREELIST_STREAM_PREFIX;

    // Size the chain before taking any pages for it; the takes below only
    // shrink the stream, so the count stays sufficient.
    let initial_len = freelist.to_stream().len();
    if initial_len == 0 {
        return Ok((PageId::NONE, Vec::new()));
    }
    let rest = initial_len.saturating_sub(first_cap);
    let n_pages = 1 + rest.div_ceil(payload_cap);

    let mut ids = Vec::with_capacity(n_pages);
    for _ in 0..n_pages {
        let id = match freelist.take(committed) {
            Some(id) => id,
            None => {
                let id = *next_page;
                let next = id
                    .0
                    .checked_add(1)
                    .ok_or(Error::Invalid("page number space exhausted"))?;
                *next_page = PageId(next);
                id
            }
        };
        ids.push(id);
    }

    let stream = freelist.to_stream();
    let mut pages = Vec::with_capacity(n_pages);
    let mut pos = 0usize;
    for (idx, id) in ids.iter().enumerate() {
        let mut image = vec![0u8; page_size as usize];
        let mut header = PageHeader::new(PageKind::FreeList, page_size);
        header.next = ids.get(idx + 1).copied().unwrap_or(PageId::NONE);
        header.encode(&mut image)?;
        let payload = &mut image[PAGE_HDR_LEN..];
        let body = if idx == 0 {
            payload[..FREELIST_STREAM_PREFIX].copy_from_slice(&(stream.len() as u64).to_be_bytes());
            &mut payload[FREELIST_STREAM_PREFIX..]
        } else {
            payload
        };
        let take = body.len().min(stream.len() - pos);
        body[..take].copy_from_slice(&stream[pos..pos + take]);
        pos += take;
        page::stamp_crc32(*id, salt, &mut image)?;
        pages.push((*id, image));
    }
    debug_assert_eq!(pos, stream.len());
    Ok((ids[0], pages))
}

/// Byte offset of a page, with overflow checking.
pub fn page_offset(id: PageId, page_size: u32) -> Result<u64> {
    id.0
        .checked_mul(page_size as u64)
        .ok_or(Error::Invalid("page offset overflow"))
}
