//! Public database handle composing the pager and the tree engine.

use std::fs;
use std::path::{Path, PathBuf};

use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use crate::config::{Options, Synchronous, WriteFlags};
use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::tree::{Cursor, Tree};

/// Cheap counters describing an open store.
#[derive(Clone, Copy, Debug)]
pub struct Stats {
    /// Page size in bytes.
    pub page_size: u32,
    /// Commit counter of the current meta.
    pub txnid: u64,
    /// Pages in the file, meta slots included.
    pub page_count: u64,
    /// Pages recorded as reclaimable.
    pub free_pages: u64,
    /// Tree height; zero for an empty store.
    pub height: u32,
}

/// An open key/value store backed by a single file.
///
/// Reads take `&self` and only traverse the mapped file; mutations take
/// `&mut self`, which is the single-writer guarantee — there is no internal
/// locking to serialize concurrent writers, and none is needed. A second
/// process opening the same file is refused with [`Error::Busy`].
pub struct Database {
    pager: Pager,
    tree: Tree,
    options: Options,
}

impl Database {
    /// Opens or creates the store at `path`.
    ///
    /// Fails if the stored page size disagrees with `options.page_size`, if
    /// an explicit `key_order` conflicts with the order the file was created
    /// with, if neither meta slot validates, or if another process holds
    /// the file.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Database> {
        let pager = Pager::open(path.as_ref(), &options)?;
        if let Some(requested) = options.key_order {
            if requested != pager.key_order() {
                return Err(Error::Invalid("key order conflicts with existing file"));
            }
        }
        let tree = Tree::new(&pager, &options);
        Ok(Self {
            pager,
            tree,
            options,
        })
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.validate_key(key)?;
        self.tree.get(&self.pager, key)
    }

    /// Inserts or overwrites `key`, committing synchronously.
    ///
    /// With [`WriteFlags::NO_OVERWRITE`] an existing key fails with
    /// [`Error::KeyExists`] and the store is untouched.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_writable()?;
        self.validate_key(key)?;
        if value.len() > self.options.max_value_len {
            return Err(Error::Invalid("value longer than configured maximum"));
        }
        let staged = self
            .tree
            .put(&mut self.pager, key, value, flags.no_overwrite);
        match staged.and_then(|root| self.pager.commit(root).map(|()| root)) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.pager.rollback();
                Err(err)
            }
        }
    }

    /// Removes `key` and returns the value it held.
    pub fn delete(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_writable()?;
        self.validate_key(key)?;
        let staged = self.tree.delete(&mut self.pager, key);
        match staged.and_then(|(root, old)| self.pager.commit(root).map(|()| old)) {
            Ok(old) => Ok(old),
            Err(err) => {
                self.pager.rollback();
                Err(err)
            }
        }
    }

    /// In-order iterator over every entry.
    ///
    /// Order follows the comparator the file was created with: plain byte
    /// order, or trailing-byte-first in reverse-key mode.
    pub fn iter(&self) -> Cursor<'_> {
        self.tree.scan(&self.pager)
    }

    /// Counters for the current committed state.
    pub fn stats(&self) -> Result<Stats> {
        let meta = self.pager.meta();
        Ok(Stats {
            page_size: meta.page_size,
            txnid: meta.txnid.0,
            page_count: meta.next_page.0,
            free_pages: self.pager.free_page_count() as u64,
            height: self.tree.height(&self.pager)? as u32,
        })
    }

    /// Forces all file content to stable storage; useful after a run of
    /// commits with durability off.
    pub fn flush(&self) -> Result<()> {
        self.pager.sync_all()
    }

    /// Rewrites the store into the minimal set of pages.
    ///
    /// Live entries stream into a scratch file next to the original, which
    /// then atomically replaces it. The handle continues over the new file.
    pub fn compact(&mut self) -> Result<()> {
        self.check_writable()?;
        let path = self.pager.path().to_path_buf();
        let scratch = scratch_path(&path);
        if let Err(err) = self.copy_into(&scratch) {
            let _ = fs::remove_file(&scratch);
            return Err(err);
        }
        if let Err(err) = fs::rename(&scratch, &path) {
            let _ = fs::remove_file(&scratch);
            return Err(Error::Io(err));
        }
        self.pager = Pager::open(&path, &self.options)?;
        self.tree = Tree::new(&self.pager, &self.options);
        info!(path = %path.display(), "compacted database");
        Ok(())
    }

    /// Flushes and releases the handle.
    pub fn close(self) -> Result<()> {
        if !self.options.read_only {
            self.pager.sync_all()?;
        }
        debug!(path = %self.pager.path().display(), "closed database");
        Ok(())
    }

    fn copy_into(&self, scratch: &Path) -> Result<()> {
        let mut scratch_options = self.options.clone();
        scratch_options.synchronous = Synchronous::Off;
        scratch_options.read_only = false;
        scratch_options.key_order = Some(self.tree.order());
        let mut fresh = Database::open(scratch, scratch_options)?;
        for item in self.iter() {
            let (key, value) = item?;
            fresh.put(&key, &value, WriteFlags::default())?;
        }
        fresh.flush()?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Invalid("key must be non-empty"));
        }
        if key.len() > self.options.max_key_len {
            return Err(Error::Invalid("key longer than configured maximum"));
        }
        Ok(())
    }
}

/// Unique scratch filename beside `path`, named from the random-byte
/// service so concurrent compactions of different stores cannot collide.
fn scratch_path(path: &Path) -> PathBuf {
    let mut tag = [0u8; 8];
    OsRng.fill_bytes(&mut tag);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".compact-{}", hex::encode(tag)));
    PathBuf::from(name)
}
