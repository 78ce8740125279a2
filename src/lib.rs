//! Umbra — an embedded, single-file, copy-on-write B+tree key/value store.
//!
//! The store keeps opaque byte-string keys and values in a page-structured
//! file: two alternating meta pages anchor the committed tree, every
//! mutation rewrites its path copy-on-write, and retired pages flow through
//! a persisted free list before the file grows. Crash recovery needs no
//! replay log — reopening simply adopts the newer valid meta slot.
//!
//! ```no_run
//! use umbra::{Database, Options, WriteFlags};
//!
//! let mut db = Database::open("data.db", Options::default())?;
//! db.put(b"hello", b"world", WriteFlags::default())?;
//! assert_eq!(db.get(b"hello")?, b"world");
//! db.delete(b"hello")?;
//! # Ok::<(), umbra::Error>(())
//! ```

#![warn(missing_docs)]

pub mod bytes;
pub mod config;
pub mod db;
pub mod error;
pub mod io;
pub mod pager;
pub mod tree;
pub mod types;

pub use config::{KeyOrder, Options, Synchronous, WriteFlags};
pub use db::{Database, Stats};
pub use error::{Error, Result};
pub use tree::Cursor;
pub use types::{PageId, TxnId};
