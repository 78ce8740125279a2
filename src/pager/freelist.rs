//! Persisted record of reclaimable page numbers.
//!
//! Pages freed by a transaction are recorded in a batch keyed by that
//! transaction's id. A batch becomes eligible for reuse once its commit is
//! durable; with a single active handle there is no older-reader horizon to
//! wait out. Reuse is oldest-freed first. The serialized form is a byte
//! stream of batches carried by a chain of free-list pages owned by the
//! pager.

use std::collections::{BTreeMap, VecDeque};
use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::types::{PageId, TxnId};

const BATCH_HDR_LEN: usize = 12;

/// In-memory free-page list with an undo journal for the in-flight
/// transaction.
#[derive(Clone, Debug, Default)]
pub struct FreeList {
    batches: BTreeMap<TxnId, VecDeque<PageId>>,
    taken: Vec<(TxnId, PageId)>,
}

impl FreeList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the serialized batch stream.
    pub fn from_stream(buf: &[u8]) -> Result<Self> {
        let mut batches: BTreeMap<TxnId, VecDeque<PageId>> = BTreeMap::new();
        let mut pos = 0;
        while pos < buf.len() {
            if buf.len() - pos < BATCH_HDR_LEN {
                return Err(Error::Corruption("free-list batch header truncated"));
            }
            let txnid = TxnId(u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap()));
            let count = u32::from_be_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
            pos += BATCH_HDR_LEN;
            let body = count
                .checked_mul(8)
                .ok_or(Error::Corruption("free-list batch length overflow"))?;
            if buf.len() - pos < body {
                return Err(Error::Corruption("free-list batch truncated"));
            }
            if batches.contains_key(&txnid) {
                return Err(Error::Corruption("duplicate free-list batch"));
            }
            let mut pages = VecDeque::with_capacity(count);
            for chunk in buf[pos..pos + body].chunks_exact(8) {
                let id = PageId(u64::from_be_bytes(chunk.try_into().unwrap()));
                if !id.is_some() {
                    return Err(Error::Corruption("free-list contains page zero"));
                }
                pages.push_back(id);
            }
            pos += body;
            batches.insert(txnid, pages);
        }
        Ok(Self {
            batches,
            taken: Vec::new(),
        })
    }

    /// Serializes every batch, oldest transaction first.
    pub fn to_stream(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.page_count() * 8 + self.batches.len() * BATCH_HDR_LEN);
        for (txnid, pages) in &self.batches {
            if pages.is_empty() {
                continue;
            }
            out.extend_from_slice(&txnid.0.to_be_bytes());
            out.extend_from_slice(&(pages.len() as u32).to_be_bytes());
            for page in pages {
                out.extend_from_slice(&page.0.to_be_bytes());
            }
        }
        out
    }

    /// Removes and returns the oldest reusable page freed at or before
    /// `limit`, journaling the removal so a rollback can restore it.
    pub fn take(&mut self, limit: TxnId) -> Option<PageId> {
        let (&txnid, _) = self
            .batches
            .iter()
            .find(|(txnid, pages)| **txnid <= limit && !pages.is_empty())?;
        let pages = self.batches.get_mut(&txnid)?;
        let page = pages.pop_front()?;
        if pages.is_empty() {
            self.batches.remove(&txnid);
        }
        self.taken.push((txnid, page));
        Some(page)
    }

    /// Records `pages` as freed by transaction `txnid`.
    ///
    /// Called at commit time; the batch becomes eligible once that commit is
    /// the current durable meta.
    pub fn record(&mut self, txnid: TxnId, pages: impl IntoIterator<Item = PageId>) {
        let batch = self.batches.entry(txnid).or_default();
        batch.extend(pages);
        if batch.is_empty() {
            self.batches.remove(&txnid);
        }
    }

    /// Discards the undo journal after a successful commit.
    pub fn commit_taken(&mut self) {
        self.taken.clear();
    }

    /// Restores every page taken by the in-flight transaction.
    pub fn rollback_taken(&mut self) {
        while let Some((txnid, page)) = self.taken.pop() {
            self.batches.entry(txnid).or_default().push_front(page);
        }
    }

    /// Total reclaimable pages currently recorded.
    pub fn page_count(&self) -> usize {
        self.batches.values().map(VecDeque::len).sum()
    }
}
