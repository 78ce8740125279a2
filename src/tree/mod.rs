//! Copy-on-write B+tree engine.
//!
//! Every mutation rewrites the touched path bottom-up: the leaf gets a new
//! page number, then each ancestor is rebuilt with the updated child
//! reference, and the final root id is handed to the pager's commit. No
//! page reachable from the committed meta is ever edited in place; the old
//! path pages are handed to the free list and become reusable only after
//! the commit that retires them is durable.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use smallvec::SmallVec;

use crate::config::{KeyOrder, Options};
use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::PageId;

pub mod node;

use node::{BranchEntry, LeafEntry, LeafValue, Node};

/// Replacement set produced by rewriting one node: one page, or two after a
/// split, each carried with the smallest key it covers.
type Replacement = SmallVec<[(PageId, Vec<u8>); 2]>;

/// B+tree logic bound to one open store.
///
/// The tree holds no page state of its own beyond a cache of decoded,
/// committed nodes; all page content lives in the pager.
pub struct Tree {
    order: KeyOrder,
    page_size: u32,
    salt: u64,
    verify_checksums: bool,
    inline_cap: usize,
    min_fill: usize,
    cache: RefCell<LruCache<PageId, Arc<Node>>>,
}

impl Tree {
    /// Builds the engine for an open pager.
    pub fn new(pager: &Pager, options: &Options) -> Self {
        let page_size = pager.page_size();
        let cache_size =
            NonZeroUsize::new(options.cache_pages).unwrap_or(NonZeroUsize::new(128).unwrap());
        Self {
            order: pager.key_order(),
            page_size,
            salt: pager.salt(),
            verify_checksums: options.verify_checksums,
            inline_cap: options.inline_value_cap(page_size),
            min_fill: options.min_fill_bytes(page_size),
            cache: RefCell::new(LruCache::new(cache_size)),
        }
    }

    /// Active key ordering.
    pub fn order(&self) -> KeyOrder {
        self.order
    }

    /// Looks up `key` and returns its value with overflow chains resolved.
    pub fn get(&self, pager: &Pager, key: &[u8]) -> Result<Vec<u8>> {
        let mut current = pager.meta().root;
        if !current.is_some() {
            return Err(Error::NotFound);
        }
        loop {
            let node = self.read_node(pager, current)?;
            match &*node {
                Node::Branch(entries) => {
                    if entries.is_empty() {
                        return Err(Error::Corruption("branch page with no entries"));
                    }
                    current = entries[self.choose_child(entries, key)].child;
                }
                Node::Leaf(entries) => {
                    return match self.search_leaf(entries, key) {
                        Ok(idx) => self.read_value(pager, &entries[idx].value),
                        Err(_) => Err(Error::NotFound),
                    };
                }
            }
        }
    }

    /// Inserts or overwrites `key`, returning the staged root for commit.
    pub fn put(
        &self,
        pager: &mut Pager,
        key: &[u8],
        value: &[u8],
        no_overwrite: bool,
    ) -> Result<PageId> {
        let root = pager.meta().root;
        if !root.is_some() {
            let value = self.make_leaf_value(pager, value)?;
            let node = Node::Leaf(vec![LeafEntry {
                key: key.to_vec(),
                value,
            }]);
            let (id, _) = self.write_node(pager, node)?;
            return Ok(id);
        }

        let (path, leaf_id) = self.descend(pager, root, key)?;
        let mut entries = match &*self.read_node(pager, leaf_id)? {
            Node::Leaf(entries) => entries.clone(),
            Node::Branch(_) => return Err(Error::Corruption("descent ended on a branch page")),
        };

        match self.search_leaf(&entries, key) {
            Ok(idx) => {
                if no_overwrite {
                    return Err(Error::KeyExists);
                }
                self.free_value(pager, &entries[idx].value)?;
                entries[idx].value = self.make_leaf_value(pager, value)?;
            }
            Err(idx) => {
                let value = self.make_leaf_value(pager, value)?;
                entries.insert(
                    idx,
                    LeafEntry {
                        key: key.to_vec(),
                        value,
                    },
                );
            }
        }

        self.retire_page(pager, leaf_id);
        let mut replacement = self.write_or_split(pager, Node::Leaf(entries))?;
        for step in path.into_iter().rev() {
            let mut entries = match &*step.node {
                Node::Branch(entries) => entries.clone(),
                Node::Leaf(_) => return Err(Error::Corruption("leaf page on branch path")),
            };
            entries.splice(
                step.child_idx..=step.child_idx,
                replacement.iter().map(|(id, min)| BranchEntry {
                    sep: min.clone(),
                    child: *id,
                }),
            );
            self.retire_page(pager, step.page_id);
            replacement = self.write_or_split(pager, Node::Branch(entries))?;
        }

        if replacement.len() == 1 {
            Ok(replacement[0].0)
        } else {
            let entries = replacement
                .into_iter()
                .map(|(id, min)| BranchEntry {
                    sep: min,
                    child: id,
                })
                .collect();
            let (id, _) = self.write_node(pager, Node::Branch(entries))?;
            Ok(id)
        }
    }

    /// Removes `key`, returning the staged root and the removed value.
    pub fn delete(&self, pager: &mut Pager, key: &[u8]) -> Result<(PageId, Vec<u8>)> {
        let root = pager.meta().root;
        if !root.is_some() {
            return Err(Error::NotFound);
        }

        let (path, leaf_id) = self.descend(pager, root, key)?;
        let mut entries = match &*self.read_node(pager, leaf_id)? {
            Node::Leaf(entries) => entries.clone(),
            Node::Branch(_) => return Err(Error::Corruption("descent ended on a branch page")),
        };
        let idx = match self.search_leaf(&entries, key) {
            Ok(idx) => idx,
            Err(_) => return Err(Error::NotFound),
        };
        let removed = entries.remove(idx);
        let old_value = self.read_value(pager, &removed.value)?;
        self.free_value(pager, &removed.value)?;
        self.retire_page(pager, leaf_id);

        let mut pending = Node::Leaf(entries);
        for step in path.into_iter().rev() {
            let mut entries = match &*step.node {
                Node::Branch(entries) => entries.clone(),
                Node::Leaf(_) => return Err(Error::Corruption("leaf page on branch path")),
            };
            self.retire_page(pager, step.page_id);
            if entries.len() == 1 {
                // A single-child branch adds nothing; it dissolves and its
                // child keeps propagating upward.
                continue;
            }
            let mut child_idx = step.child_idx;
            if pending.used_bytes() < self.min_fill {
                self.rebalance(pager, &mut entries, &mut child_idx, &mut pending)?;
            }
            let (id, min) = self.write_node(pager, pending)?;
            entries[child_idx] = BranchEntry {
                sep: min,
                child: id,
            };
            pending = Node::Branch(entries);
        }

        match &pending {
            Node::Leaf(entries) if entries.is_empty() => Ok((PageId::NONE, old_value)),
            Node::Branch(entries) if entries.len() == 1 => Ok((entries[0].child, old_value)),
            _ => {
                let (id, _) = self.write_node(pager, pending)?;
                Ok((id, old_value))
            }
        }
    }

    /// In-order cursor over the committed tree.
    pub fn scan<'a>(&'a self, pager: &'a Pager) -> Cursor<'a> {
        Cursor {
            tree: self,
            pager,
            stack: Vec::new(),
            started: false,
            done: false,
        }
    }

    /// Height of the committed tree (0 for an empty store).
    pub fn height(&self, pager: &Pager) -> Result<usize> {
        let mut current = pager.meta().root;
        let mut height = 0;
        while current.is_some() {
            height += 1;
            match &*self.read_node(pager, current)? {
                Node::Branch(entries) => {
                    current = entries
                        .first()
                        .ok_or(Error::Corruption("branch page with no entries"))?
                        .child;
                }
                Node::Leaf(_) => break,
            }
        }
        Ok(height)
    }

    /// Drops every cached node; used when the backing file is replaced.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    fn descend(
        &self,
        pager: &Pager,
        root: PageId,
        key: &[u8],
    ) -> Result<(Vec<PathStep>, PageId)> {
        let mut path = Vec::new();
        let mut current = root;
        loop {
            let node = self.read_node(pager, current)?;
            match &*node {
                Node::Branch(entries) => {
                    if entries.is_empty() {
                        return Err(Error::Corruption("branch page with no entries"));
                    }
                    let child_idx = self.choose_child(entries, key);
                    let child = entries[child_idx].child;
                    path.push(PathStep {
                        page_id: current,
                        node: node.clone(),
                        child_idx,
                    });
                    if path.len() > 64 {
                        return Err(Error::Corruption("tree deeper than supported"));
                    }
                    current = child;
                }
                Node::Leaf(_) => return Ok((path, current)),
            }
        }
    }

    /// Rightmost child whose separator does not exceed `key`; keys below
    /// every separator route to the leftmost child.
    fn choose_child(&self, entries: &[BranchEntry], key: &[u8]) -> usize {
        let below = entries
            .partition_point(|e| self.order.cmp(&e.sep, key) != std::cmp::Ordering::Greater);
        below.saturating_sub(1)
    }

    fn search_leaf(&self, entries: &[LeafEntry], key: &[u8]) -> std::result::Result<usize, usize> {
        entries.binary_search_by(|e| self.order.cmp(&e.key, key))
    }

    /// Decodes a node, serving committed pages from the LRU cache.
    fn read_node(&self, pager: &Pager, id: PageId) -> Result<Arc<Node>> {
        if pager.is_dirty(id) {
            let image = pager.read_page(id)?;
            return Ok(Arc::new(Node::decode(image)?));
        }
        if let Some(node) = self.cache.borrow_mut().get(&id) {
            return Ok(node.clone());
        }
        let image = pager.read_page(id)?;
        if self.verify_checksums {
            page::verify_crc32(id, self.salt, image)?;
        }
        let node = Arc::new(Node::decode(image)?);
        self.cache.borrow_mut().put(id, node.clone());
        Ok(node)
    }

    /// Frees a committed tree page and forgets its cached decode.
    fn retire_page(&self, pager: &mut Pager, id: PageId) {
        self.cache.borrow_mut().pop(&id);
        pager.free_page(id);
    }

    /// Allocates a page for `node`, stages its image and returns the id and
    /// the smallest key the node covers.
    fn write_node(&self, pager: &mut Pager, node: Node) -> Result<(PageId, Vec<u8>)> {
        let id = pager.allocate()?;
        let mut image = node.encode(self.page_size)?;
        page::stamp_crc32(id, self.salt, &mut image)?;
        pager.stage(id, image)?;
        let min = node.min_key().unwrap_or_default().to_vec();
        Ok((id, min))
    }

    /// Writes `node`, splitting it into two pages when it no longer fits.
    fn write_or_split(&self, pager: &mut Pager, node: Node) -> Result<Replacement> {
        if node.fits(self.page_size) {
            let (id, min) = self.write_node(pager, node)?;
            let mut replacement = Replacement::new();
            replacement.push((id, min));
            return Ok(replacement);
        }
        let (left, right) = split_node(node, self.page_size)?;
        let (left_id, left_min) = self.write_node(pager, left)?;
        let (right_id, right_min) = self.write_node(pager, right)?;
        let mut replacement = Replacement::new();
        replacement.push((left_id, left_min));
        replacement.push((right_id, right_min));
        Ok(replacement)
    }

    /// Restores the fill level of `pending` using a sibling under the same
    /// parent: merge right when the pair fits, else borrow from the sibling
    /// with surplus, else merge left.
    fn rebalance(
        &self,
        pager: &mut Pager,
        entries: &mut Vec<BranchEntry>,
        child_idx: &mut usize,
        pending: &mut Node,
    ) -> Result<()> {
        let right_idx = *child_idx + 1;
        let right = if right_idx < entries.len() {
            let id = entries[right_idx].child;
            Some((id, self.read_node(pager, id)?))
        } else {
            None
        };
        if let Some((right_id, right_node)) = &right {
            let combined = concat_nodes(pending, right_node.as_ref())?;
            if combined.fits(self.page_size) {
                self.retire_page(pager, *right_id);
                entries.remove(right_idx);
                *pending = combined;
                return Ok(());
            }
        }

        let left = if *child_idx > 0 {
            let id = entries[*child_idx - 1].child;
            Some((id, self.read_node(pager, id)?))
        } else {
            None
        };

        // Borrow one entry from the fuller sibling, provided the donor stays
        // above the threshold itself.
        let right_used = right.as_ref().map(|(_, n)| n.used_bytes()).unwrap_or(0);
        let left_used = left.as_ref().map(|(_, n)| n.used_bytes()).unwrap_or(0);
        if right_used >= left_used {
            if let Some((right_id, right_node)) = &right {
                if self.try_borrow(pager, entries, *child_idx, pending, *right_id, right_node.as_ref(), true)? {
                    return Ok(());
                }
            }
            if let Some((left_id, left_node)) = &left {
                if self.try_borrow(pager, entries, *child_idx, pending, *left_id, left_node.as_ref(), false)? {
                    return Ok(());
                }
            }
        } else {
            if let Some((left_id, left_node)) = &left {
                if self.try_borrow(pager, entries, *child_idx, pending, *left_id, left_node.as_ref(), false)? {
                    return Ok(());
                }
            }
            if let Some((right_id, right_node)) = &right {
                if self.try_borrow(pager, entries, *child_idx, pending, *right_id, right_node.as_ref(), true)? {
                    return Ok(());
                }
            }
        }

        if let Some((left_id, left_node)) = &left {
            let combined = concat_nodes(left_node.as_ref(), pending)?;
            if combined.fits(self.page_size) {
                self.retire_page(pager, *left_id);
                entries.remove(*child_idx);
                *child_idx -= 1;
                *pending = combined;
                return Ok(());
            }
        }
        // Both siblings are at capacity; an underfull node is tolerated.
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn try_borrow(
        &self,
        pager: &mut Pager,
        entries: &mut [BranchEntry],
        child_idx: usize,
        pending: &mut Node,
        donor_id: PageId,
        donor: &Node,
        from_right: bool,
    ) -> Result<bool> {
        if donor.len() < 2 || donor.is_leaf() != pending.is_leaf() {
            return Ok(false);
        }
        let mut donor = donor.clone();
        let (moved_leaf, moved_branch, moved_bytes) = match &mut donor {
            Node::Leaf(donor_entries) => {
                let entry = if from_right {
                    donor_entries.remove(0)
                } else {
                    donor_entries.pop().expect("donor has entries")
                };
                let bytes = node::leaf_record_len(&entry.key, &entry.value) + node::SLOT_ENTRY_LEN;
                (Some(entry), None, bytes)
            }
            Node::Branch(donor_entries) => {
                let entry = if from_right {
                    donor_entries.remove(0)
                } else {
                    donor_entries.pop().expect("donor has entries")
                };
                let bytes = node::branch_record_len(&entry.sep) + node::SLOT_ENTRY_LEN;
                (None, Some(entry), bytes)
            }
        };
        // The donation must leave the donor healthy and the receiver legal.
        if donor.used_bytes() < self.min_fill
            || pending.encoded_len() + moved_bytes > self.page_size as usize
        {
            return Ok(false);
        }
        match &mut *pending {
            Node::Leaf(pending_entries) => {
                let entry = moved_leaf.expect("kinds checked above");
                if from_right {
                    pending_entries.push(entry);
                } else {
                    pending_entries.insert(0, entry);
                }
            }
            Node::Branch(pending_entries) => {
                let entry = moved_branch.expect("kinds checked above");
                if from_right {
                    pending_entries.push(entry);
                } else {
                    pending_entries.insert(0, entry);
                }
            }
        }
        let donor_pos = if from_right { child_idx + 1 } else { child_idx - 1 };
        self.retire_page(pager, donor_id);
        let (new_donor_id, new_donor_min) = self.write_node(pager, donor)?;
        entries[donor_pos] = BranchEntry {
            sep: new_donor_min,
            child: new_donor_id,
        };
        Ok(true)
    }

    /// Converts caller bytes into a leaf value, spilling oversized values to
    /// a staged overflow chain.
    fn make_leaf_value(&self, pager: &mut Pager, value: &[u8]) -> Result<LeafValue> {
        if value.len() <= self.inline_cap {
            return Ok(LeafValue::Inline(value.to_vec()));
        }
        let head = self.write_overflow(pager, value)?;
        Ok(LeafValue::Spilled {
            head,
            total_len: value.len() as u64,
        })
    }

    /// Resolves a leaf value to owned bytes.
    fn read_value(&self, pager: &Pager, value: &LeafValue) -> Result<Vec<u8>> {
        match value {
            LeafValue::Inline(bytes) => Ok(bytes.clone()),
            LeafValue::Spilled { head, total_len } => {
                self.read_overflow(pager, *head, *total_len)
            }
        }
    }

    /// Frees the overflow chain behind a spilled value, if any.
    fn free_value(&self, pager: &mut Pager, value: &LeafValue) -> Result<()> {
        if let LeafValue::Spilled { head, total_len } = value {
            let pages = self.walk_overflow(pager, *head, *total_len)?;
            for id in pages {
                pager.free_page(id);
            }
        }
        Ok(())
    }

    fn overflow_capacity(&self) -> usize {
        self.page_size as usize - PAGE_HDR_LEN
    }

    fn write_overflow(&self, pager: &mut Pager, value: &[u8]) -> Result<PageId> {
        let cap = self.overflow_capacity();
        let n_pages = value.len().div_ceil(cap).max(1);
        let mut ids = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            ids.push(pager.allocate()?);
        }
        for (idx, chunk) in value.chunks(cap).enumerate() {
            let id = ids[idx];
            let mut image = vec![0u8; self.page_size as usize];
            let mut header = PageHeader::new(PageKind::Overflow, self.page_size);
            header.next = ids.get(idx + 1).copied().unwrap_or(PageId::NONE);
            header.encode(&mut image)?;
            image[PAGE_HDR_LEN..PAGE_HDR_LEN + chunk.len()].copy_from_slice(chunk);
            page::stamp_crc32(id, self.salt, &mut image)?;
            pager.stage(id, image)?;
        }
        Ok(ids[0])
    }

    fn read_overflow(&self, pager: &Pager, head: PageId, total_len: u64) -> Result<Vec<u8>> {
        let total = usize::try_from(total_len)
            .map_err(|_| Error::Corruption("overflow value exceeds usize"))?;
        let cap = self.overflow_capacity();
        let mut out = Vec::with_capacity(total);
        for id in self.walk_overflow(pager, head, total_len)? {
            let image = pager.read_page(id)?;
            let take = cap.min(total - out.len());
            out.extend_from_slice(&image[PAGE_HDR_LEN..PAGE_HDR_LEN + take]);
        }
        debug_assert_eq!(out.len(), total);
        Ok(out)
    }

    /// Validates an overflow chain and returns its page ids in order.
    fn walk_overflow(&self, pager: &Pager, head: PageId, total_len: u64) -> Result<Vec<PageId>> {
        let cap = self.overflow_capacity() as u64;
        let expected = usize::try_from(total_len.div_ceil(cap).max(1))
            .map_err(|_| Error::Corruption("overflow chain length overflow"))?;
        let mut ids = Vec::with_capacity(expected);
        let mut current = head;
        while current.is_some() {
            if ids.len() == expected {
                return Err(Error::Corruption("overflow chain longer than value"));
            }
            let image = pager.read_page(current)?;
            if self.verify_checksums && !pager.is_dirty(current) {
                page::verify_crc32(current, self.salt, image)?;
            }
            let header = PageHeader::decode(image)?;
            if header.kind != PageKind::Overflow {
                return Err(Error::Corruption("overflow chain page has wrong kind"));
            }
            ids.push(current);
            current = header.next;
        }
        if ids.len() != expected {
            return Err(Error::Corruption("overflow chain shorter than value"));
        }
        Ok(ids)
    }
}

struct PathStep {
    page_id: PageId,
    node: Arc<Node>,
    child_idx: usize,
}

/// In-order iterator over committed entries.
pub struct Cursor<'a> {
    tree: &'a Tree,
    pager: &'a Pager,
    stack: Vec<(Arc<Node>, usize)>,
    started: bool,
    done: bool,
}

impl Cursor<'_> {
    fn prime(&mut self) -> Result<()> {
        self.started = true;
        let root = self.pager.meta().root;
        if root.is_some() {
            let node = self.tree.read_node(self.pager, root)?;
            self.stack.push((node, 0));
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.started {
            self.prime()?;
        }
        loop {
            let Some((node, idx)) = self.stack.last().map(|(n, i)| (n.clone(), *i)) else {
                return Ok(None);
            };
            if idx >= node.len() {
                self.stack.pop();
                continue;
            }
            self.stack.last_mut().expect("stack non-empty").1 += 1;
            match &*node {
                Node::Branch(entries) => {
                    if self.stack.len() > 64 {
                        return Err(Error::Corruption("tree deeper than supported"));
                    }
                    let child = self.tree.read_node(self.pager, entries[idx].child)?;
                    self.stack.push((child, 0));
                }
                Node::Leaf(entries) => {
                    let entry = &entries[idx];
                    let value = self.tree.read_value(self.pager, &entry.value)?;
                    return Ok(Some((entry.key.clone(), value)));
                }
            }
        }
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Splits an over-full node into two fitting halves, preferring balance.
fn split_node(node: Node, page_size: u32) -> Result<(Node, Node)> {
    let record_lens: Vec<usize> = match &node {
        Node::Leaf(entries) => entries
            .iter()
            .map(|e| node::leaf_record_len(&e.key, &e.value) + node::SLOT_ENTRY_LEN)
            .collect(),
        Node::Branch(entries) => entries
            .iter()
            .map(|e| node::branch_record_len(&e.sep) + node::SLOT_ENTRY_LEN)
            .collect(),
    };
    let n = record_lens.len();
    if n < 2 {
        return Err(Error::Invalid("cannot split a single oversized record"));
    }
    let total: usize = record_lens.iter().sum();
    let budget = page_size as usize - PAGE_HDR_LEN;

    let mut best: Option<(usize, usize)> = None;
    let mut left_size = 0usize;
    for split in 1..n {
        left_size += record_lens[split - 1];
        let right_size = total - left_size;
        if left_size > budget || right_size > budget {
            continue;
        }
        let imbalance = left_size.abs_diff(right_size);
        if best.map_or(true, |(_, b)| imbalance < b) {
            best = Some((split, imbalance));
        }
    }
    let (split, _) = best.ok_or(Error::Invalid("node records too large to split"))?;

    Ok(match node {
        Node::Leaf(mut entries) => {
            let right = entries.split_off(split);
            (Node::Leaf(entries), Node::Leaf(right))
        }
        Node::Branch(mut entries) => {
            let right = entries.split_off(split);
            (Node::Branch(entries), Node::Branch(right))
        }
    })
}

/// Concatenates two same-kind siblings in key order.
fn concat_nodes(left: &Node, right: &Node) -> Result<Node> {
    match (left, right) {
        (Node::Leaf(a), Node::Leaf(b)) => {
            let mut entries = a.clone();
            entries.extend(b.iter().cloned());
            Ok(Node::Leaf(entries))
        }
        (Node::Branch(a), Node::Branch(b)) => {
            let mut entries = a.clone();
            entries.extend(b.iter().cloned());
            Ok(Node::Branch(entries))
        }
        _ => Err(Error::Corruption("sibling pages of mixed kinds")),
    }
}
