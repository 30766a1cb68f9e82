//! Access Method Module
//!
//! Ordered tree over buffer-managed pages.
//!
//! ## Responsibilities
//! - Point lookups and ordered navigation for cursors
//! - Insert / remove with split, merge, redistribution and root collapse
//! - Overflow chains for large values, free list for released pages
//!
//! ## Ordering
//! Entries are ordered by `(key, dup)` where `dup` is the value in
//! sorted-duplicate databases and absent otherwise. B-tree databases compare
//! keys bytewise or with a named comparator; hash databases compare
//! `(crc32(key), key)`.
//!
//! ## Concurrency:
//! - `latch`: readers share it, one writer per database at a time
//! - Tree code never waits on transaction locks while holding the latch

mod batch;
mod write;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{AccessMethod, Comparator, Duplicates};
use crate::error::{EmberError, Result};
use crate::storage::{
    decode_page, encode_page, BufferPool, DbId, LeafEntry, LeafNode, MetaPage, Node, Page,
    PageFile, PageId, Separator, StoredValue, META_MAGIC, META_PAGE, PAGE_HEADER_SIZE,
};

pub(crate) use batch::PageBatch;

/// Entry order of one database
#[derive(Clone)]
pub(crate) struct KeyOrder {
    method: AccessMethod,
    duplicates: Duplicates,
    comparator: Option<Comparator>,
}

impl KeyOrder {
    pub fn new(method: AccessMethod, duplicates: Duplicates, comparator: Option<Comparator>) -> Self {
        Self {
            method,
            duplicates,
            comparator,
        }
    }

    pub fn cmp_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (self.method, &self.comparator) {
            (AccessMethod::Hash, _) => (crc32fast::hash(a), a).cmp(&(crc32fast::hash(b), b)),
            (AccessMethod::BTree, Some(cmp)) => cmp(a, b),
            (AccessMethod::BTree, None) => a.cmp(b),
        }
    }

    /// Compare `(key, dup)` pairs; an absent dup sorts before any value
    pub fn cmp(&self, a: (&[u8], Option<&[u8]>), b: (&[u8], Option<&[u8]>)) -> Ordering {
        self.cmp_keys(a.0, b.0).then_with(|| a.1.cmp(&b.1))
    }

    pub fn dup_of<'a>(&self, entry: &'a LeafEntry) -> Option<&'a [u8]> {
        match self.duplicates {
            Duplicates::Sorted => entry.value.inline(),
            Duplicates::Unique => None,
        }
    }

    pub fn sorted_dups(&self) -> bool {
        self.duplicates == Duplicates::Sorted
    }

    fn cmp_entry(&self, entry: &LeafEntry, target: (&[u8], Option<&[u8]>)) -> Ordering {
        self.cmp((&entry.key, self.dup_of(entry)), target)
    }

    fn cmp_separator(&self, sep: &Separator, target: (&[u8], Option<&[u8]>)) -> Ordering {
        self.cmp((&sep.key, sep.dup.as_deref()), target)
    }
}

/// A leaf slot found by navigation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Located {
    pub page: PageId,
    pub index: usize,
    pub key: Vec<u8>,
    /// Value bytes in sorted-duplicate databases
    pub dup: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Shape of one database file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStat {
    pub page_size: usize,
    pub height: u32,
    pub page_count: u32,
    pub internal_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub free_pages: u64,
    pub entries: u64,
}

/// One database's tree
pub(crate) struct BTree {
    db: DbId,
    page_size: usize,
    order: KeyOrder,
    latch: RwLock<()>,
}

impl BTree {
    pub fn new(db: DbId, page_size: usize, order: KeyOrder) -> Self {
        Self {
            db,
            page_size,
            order,
            latch: RwLock::new(()),
        }
    }

    /// Write the meta page and an empty root leaf into a new file
    pub fn create_file(file: &PageFile, meta: MetaPage) -> Result<()> {
        let page_size = file.page_size();
        let pages = [
            (META_PAGE, Node::Meta(meta)),
            (1, Node::Leaf(LeafNode::default())),
        ];
        for (id, node) in pages {
            let bytes = encode_page(&Page { lsn: 0, node }, page_size)?;
            file.write_page(id, &bytes)?;
        }
        file.sync()
    }

    /// Read the meta page straight from a file
    pub fn read_meta(file: &PageFile) -> Result<MetaPage> {
        let bytes = file.read_page(META_PAGE)?;
        match decode_page(&bytes, META_PAGE)? {
            Some(Page {
                node: Node::Meta(meta),
                ..
            }) if meta.magic == META_MAGIC => Ok(meta),
            Some(_) => Err(EmberError::Corruption(format!(
                "{} is not a database file",
                file.path().display()
            ))),
            None => Err(EmberError::Corruption(format!(
                "{} has no meta page",
                file.path().display()
            ))),
        }
    }

    pub fn db(&self) -> DbId {
        self.db
    }

    pub fn order(&self) -> &KeyOrder {
        &self.order
    }

    pub fn latch(&self) -> &RwLock<()> {
        &self.latch
    }

    /// Largest key accepted
    pub fn max_key(&self) -> usize {
        self.page_size / 8
    }

    /// Largest value kept inside a leaf
    pub fn max_inline(&self) -> usize {
        self.page_size / 4
    }

    /// Payload bytes a node may occupy
    fn capacity(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    // =========================================================================
    // Reads (caller holds the latch)
    // =========================================================================

    pub fn meta(&self, pool: &BufferPool) -> Result<MetaPage> {
        let page = pool.read(self.db, META_PAGE)?;
        match &page.node {
            Node::Meta(meta) => Ok(meta.clone()),
            other => Err(self.unexpected(META_PAGE, other)),
        }
    }

    /// Every value stored under `key`, in order
    pub fn values(&self, pool: &BufferPool, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        let mut cursor = self.seek(pool, (key, None))?;
        while let Some((page, index, leaf)) = cursor {
            let Node::Leaf(node) = &leaf.node else {
                return Err(self.unexpected(page, &leaf.node));
            };
            let entry = &node.entries[index];
            if self.order.cmp_keys(&entry.key, key) != Ordering::Equal {
                break;
            }
            values.push(self.load_value(pool, &entry.value)?);
            if !self.order.sorted_dups() {
                break;
            }
            cursor = self.forward(pool, page, leaf, index + 1)?;
        }
        Ok(values)
    }

    /// Leaf page that holds (or would hold) `key`
    pub fn leaf_for(&self, pool: &BufferPool, key: &[u8]) -> Result<PageId> {
        let (page, _) = self.descend(pool, (key, None))?;
        Ok(page)
    }

    /// First entry at or after `(key, dup)`
    pub fn seek_entry(
        &self,
        pool: &BufferPool,
        key: &[u8],
        dup: Option<&[u8]>,
    ) -> Result<Option<Located>> {
        match self.seek(pool, (key, dup))? {
            Some((page, index, leaf)) => self.located(pool, page, &leaf, index).map(Some),
            None => Ok(None),
        }
    }

    /// First entry strictly after `(key, dup)`
    pub fn entry_after(
        &self,
        pool: &BufferPool,
        key: &[u8],
        dup: Option<&[u8]>,
    ) -> Result<Option<Located>> {
        let cursor = match self.seek(pool, (key, dup))? {
            Some((page, index, leaf)) => {
                let exact = matches!(
                    &leaf.node,
                    Node::Leaf(node)
                        if self.order.cmp_entry(&node.entries[index], (key, dup)) == Ordering::Equal
                );
                if exact {
                    self.forward(pool, page, leaf, index + 1)?
                } else {
                    Some((page, index, leaf))
                }
            }
            None => None,
        };
        match cursor {
            Some((page, index, leaf)) => self.located(pool, page, &leaf, index).map(Some),
            None => Ok(None),
        }
    }

    /// Last entry strictly before `(key, dup)`
    pub fn entry_before(
        &self,
        pool: &BufferPool,
        key: &[u8],
        dup: Option<&[u8]>,
    ) -> Result<Option<Located>> {
        let target = (key, dup);
        let (mut page, mut leaf) = self.descend(pool, target)?;
        loop {
            let Node::Leaf(node) = &leaf.node else {
                return Err(self.unexpected(page, &leaf.node));
            };
            let index = node
                .entries
                .partition_point(|e| self.order.cmp_entry(e, target) == Ordering::Less);
            if index > 0 {
                return self.located(pool, page, &leaf, index - 1).map(Some);
            }
            match node.prev {
                Some(prev) => {
                    page = prev;
                    leaf = pool.read(self.db, prev)?;
                }
                None => return Ok(None),
            }
        }
    }

    pub fn first(&self, pool: &BufferPool) -> Result<Option<Located>> {
        let (page, leaf) = self.edge_leaf(pool, false)?;
        match self.forward(pool, page, leaf, 0)? {
            Some((page, index, leaf)) => self.located(pool, page, &leaf, index).map(Some),
            None => Ok(None),
        }
    }

    pub fn last(&self, pool: &BufferPool) -> Result<Option<Located>> {
        let (mut page, mut leaf) = self.edge_leaf(pool, true)?;
        loop {
            let Node::Leaf(node) = &leaf.node else {
                return Err(self.unexpected(page, &leaf.node));
            };
            if !node.entries.is_empty() {
                let index = node.entries.len() - 1;
                return self.located(pool, page, &leaf, index).map(Some);
            }
            match node.prev {
                Some(prev) => {
                    page = prev;
                    leaf = pool.read(self.db, prev)?;
                }
                None => return Ok(None),
            }
        }
    }

    /// Entry at a remembered slot, if it still holds `(key, dup)`
    pub fn entry_at(
        &self,
        pool: &BufferPool,
        page: PageId,
        index: usize,
        key: &[u8],
        dup: Option<&[u8]>,
    ) -> Result<Option<Located>> {
        let leaf = pool.read(self.db, page)?;
        let Node::Leaf(node) = &leaf.node else {
            return Ok(None);
        };
        match node.entries.get(index) {
            Some(entry) if self.order.cmp_entry(entry, (key, dup)) == Ordering::Equal => {
                self.located(pool, page, &leaf, index).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn stat(&self, pool: &BufferPool) -> Result<TreeStat> {
        let meta = self.meta(pool)?;
        let mut stat = TreeStat {
            page_size: self.page_size,
            height: meta.height,
            page_count: meta.page_count,
            ..TreeStat::default()
        };

        let mut queue = VecDeque::from([meta.root]);
        while let Some(id) = queue.pop_front() {
            let page = pool.read(self.db, id)?;
            match &page.node {
                Node::Internal(node) => {
                    stat.internal_pages += 1;
                    queue.extend(node.children.iter().copied());
                }
                Node::Leaf(node) => {
                    stat.leaf_pages += 1;
                    stat.entries += node.entries.len() as u64;
                    for entry in &node.entries {
                        if let StoredValue::Overflow { head, .. } = entry.value {
                            stat.overflow_pages += self.chain_len(pool, head)?;
                        }
                    }
                }
                other => return Err(self.unexpected(id, other)),
            }
        }

        let mut free = meta.free_head;
        while let Some(id) = free {
            stat.free_pages += 1;
            free = match &pool.read(self.db, id)?.node {
                Node::Free { next } => *next,
                other => return Err(self.unexpected(id, other)),
            };
        }
        Ok(stat)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Leaf that `target` routes to
    fn descend(
        &self,
        pool: &BufferPool,
        target: (&[u8], Option<&[u8]>),
    ) -> Result<(PageId, Arc<Page>)> {
        let mut id = self.meta(pool)?.root;
        loop {
            let page = pool.read(self.db, id)?;
            match &page.node {
                Node::Internal(node) => {
                    let child = node
                        .keys
                        .partition_point(|s| self.order.cmp_separator(s, target) != Ordering::Greater);
                    id = node.children[child];
                }
                Node::Leaf(_) => return Ok((id, page)),
                other => return Err(self.unexpected(id, other)),
            }
        }
    }

    fn edge_leaf(&self, pool: &BufferPool, rightmost: bool) -> Result<(PageId, Arc<Page>)> {
        let mut id = self.meta(pool)?.root;
        loop {
            let page = pool.read(self.db, id)?;
            match &page.node {
                Node::Internal(node) => {
                    let child = if rightmost { node.children.last() } else { node.children.first() };
                    id = *child.ok_or_else(|| self.unexpected(id, &page.node))?;
                }
                Node::Leaf(_) => return Ok((id, page)),
                other => return Err(self.unexpected(id, other)),
            }
        }
    }

    /// First slot at or after `target`
    fn seek(
        &self,
        pool: &BufferPool,
        target: (&[u8], Option<&[u8]>),
    ) -> Result<Option<(PageId, usize, Arc<Page>)>> {
        let (page, leaf) = self.descend(pool, target)?;
        let index = match &leaf.node {
            Node::Leaf(node) => node
                .entries
                .partition_point(|e| self.order.cmp_entry(e, target) == Ordering::Less),
            other => return Err(self.unexpected(page, other)),
        };
        self.forward(pool, page, leaf, index)
    }

    /// Normalize a slot that may sit past the end of its leaf
    fn forward(
        &self,
        pool: &BufferPool,
        mut page: PageId,
        mut leaf: Arc<Page>,
        mut index: usize,
    ) -> Result<Option<(PageId, usize, Arc<Page>)>> {
        loop {
            let next = match &leaf.node {
                Node::Leaf(node) if index < node.entries.len() => {
                    return Ok(Some((page, index, leaf)));
                }
                Node::Leaf(node) => node.next,
                other => return Err(self.unexpected(page, other)),
            };
            match next {
                Some(next) => {
                    page = next;
                    leaf = pool.read(self.db, next)?;
                    index = 0;
                }
                None => return Ok(None),
            }
        }
    }

    fn located(&self, pool: &BufferPool, page: PageId, leaf: &Page, index: usize) -> Result<Located> {
        let Node::Leaf(node) = &leaf.node else {
            return Err(self.unexpected(page, &leaf.node));
        };
        let entry = &node.entries[index];
        Ok(Located {
            page,
            index,
            key: entry.key.clone(),
            dup: self.order.dup_of(entry).map(<[u8]>::to_vec),
            value: self.load_value(pool, &entry.value)?,
        })
    }

    pub(crate) fn load_value(&self, pool: &BufferPool, value: &StoredValue) -> Result<Vec<u8>> {
        match value {
            StoredValue::Inline(bytes) => Ok(bytes.clone()),
            StoredValue::Overflow { head, len } => {
                let mut out = Vec::with_capacity(*len as usize);
                let mut next = Some(*head);
                while let Some(id) = next {
                    let page = pool.read(self.db, id)?;
                    match &page.node {
                        Node::Overflow { next: following, data } => {
                            out.extend_from_slice(data);
                            next = *following;
                        }
                        other => return Err(self.unexpected(id, other)),
                    }
                }
                if out.len() as u64 != *len {
                    return Err(EmberError::Corruption(format!(
                        "overflow chain at page {} holds {} bytes, expected {}",
                        head,
                        out.len(),
                        len
                    )));
                }
                Ok(out)
            }
        }
    }

    fn chain_len(&self, pool: &BufferPool, head: PageId) -> Result<u64> {
        let mut count = 0;
        let mut next = Some(head);
        while let Some(id) = next {
            count += 1;
            next = match &pool.read(self.db, id)?.node {
                Node::Overflow { next, .. } => *next,
                other => return Err(self.unexpected(id, other)),
            };
        }
        Ok(count)
    }

    fn unexpected(&self, page: PageId, node: &Node) -> EmberError {
        EmberError::Corruption(format!(
            "database {} page {}: unexpected {} page",
            self.db,
            page,
            node.kind()
        ))
    }
}
