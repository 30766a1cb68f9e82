//! Tree mutation
//!
//! Writers never touch cached pages directly: every page they change is
//! cloned into a [`PageBatch`] and the caller logs and installs the batch.

use std::cmp::Ordering;

use crate::error::{EmberError, Result};
use crate::storage::{
    BufferPool, InternalNode, LeafEntry, LeafNode, MetaPage, Node, PageId, Separator, StoredValue,
    META_PAGE,
};

use super::{BTree, PageBatch};

/// Bytes an overflow node spends on framing around its data
const OVERFLOW_OVERHEAD: usize = 32;

/// bincode tag preceding every `Node` variant
const NODE_TAG: usize = 4;

impl BTree {
    /// Stage the change of `key` from the values `before` to `after`
    ///
    /// `claim` is asked before a leaf page this operation does not already
    /// own is modified or allocated; a refused claim skips rebalancing or
    /// picks another page.
    pub fn replace_all(
        &self,
        pool: &BufferPool,
        key: &[u8],
        before: &[Vec<u8>],
        after: &[Vec<u8>],
        claim: &dyn Fn(PageId) -> bool,
    ) -> Result<PageBatch> {
        self.check_key(key)?;
        for value in after {
            self.check_value(value)?;
        }

        let mut writer = TreeWriter::new(self, pool, claim)?;
        if self.order.sorted_dups() {
            for value in before.iter().filter(|v| !after.contains(v)) {
                writer.remove(key, Some(value.as_slice()))?;
            }
            for value in after.iter().filter(|v| !before.contains(v)) {
                writer.insert(key, Some(value.as_slice()), value)?;
            }
        } else {
            match after.first() {
                Some(value) => writer.upsert(key, value)?,
                None if !before.is_empty() => writer.remove(key, None)?,
                None => {}
            }
        }
        Ok(writer.finish())
    }

    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key() {
            return Err(EmberError::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                self.max_key()
            )));
        }
        Ok(())
    }

    pub fn check_value(&self, value: &[u8]) -> Result<()> {
        if self.order.sorted_dups() && value.len() > self.max_inline() {
            return Err(EmberError::InvalidArgument(format!(
                "duplicate values are limited to {} bytes",
                self.max_inline()
            )));
        }
        if value.len() as u64 > u32::MAX as u64 {
            return Err(EmberError::InvalidArgument("value too large".to_string()));
        }
        Ok(())
    }
}

/// Internal node visited on the way down, and the child taken
#[derive(Debug, Clone, Copy)]
struct PathStep {
    page: PageId,
    child: usize,
}

struct TreeWriter<'a> {
    tree: &'a BTree,
    pool: &'a BufferPool,
    claim: &'a dyn Fn(PageId) -> bool,
    batch: PageBatch,
    meta: MetaPage,
    meta_dirty: bool,
}

impl<'a> TreeWriter<'a> {
    fn new(tree: &'a BTree, pool: &'a BufferPool, claim: &'a dyn Fn(PageId) -> bool) -> Result<Self> {
        let meta = tree.meta(pool)?;
        Ok(Self {
            tree,
            pool,
            claim,
            batch: PageBatch::new(tree.db),
            meta,
            meta_dirty: false,
        })
    }

    fn finish(mut self) -> PageBatch {
        if self.meta_dirty {
            self.batch.stage(META_PAGE, Node::Meta(self.meta));
        }
        self.batch
    }

    // =========================================================================
    // Entry operations
    // =========================================================================

    /// Insert or overwrite the single value of a unique key
    fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (path, leaf_id) = self.descend((key, None))?;
        let mut leaf = self.leaf(leaf_id)?;
        let index = self.lower_bound(&leaf, (key, None));
        let stored = self.store_value(value)?;

        let existing = leaf
            .entries
            .get(index)
            .map_or(false, |e| self.tree.order.cmp_keys(&e.key, key) == Ordering::Equal);
        if existing {
            let old = std::mem::replace(&mut leaf.entries[index].value, stored);
            self.free_value(&old)?;
        } else {
            leaf.entries.insert(
                index,
                LeafEntry {
                    key: key.to_vec(),
                    value: stored,
                },
            );
        }
        self.settle_leaf(path, leaf_id, leaf)
    }

    /// Insert one `(key, dup)` entry; an identical entry is left alone
    fn insert(&mut self, key: &[u8], dup: Option<&[u8]>, value: &[u8]) -> Result<()> {
        let (path, leaf_id) = self.descend((key, dup))?;
        let mut leaf = self.leaf(leaf_id)?;
        let index = self.lower_bound(&leaf, (key, dup));
        if self.matches(&leaf, index, (key, dup)) {
            return Ok(());
        }

        let stored = self.store_value(value)?;
        leaf.entries.insert(
            index,
            LeafEntry {
                key: key.to_vec(),
                value: stored,
            },
        );
        self.settle_leaf(path, leaf_id, leaf)
    }

    fn remove(&mut self, key: &[u8], dup: Option<&[u8]>) -> Result<()> {
        let (path, leaf_id) = self.descend((key, dup))?;
        let mut leaf = self.leaf(leaf_id)?;
        let index = self.lower_bound(&leaf, (key, dup));
        let found = match dup {
            Some(_) => self.matches(&leaf, index, (key, dup)),
            None => leaf
                .entries
                .get(index)
                .map_or(false, |e| self.tree.order.cmp_keys(&e.key, key) == Ordering::Equal),
        };
        if !found {
            return Ok(());
        }

        let entry = leaf.entries.remove(index);
        self.free_value(&entry.value)?;
        self.settle_leaf(path, leaf_id, leaf)
    }

    // =========================================================================
    // Structure maintenance
    // =========================================================================

    fn settle_leaf(&mut self, path: Vec<PathStep>, id: PageId, leaf: LeafNode) -> Result<()> {
        let size = self.leaf_len(&leaf)?;
        if size > self.tree.capacity() {
            return self.split_leaf(path, id, leaf);
        }
        self.batch.stage(id, Node::Leaf(leaf));
        if !path.is_empty() && size < self.tree.capacity() / 4 {
            return self.rebalance(path, id);
        }
        Ok(())
    }

    fn split_leaf(&mut self, path: Vec<PathStep>, id: PageId, mut leaf: LeafNode) -> Result<()> {
        let mid = self.split_point(&leaf.entries)?;
        let right_entries = leaf.entries.split_off(mid);
        let right_id = self.allocate(true)?;
        let separator = self.separator_of(&right_entries[0]);

        if let Some(next) = leaf.next {
            let mut following = self.leaf(next)?;
            following.prev = Some(right_id);
            self.batch.stage(next, Node::Leaf(following));
        }
        let right = LeafNode {
            entries: right_entries,
            prev: Some(id),
            next: leaf.next,
        };
        leaf.next = Some(right_id);

        tracing::debug!(
            "database {}: split leaf {} ({} | {} entries, {} | {} bytes) into {}",
            self.tree.db,
            id,
            leaf.entries.len(),
            right.entries.len(),
            self.leaf_len(&leaf)?,
            self.leaf_len(&right)?,
            right_id
        );
        self.batch.stage(id, Node::Leaf(leaf));
        self.batch.stage(right_id, Node::Leaf(right));
        self.insert_separator(path, id, separator, right_id)
    }

    fn insert_separator(
        &mut self,
        mut path: Vec<PathStep>,
        left: PageId,
        separator: Separator,
        right: PageId,
    ) -> Result<()> {
        let Some(step) = path.pop() else {
            let root = self.allocate(false)?;
            self.batch.stage(
                root,
                Node::Internal(InternalNode {
                    keys: vec![separator],
                    children: vec![left, right],
                }),
            );
            self.meta.root = root;
            self.meta.height += 1;
            self.meta_dirty = true;
            tracing::debug!(
                "database {}: new root {} (height {})",
                self.tree.db,
                root,
                self.meta.height
            );
            return Ok(());
        };

        let mut parent = self.internal(step.page)?;
        parent.keys.insert(step.child, separator);
        parent.children.insert(step.child + 1, right);
        if self.internal_len(&parent)? > self.tree.capacity() {
            return self.split_internal(path, step.page, parent);
        }
        self.batch.stage(step.page, Node::Internal(parent));
        Ok(())
    }

    fn split_internal(&mut self, path: Vec<PathStep>, id: PageId, node: InternalNode) -> Result<()> {
        let (left, promoted, right) = self.divide_internal(id, node)?;
        let right_id = self.allocate(false)?;
        tracing::debug!(
            "database {}: split internal {} ({} | {} bytes) into {}",
            self.tree.db,
            id,
            self.internal_len(&left)?,
            self.internal_len(&right)?,
            right_id
        );
        self.batch.stage(id, Node::Internal(left));
        self.batch.stage(right_id, Node::Internal(right));
        self.insert_separator(path, id, promoted, right_id)
    }

    /// Merge or redistribute an underfull node with a sibling
    fn rebalance(&mut self, mut path: Vec<PathStep>, id: PageId) -> Result<()> {
        let Some(step) = path.pop() else {
            return Ok(());
        };
        let mut parent = self.internal(step.page)?;

        let (left_id, right_id, sep_index) = if step.child + 1 < parent.children.len() {
            (id, parent.children[step.child + 1], step.child)
        } else if step.child > 0 {
            (parent.children[step.child - 1], id, step.child - 1)
        } else {
            return Ok(());
        };

        match self.node(id)? {
            Node::Leaf(_) => {
                let sibling = if left_id == id { right_id } else { left_id };
                if !(self.claim)(sibling) {
                    return Ok(());
                }
                let left = self.leaf(left_id)?;
                let right = self.leaf(right_id)?;
                self.rebalance_leaves(&mut parent, sep_index, (left_id, left), (right_id, right))?;
            }
            Node::Internal(_) => {
                let left = self.internal(left_id)?;
                let right = self.internal(right_id)?;
                self.rebalance_internals(&mut parent, sep_index, (left_id, left), (right_id, right))?;
            }
            other => return Err(self.tree.unexpected(id, &other)),
        }

        self.settle_parent(path, step.page, parent)
    }

    fn rebalance_leaves(
        &mut self,
        parent: &mut InternalNode,
        sep_index: usize,
        (left_id, mut left): (PageId, LeafNode),
        (right_id, mut right): (PageId, LeafNode),
    ) -> Result<()> {
        let mut entries = std::mem::take(&mut left.entries);
        entries.append(&mut right.entries);
        let merged = LeafNode {
            entries,
            prev: left.prev,
            next: right.next,
        };

        if self.leaf_len(&merged)? <= self.tree.capacity() {
            if let Some(next) = right.next {
                let mut following = self.leaf(next)?;
                following.prev = Some(left_id);
                self.batch.stage(next, Node::Leaf(following));
            }
            tracing::debug!("database {}: merged leaf {} into {}", self.tree.db, right_id, left_id);
            self.batch.stage(left_id, Node::Leaf(merged));
            self.free_page(right_id)?;
            parent.keys.remove(sep_index);
            parent.children.remove(sep_index + 1);
            return Ok(());
        }

        let mut entries = merged.entries;
        let mid = self.split_point(&entries)?;
        right.entries = entries.split_off(mid);
        left.entries = entries;
        parent.keys[sep_index] = self.separator_of(&right.entries[0]);
        tracing::debug!("database {}: redistributed leaves {} and {}", self.tree.db, left_id, right_id);
        self.batch.stage(left_id, Node::Leaf(left));
        self.batch.stage(right_id, Node::Leaf(right));
        Ok(())
    }

    fn rebalance_internals(
        &mut self,
        parent: &mut InternalNode,
        sep_index: usize,
        (left_id, left): (PageId, InternalNode),
        (right_id, right): (PageId, InternalNode),
    ) -> Result<()> {
        let mut keys = left.keys;
        keys.push(parent.keys[sep_index].clone());
        keys.extend(right.keys);
        let mut children = left.children;
        children.extend(right.children);
        let merged = InternalNode { keys, children };

        if self.internal_len(&merged)? <= self.tree.capacity() {
            tracing::debug!("database {}: merged internal {} into {}", self.tree.db, right_id, left_id);
            self.batch.stage(left_id, Node::Internal(merged));
            self.free_page(right_id)?;
            parent.keys.remove(sep_index);
            parent.children.remove(sep_index + 1);
            return Ok(());
        }

        let (left, promoted, right) = self.divide_internal(left_id, merged)?;
        tracing::debug!(
            "database {}: redistributed internals {} and {} ({} | {} bytes)",
            self.tree.db,
            left_id,
            right_id,
            self.internal_len(&left)?,
            self.internal_len(&right)?
        );
        parent.keys[sep_index] = promoted;
        self.batch.stage(left_id, Node::Internal(left));
        self.batch.stage(right_id, Node::Internal(right));
        Ok(())
    }

    /// Stage a parent after one of its children merged or moved entries
    fn settle_parent(&mut self, path: Vec<PathStep>, id: PageId, parent: InternalNode) -> Result<()> {
        if path.is_empty() {
            if parent.keys.is_empty() {
                let child = parent.children.first().copied().ok_or_else(|| {
                    EmberError::Corruption(format!("root page {} has no children", id))
                })?;
                self.meta.root = child;
                self.meta.height = self.meta.height.saturating_sub(1).max(1);
                self.meta_dirty = true;
                self.free_page(id)?;
                tracing::debug!(
                    "database {}: root collapsed to {} (height {})",
                    self.tree.db,
                    child,
                    self.meta.height
                );
                return Ok(());
            }
            self.batch.stage(id, Node::Internal(parent));
            return Ok(());
        }

        let underfull = self.internal_len(&parent)? < self.tree.capacity() / 4;
        self.batch.stage(id, Node::Internal(parent));
        if underfull {
            return self.rebalance(path, id);
        }
        Ok(())
    }

    // =========================================================================
    // Pages and values
    // =========================================================================

    fn allocate(&mut self, leaf: bool) -> Result<PageId> {
        if let Some(head) = self.meta.free_head {
            if !leaf || (self.claim)(head) {
                let next = match self.node(head)? {
                    Node::Free { next } => next,
                    other => return Err(self.tree.unexpected(head, &other)),
                };
                self.meta.free_head = next;
                self.meta_dirty = true;
                return Ok(head);
            }
        }

        let id = self.meta.page_count;
        self.meta.page_count = id.checked_add(1).ok_or_else(|| {
            EmberError::CapacityExceeded(format!("database {} is out of page ids", self.tree.db))
        })?;
        self.meta_dirty = true;
        if leaf {
            (self.claim)(id);
        }
        Ok(id)
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.batch.stage(id, Node::Free { next: self.meta.free_head });
        self.meta.free_head = Some(id);
        self.meta_dirty = true;
        Ok(())
    }

    fn store_value(&mut self, value: &[u8]) -> Result<StoredValue> {
        if value.len() <= self.tree.max_inline() {
            return Ok(StoredValue::Inline(value.to_vec()));
        }

        let chunk = self.tree.capacity() - OVERFLOW_OVERHEAD;
        let chunks: Vec<&[u8]> = value.chunks(chunk).collect();
        let mut ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            ids.push(self.allocate(false)?);
        }
        for (i, data) in chunks.iter().enumerate() {
            self.batch.stage(
                ids[i],
                Node::Overflow {
                    next: ids.get(i + 1).copied(),
                    data: data.to_vec(),
                },
            );
        }
        Ok(StoredValue::Overflow {
            head: ids[0],
            len: value.len() as u64,
        })
    }

    fn free_value(&mut self, value: &StoredValue) -> Result<()> {
        let StoredValue::Overflow { head, .. } = value else {
            return Ok(());
        };
        let mut next = Some(*head);
        while let Some(id) = next {
            next = match self.node(id)? {
                Node::Overflow { next, .. } => next,
                other => return Err(self.tree.unexpected(id, &other)),
            };
            self.free_page(id)?;
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Latest version of a page: staged copy first, then the cache
    fn node(&self, id: PageId) -> Result<Node> {
        match self.batch.get(id) {
            Some(node) => Ok(node.clone()),
            None => Ok(self.pool.read(self.tree.db, id)?.node.clone()),
        }
    }

    fn leaf(&self, id: PageId) -> Result<LeafNode> {
        match self.node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            other => Err(self.tree.unexpected(id, &other)),
        }
    }

    fn internal(&self, id: PageId) -> Result<InternalNode> {
        match self.node(id)? {
            Node::Internal(node) => Ok(node),
            other => Err(self.tree.unexpected(id, &other)),
        }
    }

    fn descend(&self, target: (&[u8], Option<&[u8]>)) -> Result<(Vec<PathStep>, PageId)> {
        let mut path = Vec::with_capacity(self.meta.height as usize);
        let mut id = self.meta.root;
        loop {
            match self.node(id)? {
                Node::Internal(node) => {
                    let child = node.keys.partition_point(|s| {
                        self.tree.order.cmp((&s.key, s.dup.as_deref()), target) != Ordering::Greater
                    });
                    path.push(PathStep { page: id, child });
                    id = node.children[child];
                }
                Node::Leaf(_) => return Ok((path, id)),
                other => return Err(self.tree.unexpected(id, &other)),
            }
        }
    }

    fn lower_bound(&self, leaf: &LeafNode, target: (&[u8], Option<&[u8]>)) -> usize {
        leaf.entries.partition_point(|e| {
            self.tree.order.cmp((&e.key, self.tree.order.dup_of(e)), target) == Ordering::Less
        })
    }

    fn matches(&self, leaf: &LeafNode, index: usize, target: (&[u8], Option<&[u8]>)) -> bool {
        leaf.entries.get(index).map_or(false, |e| {
            self.tree.order.cmp((&e.key, self.tree.order.dup_of(e)), target) == Ordering::Equal
        })
    }

    fn separator_of(&self, entry: &LeafEntry) -> Separator {
        Separator {
            key: entry.key.clone(),
            dup: self.tree.order.dup_of(entry).map(<[u8]>::to_vec),
        }
    }

    /// Index that splits `entries` into two halves of similar byte size
    fn split_point(&self, entries: &[LeafEntry]) -> Result<usize> {
        if entries.len() < 2 {
            return Err(EmberError::Corruption(
                "cannot split a leaf with fewer than two entries".to_string(),
            ));
        }
        let sizes = entries
            .iter()
            .map(|e| Ok(bincode::serialized_size(e)? as usize))
            .collect::<Result<Vec<usize>>>()?;
        let total: usize = sizes.iter().sum();

        let mut acc = 0;
        let mut mid = entries.len() / 2;
        for (i, size) in sizes.iter().enumerate() {
            if (acc + size) * 2 > total {
                // Put the straddling entry on whichever side stays smaller
                mid = if acc >= total - acc - size { i } else { i + 1 };
                break;
            }
            acc += size;
        }
        Ok(mid.clamp(1, entries.len() - 1))
    }

    /// Cut an internal node where both halves carry a similar byte size
    ///
    /// Returns the left half, the promoted separator and the right half.
    fn divide_internal(&self, id: PageId, node: InternalNode) -> Result<(InternalNode, Separator, InternalNode)> {
        let InternalNode {
            mut keys,
            mut children,
        } = node;
        if keys.len() < 2 || children.len() != keys.len() + 1 {
            return Err(EmberError::Corruption(format!(
                "internal page {} cannot be split ({} keys, {} children)",
                id,
                keys.len(),
                children.len()
            )));
        }

        // Each key travels with the child to its right
        let child_size = std::mem::size_of::<PageId>();
        let sizes = keys
            .iter()
            .map(|k| Ok(bincode::serialized_size(k)? as usize + child_size))
            .collect::<Result<Vec<usize>>>()?;
        let total: usize = sizes.iter().sum();

        // Left keeps keys[..mid], keys[mid] moves up, right keeps keys[mid + 1..]
        let candidates = if keys.len() > 2 { 1..keys.len() - 1 } else { 0..keys.len() };
        let mut prefix = vec![0usize; sizes.len() + 1];
        for (i, size) in sizes.iter().enumerate() {
            prefix[i + 1] = prefix[i] + size;
        }
        let mid = candidates
            .min_by_key(|&mid| prefix[mid].max(total - prefix[mid + 1]))
            .unwrap_or(keys.len() / 2);

        let right_keys = keys.split_off(mid + 1);
        let promoted = keys
            .pop()
            .ok_or_else(|| EmberError::Corruption(format!("internal page {} has no keys", id)))?;
        let right_children = children.split_off(mid + 1);
        let left = InternalNode { keys, children };
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };

        for half in [&left, &right] {
            let len = self.internal_len(half)?;
            if len > self.tree.capacity() {
                return Err(EmberError::Corruption(format!(
                    "internal page {} split leaves a {} byte half for a {} byte page",
                    id,
                    len,
                    self.tree.capacity()
                )));
            }
        }
        Ok((left, promoted, right))
    }

    fn leaf_len(&self, leaf: &LeafNode) -> Result<usize> {
        Ok(bincode::serialized_size(leaf)? as usize + NODE_TAG)
    }

    fn internal_len(&self, node: &InternalNode) -> Result<usize> {
        Ok(bincode::serialized_size(node)? as usize + NODE_TAG)
    }
}
