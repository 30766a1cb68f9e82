//! Page Batch
//!
//! Staged copies of every page one logical operation modifies. The batch is
//! pinned, logged as a set of after-images and only then installed, so no
//! page in the cache ever runs ahead of the log.

use crate::error::Result;
use crate::storage::{BufferPool, DbId, Node, PageGuard, PageId};
use crate::wal::{Lsn, PageImage};

#[derive(Debug)]
pub(crate) struct PageBatch {
    db: DbId,
    pages: Vec<(PageId, Node)>,
}

impl PageBatch {
    pub fn new(db: DbId) -> Self {
        Self {
            db,
            pages: Vec::new(),
        }
    }

    pub fn get(&self, id: PageId) -> Option<&Node> {
        self.pages.iter().find(|(p, _)| *p == id).map(|(_, n)| n)
    }

    /// Stage a new version of a page, replacing any earlier one
    pub fn stage(&mut self, id: PageId, node: Node) {
        match self.pages.iter_mut().find(|(p, _)| *p == id) {
            Some(slot) => slot.1 = node,
            None => self.pages.push((id, node)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn images(&self) -> Vec<PageImage> {
        self.pages
            .iter()
            .map(|(page, node)| PageImage {
                page: *page,
                node: node.clone(),
            })
            .collect()
    }

    /// Pin every target frame; nothing is changed if this fails
    pub fn pin<'a>(&self, pool: &'a BufferPool) -> Result<Vec<PageGuard<'a>>> {
        self.pages
            .iter()
            .map(|(id, _)| pool.fetch_allow_missing(self.db, *id))
            .collect()
    }

    /// Install the staged pages into frames pinned by [`PageBatch::pin`]
    pub fn install(self, guards: Vec<PageGuard<'_>>, lsn: Lsn) {
        for ((_, node), mut guard) in self.pages.into_iter().zip(guards) {
            guard.install(node, lsn);
        }
    }
}
