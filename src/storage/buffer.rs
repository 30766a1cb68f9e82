//! Buffer Pool
//!
//! Caches pages of every database file in the environment.
//!
//! ## Frames
//! A frame holds an `Arc<Page>`: readers take a cheap snapshot of the Arc,
//! writers replace it wholesale through [`PageGuard::install`]. Pinned frames
//! are never evicted.
//!
//! ## Write-ahead rule
//! Before a dirty page is written back, the log is flushed up to the page's
//! LSN. Eviction picks the least recently used unpinned frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EmberError, Result};
use crate::wal::{LogManager, Lsn};

use super::page::{decode_page, encode_page, Node, Page};
use super::{DbId, PageFile, PageId};

/// Counters reported by `Environment::stat`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub resident: usize,
    pub dirty: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pages_written: u64,
}

struct Frame {
    page: Arc<Page>,
    pins: usize,
    dirty: bool,
    last_used: u64,
}

#[derive(Default)]
struct PoolInner {
    files: HashMap<DbId, Arc<PageFile>>,
    frames: HashMap<(DbId, PageId), Frame>,
    tick: u64,
}

/// Environment-wide page cache
pub struct BufferPool {
    page_size: usize,

    /// Maximum number of resident frames
    capacity: usize,

    /// Log consulted before writing back dirty pages (None when logging is off)
    wal: Option<Arc<LogManager>>,

    inner: Mutex<PoolInner>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    pages_written: AtomicU64,
}

/// A pinned page; unpinned on drop
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    db: DbId,
    id: PageId,
    page: Arc<Page>,
}

impl BufferPool {
    pub fn new(page_size: usize, capacity: usize, wal: Option<Arc<LogManager>>) -> Self {
        Self {
            page_size,
            capacity,
            wal,
            inner: Mutex::new(PoolInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Make a database file addressable by `db`
    pub fn register_file(&self, db: DbId, file: Arc<PageFile>) {
        self.inner.lock().files.insert(db, file);
    }

    pub fn file(&self, db: DbId) -> Option<Arc<PageFile>> {
        self.inner.lock().files.get(&db).cloned()
    }

    /// Pin a page that must exist
    pub fn fetch(&self, db: DbId, id: PageId) -> Result<PageGuard<'_>> {
        let page = self.pin(db, id, false)?;
        Ok(PageGuard {
            pool: self,
            db,
            id,
            page,
        })
    }

    /// Pin a page that may never have been written (new pages, redo)
    ///
    /// A blank page comes back as an empty free page with LSN 0.
    pub fn fetch_allow_missing(&self, db: DbId, id: PageId) -> Result<PageGuard<'_>> {
        let page = self.pin(db, id, true)?;
        Ok(PageGuard {
            pool: self,
            db,
            id,
            page,
        })
    }

    /// Snapshot of a page without keeping it pinned
    pub fn read(&self, db: DbId, id: PageId) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        let page = self.load(&mut inner, db, id, false)?;
        Ok(page)
    }

    /// Write one page back if dirty
    pub fn flush_page(&self, db: DbId, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_back(&mut inner, |key| key == (db, id))?;
        if let Some(file) = inner.files.get(&db) {
            file.sync()?;
        }
        Ok(())
    }

    /// Write back every dirty page of one file and fsync it
    pub fn flush_file(&self, db: DbId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_back(&mut inner, |(frame_db, _)| frame_db == db)?;
        if let Some(file) = inner.files.get(&db) {
            file.sync()?;
        }
        Ok(())
    }

    /// Write back every dirty page and fsync every file
    pub fn flush_all(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let written = self.write_back(&mut inner, |_| true)?;
        for file in inner.files.values() {
            file.sync()?;
        }
        Ok(written)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            capacity: self.capacity,
            resident: inner.frames.len(),
            dirty: inner.frames.values().filter(|f| f.dirty).count(),
            pinned: inner.frames.values().filter(|f| f.pins > 0).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn pin(&self, db: DbId, id: PageId, allow_missing: bool) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        let page = self.load(&mut inner, db, id, allow_missing)?;
        if let Some(frame) = inner.frames.get_mut(&(db, id)) {
            frame.pins += 1;
        }
        Ok(page)
    }

    /// Bring a page into the cache (evicting if needed) and touch it
    fn load(
        &self,
        inner: &mut PoolInner,
        db: DbId,
        id: PageId,
        allow_missing: bool,
    ) -> Result<Arc<Page>> {
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(frame) = inner.frames.get_mut(&(db, id)) {
            frame.last_used = tick;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&frame.page));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let file = inner.files.get(&db).cloned().ok_or_else(|| {
            EmberError::InvalidArgument(format!("database {} is not open", db))
        })?;

        if inner.frames.len() >= self.capacity {
            self.evict_one(inner)?;
        }

        let bytes = file.read_page(id)?;
        let page = match decode_page(&bytes, id)? {
            Some(page) => page,
            None if allow_missing => Page {
                lsn: 0,
                node: Node::Free { next: None },
            },
            None => {
                return Err(EmberError::Corruption(format!(
                    "page {} of database {} was never written",
                    id, db
                )))
            }
        };

        let page = Arc::new(page);
        inner.frames.insert(
            (db, id),
            Frame {
                page: Arc::clone(&page),
                pins: 0,
                dirty: false,
                last_used: tick,
            },
        );
        Ok(page)
    }

    fn evict_one(&self, inner: &mut PoolInner) -> Result<()> {
        let victim = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.pins == 0)
            .min_by_key(|(_, frame)| frame.last_used)
            .map(|(key, _)| *key)
            .ok_or(EmberError::OutOfMemory)?;

        if let Some(frame) = inner.frames.get(&victim) {
            if frame.dirty {
                let page = Arc::clone(&frame.page);
                self.write_page(inner, victim, &page)?;
            }
        }

        inner.frames.remove(&victim);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("evicted page {} of database {}", victim.1, victim.0);
        Ok(())
    }

    /// Write back matching dirty frames; returns how many were written
    fn write_back(
        &self,
        inner: &mut PoolInner,
        matches: impl Fn((DbId, PageId)) -> bool,
    ) -> Result<usize> {
        let mut dirty: Vec<((DbId, PageId), Arc<Page>)> = inner
            .frames
            .iter()
            .filter(|(key, frame)| frame.dirty && matches(**key))
            .map(|(key, frame)| (*key, Arc::clone(&frame.page)))
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        dirty.sort_by_key(|(key, _)| *key);

        let max_lsn: Lsn = dirty.iter().map(|(_, page)| page.lsn).max().unwrap_or(0);
        self.flush_log(max_lsn)?;

        for (key, page) in &dirty {
            self.write_raw(inner, *key, page)?;
            if let Some(frame) = inner.frames.get_mut(key) {
                frame.dirty = false;
            }
        }
        Ok(dirty.len())
    }

    fn write_page(&self, inner: &PoolInner, key: (DbId, PageId), page: &Page) -> Result<()> {
        self.flush_log(page.lsn)?;
        self.write_raw(inner, key, page)
    }

    fn write_raw(&self, inner: &PoolInner, (db, id): (DbId, PageId), page: &Page) -> Result<()> {
        let file = inner.files.get(&db).ok_or_else(|| {
            EmberError::InvalidArgument(format!("database {} is not open", db))
        })?;
        let bytes = encode_page(page, self.page_size)?;
        file.write_page(id, &bytes)?;
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush_log(&self, upto: Lsn) -> Result<()> {
        match &self.wal {
            Some(wal) if upto > 0 => wal.flush(upto),
            _ => Ok(()),
        }
    }

    fn install(&self, db: DbId, id: PageId, page: Arc<Page>) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&(db, id)) {
            frame.page = page;
            frame.dirty = true;
        }
    }

    fn unpin(&self, db: DbId, id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&(db, id)) {
            frame.pins = frame.pins.saturating_sub(1);
        }
    }
}

impl<'a> PageGuard<'a> {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Replace the page contents and mark the frame dirty
    pub fn install(&mut self, node: Node, lsn: Lsn) {
        let page = Arc::new(Page { lsn, node });
        self.pool.install(self.db, self.id, Arc::clone(&page));
        self.page = page;
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.db, self.id);
    }
}
