//! Storage Module
//!
//! Page-structured persistent storage shared by every database in an
//! environment.
//!
//! ## Responsibilities
//! - Fixed-size page I/O against one file per database
//! - Page encoding with per-page LSN and CRC32
//! - Buffer pool with pinning, LRU eviction and the write-ahead rule
//!
//! ## File Layout
//! ```text
//! ┌────────────┬────────────┬────────────┬─────┐
//! │ Page 0     │ Page 1     │ Page 2     │ ... │
//! │ (meta)     │ (root)     │            │     │
//! └────────────┴────────────┴────────────┴─────┘
//! ```

mod buffer;
mod file;
mod page;

use std::fs::OpenOptions;

pub use buffer::{BufferPool, PageGuard, PoolStats};
pub use file::PageFile;
pub use page::{
    decode_page, encode_page, InternalNode, LeafEntry, LeafNode, MetaPage, Node, Page, Separator,
    StoredValue, FORMAT_VERSION, META_MAGIC, META_PAGE, PAGE_HEADER_SIZE,
};

/// Identifies a database within an environment
pub type DbId = u32;

/// Page number within a database file
pub type PageId = u32;

/// Apply unix permission bits to files we create
pub(crate) fn set_mode(options: &mut OpenOptions, mode: Option<u32>) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(mode) = mode {
            options.mode(mode);
        }
    }
    #[cfg(not(unix))]
    let _ = (options, mode);
}
