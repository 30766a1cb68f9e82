//! Page File
//!
//! Fixed-size page I/O against one database file.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

use super::{set_mode, PageId};

/// A database file addressed in pages
///
/// The file handle sits behind a mutex because reads and writes both move
/// the shared cursor.
pub struct PageFile {
    path: PathBuf,
    file: Mutex<File>,
    page_size: usize,
}

impl PageFile {
    /// Open an existing file, or create it when `create` is set
    pub fn open(path: &Path, page_size: usize, create: bool, mode: Option<u32>) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(create);
        set_mode(&mut options, mode);
        let file = options.open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_size,
        })
    }

    /// Read one page; bytes past EOF come back as zeroes
    pub fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(id)))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    pub fn write_page(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(id)))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// fsync data and metadata
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Number of whole pages currently in the file
    pub fn page_count(&self) -> Result<u64> {
        let len = self.file.lock().metadata()?.len();
        Ok(len / self.page_size as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn offset(&self, id: PageId) -> u64 {
        id as u64 * self.page_size as u64
    }
}
