//! WAL Reader
//!
//! Handles reading entries from the WAL file.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{EmberError, Result};

use super::entry::HEADER_SIZE;
use super::WalEntry;

/// Reads entries from the WAL file
pub struct WalReader {
    reader: BufReader<File>,

    /// Byte offset just past the last entry returned
    position: u64,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a complete, checksummed entry
    /// - `Ok(None)`: clean end of file
    /// - `Err(WalCorruption)`: torn or damaged frame
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let mut header = [0u8; HEADER_SIZE];
        let read = read_fully(&mut self.reader, &mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(EmberError::WalCorruption(format!(
                "partial header at offset {}",
                self.position
            )));
        }

        let (_, _, len) = WalEntry::parse_header(&header)?;

        let mut frame = vec![0u8; HEADER_SIZE + len as usize];
        frame[..HEADER_SIZE].copy_from_slice(&header);
        let body = read_fully(&mut self.reader, &mut frame[HEADER_SIZE..])?;
        if body < len as usize {
            return Err(EmberError::WalCorruption(format!(
                "partial payload at offset {}",
                self.position
            )));
        }

        let entry = WalEntry::deserialize(&frame)?;
        self.position += frame.len() as u64;
        Ok(Some(entry))
    }

    /// Byte offset of the end of the last valid entry
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over WAL entries; stops after the first error
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
