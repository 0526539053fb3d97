//! Page I/O collaborator interface.
//!
//! The B-tree layer never touches the file directly; it consumes the
//! narrow [`Pager`] interface below (fetch/write pages, transaction
//! boundaries, savepoints). Journaling, WAL and durable atomic commit
//! belong to the real pager subsystem and are out of scope here; the two
//! implementations in this module — an in-memory image and a plain
//! single-file store with an in-memory rollback journal — exist so the
//! engine and its tests have something concrete to run against.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest supported page size (encoded as 1 in the file header).
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Savepoint operations, mirroring the two ways a nested transaction
/// level can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    /// Keep the changes; the savepoint and any nested above it go away.
    Release,
    /// Undo every page write made since the savepoint was opened. The
    /// savepoint itself stays open.
    Rollback,
}

/// The page-fetch/page-write/transaction interface the B-tree consumes.
///
/// Pages are numbered from 1. Fetching a page past the current end of
/// the image yields a zeroed page of `page_size` bytes; writing past the
/// end extends the image. All mutation requires an open write
/// transaction, and `rollback` must restore the image to its state at
/// `begin_write` (including the page count).
pub trait Pager: Send {
    fn page_size(&self) -> u32;

    /// Current size of the image in pages.
    fn page_count(&self) -> Pgno;

    fn fetch_page(&mut self, pgno: Pgno) -> Result<Vec<u8>>;

    fn write_page(&mut self, pgno: Pgno, data: &[u8]) -> Result<()>;

    fn begin_write(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Drop every page past `n_page`.
    fn truncate(&mut self, n_page: Pgno) -> Result<()>;

    /// Open a nested savepoint; returns its index (0-based depth).
    fn open_savepoint(&mut self) -> Result<usize>;

    /// Release or roll back the savepoint at `index`.
    fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()>;

    fn in_write(&self) -> bool;
}

fn validate_page_size(page_size: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("unsupported page size {}", page_size),
        ));
    }
    Ok(())
}

/// Pre-images recorded since a transaction or savepoint began. Only
/// pages that existed at that point are recorded; later pages are
/// discarded by truncating back to `orig_count`.
#[derive(Debug, Default)]
struct PageJournal {
    orig_count: Pgno,
    preimages: HashMap<Pgno, Vec<u8>>,
}

impl PageJournal {
    fn new(orig_count: Pgno) -> Self {
        Self {
            orig_count,
            preimages: HashMap::new(),
        }
    }
}

// ============================================================================
// MemPager
// ============================================================================

/// A pager over an in-memory database image.
pub struct MemPager {
    page_size: u32,
    pages: Vec<Vec<u8>>,
    journal: Option<PageJournal>,
    savepoints: Vec<PageJournal>,
}

impl MemPager {
    pub fn new(page_size: u32) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            pages: Vec::new(),
            journal: None,
            savepoints: Vec::new(),
        })
    }

    fn require_write(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page write outside a write transaction",
            ));
        }
        Ok(())
    }

    fn record_preimage(&mut self, pgno: Pgno) {
        let existing = if pgno as usize <= self.pages.len() {
            Some(self.pages[pgno as usize - 1].clone())
        } else {
            None
        };
        if let Some(sp) = self.savepoints.last_mut() {
            if pgno <= sp.orig_count && !sp.preimages.contains_key(&pgno) {
                if let Some(data) = existing.clone() {
                    sp.preimages.insert(pgno, data);
                }
            }
        }
        if let Some(journal) = self.journal.as_mut() {
            if pgno <= journal.orig_count && !journal.preimages.contains_key(&pgno) {
                if let Some(data) = existing {
                    journal.preimages.insert(pgno, data);
                }
            }
        }
    }

    fn apply_journal(&mut self, journal: PageJournal) {
        for (pgno, data) in journal.preimages {
            let idx = pgno as usize - 1;
            if idx < self.pages.len() {
                self.pages[idx] = data;
            }
        }
        self.pages.truncate(journal.orig_count as usize);
    }
}

impl Pager for MemPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.pages.len() as Pgno
    }

    fn fetch_page(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        if pgno == 0 {
            return Err(Error::new(ErrorCode::Range));
        }
        match self.pages.get(pgno as usize - 1) {
            Some(data) => Ok(data.clone()),
            None => Ok(vec![0u8; self.page_size as usize]),
        }
    }

    fn write_page(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if pgno == 0 {
            return Err(Error::new(ErrorCode::Range));
        }
        if data.len() != self.page_size as usize {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.require_write()?;
        self.record_preimage(pgno);
        let idx = pgno as usize - 1;
        while self.pages.len() <= idx {
            self.pages.push(vec![0u8; self.page_size as usize]);
        }
        self.pages[idx].copy_from_slice(data);
        Ok(())
    }

    fn begin_write(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.journal = Some(PageJournal::new(self.page_count()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.journal.take().is_none() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.savepoints.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.take() {
            self.savepoints.clear();
            self.apply_journal(journal);
        }
        Ok(())
    }

    fn truncate(&mut self, n_page: Pgno) -> Result<()> {
        self.require_write()?;
        for pgno in n_page + 1..=self.page_count() {
            self.record_preimage(pgno);
        }
        self.pages.truncate(n_page as usize);
        Ok(())
    }

    fn open_savepoint(&mut self) -> Result<usize> {
        self.require_write()?;
        self.savepoints.push(PageJournal::new(self.page_count()));
        Ok(self.savepoints.len() - 1)
    }

    fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        if index >= self.savepoints.len() {
            return Err(Error::new(ErrorCode::Range));
        }
        match op {
            SavepointOp::Release => {
                // The released levels' pre-images fold into the level
                // below, oldest value winning, so a later rollback of
                // that level still restores the right bytes.
                let released = self.savepoints.split_off(index);
                if let Some(parent) = self.savepoints.last_mut() {
                    for journal in released {
                        for (pgno, data) in journal.preimages {
                            if pgno <= parent.orig_count {
                                parent.preimages.entry(pgno).or_insert(data);
                            }
                        }
                    }
                }
            }
            SavepointOp::Rollback => {
                while self.savepoints.len() > index + 1 {
                    let journal = self.savepoints.pop().expect("length checked");
                    self.apply_journal(journal);
                }
                let orig_count = self.savepoints[index].orig_count;
                let journal = std::mem::replace(
                    &mut self.savepoints[index],
                    PageJournal::new(orig_count),
                );
                self.apply_journal(journal);
            }
        }
        Ok(())
    }

    fn in_write(&self) -> bool {
        self.journal.is_some()
    }
}

// ============================================================================
// FilePager
// ============================================================================

/// A pager over a single ordinary file.
///
/// Rollback uses an in-memory journal of pre-images rather than a
/// journal file; this gives transaction atomicity against errors, not
/// against process crashes. Good enough for the storage layer's own
/// tests; the production pager replaces this wholesale.
pub struct FilePager {
    file: File,
    page_size: u32,
    n_page: Pgno,
    journal: Option<PageJournal>,
    savepoints: Vec<PageJournal>,
}

impl FilePager {
    /// Open (or create) the file at `path`. An existing non-empty file
    /// dictates the page size via header offset 16; `default_page_size`
    /// applies only to a fresh file.
    pub fn open(path: impl AsRef<Path>, default_page_size: u32) -> Result<Self> {
        validate_page_size(default_page_size)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let page_size = if file_len >= 100 {
            let mut header = [0u8; 100];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            let raw = u16::from_be_bytes([header[16], header[17]]);
            let size = if raw == 1 { 65536 } else { raw as u32 };
            validate_page_size(size)
                .map_err(|_| Error::with_message(ErrorCode::NotADb, "invalid page size field"))?;
            size
        } else {
            default_page_size
        };

        if file_len % page_size as u64 != 0 {
            return Err(Error::with_message(
                ErrorCode::NotADb,
                "file size is not a whole number of pages",
            ));
        }

        Ok(Self {
            file,
            page_size,
            n_page: (file_len / page_size as u64) as Pgno,
            journal: None,
            savepoints: Vec::new(),
        })
    }

    fn require_write(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page write outside a write transaction",
            ));
        }
        Ok(())
    }

    fn read_raw(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size as usize];
        if pgno <= self.n_page {
            let offset = (pgno as u64 - 1) * self.page_size as u64;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut data)?;
        }
        Ok(data)
    }

    fn write_raw(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let offset = (pgno as u64 - 1) * self.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn record_preimage(&mut self, pgno: Pgno) -> Result<()> {
        let needs_sp = self
            .savepoints
            .last()
            .map(|sp| pgno <= sp.orig_count && !sp.preimages.contains_key(&pgno))
            .unwrap_or(false);
        let needs_main = self
            .journal
            .as_ref()
            .map(|j| pgno <= j.orig_count && !j.preimages.contains_key(&pgno))
            .unwrap_or(false);
        if !needs_sp && !needs_main {
            return Ok(());
        }
        let data = self.read_raw(pgno)?;
        if needs_sp {
            if let Some(sp) = self.savepoints.last_mut() {
                sp.preimages.insert(pgno, data.clone());
            }
        }
        if needs_main {
            if let Some(journal) = self.journal.as_mut() {
                journal.preimages.insert(pgno, data);
            }
        }
        Ok(())
    }

    fn apply_journal(&mut self, journal: PageJournal) -> Result<()> {
        for (pgno, data) in journal.preimages {
            if pgno <= journal.orig_count {
                self.write_raw(pgno, &data)?;
            }
        }
        self.file
            .set_len(journal.orig_count as u64 * self.page_size as u64)?;
        self.n_page = journal.orig_count;
        Ok(())
    }
}

impl Pager for FilePager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.n_page
    }

    fn fetch_page(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        if pgno == 0 {
            return Err(Error::new(ErrorCode::Range));
        }
        self.read_raw(pgno)
    }

    fn write_page(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if pgno == 0 {
            return Err(Error::new(ErrorCode::Range));
        }
        if data.len() != self.page_size as usize {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.require_write()?;
        self.record_preimage(pgno)?;
        self.write_raw(pgno, data)?;
        if pgno > self.n_page {
            self.n_page = pgno;
        }
        Ok(())
    }

    fn begin_write(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.journal = Some(PageJournal::new(self.n_page));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.journal.take().is_none() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.savepoints.clear();
        self.file.sync_all()?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(journal) = self.journal.take() {
            self.savepoints.clear();
            self.apply_journal(journal)?;
        }
        Ok(())
    }

    fn truncate(&mut self, n_page: Pgno) -> Result<()> {
        self.require_write()?;
        for pgno in n_page + 1..=self.n_page {
            self.record_preimage(pgno)?;
        }
        self.file
            .set_len(n_page as u64 * self.page_size as u64)?;
        self.n_page = n_page;
        Ok(())
    }

    fn open_savepoint(&mut self) -> Result<usize> {
        self.require_write()?;
        self.savepoints.push(PageJournal::new(self.n_page));
        Ok(self.savepoints.len() - 1)
    }

    fn savepoint(&mut self, op: SavepointOp, index: usize) -> Result<()> {
        if index >= self.savepoints.len() {
            return Err(Error::new(ErrorCode::Range));
        }
        match op {
            SavepointOp::Release => {
                let released = self.savepoints.split_off(index);
                if let Some(parent) = self.savepoints.last_mut() {
                    for journal in released {
                        for (pgno, data) in journal.preimages {
                            if pgno <= parent.orig_count {
                                parent.preimages.entry(pgno).or_insert(data);
                            }
                        }
                    }
                }
            }
            SavepointOp::Rollback => {
                while self.savepoints.len() > index + 1 {
                    let journal = self.savepoints.pop().expect("length checked");
                    self.apply_journal(journal)?;
                }
                let orig_count = self.savepoints[index].orig_count;
                let journal = std::mem::replace(
                    &mut self.savepoints[index],
                    PageJournal::new(orig_count),
                );
                self.apply_journal(journal)?;
            }
        }
        Ok(())
    }

    fn in_write(&self) -> bool {
        self.journal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pager: &MemPager, byte: u8) -> Vec<u8> {
        vec![byte; pager.page_size() as usize]
    }

    #[test]
    fn test_fetch_past_end_is_zeroed() {
        let mut pager = MemPager::new(512).unwrap();
        let data = pager.fetch_page(5).unwrap();
        assert_eq!(data, vec![0u8; 512]);
        assert_eq!(pager.page_count(), 0);
    }

    #[test]
    fn test_write_extends_image() {
        let mut pager = MemPager::new(512).unwrap();
        pager.begin_write().unwrap();
        let data = page(&pager, 7);
        pager.write_page(3, &data).unwrap();
        assert_eq!(pager.page_count(), 3);
        assert_eq!(pager.fetch_page(3).unwrap(), data);
        assert_eq!(pager.fetch_page(1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_rollback_restores_image() {
        let mut pager = MemPager::new(512).unwrap();
        pager.begin_write().unwrap();
        let one = page(&pager, 1);
        pager.write_page(1, &one).unwrap();
        pager.commit().unwrap();

        pager.begin_write().unwrap();
        pager.write_page(1, &page(&pager, 9)).unwrap();
        pager.write_page(2, &page(&pager, 9)).unwrap();
        pager.rollback().unwrap();

        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.fetch_page(1).unwrap(), one);
    }

    #[test]
    fn test_write_without_transaction_fails() {
        let mut pager = MemPager::new(512).unwrap();
        let data = page(&pager, 1);
        let err = pager.write_page(1, &data).unwrap_err();
        assert_eq!(err.code, ErrorCode::Misuse);
    }

    #[test]
    fn test_savepoint_rollback_is_nested() {
        let mut pager = MemPager::new(512).unwrap();
        pager.begin_write().unwrap();
        pager.write_page(1, &page(&pager, 1)).unwrap();

        let sp = pager.open_savepoint().unwrap();
        pager.write_page(1, &page(&pager, 2)).unwrap();
        pager.write_page(2, &page(&pager, 2)).unwrap();
        pager.savepoint(SavepointOp::Rollback, sp).unwrap();

        assert_eq!(pager.fetch_page(1).unwrap(), page(&pager, 1));
        assert_eq!(pager.page_count(), 1);

        // Outer transaction is still live and can commit its own work.
        pager.commit().unwrap();
        assert_eq!(pager.fetch_page(1).unwrap(), page(&pager, 1));
    }

    #[test]
    fn test_file_pager_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");

        let mut pager = FilePager::open(&path, 512).unwrap();
        pager.begin_write().unwrap();
        let mut first = vec![0u8; 512];
        // A plausible header: page size 512 at offset 16.
        first[16] = 0x02;
        first[17] = 0x00;
        pager.write_page(1, &first).unwrap();
        pager.write_page(2, &vec![3u8; 512]).unwrap();
        pager.commit().unwrap();
        drop(pager);

        let mut pager = FilePager::open(&path, 4096).unwrap();
        assert_eq!(pager.page_size(), 512);
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.fetch_page(2).unwrap(), vec![3u8; 512]);
    }
}
