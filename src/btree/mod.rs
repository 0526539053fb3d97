//! B-tree storage engine.
//!
//! One file (or in-memory image) holds any number of independently
//! rooted B-trees over fixed-size pages. `BtShared` is the per-file
//! state every connection attached to that file shares; `Btree` is one
//! connection's handle. Page I/O, journaling and atomic commit live
//! behind the [`crate::pager::Pager`] interface.

mod balance;
mod cell;
mod cursor;
mod encoding;
mod freelist;
mod integrity;
mod page;
mod ptrmap;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, Result};
use crate::pager::{Pager, SavepointOp};
use crate::types::{Pgno, RowId};

pub use cursor::{BtCursor, BtreePayload};
pub use encoding::{
    put_varint, read_u16, read_u32, read_varint, read_varint32, varint_len, write_u16, write_u32,
    write_varint,
};
pub use integrity::IntegrityCheckResult;
pub use page::MemPage;
pub use types::{
    AutoVacuum, BtLock, BtreeConfig, CursorState, DbHeader, Geometry, InsertFlags, PageKind,
    PageLimits, TransState, TreeKind, FILE_HEADER_SIZE, FILE_MAGIC, META_APPLICATION_ID,
    META_DATA_VERSION, META_FREE_PAGE_COUNT, META_INCR_VACUUM, META_LARGEST_ROOT_PAGE,
    META_SCHEMA_VERSION, META_USER_VERSION, N_BTREE_META,
};

use cell::clear_cell_overflow;
use freelist::{allocate_page, free_page};
use page::MemPage as Page;
use ptrmap::{auto_vacuum_commit, incr_vacuum_step, ptrmap_put};
use types::{TableLockEntry, PTRMAP_ROOTPAGE};

/// Per-file state shared by every connection attached to the file.
pub struct BtShared {
    pub(crate) pager: Box<dyn Pager>,
    pub(crate) page_size: u32,
    pub(crate) usable_size: u32,
    pub(crate) reserve: u8,
    pub(crate) auto_vacuum: AutoVacuum,
    pub(crate) geom: Geometry,
    /// Current file size in pages, tracked through the transaction.
    pub(crate) n_page: Pgno,
    pub(crate) in_transaction: TransState,
    pub(crate) n_readers: u32,
    /// Connection id of the single active writer, if any.
    pub(crate) writer: Option<u64>,
    /// Bumped on every tree-shape mutation; cursors compare against it.
    pub(crate) structure_version: u64,
    /// Bumped on every committed write transaction.
    pub(crate) data_version: u32,
    pub(crate) table_locks: Vec<TableLockEntry>,
    pub(crate) interrupt: Arc<AtomicBool>,
    next_conn: u64,
}

impl BtShared {
    pub(crate) fn limits_for(&self, pgno: Pgno) -> PageLimits {
        PageLimits::for_page(self.page_size, self.usable_size, pgno)
    }

    pub(crate) fn read_page_raw(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        self.pager.fetch_page(pgno)
    }

    pub(crate) fn write_page_raw(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        self.pager.write_page(pgno, data)?;
        if pgno > self.n_page {
            self.n_page = pgno;
        }
        Ok(())
    }

    pub(crate) fn read_page(&mut self, pgno: Pgno) -> Result<Page> {
        let data = self.pager.fetch_page(pgno)?;
        Page::from_bytes(pgno, data, self.limits_for(pgno), &self.geom)
    }

    pub(crate) fn write_mem_page(&mut self, page: &Page) -> Result<()> {
        self.write_page_raw(page.pgno, &page.data)
    }

    pub(crate) fn zero_page(&mut self, pgno: Pgno) -> Result<()> {
        let zeros = vec![0u8; self.page_size as usize];
        self.write_page_raw(pgno, &zeros)
    }

    pub(crate) fn header(&mut self) -> Result<DbHeader> {
        let data = self.read_page_raw(1)?;
        DbHeader::parse(&data)
    }

    pub(crate) fn update_header(&mut self, f: impl FnOnce(&mut DbHeader)) -> Result<()> {
        let mut data = self.read_page_raw(1)?;
        let mut header = DbHeader::parse(&data)?;
        f(&mut header);
        header.write_to(&mut data)?;
        self.write_page_raw(1, &data)
    }

    pub(crate) fn truncate_file(&mut self, n_page: Pgno) -> Result<()> {
        self.pager.truncate(n_page)?;
        self.n_page = n_page;
        Ok(())
    }

    pub(crate) fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorCode::Interrupt));
        }
        Ok(())
    }

    pub(crate) fn bump_structure_version(&mut self) {
        self.structure_version = self.structure_version.wrapping_add(1);
    }

    fn require_writer(&self, conn: u64) -> Result<()> {
        if self.writer != Some(conn) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        Ok(())
    }

    fn lock_table(&mut self, conn: u64, root: Pgno, kind: BtLock) -> Result<()> {
        for entry in &self.table_locks {
            if entry.root == root
                && entry.conn != conn
                && (kind == BtLock::Write || entry.kind == BtLock::Write)
            {
                return Err(Error::with_message(
                    ErrorCode::Locked,
                    format!("tree rooted at {} is locked", root),
                ));
            }
        }
        if kind == BtLock::Write {
            self.require_writer(conn)?;
        }
        if let Some(entry) = self
            .table_locks
            .iter_mut()
            .find(|e| e.root == root && e.conn == conn)
        {
            if kind == BtLock::Write {
                entry.kind = BtLock::Write;
            }
            return Ok(());
        }
        self.table_locks.push(TableLockEntry { root, conn, kind });
        Ok(())
    }

    fn unlock_tables(&mut self, conn: u64) {
        self.table_locks.retain(|e| e.conn != conn);
    }

    /// Write the header and empty root for tree 1 into a fresh file.
    fn new_db(&mut self, config: &BtreeConfig) -> Result<()> {
        let limits = self.limits_for(1);
        let mut root = Page::zeroed(1, PageKind::TableLeaf, limits, &self.geom);
        let header = DbHeader::new(self.page_size, config);
        header.write_to(&mut root.data)?;
        self.write_mem_page(&root)?;
        self.n_page = 1;
        Ok(())
    }
}

/// One connection to a shared B-tree file.
pub struct Btree {
    shared: Arc<Mutex<BtShared>>,
    conn: u64,
    trans: TransState,
    n_savepoints: usize,
    busy_handler: Option<Box<dyn FnMut(u32) -> bool + Send>>,
}

impl Btree {
    /// Open the file behind `pager`, creating the header and the root of
    /// tree 1 when the file is empty. The configuration applies to a
    /// fresh file; an existing header wins over it.
    pub fn open(mut pager: Box<dyn Pager>, config: BtreeConfig) -> Result<Btree> {
        let page_size = pager.page_size();
        let fresh = pager.page_count() == 0;

        let (reserve, auto_vacuum, geom) = if fresh {
            let usable = page_size - config.reserve_bytes as u32;
            if usable < 480 {
                return Err(Error::new(ErrorCode::Misuse));
            }
            (
                config.reserve_bytes,
                config.auto_vacuum,
                Geometry::new(
                    usable,
                    config.max_embedded_fraction,
                    config.min_embedded_fraction,
                    config.min_leaf_fraction,
                ),
            )
        } else {
            let data = pager.fetch_page(1)?;
            let header = DbHeader::parse(&data)?;
            if header.page_size != page_size {
                return Err(Error::with_message(
                    ErrorCode::NotADb,
                    "page size in header disagrees with the pager",
                ));
            }
            let auto_vacuum = if header.largest_root_page == 0 {
                AutoVacuum::None
            } else if header.incr_vacuum != 0 {
                AutoVacuum::Incremental
            } else {
                AutoVacuum::Full
            };
            let usable = page_size - header.reserve as u32;
            (
                header.reserve,
                auto_vacuum,
                Geometry::new(
                    usable,
                    header.max_embedded_fraction,
                    header.min_embedded_fraction,
                    header.min_leaf_fraction,
                ),
            )
        };

        let n_page = pager.page_count();
        let mut shared = BtShared {
            pager,
            page_size,
            usable_size: page_size - reserve as u32,
            reserve,
            auto_vacuum,
            geom,
            n_page,
            in_transaction: TransState::None,
            n_readers: 0,
            writer: None,
            structure_version: 1,
            data_version: 0,
            table_locks: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            next_conn: 2,
        };

        if fresh {
            shared.pager.begin_write()?;
            shared.new_db(&config)?;
            shared.pager.commit()?;
        }

        Ok(Btree {
            shared: Arc::new(Mutex::new(shared)),
            conn: 1,
            trans: TransState::None,
            n_savepoints: 0,
            busy_handler: None,
        })
    }

    /// Attach another connection to the same shared file state.
    pub fn connect(other: &Btree) -> Result<Btree> {
        let shared = Arc::clone(&other.shared);
        let conn = {
            let mut guard = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
            let conn = guard.next_conn;
            guard.next_conn += 1;
            conn
        };
        Ok(Btree {
            shared,
            conn,
            trans: TransState::None,
            n_savepoints: 0,
            busy_handler: None,
        })
    }

    /// Handle for cooperative cancellation; set it from any thread to
    /// abort long walks with `Interrupt`.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.shared
            .lock()
            .map(|s| Arc::clone(&s.interrupt))
            .unwrap_or_else(|_| Arc::new(AtomicBool::new(false)))
    }

    /// Called with the retry count while another connection holds the
    /// write transaction; return false to give up with `Busy`.
    pub fn set_busy_handler(&mut self, handler: impl FnMut(u32) -> bool + Send + 'static) {
        self.busy_handler = Some(Box::new(handler));
    }

    pub fn page_size(&self) -> u32 {
        self.shared.lock().map(|s| s.page_size).unwrap_or(0)
    }

    pub fn page_count(&self) -> Result<Pgno> {
        let shared = self.lock()?;
        Ok(shared.n_page)
    }

    pub fn auto_vacuum_mode(&self) -> AutoVacuum {
        self.shared
            .lock()
            .map(|s| s.auto_vacuum)
            .unwrap_or(AutoVacuum::None)
    }

    pub fn txn_state(&self) -> TransState {
        self.trans
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BtShared>> {
        self.shared
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))
    }

    /// Begin a read or write transaction. A second writer blocks through
    /// the busy handler, or fails with `Busy`.
    pub fn begin_trans(&mut self, write: bool) -> Result<()> {
        if self.trans == TransState::Write || (self.trans == TransState::Read && !write) {
            return Ok(());
        }
        let shared_arc = Arc::clone(&self.shared);
        let mut attempts = 0u32;
        loop {
            {
                let mut shared = shared_arc
                    .lock()
                    .map_err(|_| Error::new(ErrorCode::Internal))?;
                let blocked = write && shared.writer.map_or(false, |w| w != self.conn);
                if !blocked {
                    if self.trans == TransState::None {
                        shared.n_readers += 1;
                    }
                    if write && shared.writer.is_none() {
                        shared.pager.begin_write()?;
                        shared.writer = Some(self.conn);
                        shared.in_transaction = TransState::Write;
                        shared.n_page = shared.pager.page_count();
                    } else if shared.in_transaction == TransState::None {
                        shared.in_transaction = TransState::Read;
                    }
                    self.trans = if write {
                        TransState::Write
                    } else {
                        TransState::Read
                    };
                    return Ok(());
                }
            }
            let retry = match self.busy_handler.as_mut() {
                Some(handler) => handler(attempts),
                None => false,
            };
            if retry {
                attempts += 1;
            } else {
                return Err(Error::new(ErrorCode::Busy));
            }
        }
    }

    /// Commit this connection's transaction. For the writer this runs
    /// auto-vacuum, stamps the change counter, and commits the pager.
    pub fn commit(&mut self) -> Result<()> {
        let shared_arc = Arc::clone(&self.shared);
        let mut shared = shared_arc
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        if self.trans == TransState::Write {
            shared.require_writer(self.conn)?;
            auto_vacuum_commit(&mut shared)?;
            let n_page = shared.n_page;
            shared.update_header(|h| {
                h.change_counter = h.change_counter.wrapping_add(1);
                h.version_valid_for = h.change_counter;
                h.page_count = n_page;
            })?;
            shared.pager.commit()?;
            shared.writer = None;
            shared.data_version = shared.data_version.wrapping_add(1);
            shared.bump_structure_version();
        }
        self.end_trans(&mut shared);
        Ok(())
    }

    /// Roll the transaction back through the pager; every cursor of
    /// every connection must re-seek afterwards.
    pub fn rollback(&mut self) -> Result<()> {
        let shared_arc = Arc::clone(&self.shared);
        let mut shared = shared_arc
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        if self.trans == TransState::Write && shared.writer == Some(self.conn) {
            shared.pager.rollback()?;
            shared.n_page = shared.pager.page_count();
            shared.writer = None;
            shared.bump_structure_version();
        }
        self.end_trans(&mut shared);
        Ok(())
    }

    fn end_trans(&mut self, shared: &mut BtShared) {
        if self.trans != TransState::None {
            shared.n_readers = shared.n_readers.saturating_sub(1);
        }
        shared.in_transaction = if shared.writer.is_some() {
            TransState::Write
        } else if shared.n_readers > 0 {
            TransState::Read
        } else {
            TransState::None
        };
        shared.unlock_tables(self.conn);
        self.trans = TransState::None;
        self.n_savepoints = 0;
    }

    /// Open a savepoint inside the current write transaction; returns
    /// its index for `savepoint_release`/`savepoint_rollback`.
    pub fn savepoint_open(&mut self) -> Result<usize> {
        let shared_arc = Arc::clone(&self.shared);
        let mut shared = shared_arc
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        shared.require_writer(self.conn)?;
        let index = shared.pager.open_savepoint()?;
        self.n_savepoints = index + 1;
        Ok(index)
    }

    pub fn savepoint_release(&mut self, index: usize) -> Result<()> {
        if index >= self.n_savepoints {
            return Err(Error::new(ErrorCode::Range));
        }
        let shared_arc = Arc::clone(&self.shared);
        let mut shared = shared_arc
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        shared.require_writer(self.conn)?;
        shared.pager.savepoint(SavepointOp::Release, index)?;
        self.n_savepoints = index;
        Ok(())
    }

    pub fn savepoint_rollback(&mut self, index: usize) -> Result<()> {
        if index >= self.n_savepoints {
            return Err(Error::new(ErrorCode::Range));
        }
        let mut shared = self.lock()?;
        shared.require_writer(self.conn)?;
        shared.pager.savepoint(SavepointOp::Rollback, index)?;
        shared.n_page = shared.pager.page_count();
        shared.bump_structure_version();
        Ok(())
    }

    /// Open a cursor on the tree rooted at `root`. A write cursor takes
    /// the exclusive table lock and requires the write transaction; a
    /// read cursor takes a shared lock.
    pub fn cursor(&self, root: Pgno, writable: bool) -> Result<BtCursor> {
        let mut shared = self.lock()?;
        if root < 1 || root > shared.n_page {
            return Err(Error::new(ErrorCode::NotFound));
        }
        let kind = shared.read_page(root)?.kind;
        let lock = if writable { BtLock::Write } else { BtLock::Read };
        shared.lock_table(self.conn, root, lock)?;
        Ok(BtCursor::new(
            Arc::clone(&self.shared),
            self.conn,
            root,
            kind.is_table(),
            writable,
            shared.structure_version,
        ))
    }

    /// Allocate the root page of a new tree.
    pub fn create_tree(&mut self, kind: TreeKind) -> Result<Pgno> {
        let mut shared = self.lock()?;
        shared.require_writer(self.conn)?;
        let pgno = allocate_page(&mut shared)?;
        let page_kind = match kind {
            TreeKind::Table => PageKind::TableLeaf,
            TreeKind::Index => PageKind::IndexLeaf,
        };
        let limits = shared.limits_for(pgno);
        let geom = shared.geom;
        let root = Page::zeroed(pgno, page_kind, limits, &geom);
        shared.write_mem_page(&root)?;
        ptrmap_put(&mut shared, pgno, PTRMAP_ROOTPAGE, 0)?;
        if shared.auto_vacuum != AutoVacuum::None {
            shared.update_header(|h| h.largest_root_page = h.largest_root_page.max(pgno))?;
        }
        shared.bump_structure_version();
        Ok(pgno)
    }

    /// Delete every entry of a tree, freeing all its pages except the
    /// root. Returns the number of entries removed.
    pub fn clear_tree(&mut self, root: Pgno) -> Result<i64> {
        let mut shared = self.lock()?;
        shared.require_writer(self.conn)?;
        shared.lock_table(self.conn, root, BtLock::Write)?;

        let root_kind = shared.read_page(root)?.kind;
        let mut removed = 0i64;
        let mut stack = vec![root];
        while let Some(pgno) = stack.pop() {
            shared.check_interrupt()?;
            let page = shared.read_page(pgno)?;
            let limits = shared.limits_for(pgno);
            for i in 0..page.n_cell {
                let info = page.cell(i, limits)?;
                clear_cell_overflow(&mut shared, &info)?;
                if page.is_leaf() || !page.kind.is_table() {
                    removed += 1;
                }
                if !page.is_leaf() {
                    stack.push(page.child(i, limits)?);
                }
            }
            if !page.is_leaf() {
                stack.push(page.child(page.n_cell, limits)?);
            }
            if pgno != root {
                free_page(&mut shared, pgno)?;
            }
        }

        let limits = shared.limits_for(root);
        let geom = shared.geom;
        let mut empty = Page::zeroed(root, root_kind.leaf_of(), limits, &geom);
        if limits.header_offset > 0 {
            // Page 1 keeps its file header.
            let current = shared.read_page_raw(root)?;
            empty.data[..limits.header_offset]
                .copy_from_slice(&current[..limits.header_offset]);
        }
        shared.write_mem_page(&empty)?;
        shared.bump_structure_version();
        Ok(removed)
    }

    /// Drop a tree entirely: clear it and free its root. Tree 1 cannot
    /// be dropped.
    pub fn drop_tree(&mut self, root: Pgno) -> Result<()> {
        if root == 1 {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.clear_tree(root)?;
        let mut shared = self.lock()?;
        free_page(&mut shared, root)?;
        shared.bump_structure_version();
        Ok(())
    }

    /// Delete all rows of a table tree with rowids in `lo..=hi`.
    /// Returns the number deleted.
    pub fn delete_range(&mut self, root: Pgno, lo: RowId, hi: RowId) -> Result<u64> {
        let mut cursor = self.cursor(root, true)?;
        let rc = cursor.table_moveto(lo, false)?;
        if !cursor.is_valid() {
            return Ok(0);
        }
        if rc < 0 && !cursor.next()? {
            return Ok(0);
        }
        let mut removed = 0u64;
        loop {
            let rowid = cursor.rowid()?;
            if rowid > hi {
                break;
            }
            cursor.delete()?;
            removed += 1;
            if !cursor.next()? {
                break;
            }
        }
        Ok(removed)
    }

    /// Read one of the 16 metadata slots.
    pub fn get_meta(&self, idx: usize) -> Result<u32> {
        let mut shared = self.lock()?;
        if idx >= N_BTREE_META {
            return Err(Error::new(ErrorCode::Range));
        }
        if idx == META_DATA_VERSION {
            return Ok(shared.data_version);
        }
        let header = shared.header()?;
        Ok(match idx {
            META_FREE_PAGE_COUNT => header.freelist_pages,
            _ => {
                let data = shared.read_page_raw(1)?;
                read_u32(&data, 36 + 4 * idx).unwrap_or(0)
            }
        })
    }

    /// Update a metadata slot (slots 1 through 8).
    pub fn update_meta(&mut self, idx: usize, value: u32) -> Result<()> {
        let mut shared = self.lock()?;
        shared.require_writer(self.conn)?;
        if !(1..=8).contains(&idx) {
            return Err(Error::new(ErrorCode::Range));
        }
        let mut data = shared.read_page_raw(1)?;
        write_u32(&mut data, 36 + 4 * idx, value)?;
        shared.write_page_raw(1, &data)
    }

    /// Run one incremental-vacuum step; true while more work remains.
    pub fn incr_vacuum(&mut self) -> Result<bool> {
        let mut shared = self.lock()?;
        shared.require_writer(self.conn)?;
        if shared.auto_vacuum == AutoVacuum::None {
            return Err(Error::new(ErrorCode::Misuse));
        }
        incr_vacuum_step(&mut shared)
    }

    /// Number of levels in the tree rooted at `root` (1 for a lone
    /// leaf).
    pub fn tree_height(&self, root: Pgno) -> Result<u32> {
        let mut shared = self.lock()?;
        let mut height = 1u32;
        let mut pgno = root;
        loop {
            let page = shared.read_page(pgno)?;
            if page.is_leaf() {
                return Ok(height);
            }
            let limits = shared.limits_for(pgno);
            pgno = page.child(0, limits)?;
            height += 1;
            if height > 40 {
                return Err(Error::corrupt("tree deeper than any well-formed file"));
            }
        }
    }

    /// Verify every page of the listed trees, the freelist, and the
    /// pointer map. `max_errors == 0` removes the bound.
    pub fn integrity_check(
        &self,
        roots: &[Pgno],
        max_errors: usize,
    ) -> Result<IntegrityCheckResult> {
        let mut shared = self.lock()?;
        integrity::integrity_check(&mut shared, roots, max_errors)
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        // A connection dying mid-write must not leave the shared state
        // wedged; its transaction rolls back.
        if self.trans != TransState::None {
            let _ = self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemPager;

    fn memory_btree(page_size: u32) -> Btree {
        let pager = Box::new(MemPager::new(page_size).unwrap());
        Btree::open(pager, BtreeConfig::default()).unwrap()
    }

    fn memory_btree_av(page_size: u32) -> Btree {
        let pager = Box::new(MemPager::new(page_size).unwrap());
        let config = BtreeConfig {
            auto_vacuum: AutoVacuum::Full,
            ..BtreeConfig::default()
        };
        Btree::open(pager, config).unwrap()
    }

    #[test]
    fn test_open_creates_header_and_root() {
        let bt = memory_btree(512);
        assert_eq!(bt.page_count().unwrap(), 1);
        let check = bt.integrity_check(&[1], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
    }

    #[test]
    fn test_begin_commit_rollback() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        assert_eq!(bt.txn_state(), TransState::Write);
        bt.commit().unwrap();
        assert_eq!(bt.txn_state(), TransState::None);

        bt.begin_trans(false).unwrap();
        assert_eq!(bt.txn_state(), TransState::Read);
        bt.rollback().unwrap();
    }

    #[test]
    fn test_second_writer_gets_busy() {
        let mut bt1 = memory_btree(512);
        let mut bt2 = Btree::connect(&bt1).unwrap();
        bt1.begin_trans(true).unwrap();
        let err = bt2.begin_trans(true).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        bt1.commit().unwrap();
        bt2.begin_trans(true).unwrap();
        bt2.commit().unwrap();
    }

    #[test]
    fn test_busy_handler_retries_until_free() {
        let mut bt1 = memory_btree(512);
        let mut bt2 = Btree::connect(&bt1).unwrap();
        bt2.set_busy_handler(|attempts| attempts < 3);
        bt1.begin_trans(true).unwrap();
        // Handler gives up after three retries; still Busy.
        let err = bt2.begin_trans(true).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
    }

    #[test]
    fn test_mutation_requires_write_transaction() {
        let bt = memory_btree(512);
        // A write cursor without a write transaction is refused outright.
        let err = bt.cursor(1, true).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnly);

        let mut bt = bt;
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, false).unwrap();
        let err = cur
            .insert(&BtreePayload::table(1, b"x".to_vec()), InsertFlags::empty())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnly);
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_insert_and_read_single_row() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        cur.insert(
            &BtreePayload::table(42, b"hello, tree".to_vec()),
            InsertFlags::empty(),
        )
        .unwrap();
        assert_eq!(cur.table_moveto(42, false).unwrap(), 0);
        assert_eq!(cur.rowid().unwrap(), 42);
        assert_eq!(cur.payload().unwrap(), b"hello, tree");
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_replace_existing_rowid() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        cur.insert(&BtreePayload::table(7, b"old".to_vec()), InsertFlags::empty())
            .unwrap();
        cur.insert(&BtreePayload::table(7, b"new".to_vec()), InsertFlags::empty())
            .unwrap();
        assert_eq!(cur.table_moveto(7, false).unwrap(), 0);
        assert_eq!(cur.payload().unwrap(), b"new");
        // Still exactly one row.
        assert!(cur.first().unwrap());
        assert!(!cur.next().unwrap());
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_ordered_traversal_after_random_inserts() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        // A fixed pseudo-random-ish insertion order.
        let mut keys: Vec<RowId> = (1..=200).map(|i| (i * 73) % 211).collect();
        keys.sort();
        keys.dedup();
        let mut shuffled = keys.clone();
        shuffled.reverse();
        for &k in &shuffled {
            cur.insert(
                &BtreePayload::table(k, format!("row{}", k).into_bytes()),
                InsertFlags::empty(),
            )
            .unwrap();
        }

        let mut seen = Vec::new();
        let mut more = cur.first().unwrap();
        while more {
            seen.push(cur.rowid().unwrap());
            more = cur.next().unwrap();
        }
        assert_eq!(seen, keys);
        drop(cur);
        bt.commit().unwrap();

        let check = bt.integrity_check(&[1], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
    }

    #[test]
    fn test_index_tree_insert_and_seek() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let root = bt.create_tree(TreeKind::Index).unwrap();
        let mut cur = bt.cursor(root, true).unwrap();
        for word in ["delta", "alpha", "echo", "bravo", "charlie"] {
            cur.insert(
                &BtreePayload::index(word.as_bytes().to_vec()),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        assert_eq!(cur.index_moveto(b"charlie").unwrap(), 0);

        let mut seen = Vec::new();
        let mut more = cur.first().unwrap();
        while more {
            seen.push(String::from_utf8(cur.payload().unwrap()).unwrap());
            more = cur.next().unwrap();
        }
        assert_eq!(seen, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_create_and_drop_tree_returns_pages_to_freelist() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let root = bt.create_tree(TreeKind::Table).unwrap();
        let mut cur = bt.cursor(root, true).unwrap();
        for i in 1..=100 {
            cur.insert(
                &BtreePayload::table(i, vec![0xaa; 40]),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.drop_tree(root).unwrap();
        bt.commit().unwrap();

        // Everything the tree used is on the freelist, and the file
        // passes a full check.
        let check = bt.integrity_check(&[1], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
        assert!(bt.get_meta(META_FREE_PAGE_COUNT).unwrap() > 0);

        // A new tree reuses freed pages instead of growing the file.
        let before = bt.page_count().unwrap();
        bt.begin_trans(true).unwrap();
        let root2 = bt.create_tree(TreeKind::Table).unwrap();
        bt.commit().unwrap();
        assert!(root2 <= before);
        assert_eq!(bt.page_count().unwrap(), before);
    }

    #[test]
    fn test_clear_tree_counts_rows() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 1..=50 {
            cur.insert(&BtreePayload::table(i, vec![1; 20]), InsertFlags::empty())
                .unwrap();
        }
        drop(cur);
        assert_eq!(bt.clear_tree(1).unwrap(), 50);
        let mut cur = bt.cursor(1, false).unwrap();
        assert!(!cur.first().unwrap());
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_delete_range() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 1..=30 {
            cur.insert(&BtreePayload::table(i, vec![2; 10]), InsertFlags::empty())
                .unwrap();
        }
        drop(cur);
        assert_eq!(bt.delete_range(1, 10, 19).unwrap(), 10);
        let mut cur = bt.cursor(1, false).unwrap();
        let mut seen = Vec::new();
        let mut more = cur.first().unwrap();
        while more {
            seen.push(cur.rowid().unwrap());
            more = cur.next().unwrap();
        }
        let expected: Vec<RowId> = (1..=9).chain(20..=30).collect();
        assert_eq!(seen, expected);
        drop(cur);
        bt.commit().unwrap();
    }

    #[test]
    fn test_meta_slots_round_trip() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        bt.update_meta(META_USER_VERSION, 7).unwrap();
        bt.update_meta(META_APPLICATION_ID, 0xbeef).unwrap();
        bt.commit().unwrap();
        assert_eq!(bt.get_meta(META_USER_VERSION).unwrap(), 7);
        assert_eq!(bt.get_meta(META_APPLICATION_ID).unwrap(), 0xbeef);
        // Committing bumped the data version.
        assert!(bt.get_meta(META_DATA_VERSION).unwrap() >= 1);
    }

    #[test]
    fn test_rollback_undoes_inserts() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        cur.insert(&BtreePayload::table(1, b"keep".to_vec()), InsertFlags::empty())
            .unwrap();
        drop(cur);
        bt.commit().unwrap();

        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        cur.insert(&BtreePayload::table(2, b"drop".to_vec()), InsertFlags::empty())
            .unwrap();
        drop(cur);
        bt.rollback().unwrap();

        let mut cur = bt.cursor(1, false).unwrap();
        assert!(cur.first().unwrap());
        assert_eq!(cur.rowid().unwrap(), 1);
        assert!(!cur.next().unwrap());
    }

    #[test]
    fn test_savepoint_rollback_restores_rows() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        cur.insert(&BtreePayload::table(1, b"outer".to_vec()), InsertFlags::empty())
            .unwrap();
        drop(cur);

        let sp = bt.savepoint_open().unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 2..=20 {
            cur.insert(&BtreePayload::table(i, vec![9; 30]), InsertFlags::empty())
                .unwrap();
        }
        drop(cur);
        bt.savepoint_rollback(sp).unwrap();
        bt.commit().unwrap();

        let mut cur = bt.cursor(1, false).unwrap();
        assert!(cur.first().unwrap());
        assert_eq!(cur.rowid().unwrap(), 1);
        assert!(!cur.next().unwrap());
        let check = bt.integrity_check(&[1], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
    }

    #[test]
    fn test_interrupt_aborts_scan() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 1..=100 {
            cur.insert(&BtreePayload::table(i, vec![5; 30]), InsertFlags::empty())
                .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();

        bt.interrupt_handle().store(true, Ordering::Relaxed);
        let mut cur = bt.cursor(1, false).unwrap();
        let err = cur.table_moveto(50, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Interrupt);
        bt.interrupt_handle().store(false, Ordering::Relaxed);
        assert_eq!(cur.table_moveto(50, false).unwrap(), 0);
    }

    #[test]
    fn test_cursor_requires_seek_after_foreign_write() {
        let mut bt = memory_btree(512);
        bt.begin_trans(true).unwrap();
        let mut cur = bt.cursor(1, true).unwrap();
        for i in 1..=10 {
            cur.insert(&BtreePayload::table(i, vec![3; 10]), InsertFlags::empty())
                .unwrap();
        }
        // Park a second cursor on row 5.
        let mut reader = bt.cursor(1, false).unwrap();
        assert_eq!(reader.table_moveto(5, false).unwrap(), 0);

        // Grow the tree enough to force splits under the reader.
        for i in 11..=200 {
            cur.insert(&BtreePayload::table(i, vec![3; 30]), InsertFlags::empty())
                .unwrap();
        }
        // The reader re-seeks transparently and still sees its row.
        assert_eq!(reader.rowid().unwrap(), 5);
        assert!(reader.next().unwrap());
        assert_eq!(reader.rowid().unwrap(), 6);
        drop(cur);
        drop(reader);
        bt.commit().unwrap();
    }

    #[test]
    fn test_auto_vacuum_file_stays_consistent() {
        let mut bt = memory_btree_av(512);
        bt.begin_trans(true).unwrap();
        let root = bt.create_tree(TreeKind::Table).unwrap();
        let mut cur = bt.cursor(root, true).unwrap();
        for i in 1..=150 {
            cur.insert(
                &BtreePayload::table(i, vec![0x5a; 60]),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(cur);
        bt.commit().unwrap();
        let check = bt.integrity_check(&[1, root], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);

        // Dropping the tree and committing vacuums the file back down.
        let before = bt.page_count().unwrap();
        bt.begin_trans(true).unwrap();
        bt.drop_tree(root).unwrap();
        bt.commit().unwrap();
        let after = bt.page_count().unwrap();
        assert!(after < before, "{} !< {}", after, before);
        assert_eq!(bt.get_meta(META_FREE_PAGE_COUNT).unwrap(), 0);
        let check = bt.integrity_check(&[1], 0).unwrap();
        assert!(check.is_ok, "findings: {:?}", check.errors);
    }

    #[test]
    fn test_table_lock_conflicts() {
        let mut bt1 = memory_btree(512);
        let bt2 = Btree::connect(&bt1).unwrap();
        bt1.begin_trans(true).unwrap();
        let _w = bt1.cursor(1, true).unwrap();
        let err = bt2.cursor(1, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);
    }
}
