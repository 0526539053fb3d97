//! Tree cursors.
//!
//! A cursor remembers its root-to-current path as (page number, cell
//! index) pairs — page numbers, never page references, because balances
//! move content between pages freely. Whenever the shared structure
//! version moves past the cursor's, the path is abandoned and the
//! remembered key is re-sought on next use (`RequireSeek`).
//!
//! Table trees keep every entry in their leaves; index trees store each
//! key exactly once, so in-order traversal visits interior cells too.

use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Pgno, RowId};

use super::balance::{balance, unpack};
use super::cell::{
    build_index_leaf_cell, build_table_leaf_cell, cell_info, clear_cell_overflow,
    read_overflow_chain, CellInfo,
};
use super::page::MemPage;
use super::ptrmap::ptrmap_put;
use super::types::{CursorState, InsertFlags, PageKind, AutoVacuum, PTRMAP_OVERFLOW1};
use super::BtShared;

/// What gets stored by an insert: a rowid plus payload for table trees,
/// or key bytes for index trees.
#[derive(Debug, Clone, Default)]
pub struct BtreePayload {
    pub rowid: RowId,
    pub key: Option<Vec<u8>>,
    pub data: Vec<u8>,
    /// Trailing zero bytes appended to `data` without materializing
    /// them.
    pub n_zero: u32,
}

impl BtreePayload {
    pub fn table(rowid: RowId, data: Vec<u8>) -> Self {
        Self {
            rowid,
            key: None,
            data,
            n_zero: 0,
        }
    }

    pub fn index(key: Vec<u8>) -> Self {
        Self {
            rowid: 0,
            key: Some(key),
            data: Vec::new(),
            n_zero: 0,
        }
    }
}

/// The key a cursor remembers for re-seeking.
#[derive(Debug, Clone)]
enum SavedPosition {
    None,
    Rowid(RowId),
    IndexKey(Vec<u8>),
}

impl std::fmt::Debug for BtCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtCursor")
            .field("conn", &self.conn)
            .field("root", &self.root)
            .field("writable", &self.writable)
            .field("intkey", &self.intkey)
            .field("state", &self.state)
            .field("path", &self.path)
            .field("saved", &self.saved)
            .field("skip_next", &self.skip_next)
            .field("structure_version", &self.structure_version)
            .finish()
    }
}

pub struct BtCursor {
    shared: Arc<Mutex<BtShared>>,
    conn: u64,
    root: Pgno,
    writable: bool,
    intkey: bool,
    state: CursorState,
    /// (page number, cell index) from root to the current page.
    path: Vec<(Pgno, u16)>,
    /// Cached shape of the current cell; valid while `state == Valid`.
    info: CellInfo,
    saved: SavedPosition,
    /// After a restore: <0 the next `prev` is a no-op, >0 the next
    /// `next` is a no-op (the re-seek already moved past the old spot).
    skip_next: i32,
    structure_version: u64,
}

impl BtCursor {
    pub(crate) fn new(
        shared: Arc<Mutex<BtShared>>,
        conn: u64,
        root: Pgno,
        intkey: bool,
        writable: bool,
        structure_version: u64,
    ) -> Self {
        Self {
            shared,
            conn,
            root,
            writable,
            intkey,
            state: CursorState::Invalid,
            path: Vec::new(),
            info: CellInfo::default(),
            saved: SavedPosition::None,
            skip_next: 0,
            structure_version,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    pub fn root_page(&self) -> Pgno {
        self.root
    }

    // ------------------------------------------------------------------
    // Public operations: each takes the shared mutex for its duration.
    // ------------------------------------------------------------------

    /// Position on the smallest entry. Returns false when the tree is
    /// empty.
    pub fn first(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.sync_version(&shared);
        self.move_to_root();
        self.descend_edge(&mut shared, false)
    }

    /// Position on the largest entry. Returns false when the tree is
    /// empty.
    pub fn last(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.sync_version(&shared);
        self.move_to_root();
        self.descend_edge(&mut shared, true)
    }

    /// Seek a table tree by rowid. Returns 0 on an exact hit, -1 when
    /// the cursor settles before the key, +1 when after.
    pub fn table_moveto(&mut self, key: RowId, _bias: bool) -> Result<i32> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.sync_version(&shared);
        self.table_moveto_locked(&mut shared, key)
    }

    /// Seek an index tree by key bytes; same return convention as
    /// `table_moveto`.
    pub fn index_moveto(&mut self, key: &[u8]) -> Result<i32> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.sync_version(&shared);
        self.index_moveto_locked(&mut shared, key)
    }

    /// Advance to the next entry in key order. Returns false once the
    /// tree is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        if self.skip_next > 0 {
            self.skip_next = 0;
            return Ok(true);
        }
        self.skip_next = 0;
        self.step_forward(&mut shared)
    }

    /// Step back to the previous entry. Returns false at the start.
    pub fn prev(&mut self) -> Result<bool> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        if self.state != CursorState::Valid {
            return Ok(false);
        }
        if self.skip_next < 0 {
            self.skip_next = 0;
            return Ok(true);
        }
        self.skip_next = 0;
        self.step_backward(&mut shared)
    }

    /// Rowid of the current entry (table trees).
    pub fn rowid(&mut self) -> Result<RowId> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        if self.state != CursorState::Valid {
            return Err(Error::new(ErrorCode::Misuse));
        }
        Ok(self.info.key)
    }

    /// Total payload length of the current entry.
    pub fn payload_size(&mut self) -> Result<u32> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        if self.state != CursorState::Valid {
            return Err(Error::new(ErrorCode::Misuse));
        }
        Ok(self.info.n_payload)
    }

    /// Full payload of the current entry, overflow included.
    pub fn payload(&mut self) -> Result<Vec<u8>> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        self.payload_range_locked(&mut shared, 0, u32::MAX)
    }

    /// A sub-range of the current payload, walking the overflow chain
    /// only as far as needed.
    pub fn payload_slice(&mut self, offset: u32, amount: u32) -> Result<Vec<u8>> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.revalidate(&mut shared)?;
        self.payload_range_locked(&mut shared, offset, amount)
    }

    /// Insert (or replace) an entry. The cell is written in place when
    /// it fits; otherwise the page goes through the balancer.
    pub fn insert(&mut self, payload: &BtreePayload, _flags: InsertFlags) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.require_writable(&shared)?;
        self.sync_version(&shared);

        let mut rc = if self.intkey {
            self.table_moveto_locked(&mut shared, payload.rowid)?
        } else {
            let key = payload.key.as_deref().ok_or(Error::new(ErrorCode::Misuse))?;
            self.index_moveto_locked(&mut shared, key)?
        };

        // Replacing an existing entry: take the old cell out first. An
        // exact match on an index interior cell goes through the full
        // delete path, after which the key is gone from the tree.
        if rc == 0 && self.state == CursorState::Valid {
            let (pgno, idx) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
            let limits = shared.limits_for(pgno);
            let page = shared.read_page(pgno)?;
            if page.is_leaf() {
                let old = page.cell(idx, limits)?;
                clear_cell_overflow(&mut shared, &old)?;
                let mut page = page;
                page.drop_cell(idx, limits)?;
                shared.write_mem_page(&page)?;
            } else {
                self.delete_locked(&mut shared)?;
                rc = if self.intkey {
                    self.table_moveto_locked(&mut shared, payload.rowid)?
                } else {
                    let key = payload.key.as_deref().ok_or(Error::new(ErrorCode::Misuse))?;
                    self.index_moveto_locked(&mut shared, key)?
                };
            }
        }

        let cell = if self.intkey {
            build_table_leaf_cell(&mut shared, payload.rowid, &payload.data, payload.n_zero)?
        } else {
            let key = payload.key.as_deref().ok_or(Error::new(ErrorCode::Misuse))?;
            build_index_leaf_cell(&mut shared, key)?
        };

        let (pgno, seek_idx) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
        let limits = shared.limits_for(pgno);
        let mut page = shared.read_page(pgno)?;
        let idx = match rc {
            r if r < 0 && self.state == CursorState::Valid => seek_idx + 1,
            _ if self.state != CursorState::Valid => 0,
            _ => seek_idx,
        }
        .min(page.n_cell);

        if page.insert_cell(idx, &cell, limits)? {
            shared.write_mem_page(&page)?;
            if shared.auto_vacuum != AutoVacuum::None {
                let placed = page.cell(idx, limits)?;
                if let Some(ovfl) = placed.overflow_page {
                    ptrmap_put(&mut shared, ovfl, PTRMAP_OVERFLOW1, pgno)?;
                }
            }
            shared.bump_structure_version();
            self.structure_version = shared.structure_version;
            if let Some(last) = self.path.last_mut() {
                last.1 = idx;
            }
            self.info = page.cell(idx, limits)?;
            self.state = CursorState::Valid;
            self.save_current_key(&mut shared)?;
        } else {
            let mut snap = unpack(&page, limits)?;
            snap.cells.insert(idx as usize, cell);
            balance(&mut shared, &self.path, snap)?;
            self.saved = if self.intkey {
                SavedPosition::Rowid(payload.rowid)
            } else {
                SavedPosition::IndexKey(payload.key.clone().unwrap_or_default())
            };
            self.state = CursorState::RequireSeek;
            self.structure_version = shared.structure_version;
        }
        Ok(())
    }

    /// Delete the current entry. The cursor remembers the deleted key;
    /// a following `next` lands on the entry after it.
    pub fn delete(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let mut shared = shared.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        self.require_writable(&shared)?;
        self.revalidate(&mut shared)?;
        if self.state != CursorState::Valid {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.delete_locked(&mut shared)
    }

    // ------------------------------------------------------------------
    // Internals (shared mutex already held)
    // ------------------------------------------------------------------

    fn require_writable(&self, shared: &BtShared) -> Result<()> {
        if !self.writable || shared.writer != Some(self.conn) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        Ok(())
    }

    /// Note a structure-version change: the path is garbage, but the
    /// remembered key can re-seek.
    fn sync_version(&mut self, shared: &BtShared) {
        if self.structure_version != shared.structure_version {
            if self.state == CursorState::Valid {
                self.state = CursorState::RequireSeek;
            }
            self.structure_version = shared.structure_version;
        }
    }

    /// `sync_version`, then re-seek a `RequireSeek` cursor.
    fn revalidate(&mut self, shared: &mut BtShared) -> Result<()> {
        self.sync_version(shared);
        if self.state != CursorState::RequireSeek {
            return Ok(());
        }
        let rc = match std::mem::replace(&mut self.saved, SavedPosition::None) {
            SavedPosition::Rowid(rowid) => {
                let rc = self.table_moveto_locked(shared, rowid)?;
                self.saved = SavedPosition::Rowid(rowid);
                rc
            }
            SavedPosition::IndexKey(key) => {
                let rc = self.index_moveto_locked(shared, &key)?;
                self.saved = SavedPosition::IndexKey(key);
                rc
            }
            SavedPosition::None => {
                self.state = CursorState::Invalid;
                return Ok(());
            }
        };
        self.skip_next = rc;
        Ok(())
    }

    fn move_to_root(&mut self) {
        self.path.clear();
        self.path.push((self.root, 0));
        self.state = CursorState::Invalid;
        self.skip_next = 0;
    }

    fn current_page(&self, shared: &mut BtShared) -> Result<MemPage> {
        let (pgno, _) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
        shared.read_page(pgno)
    }

    /// Descend to the leftmost (or rightmost) entry below the current
    /// page. Returns false when there is none.
    fn descend_edge(&mut self, shared: &mut BtShared, rightmost: bool) -> Result<bool> {
        loop {
            let page = self.current_page(shared)?;
            let limits = shared.limits_for(page.pgno);
            if page.is_leaf() {
                if page.n_cell == 0 {
                    self.state = CursorState::Invalid;
                    return Ok(false);
                }
                let idx = if rightmost { page.n_cell - 1 } else { 0 };
                return self.settle(shared, &page, idx).map(|_| true)
            }
            let idx = if rightmost { page.n_cell } else { 0 };
            let child = page.child(idx, limits)?;
            self.path.last_mut().expect("path nonempty").1 = idx;
            self.push_level(child)?;
        }
    }

    fn push_level(&mut self, child: Pgno) -> Result<()> {
        if self.path.len() > 40 {
            // A path this deep cannot come from a well-formed file.
            return Err(Error::corrupt("cursor path exceeds maximum tree depth"));
        }
        if child == 0 {
            return Err(Error::corrupt("descent into page 0"));
        }
        self.path.push((child, 0));
        Ok(())
    }

    /// Cache the cell at `idx` and mark the cursor valid there.
    fn settle(&mut self, shared: &mut BtShared, page: &MemPage, idx: u16) -> Result<()> {
        let limits = shared.limits_for(page.pgno);
        self.info = page.cell(idx, limits)?;
        self.path.last_mut().expect("path nonempty").1 = idx;
        self.state = CursorState::Valid;
        self.save_current_key(shared)?;
        Ok(())
    }

    /// Remember the current key for later re-seeks.
    fn save_current_key(&mut self, shared: &mut BtShared) -> Result<()> {
        if self.intkey {
            self.saved = SavedPosition::Rowid(self.info.key);
        } else {
            let (pgno, idx) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
            let page = shared.read_page(pgno)?;
            let key = self.index_key_at(shared, &page, idx)?;
            self.saved = SavedPosition::IndexKey(key);
        }
        Ok(())
    }

    /// Full key bytes of cell `idx`, reading the overflow chain when the
    /// key spills.
    fn index_key_at(&self, shared: &mut BtShared, page: &MemPage, idx: u16) -> Result<Vec<u8>> {
        let limits = shared.limits_for(page.pgno);
        let info = page.cell(idx, limits)?;
        let offset = page.cell_ptr(idx, limits)? as usize;
        let start = offset + info.local_start as usize;
        let mut key = page.data[start..start + info.n_local as usize].to_vec();
        if let Some(first) = info.overflow_page {
            let rest = read_overflow_chain(shared, first, info.n_payload - info.n_local as u32)?;
            key.extend_from_slice(&rest);
        }
        Ok(key)
    }

    fn table_moveto_locked(&mut self, shared: &mut BtShared, key: RowId) -> Result<i32> {
        self.move_to_root();
        loop {
            shared.check_interrupt()?;
            let page = self.current_page(shared)?;
            let limits = shared.limits_for(page.pgno);

            // First cell with rowid >= key.
            let mut lo = 0u16;
            let mut hi = page.n_cell;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if page.cell(mid, limits)?.key < key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }

            if !page.is_leaf() {
                let child = page.child(lo, limits)?;
                self.path.last_mut().expect("path nonempty").1 = lo;
                self.push_level(child)?;
                continue;
            }

            if page.n_cell == 0 {
                self.state = CursorState::Invalid;
                self.path.last_mut().expect("path nonempty").1 = 0;
                return Ok(-1);
            }
            if lo < page.n_cell {
                self.settle(shared, &page, lo)?;
                return Ok(if self.info.key == key { 0 } else { 1 });
            }
            self.settle(shared, &page, page.n_cell - 1)?;
            return Ok(-1);
        }
    }

    fn index_moveto_locked(&mut self, shared: &mut BtShared, key: &[u8]) -> Result<i32> {
        self.move_to_root();
        loop {
            shared.check_interrupt()?;
            let page = self.current_page(shared)?;
            let limits = shared.limits_for(page.pgno);

            // First cell with cell key >= target.
            let mut lo = 0u16;
            let mut hi = page.n_cell;
            let mut exact = false;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let mid_key = self.index_key_at(shared, &page, mid)?;
                match mid_key.as_slice().cmp(key) {
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Equal => {
                        lo = mid;
                        exact = true;
                        break;
                    }
                    std::cmp::Ordering::Greater => hi = mid,
                }
            }

            if exact {
                self.settle(shared, &page, lo)?;
                return Ok(0);
            }

            if !page.is_leaf() {
                let child = page.child(lo, limits)?;
                self.path.last_mut().expect("path nonempty").1 = lo;
                self.push_level(child)?;
                continue;
            }

            if page.n_cell == 0 {
                self.state = CursorState::Invalid;
                self.path.last_mut().expect("path nonempty").1 = 0;
                return Ok(-1);
            }
            if lo < page.n_cell {
                self.settle(shared, &page, lo)?;
                return Ok(1);
            }
            self.settle(shared, &page, page.n_cell - 1)?;
            return Ok(-1);
        }
    }

    fn step_forward(&mut self, shared: &mut BtShared) -> Result<bool> {
        let page = self.current_page(shared)?;
        let limits = shared.limits_for(page.pgno);
        let idx = self.path.last().expect("path nonempty").1;

        if !page.is_leaf() {
            // On an index interior cell: the successor is the smallest
            // entry of the subtree to its right.
            let child = page.child(idx + 1, limits)?;
            self.path.last_mut().expect("path nonempty").1 = idx + 1;
            self.push_level(child)?;
            return self.descend_edge(shared, false);
        }

        if idx + 1 < page.n_cell {
            self.settle(shared, &page, idx + 1)?;
            return Ok(true);
        }

        // Leaf exhausted: climb until a subtree to the right exists.
        loop {
            self.path.pop();
            let Some(&(pgno, pidx)) = self.path.last() else {
                self.state = CursorState::Invalid;
                return Ok(false);
            };
            let parent = shared.read_page(pgno)?;
            if pidx < parent.n_cell {
                if self.intkey {
                    // Table interior cells carry no entries; continue
                    // into the next child subtree.
                    let limits = shared.limits_for(pgno);
                    let child = parent.child(pidx + 1, limits)?;
                    self.path.last_mut().expect("path nonempty").1 = pidx + 1;
                    self.push_level(child)?;
                    return self.descend_edge(shared, false);
                }
                // Index interior cell is itself the next entry.
                self.settle(shared, &parent, pidx)?;
                return Ok(true);
            }
        }
    }

    fn step_backward(&mut self, shared: &mut BtShared) -> Result<bool> {
        let page = self.current_page(shared)?;
        let limits = shared.limits_for(page.pgno);
        let idx = self.path.last().expect("path nonempty").1;

        if !page.is_leaf() {
            // On an index interior cell: the predecessor is the largest
            // entry of the subtree to its left.
            let child = page.child(idx, limits)?;
            self.push_level(child)?;
            return self.descend_edge(shared, true);
        }

        if idx > 0 {
            self.settle(shared, &page, idx - 1)?;
            return Ok(true);
        }

        loop {
            self.path.pop();
            let Some(&(pgno, pidx)) = self.path.last() else {
                self.state = CursorState::Invalid;
                return Ok(false);
            };
            let parent = shared.read_page(pgno)?;
            if pidx > 0 {
                if self.intkey {
                    let limits = shared.limits_for(pgno);
                    let child = parent.child(pidx - 1, limits)?;
                    self.path.last_mut().expect("path nonempty").1 = pidx - 1;
                    self.push_level(child)?;
                    return self.descend_edge(shared, true);
                }
                self.settle(shared, &parent, pidx - 1)?;
                return Ok(true);
            }
        }
    }

    fn payload_range_locked(
        &mut self,
        shared: &mut BtShared,
        offset: u32,
        amount: u32,
    ) -> Result<Vec<u8>> {
        if self.state != CursorState::Valid {
            return Err(Error::new(ErrorCode::Misuse));
        }
        let (pgno, idx) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
        let page = shared.read_page(pgno)?;
        let limits = shared.limits_for(pgno);
        let info = page.cell(idx, limits)?;

        if offset >= info.n_payload {
            return Ok(Vec::new());
        }
        let amount = amount.min(info.n_payload - offset);

        let cell_start = page.cell_ptr(idx, limits)? as usize;
        let local_start = cell_start + info.local_start as usize;
        let mut out = Vec::with_capacity(amount as usize);

        // Inline portion.
        if offset < info.n_local as u32 {
            let start = local_start + offset as usize;
            let take = (info.n_local as u32 - offset).min(amount) as usize;
            out.extend_from_slice(&page.data[start..start + take]);
        }

        // Spilled portion.
        if (out.len() as u32) < amount {
            let first = info
                .overflow_page
                .ok_or_else(|| Error::corrupt("payload extends past cell without overflow"))?;
            let skip = offset.saturating_sub(info.n_local as u32);
            let chain =
                read_overflow_chain(shared, first, info.n_payload - info.n_local as u32)?;
            let start = skip as usize;
            let take = amount as usize - out.len();
            out.extend_from_slice(&chain[start..start + take]);
        }
        Ok(out)
    }

    fn delete_locked(&mut self, shared: &mut BtShared) -> Result<()> {
        let (pgno, idx) = *self.path.last().ok_or(Error::new(ErrorCode::Internal))?;
        let limits = shared.limits_for(pgno);
        let page = shared.read_page(pgno)?;
        let deleted_key = if self.intkey {
            SavedPosition::Rowid(self.info.key)
        } else {
            SavedPosition::IndexKey(self.index_key_at(shared, &page, idx)?)
        };

        if page.is_leaf() {
            self.delete_from_leaf(shared, page, idx)?;
        } else {
            self.delete_from_interior(shared, page, idx)?;
        }

        self.saved = deleted_key;
        self.state = CursorState::RequireSeek;
        self.structure_version = shared.structure_version;
        Ok(())
    }

    fn delete_from_leaf(&mut self, shared: &mut BtShared, mut page: MemPage, idx: u16) -> Result<()> {
        let limits = shared.limits_for(page.pgno);
        let info = page.cell(idx, limits)?;
        clear_cell_overflow(shared, &info)?;
        page.drop_cell(idx, limits)?;
        shared.write_mem_page(&page)?;

        if self.path.len() > 1 && page.is_underfull(limits) {
            let snap = unpack(&page, limits)?;
            balance(shared, &self.path, snap)?;
        } else {
            shared.bump_structure_version();
        }
        Ok(())
    }

    /// Deleting an index interior cell: the divider is replaced by the
    /// largest entry of its left subtree, which is removed from its
    /// leaf; whichever of the two pages ends up out of shape is then
    /// balanced.
    fn delete_from_interior(
        &mut self,
        shared: &mut BtShared,
        page: MemPage,
        idx: u16,
    ) -> Result<()> {
        let limits = shared.limits_for(page.pgno);
        let divider = page.cell_bytes(idx, limits)?;
        let divider_info = page.cell(idx, limits)?;
        let child_of_divider = super::cell::cell_child(&divider)?;

        // Walk to the rightmost leaf of the left subtree.
        let interior_depth = self.path.len() - 1;
        self.path.last_mut().expect("path nonempty").1 = idx;
        self.push_level(child_of_divider)?;
        loop {
            let p = self.current_page(shared)?;
            if p.is_leaf() {
                break;
            }
            let l = shared.limits_for(p.pgno);
            let child = p.child(p.n_cell, l)?;
            self.path.last_mut().expect("path nonempty").1 = p.n_cell;
            self.push_level(child)?;
        }

        let (leaf_pgno, _) = *self.path.last().expect("path nonempty");
        let leaf_limits = shared.limits_for(leaf_pgno);
        let mut leaf = shared.read_page(leaf_pgno)?;
        if leaf.n_cell == 0 {
            return Err(Error::corrupt("interior cell with an empty left subtree"));
        }
        let pred_idx = leaf.n_cell - 1;
        let pred = leaf.cell_bytes(pred_idx, leaf_limits)?;
        leaf.drop_cell(pred_idx, leaf_limits)?;
        shared.write_mem_page(&leaf)?;
        let leaf_underfull = leaf.is_underfull(leaf_limits);
        let leaf_path = self.path.clone();

        // Swap the divider for the predecessor (keeping the child
        // pointer), freeing the divider's spilled payload.
        clear_cell_overflow(shared, &divider_info)?;
        let mut new_divider = Vec::with_capacity(4 + pred.len());
        new_divider.extend_from_slice(&divider[..4]);
        new_divider.extend_from_slice(&pred);

        let mut interior = shared.read_page(page.pgno)?;
        interior.drop_cell(idx, limits)?;
        let interior_path = &self.path[..=interior_depth];
        if interior.insert_cell(idx, &new_divider, limits)? {
            shared.write_mem_page(&interior)?;
            if shared.auto_vacuum != AutoVacuum::None {
                // The promoted cell's spilled key now hangs off the
                // interior page.
                let info = interior.cell(idx, limits)?;
                if let Some(ovfl) = info.overflow_page {
                    ptrmap_put(shared, ovfl, PTRMAP_OVERFLOW1, interior.pgno)?;
                }
            }
            if leaf_underfull {
                let leaf = shared.read_page(leaf_pgno)?;
                let snap = unpack(&leaf, leaf_limits)?;
                balance(shared, &leaf_path, snap)?;
            } else {
                shared.bump_structure_version();
            }
        } else {
            let mut snap = unpack(&interior, limits)?;
            snap.cells.insert(idx as usize, new_divider);
            balance(shared, interior_path, snap)?;
            if leaf_underfull {
                // The balance may have moved the leaf; find it again by
                // seeking the predecessor's key.
                let pred_info = cell_info(
                    PageKind::IndexLeaf,
                    leaf.max_local,
                    leaf.min_local,
                    shared.geom.usable_size,
                    &pred,
                )?;
                let mut pred_key = pred[pred_info.local_start as usize
                    ..pred_info.local_start as usize + pred_info.n_local as usize]
                    .to_vec();
                if let Some(first) = pred_info.overflow_page {
                    let rest = read_overflow_chain(
                        shared,
                        first,
                        pred_info.n_payload - pred_info.n_local as u32,
                    )?;
                    pred_key.extend_from_slice(&rest);
                }
                self.index_moveto_locked(shared, &pred_key)?;
                if let Some(&(lp, _)) = self.path.last() {
                    let l = shared.limits_for(lp);
                    let lpage = shared.read_page(lp)?;
                    if lpage.is_leaf() && lpage.is_underfull(l) {
                        let snap = unpack(&lpage, l)?;
                        let path = self.path.clone();
                        balance(shared, &path, snap)?;
                    }
                }
            }
        }
        Ok(())
    }
}
