//! Decoded, mutable in-memory view of one B-tree page.
//!
//! A `MemPage` owns a copy of the raw page image and keeps the header
//! fields it mutates (cell count, content offset, free-block chain,
//! fragment count) in sync between the struct and the image, so writing
//! the page back is a plain byte copy.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{cell_info, CellInfo};
use super::encoding::{read_u16, read_u32, write_u16, write_u32};
use super::types::{Geometry, PageKind, PageLimits, CELL_PTR_SIZE, MIN_CELL_SIZE};

#[derive(Clone, Debug)]
pub struct MemPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub kind: PageKind,
    pub n_cell: u16,
    pub first_freeblock: u16,
    /// Start of the cell content area. Kept as u32 because the on-disk
    /// encoding of 65536 is 0.
    pub cell_content: u32,
    pub frag_bytes: u8,
    pub right_child: Option<Pgno>,
    pub max_local: u16,
    pub min_local: u16,
    /// Total free bytes: gap + free blocks + fragments.
    pub n_free: i32,
}

impl MemPage {
    /// Decode a raw page image. Fails with `Corrupt` when the flag byte,
    /// cell count, content offset, or free-block chain are out of
    /// bounds.
    pub fn from_bytes(
        pgno: Pgno,
        data: Vec<u8>,
        limits: PageLimits,
        geom: &Geometry,
    ) -> Result<Self> {
        let hdr = limits.header_start();
        if data.len() < limits.page_size as usize || data.len() < hdr + 8 {
            return Err(Error::corrupt(format!("page {}: short page image", pgno)));
        }

        let kind = PageKind::from_flags(data[hdr])
            .map_err(|_| Error::corrupt(format!("page {}: bad flag byte 0x{:02x}", pgno, data[hdr])))?;
        let first_freeblock = read_u16(&data, hdr + 1).ok_or(Error::new(ErrorCode::Corrupt))?;
        let n_cell = read_u16(&data, hdr + 3).ok_or(Error::new(ErrorCode::Corrupt))?;
        if n_cell as u32 > limits.max_cell_count() {
            return Err(Error::corrupt(format!(
                "page {}: cell count {} exceeds page capacity",
                pgno, n_cell
            )));
        }
        let raw_content = read_u16(&data, hdr + 5).ok_or(Error::new(ErrorCode::Corrupt))?;
        let cell_content = if raw_content == 0 && limits.usable_size == 65536 {
            65536
        } else {
            raw_content as u32
        };
        let frag_bytes = data[hdr + 7];
        let right_child = if kind.is_leaf() {
            None
        } else {
            Some(read_u32(&data, hdr + 8).ok_or(Error::new(ErrorCode::Corrupt))?)
        };

        let mut page = Self {
            pgno,
            data,
            kind,
            n_cell,
            first_freeblock,
            cell_content,
            frag_bytes,
            right_child,
            max_local: geom.max_local(kind),
            min_local: geom.min_local(kind),
            n_free: -1,
        };
        page.n_free = page.compute_free_space(limits)?;
        Ok(page)
    }

    /// Build a fresh, empty page of the given kind over a zeroed image.
    pub fn zeroed(pgno: Pgno, kind: PageKind, limits: PageLimits, geom: &Geometry) -> Self {
        let mut data = vec![0u8; limits.page_size as usize];
        let hdr = limits.header_start();
        data[hdr] = kind.flag_byte();
        let content = limits.usable_end() as u32;
        // Content offset 65536 is stored as 0, which the zeroed image
        // already holds.
        if content < 65536 {
            write_u16(&mut data, hdr + 5, content as u16).expect("header in bounds");
        }
        let ptr_end = hdr + kind.header_size();
        Self {
            pgno,
            data,
            kind,
            n_cell: 0,
            first_freeblock: 0,
            cell_content: content,
            frag_bytes: 0,
            right_child: if kind.is_leaf() { None } else { Some(0) },
            max_local: geom.max_local(kind),
            min_local: geom.min_local(kind),
            n_free: content as i32 - ptr_end as i32,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    pub fn header_size(&self) -> usize {
        self.kind.header_size()
    }

    fn ptr_array_start(&self, limits: PageLimits) -> usize {
        limits.header_start() + self.header_size()
    }

    fn ptr_array_end(&self, limits: PageLimits) -> usize {
        self.ptr_array_start(limits) + self.n_cell as usize * CELL_PTR_SIZE
    }

    /// Gap between the end of the cell-pointer array and the content
    /// area.
    fn gap(&self, limits: PageLimits) -> usize {
        (self.cell_content as usize).saturating_sub(self.ptr_array_end(limits))
    }

    /// Offset of cell `index` in the content area, bounds-checked
    /// against `[ptr_array_end, usable_end)`.
    pub fn cell_ptr(&self, index: u16, limits: PageLimits) -> Result<u16> {
        if index >= self.n_cell {
            return Err(Error::new(ErrorCode::Range));
        }
        let slot = self.ptr_array_start(limits) + index as usize * CELL_PTR_SIZE;
        let ptr = read_u16(&self.data, slot).ok_or(Error::new(ErrorCode::Corrupt))?;
        let lo = self.ptr_array_end(limits);
        let hi = limits.usable_end().saturating_sub(MIN_CELL_SIZE);
        if (ptr as usize) < lo || ptr as usize > hi {
            return Err(Error::corrupt(format!(
                "page {}: cell pointer {} out of bounds",
                self.pgno, ptr
            )));
        }
        Ok(ptr)
    }

    /// Parse the cell at `index`.
    pub fn cell(&self, index: u16, limits: PageLimits) -> Result<CellInfo> {
        let offset = self.cell_ptr(index, limits)? as usize;
        let info = cell_info(self.kind, self.max_local, self.min_local, limits.usable_size, &self.data[offset..])?;
        if offset + info.n_size as usize > limits.usable_end() {
            return Err(Error::corrupt(format!(
                "page {}: cell {} extends past usable space",
                self.pgno, index
            )));
        }
        Ok(info)
    }

    /// Raw bytes of the cell at `index`.
    pub fn cell_bytes(&self, index: u16, limits: PageLimits) -> Result<Vec<u8>> {
        let offset = self.cell_ptr(index, limits)? as usize;
        let info = self.cell(index, limits)?;
        Ok(self.data[offset..offset + info.n_size as usize].to_vec())
    }

    /// Child page for descend position `index`; `index == n_cell` is the
    /// rightmost pointer.
    pub fn child(&self, index: u16, limits: PageLimits) -> Result<Pgno> {
        if self.is_leaf() {
            return Err(Error::new(ErrorCode::Misuse));
        }
        if index == self.n_cell {
            return self.right_child.ok_or(Error::new(ErrorCode::Corrupt));
        }
        let offset = self.cell_ptr(index, limits)? as usize;
        read_u32(&self.data, offset).ok_or(Error::new(ErrorCode::Corrupt))
    }

    pub fn set_right_child(&mut self, pgno: Pgno, limits: PageLimits) -> Result<()> {
        if self.is_leaf() {
            return Err(Error::new(ErrorCode::Internal));
        }
        self.right_child = Some(pgno);
        write_u32(&mut self.data, limits.header_start() + 8, pgno)
    }

    /// Insert `cell` before position `index`. Returns false (page left
    /// untouched) when the total free space cannot hold the cell plus
    /// its pointer; the caller then goes through the balancer.
    pub fn insert_cell(&mut self, index: u16, cell: &[u8], limits: PageLimits) -> Result<bool> {
        if index > self.n_cell {
            return Err(Error::new(ErrorCode::Range));
        }
        let size = cell.len().max(MIN_CELL_SIZE);
        if (self.n_free as usize) < size + CELL_PTR_SIZE {
            return Ok(false);
        }

        let mut offset = if self.gap(limits) >= CELL_PTR_SIZE {
            self.alloc_from_freeblocks(size, limits)?
        } else {
            None
        };
        if offset.is_none() {
            if self.gap(limits) < size + CELL_PTR_SIZE {
                self.defragment(limits)?;
            }
            offset = Some(self.alloc_from_gap(size, limits)?);
        }
        let offset = offset.expect("allocation succeeded") as usize;

        self.data[offset..offset + cell.len()].copy_from_slice(cell);

        // Open a slot in the pointer array.
        let slot = self.ptr_array_start(limits) + index as usize * CELL_PTR_SIZE;
        let end = self.ptr_array_end(limits);
        self.data.copy_within(slot..end, slot + CELL_PTR_SIZE);
        write_u16(&mut self.data, slot, offset as u16)?;
        self.set_n_cell(self.n_cell + 1, limits)?;
        self.n_free -= CELL_PTR_SIZE as i32;
        Ok(true)
    }

    /// Remove the cell at `index`, returning its free space to the page.
    pub fn drop_cell(&mut self, index: u16, limits: PageLimits) -> Result<()> {
        let offset = self.cell_ptr(index, limits)?;
        let info = self.cell(index, limits)?;
        let size = (info.n_size as usize).max(MIN_CELL_SIZE);
        self.free_space(offset, size as u16, limits)?;

        let slot = self.ptr_array_start(limits) + index as usize * CELL_PTR_SIZE;
        let end = self.ptr_array_end(limits);
        self.data.copy_within(slot + CELL_PTR_SIZE..end, slot);
        self.set_n_cell(self.n_cell - 1, limits)?;
        self.n_free += CELL_PTR_SIZE as i32;
        Ok(())
    }

    fn set_n_cell(&mut self, n: u16, limits: PageLimits) -> Result<()> {
        self.n_cell = n;
        write_u16(&mut self.data, limits.header_start() + 3, n)
    }

    fn set_cell_content(&mut self, content: u32, limits: PageLimits) -> Result<()> {
        self.cell_content = content;
        let stored = if content == 65536 { 0 } else { content as u16 };
        write_u16(&mut self.data, limits.header_start() + 5, stored)
    }

    fn set_first_freeblock(&mut self, offset: u16, limits: PageLimits) -> Result<()> {
        self.first_freeblock = offset;
        write_u16(&mut self.data, limits.header_start() + 1, offset)
    }

    fn set_frag_bytes(&mut self, frag: u8, limits: PageLimits) {
        self.frag_bytes = frag;
        self.data[limits.header_start() + 7] = frag;
    }

    /// First-fit search of the free-block chain.
    fn alloc_from_freeblocks(&mut self, size: usize, limits: PageLimits) -> Result<Option<u16>> {
        let usable_end = limits.usable_end();
        let mut prev: Option<usize> = None;
        let mut pc = self.first_freeblock as usize;
        let mut steps = 0usize;
        while pc != 0 {
            if pc + 4 > usable_end {
                return Err(Error::corrupt(format!(
                    "page {}: free block at {} out of bounds",
                    self.pgno, pc
                )));
            }
            let next = read_u16(&self.data, pc).unwrap_or(0) as usize;
            let block = read_u16(&self.data, pc + 2).unwrap_or(0) as usize;
            if block >= size {
                let rem = block - size;
                if rem < MIN_CELL_SIZE {
                    // Too small to stay a block: unlink and count the
                    // leftover as fragment bytes.
                    match prev {
                        Some(p) => write_u16(&mut self.data, p, next as u16)?,
                        None => self.set_first_freeblock(next as u16, limits)?,
                    }
                    let frag = self.frag_bytes.saturating_add(rem as u8);
                    self.set_frag_bytes(frag, limits);
                    self.n_free -= size as i32;
                    return Ok(Some(pc as u16));
                }
                // Carve the allocation from the tail of the block.
                write_u16(&mut self.data, pc + 2, rem as u16)?;
                self.n_free -= size as i32;
                return Ok(Some((pc + rem) as u16));
            }
            prev = Some(pc);
            pc = next;
            steps += 1;
            if steps > limits.usable_size as usize / 4 {
                return Err(Error::corrupt(format!(
                    "page {}: free block chain does not terminate",
                    self.pgno
                )));
            }
        }
        Ok(None)
    }

    fn alloc_from_gap(&mut self, size: usize, limits: PageLimits) -> Result<u16> {
        if self.gap(limits) < size + CELL_PTR_SIZE {
            return Err(Error::new(ErrorCode::Internal));
        }
        let new_content = self.cell_content - size as u32;
        self.set_cell_content(new_content, limits)?;
        self.n_free -= size as i32;
        Ok(new_content as u16)
    }

    /// Return `size` bytes at `offset` to the free-block chain,
    /// coalescing with adjacent blocks.
    pub fn free_space(&mut self, offset: u16, size: u16, limits: PageLimits) -> Result<()> {
        let start = offset as usize;
        let mut size = size as usize;
        let usable_end = limits.usable_end();
        if start < self.cell_content as usize || start + size > usable_end {
            return Err(Error::corrupt(format!(
                "page {}: freed range {}..{} outside content area",
                self.pgno,
                start,
                start + size
            )));
        }
        if size < MIN_CELL_SIZE {
            let frag = self.frag_bytes.saturating_add(size as u8);
            self.set_frag_bytes(frag, limits);
            self.n_free += size as i32;
            return Ok(());
        }
        let freed = size;

        // Locate the insertion point in the address-ordered chain.
        let mut prev: Option<usize> = None;
        let mut next = self.first_freeblock as usize;
        while next != 0 && next < start {
            prev = Some(next);
            next = read_u16(&self.data, next).unwrap_or(0) as usize;
        }

        let mut start = start;
        // Merge with the following block.
        if next != 0 && start + size == next {
            let next_size = read_u16(&self.data, next + 2).unwrap_or(0) as usize;
            let next_next = read_u16(&self.data, next).unwrap_or(0);
            size += next_size;
            write_u16(&mut self.data, start, next_next)?;
            write_u16(&mut self.data, start + 2, size as u16)?;
        } else {
            write_u16(&mut self.data, start, next as u16)?;
            write_u16(&mut self.data, start + 2, size as u16)?;
        }

        // Merge with the preceding block.
        if let Some(p) = prev {
            let prev_size = read_u16(&self.data, p + 2).unwrap_or(0) as usize;
            if p + prev_size == start {
                let cur_next = read_u16(&self.data, start).unwrap_or(0);
                size += prev_size;
                write_u16(&mut self.data, p, cur_next)?;
                write_u16(&mut self.data, p + 2, size as u16)?;
                start = p;
            } else {
                write_u16(&mut self.data, p, start as u16)?;
            }
        } else {
            self.set_first_freeblock(start as u16, limits)?;
        }

        // A block that now touches the content area folds into the gap.
        if start == self.cell_content as usize {
            let block_next = read_u16(&self.data, start).unwrap_or(0);
            match prev_block_before(self, start, limits) {
                Some(p) => write_u16(&mut self.data, p, block_next)?,
                None => self.set_first_freeblock(block_next, limits)?,
            }
            self.set_cell_content(self.cell_content + size as u32, limits)?;
        }

        self.n_free += freed as i32;
        Ok(())
    }

    /// Rewrite all cells contiguously at the end of the page, clearing
    /// the free-block chain and fragment count.
    pub fn defragment(&mut self, limits: PageLimits) -> Result<()> {
        let mut cells = Vec::with_capacity(self.n_cell as usize);
        for i in 0..self.n_cell {
            let offset = self.cell_ptr(i, limits)? as usize;
            let info = self.cell(i, limits)?;
            cells.push(self.data[offset..offset + info.n_size as usize].to_vec());
        }

        let mut write_at = limits.usable_end();
        let ptr_start = self.ptr_array_start(limits);
        for (i, cell) in cells.iter().enumerate() {
            let size = cell.len().max(MIN_CELL_SIZE);
            write_at -= size;
            self.data[write_at..write_at + cell.len()].copy_from_slice(cell);
            write_u16(&mut self.data, ptr_start + i * CELL_PTR_SIZE, write_at as u16)?;
        }

        self.set_first_freeblock(0, limits)?;
        self.set_frag_bytes(0, limits);
        self.set_cell_content(write_at as u32, limits)?;
        self.n_free = (write_at - self.ptr_array_end(limits)) as i32;
        Ok(())
    }

    /// Total free bytes, validating the free-block chain along the way.
    pub fn compute_free_space(&self, limits: PageLimits) -> Result<i32> {
        let ptr_end = self.ptr_array_end(limits);
        let content = self.cell_content as usize;
        if content < ptr_end || content > limits.usable_end() {
            return Err(Error::corrupt(format!(
                "page {}: content offset {} overlaps cell pointers",
                self.pgno, content
            )));
        }
        let mut free = (content - ptr_end) as i32 + self.frag_bytes as i32;

        let usable_end = limits.usable_end();
        let mut pc = self.first_freeblock as usize;
        let mut last = 0usize;
        let mut steps = 0usize;
        while pc != 0 {
            if pc < content || pc + 4 > usable_end || pc <= last {
                return Err(Error::corrupt(format!(
                    "page {}: invalid free block at {}",
                    self.pgno, pc
                )));
            }
            let size = read_u16(&self.data, pc + 2).ok_or(Error::new(ErrorCode::Corrupt))?;
            if (size as usize) < MIN_CELL_SIZE || pc + size as usize > usable_end {
                return Err(Error::corrupt(format!(
                    "page {}: free block at {} has size {}",
                    self.pgno, pc, size
                )));
            }
            free += size as i32;
            last = pc;
            pc = read_u16(&self.data, pc).ok_or(Error::new(ErrorCode::Corrupt))? as usize;
            steps += 1;
            if steps > limits.usable_size as usize / 4 {
                return Err(Error::corrupt(format!(
                    "page {}: free block chain loops",
                    self.pgno
                )));
            }
        }
        Ok(free)
    }

    /// A page is underfull when more than half its usable space is free;
    /// deletes that leave a page in this state go through the balancer.
    pub fn is_underfull(&self, limits: PageLimits) -> bool {
        self.n_free > limits.usable_size as i32 / 2
    }
}

fn prev_block_before(page: &MemPage, target: usize, _limits: PageLimits) -> Option<usize> {
    let mut prev = None;
    let mut pc = page.first_freeblock as usize;
    while pc != 0 && pc < target {
        prev = Some(pc);
        pc = read_u16(&page.data, pc).unwrap_or(0) as usize;
    }
    prev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::Geometry;

    fn geometry(usable: u32) -> Geometry {
        Geometry::new(usable, 64, 32, 32)
    }

    fn leaf_page(page_size: u32) -> (MemPage, PageLimits, Geometry) {
        let geom = geometry(page_size);
        let limits = PageLimits::new(page_size, page_size);
        (
            MemPage::zeroed(2, PageKind::TableLeaf, limits, &geom),
            limits,
            geom,
        )
    }

    // A table-leaf cell with a tiny inline payload.
    fn small_cell(rowid: u8, payload_len: u8) -> Vec<u8> {
        let mut cell = vec![payload_len, rowid];
        cell.extend(std::iter::repeat(0xabu8).take(payload_len as usize));
        cell
    }

    #[test]
    fn test_zeroed_page_round_trips() {
        let (page, limits, geom) = leaf_page(512);
        let decoded = MemPage::from_bytes(2, page.data.clone(), limits, &geom).unwrap();
        assert_eq!(decoded.n_cell, 0);
        assert_eq!(decoded.cell_content, 512);
        assert_eq!(decoded.n_free, 512 - 8);
    }

    #[test]
    fn test_insert_and_read_cells() {
        let (mut page, limits, geom) = leaf_page(512);
        assert!(page.insert_cell(0, &small_cell(1, 10), limits).unwrap());
        assert!(page.insert_cell(1, &small_cell(3, 10), limits).unwrap());
        assert!(page.insert_cell(1, &small_cell(2, 10), limits).unwrap());
        assert_eq!(page.n_cell, 3);
        for i in 0..3 {
            let info = page.cell(i, limits).unwrap();
            assert_eq!(info.key, i as i64 + 1);
            assert_eq!(info.n_local, 10);
        }
        // Encoded image decodes to the same shape.
        let decoded = MemPage::from_bytes(2, page.data.clone(), limits, &geom).unwrap();
        assert_eq!(decoded.n_cell, 3);
        assert_eq!(decoded.n_free, page.n_free);
    }

    #[test]
    fn test_drop_cell_returns_space() {
        let (mut page, limits, _) = leaf_page(512);
        let before = page.n_free;
        page.insert_cell(0, &small_cell(1, 20), limits).unwrap();
        page.insert_cell(1, &small_cell(2, 20), limits).unwrap();
        page.drop_cell(0, limits).unwrap();
        assert_eq!(page.n_cell, 1);
        assert_eq!(page.cell(0, limits).unwrap().key, 2);
        page.drop_cell(0, limits).unwrap();
        assert_eq!(page.n_free, before);
        assert_eq!(page.compute_free_space(limits).unwrap(), before);
    }

    #[test]
    fn test_freed_space_is_reused() {
        let (mut page, limits, _) = leaf_page(512);
        for i in 0..5 {
            page.insert_cell(i, &small_cell(i as u8 + 1, 30), limits)
                .unwrap();
        }
        page.drop_cell(2, limits).unwrap();
        let free_before = page.n_free;
        // Same-size cell lands back in the hole via the free-block chain.
        assert!(page.insert_cell(2, &small_cell(3, 30), limits).unwrap());
        assert_eq!(page.n_free, free_before - 30 - 2 - 2);
        assert_eq!(page.compute_free_space(limits).unwrap(), page.n_free);
    }

    #[test]
    fn test_page_fills_up_and_rejects() {
        let (mut page, limits, _) = leaf_page(512);
        let mut inserted = 0u16;
        loop {
            if !page
                .insert_cell(inserted, &small_cell(inserted as u8, 40), limits)
                .unwrap()
            {
                break;
            }
            inserted += 1;
        }
        assert!(inserted > 0);
        assert!((page.n_free as usize) < 40 + 4 + 2);
    }

    #[test]
    fn test_defragment_consolidates_holes() {
        let (mut page, limits, _) = leaf_page(512);
        for i in 0..6 {
            page.insert_cell(i, &small_cell(i as u8 + 1, 25), limits)
                .unwrap();
        }
        page.drop_cell(4, limits).unwrap();
        page.drop_cell(2, limits).unwrap();
        page.drop_cell(0, limits).unwrap();
        let free = page.n_free;
        page.defragment(limits).unwrap();
        assert_eq!(page.n_free, free);
        assert_eq!(page.first_freeblock, 0);
        assert_eq!(page.frag_bytes, 0);
        assert_eq!(page.compute_free_space(limits).unwrap(), free);
        // Survivors still decode in order.
        let keys: Vec<i64> = (0..page.n_cell)
            .map(|i| page.cell(i, limits).unwrap().key)
            .collect();
        assert_eq!(keys, vec![2, 4, 6]);
    }

    #[test]
    fn test_corrupt_flag_byte_rejected() {
        let geom = geometry(512);
        let limits = PageLimits::new(512, 512);
        let mut data = vec![0u8; 512];
        data[0] = 0x55;
        let err = MemPage::from_bytes(2, data, limits, &geom).unwrap_err();
        assert_eq!(err.code, ErrorCode::Corrupt);
    }

    #[test]
    fn test_corrupt_cell_pointer_rejected() {
        let (mut page, limits, geom) = leaf_page(512);
        page.insert_cell(0, &small_cell(1, 10), limits).unwrap();
        // Point the first cell pointer into the page header.
        write_u16(&mut page.data, 8, 3).unwrap();
        let decoded = MemPage::from_bytes(2, page.data.clone(), limits, &geom).unwrap();
        assert!(decoded.cell_ptr(0, limits).is_err());
    }

    #[test]
    fn test_interior_right_child() {
        let geom = geometry(512);
        let limits = PageLimits::new(512, 512);
        let mut page = MemPage::zeroed(3, PageKind::TableInterior, limits, &geom);
        page.set_right_child(42, limits).unwrap();
        let decoded = MemPage::from_bytes(3, page.data.clone(), limits, &geom).unwrap();
        assert_eq!(decoded.right_child, Some(42));
        assert_eq!(decoded.child(0, limits).unwrap(), 42);
    }
}
