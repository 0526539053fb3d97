//! Freelist management.
//!
//! Unused pages form a linked list of trunk pages, each holding up to
//! `(usable - 8) / 4` leaf page numbers:
//!
//! ```text
//! trunk: [next trunk pgno][leaf count][leaf pgno]...[leaf pgno]
//! ```
//!
//! The file header records the first trunk (offset 32) and the total
//! number of freelist pages, trunks included (offset 36). All updates
//! happen inside the enclosing write transaction, so a failure mid-
//! operation is undone by the pager's rollback.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::ptrmap::{is_ptrmap_page, ptrmap_put};
use super::types::{AutoVacuum, PTRMAP_FREEPAGE};
use super::BtShared;

/// Leaf slots per trunk page.
pub(crate) fn trunk_capacity(shared: &BtShared) -> u32 {
    (shared.usable_size - 8) / 4
}

/// Pop a page off the freelist, extending the file when the list is
/// empty. The returned page is zeroed and owned by the caller.
pub(crate) fn allocate_page(shared: &mut BtShared) -> Result<Pgno> {
    shared.check_interrupt()?;
    let header = shared.header()?;
    let trunk_pgno = header.freelist_trunk;

    if trunk_pgno != 0 {
        if trunk_pgno > shared.n_page || header.freelist_pages == 0 {
            return Err(Error::corrupt(format!(
                "freelist trunk {} inconsistent with header",
                trunk_pgno
            )));
        }
        let mut trunk = shared.read_page_raw(trunk_pgno)?;
        let count = read_u32(&trunk, 4).ok_or(Error::new(ErrorCode::Corrupt))?;
        if count > trunk_capacity(shared) {
            return Err(Error::corrupt(format!(
                "freelist trunk {} claims {} leaves",
                trunk_pgno, count
            )));
        }

        if count > 0 {
            // LIFO: take the most recently pushed leaf.
            let slot = 8 + 4 * (count as usize - 1);
            let leaf = read_u32(&trunk, slot).ok_or(Error::new(ErrorCode::Corrupt))?;
            if leaf < 2 || leaf > shared.n_page {
                return Err(Error::corrupt(format!(
                    "freelist leaf {} out of range",
                    leaf
                )));
            }
            write_u32(&mut trunk, 4, count - 1)?;
            shared.write_page_raw(trunk_pgno, &trunk)?;
            shared.update_header(|h| h.freelist_pages = h.freelist_pages.saturating_sub(1))?;
            shared.zero_page(leaf)?;
            return Ok(leaf);
        }

        // Empty trunk: the trunk page itself is the allocation.
        let next = read_u32(&trunk, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        shared.update_header(|h| {
            h.freelist_trunk = next;
            h.freelist_pages = h.freelist_pages.saturating_sub(1);
        })?;
        shared.zero_page(trunk_pgno)?;
        return Ok(trunk_pgno);
    }

    // Freelist empty: grow the file, materializing any pointer-map page
    // that falls on the way.
    let mut pgno = shared.n_page + 1;
    if shared.auto_vacuum != AutoVacuum::None {
        while is_ptrmap_page(shared.usable_size, pgno) {
            shared.zero_page(pgno)?;
            shared.n_page = pgno;
            pgno += 1;
        }
    }
    shared.zero_page(pgno)?;
    shared.n_page = pgno;
    Ok(pgno)
}

/// Push `pgno` onto the freelist: onto the trunk with the most free
/// slots, or as a fresh trunk at the head of the list when every trunk
/// is full.
pub(crate) fn free_page(shared: &mut BtShared, pgno: Pgno) -> Result<()> {
    shared.check_interrupt()?;
    if pgno < 2 || pgno > shared.n_page {
        return Err(Error::corrupt(format!("freeing page {} out of range", pgno)));
    }
    if shared.auto_vacuum != AutoVacuum::None && is_ptrmap_page(shared.usable_size, pgno) {
        return Err(Error::corrupt(format!(
            "freeing pointer-map page {}",
            pgno
        )));
    }

    ptrmap_put(shared, pgno, PTRMAP_FREEPAGE, 0)?;

    let capacity = trunk_capacity(shared);
    let header = shared.header()?;

    // Pick the trunk with the most room.
    let mut best: Option<(Pgno, u32)> = None;
    let mut trunk_pgno = header.freelist_trunk;
    let mut walked = 0u32;
    while trunk_pgno != 0 {
        shared.check_interrupt()?;
        if trunk_pgno == pgno {
            return Err(Error::corrupt(format!("page {} freed twice", pgno)));
        }
        if trunk_pgno > shared.n_page || walked > shared.n_page {
            return Err(Error::corrupt("freelist trunk chain does not terminate"));
        }
        let trunk = shared.read_page_raw(trunk_pgno)?;
        let count = read_u32(&trunk, 4).ok_or(Error::new(ErrorCode::Corrupt))?;
        if count > capacity {
            return Err(Error::corrupt(format!(
                "freelist trunk {} claims {} leaves",
                trunk_pgno, count
            )));
        }
        if count < capacity && best.map_or(true, |(_, c)| count < c) {
            best = Some((trunk_pgno, count));
        }
        trunk_pgno = read_u32(&trunk, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        walked += 1;
    }

    if let Some((trunk_pgno, count)) = best {
        let mut trunk = shared.read_page_raw(trunk_pgno)?;
        for i in 0..count as usize {
            if read_u32(&trunk, 8 + 4 * i) == Some(pgno) {
                return Err(Error::corrupt(format!("page {} freed twice", pgno)));
            }
        }
        write_u32(&mut trunk, 8 + 4 * count as usize, pgno)?;
        write_u32(&mut trunk, 4, count + 1)?;
        shared.write_page_raw(trunk_pgno, &trunk)?;
    } else {
        // No trunk has room: the freed page becomes the new head trunk.
        let mut trunk = vec![0u8; shared.page_size as usize];
        write_u32(&mut trunk, 0, header.freelist_trunk)?;
        shared.write_page_raw(pgno, &trunk)?;
        shared.update_header(|h| h.freelist_trunk = pgno)?;
    }

    shared.update_header(|h| h.freelist_pages += 1)?;
    Ok(())
}

/// Remove and return some free page numbered below `limit`, for the
/// incremental-vacuum relocation step. Returns `None` when the freelist
/// holds no such page.
pub(crate) fn take_free_page_below(shared: &mut BtShared, limit: Pgno) -> Result<Option<Pgno>> {
    let header = shared.header()?;
    let mut prev: Option<Pgno> = None;
    let mut trunk_pgno = header.freelist_trunk;
    let mut walked = 0u32;
    while trunk_pgno != 0 {
        shared.check_interrupt()?;
        if walked > shared.n_page {
            return Err(Error::corrupt("freelist trunk chain does not terminate"));
        }
        let mut trunk = shared.read_page_raw(trunk_pgno)?;
        let next = read_u32(&trunk, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        let count = read_u32(&trunk, 4).ok_or(Error::new(ErrorCode::Corrupt))?;

        for i in 0..count as usize {
            let leaf = read_u32(&trunk, 8 + 4 * i).ok_or(Error::new(ErrorCode::Corrupt))?;
            if leaf < limit {
                // Swap-remove with the last slot.
                let last = read_u32(&trunk, 8 + 4 * (count as usize - 1))
                    .ok_or(Error::new(ErrorCode::Corrupt))?;
                write_u32(&mut trunk, 8 + 4 * i, last)?;
                write_u32(&mut trunk, 4, count - 1)?;
                shared.write_page_raw(trunk_pgno, &trunk)?;
                shared.update_header(|h| h.freelist_pages = h.freelist_pages.saturating_sub(1))?;
                shared.zero_page(leaf)?;
                return Ok(Some(leaf));
            }
        }

        if count == 0 && trunk_pgno < limit {
            // An empty trunk below the limit can itself be taken.
            match prev {
                Some(p) => {
                    let mut prev_data = shared.read_page_raw(p)?;
                    write_u32(&mut prev_data, 0, next)?;
                    shared.write_page_raw(p, &prev_data)?;
                }
                None => shared.update_header(|h| h.freelist_trunk = next)?,
            }
            shared.update_header(|h| h.freelist_pages = h.freelist_pages.saturating_sub(1))?;
            shared.zero_page(trunk_pgno)?;
            return Ok(Some(trunk_pgno));
        }

        prev = Some(trunk_pgno);
        trunk_pgno = next;
        walked += 1;
    }
    Ok(None)
}

/// Detach a specific page from the freelist. Returns false when the
/// page is not on the list.
pub(crate) fn remove_free_page(shared: &mut BtShared, pgno: Pgno) -> Result<bool> {
    let header = shared.header()?;
    let mut prev: Option<Pgno> = None;
    let mut trunk_pgno = header.freelist_trunk;
    let mut walked = 0u32;
    while trunk_pgno != 0 {
        shared.check_interrupt()?;
        if walked > shared.n_page {
            return Err(Error::corrupt("freelist trunk chain does not terminate"));
        }
        let mut trunk = shared.read_page_raw(trunk_pgno)?;
        let next = read_u32(&trunk, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        let count = read_u32(&trunk, 4).ok_or(Error::new(ErrorCode::Corrupt))?;

        if trunk_pgno == pgno {
            // Removing a trunk: its last leaf (if any) inherits the
            // trunk role so the remaining leaves stay reachable.
            let replacement = if count > 0 {
                let new_trunk = read_u32(&trunk, 8 + 4 * (count as usize - 1))
                    .ok_or(Error::new(ErrorCode::Corrupt))?;
                write_u32(&mut trunk, 4, count - 1)?;
                shared.write_page_raw(new_trunk, &trunk)?;
                new_trunk
            } else {
                next
            };
            match prev {
                Some(p) => {
                    let mut prev_data = shared.read_page_raw(p)?;
                    write_u32(&mut prev_data, 0, replacement)?;
                    shared.write_page_raw(p, &prev_data)?;
                }
                None => shared.update_header(|h| h.freelist_trunk = replacement)?,
            }
            shared.update_header(|h| h.freelist_pages = h.freelist_pages.saturating_sub(1))?;
            return Ok(true);
        }

        for i in 0..count as usize {
            let leaf = read_u32(&trunk, 8 + 4 * i).ok_or(Error::new(ErrorCode::Corrupt))?;
            if leaf == pgno {
                let last = read_u32(&trunk, 8 + 4 * (count as usize - 1))
                    .ok_or(Error::new(ErrorCode::Corrupt))?;
                write_u32(&mut trunk, 8 + 4 * i, last)?;
                write_u32(&mut trunk, 4, count - 1)?;
                shared.write_page_raw(trunk_pgno, &trunk)?;
                shared.update_header(|h| h.freelist_pages = h.freelist_pages.saturating_sub(1))?;
                return Ok(true);
            }
        }

        prev = Some(trunk_pgno);
        trunk_pgno = next;
        walked += 1;
    }
    Ok(false)
}
