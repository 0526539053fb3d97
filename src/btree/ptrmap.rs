//! Pointer map maintenance for auto-vacuum files.
//!
//! When auto-vacuum is on, every page except page 1 and the map pages
//! themselves has a 5-byte entry `[type][parent pgno]` recording the one
//! page that references it. Map pages sit at a fixed stride through the
//! file: page 2 is the first, then every `usable/5 + 1` pages.
//!
//! Relocation rewrites the single referencing location and both map
//! entries; any disagreement between the map and the tree is surfaced as
//! corruption, never repaired in place.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::freelist::{remove_free_page, take_free_page_below};
use super::page::MemPage;
use super::types::{
    AutoVacuum, PTRMAP_BTREE, PTRMAP_FREEPAGE, PTRMAP_OVERFLOW1, PTRMAP_OVERFLOW2,
    PTRMAP_ROOTPAGE,
};
use super::BtShared;

/// Entries per pointer-map page.
fn entries_per_map_page(usable_size: u32) -> u32 {
    usable_size / 5
}

/// The map page holding the entry for `pgno`, or 0 when `pgno` has no
/// entry (page 1 and map pages themselves).
pub(crate) fn ptrmap_pageno(usable_size: u32, pgno: Pgno) -> Pgno {
    if pgno < 2 {
        return 0;
    }
    let group = entries_per_map_page(usable_size) + 1;
    let map_page = 2 + ((pgno - 2) / group) * group;
    if map_page == pgno {
        0
    } else {
        map_page
    }
}

pub(crate) fn is_ptrmap_page(usable_size: u32, pgno: Pgno) -> bool {
    pgno >= 2 && (pgno - 2) % (entries_per_map_page(usable_size) + 1) == 0
}

fn entry_offset(usable_size: u32, pgno: Pgno) -> usize {
    let group = entries_per_map_page(usable_size) + 1;
    let slot = (pgno - 2) % group;
    debug_assert!(slot > 0, "map pages have no entry");
    (slot as usize - 1) * 5
}

/// Record that `parent` (of kind `ptype`) references `pgno`. A no-op
/// when auto-vacuum is off.
pub(crate) fn ptrmap_put(shared: &mut BtShared, pgno: Pgno, ptype: u8, parent: Pgno) -> Result<()> {
    if shared.auto_vacuum == AutoVacuum::None {
        return Ok(());
    }
    let map_page = ptrmap_pageno(shared.usable_size, pgno);
    if map_page == 0 {
        return Err(Error::corrupt(format!(
            "pointer-map write for unmapped page {}",
            pgno
        )));
    }
    if map_page > shared.n_page {
        shared.n_page = map_page;
    }
    let mut data = shared.read_page_raw(map_page)?;
    let offset = entry_offset(shared.usable_size, pgno);
    data[offset] = ptype;
    write_u32(&mut data, offset + 1, parent)?;
    shared.write_page_raw(map_page, &data)
}

/// Read the entry for `pgno` as `(type, parent)`.
pub(crate) fn ptrmap_get(shared: &mut BtShared, pgno: Pgno) -> Result<(u8, Pgno)> {
    if shared.auto_vacuum == AutoVacuum::None {
        return Err(Error::new(ErrorCode::Misuse));
    }
    let map_page = ptrmap_pageno(shared.usable_size, pgno);
    if map_page == 0 || map_page > shared.n_page {
        return Err(Error::corrupt(format!(
            "no pointer-map entry for page {}",
            pgno
        )));
    }
    let data = shared.read_page_raw(map_page)?;
    let offset = entry_offset(shared.usable_size, pgno);
    let ptype = data[offset];
    if !(PTRMAP_ROOTPAGE..=PTRMAP_BTREE).contains(&ptype) {
        return Err(Error::corrupt(format!(
            "pointer-map entry for page {} has type {}",
            pgno, ptype
        )));
    }
    let parent = read_u32(&data, offset + 1).ok_or(Error::new(ErrorCode::Corrupt))?;
    Ok((ptype, parent))
}

/// Update the OVERFLOW1 entries for every spilled cell of `page`, and
/// the BTREE entries of its children. Called after a page gains cells in
/// a balance or moves to a new page number.
pub(crate) fn ptrmap_put_page_refs(shared: &mut BtShared, page: &MemPage) -> Result<()> {
    if shared.auto_vacuum == AutoVacuum::None {
        return Ok(());
    }
    let limits = shared.limits_for(page.pgno);
    for i in 0..page.n_cell {
        let info = page.cell(i, limits)?;
        if let Some(ovfl) = info.overflow_page {
            ptrmap_put(shared, ovfl, PTRMAP_OVERFLOW1, page.pgno)?;
        }
        if !page.is_leaf() {
            let child = page.child(i, limits)?;
            ptrmap_put(shared, child, PTRMAP_BTREE, page.pgno)?;
        }
    }
    if let Some(right) = page.right_child {
        ptrmap_put(shared, right, PTRMAP_BTREE, page.pgno)?;
    }
    Ok(())
}

/// Move the content of page `from` to page `to`, rewriting the single
/// location that references `from` (found via its map entry `(ptype,
/// parent)`) and every entry that `from`'s own content anchors. The
/// caller owns freeing or truncating `from` afterwards.
pub(crate) fn relocate_page(
    shared: &mut BtShared,
    from: Pgno,
    ptype: u8,
    parent: Pgno,
    to: Pgno,
) -> Result<()> {
    let image = shared.read_page_raw(from)?;
    shared.write_page_raw(to, &image)?;

    match ptype {
        PTRMAP_BTREE => {
            // Parent is an interior tree page; exactly one child slot
            // must point at `from`.
            let parent_limits = shared.limits_for(parent);
            let mut page = shared.read_page(parent)?;
            let mut found = false;
            if page.right_child == Some(from) {
                page.set_right_child(to, parent_limits)?;
                found = true;
            } else {
                for i in 0..page.n_cell {
                    let offset = page.cell_ptr(i, parent_limits)? as usize;
                    if read_u32(&page.data, offset) == Some(from) {
                        write_u32(&mut page.data, offset, to)?;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Err(Error::corrupt(format!(
                    "pointer map says page {} references {}, but it does not",
                    parent, from
                )));
            }
            shared.write_mem_page(&page)?;
        }
        PTRMAP_OVERFLOW1 => {
            // Parent is a tree page holding the cell whose chain starts
            // at `from`.
            let parent_limits = shared.limits_for(parent);
            let mut page = shared.read_page(parent)?;
            let mut found = false;
            for i in 0..page.n_cell {
                let info = page.cell(i, parent_limits)?;
                if info.overflow_page == Some(from) {
                    let offset = page.cell_ptr(i, parent_limits)? as usize;
                    let ptr_at = offset + info.local_start as usize + info.n_local as usize;
                    write_u32(&mut page.data, ptr_at, to)?;
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(Error::corrupt(format!(
                    "pointer map says a cell on page {} spills to {}, but none does",
                    parent, from
                )));
            }
            shared.write_mem_page(&page)?;
        }
        PTRMAP_OVERFLOW2 => {
            // Parent is the previous page of the chain.
            let mut prev = shared.read_page_raw(parent)?;
            if read_u32(&prev, 0) != Some(from) {
                return Err(Error::corrupt(format!(
                    "pointer map says overflow page {} follows {}, but it does not",
                    from, parent
                )));
            }
            write_u32(&mut prev, 0, to)?;
            shared.write_page_raw(parent, &prev)?;
        }
        _ => {
            return Err(Error::corrupt(format!(
                "page {} with map type {} cannot be relocated",
                from, ptype
            )));
        }
    }

    // Entries anchored by the moved content itself.
    match ptype {
        PTRMAP_BTREE => {
            let page = shared.read_page(to)?;
            ptrmap_put_page_refs(shared, &page)?;
        }
        PTRMAP_OVERFLOW1 | PTRMAP_OVERFLOW2 => {
            let next = read_u32(&image, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
            if next != 0 {
                ptrmap_put(shared, next, PTRMAP_OVERFLOW2, to)?;
            }
        }
        _ => {}
    }

    ptrmap_put(shared, to, ptype, parent)?;
    shared.bump_structure_version();
    Ok(())
}

/// One step of incremental vacuum: reclaim the last page of the file,
/// either by dropping it from the freelist or by relocating it into an
/// earlier free slot, then truncate. Returns true while progress is
/// possible.
pub(crate) fn incr_vacuum_step(shared: &mut BtShared) -> Result<bool> {
    if shared.auto_vacuum == AutoVacuum::None {
        return Ok(false);
    }
    shared.check_interrupt()?;

    if shared.header()?.freelist_pages == 0 {
        return Ok(false);
    }

    let mut last = shared.n_page;
    while last > 1 && is_ptrmap_page(shared.usable_size, last) {
        last -= 1;
    }
    if last <= 1 {
        return Ok(false);
    }

    let (ptype, parent) = ptrmap_get(shared, last)?;
    match ptype {
        PTRMAP_FREEPAGE => {
            if !remove_free_page(shared, last)? {
                return Err(Error::corrupt(format!(
                    "pointer map marks page {} free, but the freelist does not hold it",
                    last
                )));
            }
        }
        PTRMAP_ROOTPAGE => {
            // Roots stay where they were created; vacuum stops short.
            return Ok(false);
        }
        _ => {
            let Some(dest) = take_free_page_below(shared, last)? else {
                return Ok(false);
            };
            relocate_page(shared, last, ptype, parent, dest)?;
        }
    }

    let mut new_size = last - 1;
    while new_size > 1 && is_ptrmap_page(shared.usable_size, new_size) {
        new_size -= 1;
    }
    shared.truncate_file(new_size)?;
    Ok(true)
}

/// Drain vacuum steps at commit time when the mode is FULL.
pub(crate) fn auto_vacuum_commit(shared: &mut BtShared) -> Result<()> {
    if shared.auto_vacuum != AutoVacuum::Full {
        return Ok(());
    }
    while incr_vacuum_step(shared)? {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_page_layout() {
        // usable 512: 102 entries per map page, groups of 103.
        assert!(is_ptrmap_page(512, 2));
        assert!(!is_ptrmap_page(512, 3));
        assert!(is_ptrmap_page(512, 105));
        assert_eq!(ptrmap_pageno(512, 1), 0);
        assert_eq!(ptrmap_pageno(512, 2), 0);
        assert_eq!(ptrmap_pageno(512, 3), 2);
        assert_eq!(ptrmap_pageno(512, 104), 2);
        assert_eq!(ptrmap_pageno(512, 105), 0);
        assert_eq!(ptrmap_pageno(512, 106), 105);
    }

    #[test]
    fn test_entry_offsets() {
        assert_eq!(entry_offset(512, 3), 0);
        assert_eq!(entry_offset(512, 4), 5);
        assert_eq!(entry_offset(512, 104), 101 * 5);
        assert_eq!(entry_offset(512, 106), 0);
    }
}
