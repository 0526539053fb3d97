//! Sibling rebalancing.
//!
//! After an insert leaves a page with more content than fits, or a
//! delete leaves one more than half empty, the tree is repaired level by
//! level from the mutated page upward. Each level is handled by one of:
//!
//! - `balance_deeper`: an overfull root pushes its whole content into a
//!   fresh child and becomes a single-child interior page (height +1).
//! - `balance_shallower`: an interior root left with no cells adopts its
//!   only child's content (height -1).
//! - `balance_nonroot`: up to three sibling children of one parent are
//!   concatenated — dividers included, except for table leaves — and
//!   redistributed over as few pages as fit, with an evening pass that
//!   nudges the split toward equal fill.
//!
//! The upward walk is an explicit loop over the cursor's page-number
//! path, so stack depth does not grow with tree height. Pages in flight
//! are represented as unpacked cell lists (`PageSnapshot`), which lets a
//! too-full page exist in memory until the balance resolves it.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{build_table_interior_cell, cell_child, cell_info, set_cell_child};
use super::encoding::{write_u16, write_u32};
use super::freelist::{allocate_page, free_page};
use super::page::MemPage;
use super::ptrmap::ptrmap_put;
use super::types::{
    AutoVacuum, PageKind, PageLimits, CELL_PTR_SIZE, MIN_CELL_SIZE, PTRMAP_BTREE,
    PTRMAP_OVERFLOW1,
};
use super::BtShared;

/// A page unpacked into its cell list. Unlike `MemPage` this holds any
/// number of cells regardless of whether they fit, which is exactly the
/// state a page is in mid-balance.
#[derive(Clone)]
pub(crate) struct PageSnapshot {
    pub kind: PageKind,
    pub cells: Vec<Vec<u8>>,
    pub right_child: Option<Pgno>,
}

/// Unpack a decoded page into its snapshot.
pub(crate) fn unpack(page: &MemPage, limits: PageLimits) -> Result<PageSnapshot> {
    let mut cells = Vec::with_capacity(page.n_cell as usize);
    for i in 0..page.n_cell {
        cells.push(page.cell_bytes(i, limits)?);
    }
    Ok(PageSnapshot {
        kind: page.kind,
        cells,
        right_child: page.right_child,
    })
}

fn cell_footprint(cell: &[u8]) -> usize {
    cell.len().max(MIN_CELL_SIZE) + CELL_PTR_SIZE
}

fn content_size(snap: &PageSnapshot) -> usize {
    snap.cells.iter().map(|c| cell_footprint(c)).sum()
}

pub(crate) fn snapshot_fits(snap: &PageSnapshot, limits: PageLimits) -> bool {
    limits.header_start() + snap.kind.header_size() + content_size(snap) <= limits.usable_end()
}

fn snapshot_underfull(snap: &PageSnapshot, limits: PageLimits) -> bool {
    let room = limits.usable_end() - limits.header_start() - snap.kind.header_size();
    content_size(snap) * 2 < room
}

/// Serialize a snapshot into a page image. The caller must have checked
/// `snapshot_fits`.
pub(crate) fn pack(snap: &PageSnapshot, limits: PageLimits) -> Result<Vec<u8>> {
    if !snapshot_fits(snap, limits) {
        return Err(Error::new(ErrorCode::Internal));
    }
    let mut data = vec![0u8; limits.page_size as usize];
    let hdr = limits.header_start();
    data[hdr] = snap.kind.flag_byte();
    write_u16(&mut data, hdr + 3, snap.cells.len() as u16)?;
    if let Some(right) = snap.right_child {
        write_u32(&mut data, hdr + 8, right)?;
    }

    let ptr_start = hdr + snap.kind.header_size();
    let mut write_at = limits.usable_end();
    for (i, cell) in snap.cells.iter().enumerate() {
        write_at -= cell.len().max(MIN_CELL_SIZE);
        data[write_at..write_at + cell.len()].copy_from_slice(cell);
        write_u16(&mut data, ptr_start + i * CELL_PTR_SIZE, write_at as u16)?;
    }
    let stored_content = if write_at == 65536 { 0 } else { write_at as u16 };
    write_u16(&mut data, hdr + 5, stored_content)?;
    Ok(data)
}

/// Pack and write a snapshot, preserving the file header when the
/// target is page 1.
fn write_snapshot(shared: &mut BtShared, pgno: Pgno, snap: &PageSnapshot) -> Result<()> {
    let limits = shared.limits_for(pgno);
    let mut image = pack(snap, limits)?;
    if limits.header_offset > 0 {
        let current = shared.read_page_raw(pgno)?;
        image[..limits.header_offset].copy_from_slice(&current[..limits.header_offset]);
    }
    shared.write_page_raw(pgno, &image)
}

/// Child pointer for descend position `idx` of an unpacked interior
/// page.
fn snapshot_child(snap: &PageSnapshot, idx: usize) -> Result<Pgno> {
    if idx < snap.cells.len() {
        cell_child(&snap.cells[idx])
    } else if idx == snap.cells.len() {
        match snap.right_child {
            Some(p) if p != 0 => Ok(p),
            _ => Err(Error::corrupt("interior page missing rightmost pointer")),
        }
    } else {
        Err(Error::new(ErrorCode::Range))
    }
}

/// Refresh the pointer-map entries anchored by a page's content: chain
/// heads of spilled cells, and children of interior pages.
fn snapshot_ptrmap_refs(shared: &mut BtShared, snap: &PageSnapshot, pgno: Pgno) -> Result<()> {
    if shared.auto_vacuum == AutoVacuum::None {
        return Ok(());
    }
    let geom = shared.geom;
    for cell in &snap.cells {
        let info = cell_info(
            snap.kind,
            geom.max_local(snap.kind),
            geom.min_local(snap.kind),
            geom.usable_size,
            cell,
        )?;
        if let Some(ovfl) = info.overflow_page {
            ptrmap_put(shared, ovfl, PTRMAP_OVERFLOW1, pgno)?;
        }
        if !snap.kind.is_leaf() {
            ptrmap_put(shared, cell_child(cell)?, PTRMAP_BTREE, pgno)?;
        }
    }
    if let Some(right) = snap.right_child {
        if right != 0 {
            ptrmap_put(shared, right, PTRMAP_BTREE, pgno)?;
        }
    }
    Ok(())
}

/// Repair the tree along `path` (root first, mutated page last), where
/// `pending` is the unpacked content of the page at `path.last()`.
pub(crate) fn balance(
    shared: &mut BtShared,
    path: &[(Pgno, u16)],
    pending: PageSnapshot,
) -> Result<()> {
    let mut path = path.to_vec();
    let mut level = path.len() - 1;
    let mut pending = pending;

    loop {
        shared.check_interrupt()?;
        let pgno = path[level].0;
        let limits = shared.limits_for(pgno);

        if level == 0 {
            if snapshot_fits(&pending, limits) {
                write_snapshot(shared, pgno, &pending)?;
                snapshot_ptrmap_refs(shared, &pending, pgno)?;
                if !pending.kind.is_leaf() && pending.cells.is_empty() {
                    balance_shallower(shared, pgno)?;
                }
                shared.bump_structure_version();
                return Ok(());
            }
            // Root overflow: grow the tree by one level and fall through
            // to a non-root balance of the new child.
            let child = balance_deeper(shared, pgno, &pending)?;
            path = vec![(pgno, 0), (child, 0)];
            level = 1;
            continue;
        }

        if snapshot_fits(&pending, limits) && !snapshot_underfull(&pending, limits) {
            write_snapshot(shared, pgno, &pending)?;
            snapshot_ptrmap_refs(shared, &pending, pgno)?;
            shared.bump_structure_version();
            return Ok(());
        }

        let parent_pgno = path[level - 1].0;
        let child_idx = path[level - 1].1;
        let parent_limits = shared.limits_for(parent_pgno);
        let parent_page = shared.read_page(parent_pgno)?;
        let parent_snap = unpack(&parent_page, parent_limits)?;
        pending = balance_nonroot(shared, parent_snap, parent_pgno, child_idx, pending)?;
        level -= 1;
    }
}

/// Move an overfull root's content into a freshly allocated child and
/// rewrite the root as an empty interior page over it. Returns the
/// child's page number; the child content is NOT written yet — the
/// caller immediately balances it against the new root.
fn balance_deeper(shared: &mut BtShared, root: Pgno, pending: &PageSnapshot) -> Result<Pgno> {
    let child = allocate_page(shared)?;
    let root_snap = PageSnapshot {
        kind: pending.kind.interior_of(),
        cells: Vec::new(),
        right_child: Some(child),
    };
    write_snapshot(shared, root, &root_snap)?;
    ptrmap_put_if_on(shared, child, PTRMAP_BTREE, root)?;
    Ok(child)
}

fn ptrmap_put_if_on(shared: &mut BtShared, pgno: Pgno, ptype: u8, parent: Pgno) -> Result<()> {
    if shared.auto_vacuum != AutoVacuum::None {
        ptrmap_put(shared, pgno, ptype, parent)?;
    }
    Ok(())
}

/// Collapse an interior root that has no cells left: its single child's
/// content is copied into the root and the child is freed. Skipped when
/// the child's content does not fit the root (page 1 loses 100 bytes to
/// the file header); a later balance will retry.
fn balance_shallower(shared: &mut BtShared, root: Pgno) -> Result<()> {
    // Adopting an interior child can leave the root an empty interior
    // page again, so keep collapsing until a level sticks.
    loop {
        shared.check_interrupt()?;
        let root_limits = shared.limits_for(root);
        let root_page = shared.read_page(root)?;
        if root_page.is_leaf() || root_page.n_cell != 0 {
            return Ok(());
        }
        let child = root_page
            .right_child
            .filter(|&p| p != 0)
            .ok_or_else(|| Error::corrupt("childless interior root"))?;
        let child_limits = shared.limits_for(child);
        let child_page = shared.read_page(child)?;
        let child_snap = unpack(&child_page, child_limits)?;

        if !snapshot_fits(&child_snap, root_limits) {
            return Ok(());
        }
        write_snapshot(shared, root, &child_snap)?;
        free_page(shared, child)?;
        snapshot_ptrmap_refs(shared, &child_snap, root)?;
        shared.bump_structure_version();
    }
}

/// Redistribute up to three sibling children of `parent` around child
/// position `child_idx`, whose in-flight content is `child_pending`.
/// Output pages are written; the modified parent is returned unpacked
/// for the caller to settle (it may itself now be over- or underfull).
fn balance_nonroot(
    shared: &mut BtShared,
    mut parent: PageSnapshot,
    parent_pgno: Pgno,
    child_idx: u16,
    child_pending: PageSnapshot,
) -> Result<PageSnapshot> {
    let n_children = parent.cells.len() + 1;
    let child_idx = child_idx as usize;
    if child_idx >= n_children {
        return Err(Error::new(ErrorCode::Internal));
    }

    // Window of up to three children centered on the unbalanced one.
    let first = if child_idx == 0 {
        0
    } else if child_idx + 1 >= n_children {
        n_children.saturating_sub(3)
    } else {
        child_idx - 1
    };
    let count = (n_children - first).min(3);

    // Load the window, substituting the in-flight child.
    let mut child_pending = Some(child_pending);
    let mut old: Vec<(Pgno, PageSnapshot)> = Vec::with_capacity(count);
    for j in first..first + count {
        let pgno = snapshot_child(&parent, j)?;
        let snap = if j == child_idx {
            child_pending.take().expect("window visits child once")
        } else {
            let limits = shared.limits_for(pgno);
            let page = shared.read_page(pgno)?;
            unpack(&page, limits)?
        };
        old.push((pgno, snap));
    }

    let kind = old[0].1.kind;
    if old.iter().any(|(_, s)| s.kind != kind) {
        return Err(Error::corrupt("sibling pages disagree on page type"));
    }
    // Table leaves regenerate their dividers from the split points; all
    // other kinds carry the parent's divider cells through the run.
    let drop_dividers = kind == PageKind::TableLeaf;
    let final_right = old[count - 1].1.right_child;

    // Concatenate the window into one ordered run.
    let mut run: Vec<Vec<u8>> = Vec::new();
    for (i, (_, snap)) in old.iter().enumerate() {
        run.extend(snap.cells.iter().cloned());
        if i + 1 < count {
            let div = parent.cells[first + i].clone();
            match kind {
                PageKind::TableLeaf => {}
                PageKind::IndexLeaf => run.push(div[4..].to_vec()),
                PageKind::TableInterior | PageKind::IndexInterior => {
                    // The divider inherits the left sibling's rightmost
                    // pointer when it rejoins the run.
                    let mut cell = div;
                    let right = snap
                        .right_child
                        .filter(|&p| p != 0)
                        .ok_or_else(|| Error::corrupt("interior sibling missing right child"))?;
                    set_cell_child(&mut cell, right)?;
                    run.push(cell);
                }
            }
        }
    }

    let limits = PageLimits::new(shared.page_size, shared.usable_size);
    let capacity = limits.usable_end() - kind.header_size();

    // Greedy left-to-right packing. For kinds that keep dividers, the
    // cell at each page boundary moves up to the parent instead of into
    // a page.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut ix = 0usize;
    loop {
        let start = ix;
        let mut acc = 0usize;
        while ix < run.len() && acc + cell_footprint(&run[ix]) <= capacity {
            acc += cell_footprint(&run[ix]);
            ix += 1;
        }
        if ix == start && ix < run.len() {
            return Err(Error::corrupt("cell larger than a page"));
        }
        ranges.push((start, ix));
        if ix >= run.len() {
            break;
        }
        if !drop_dividers {
            ix += 1;
            if ix >= run.len() {
                // The divider had no content to its right; an empty
                // page takes the slot and the evening pass below fills
                // it.
                ranges.push((ix, ix));
                break;
            }
        }
    }

    let k = ranges.len();
    if k > count + 1 {
        return Err(Error::new(ErrorCode::Internal));
    }

    // Evening pass: shift boundaries left while it makes sibling sizes
    // strictly more even, favouring a fuller rightmost page over a
    // fuller left one.
    let range_size = |r: (usize, usize)| -> usize {
        run[r.0..r.1].iter().map(|c| cell_footprint(c)).sum()
    };
    for p in (1..k).rev() {
        loop {
            let (ls, le) = ranges[p - 1];
            if le <= ls + 1 {
                break;
            }
            let incoming = if drop_dividers { le - 1 } else { le };
            let gain = cell_footprint(&run[incoming]);
            let lose = cell_footprint(&run[le - 1]);
            let sz_left = range_size(ranges[p - 1]);
            let sz_right = range_size(ranges[p]);
            if sz_right + gain > capacity {
                break;
            }
            if sz_right != 0 && sz_left - lose < sz_right + gain {
                break;
            }
            ranges[p - 1].1 -= 1;
            ranges[p].0 -= 1;
        }
    }

    // Reuse the window's page numbers, allocating or freeing the
    // difference.
    let mut out: Vec<Pgno> = old.iter().map(|(p, _)| *p).take(k).collect();
    while out.len() < k {
        out.push(allocate_page(shared)?);
    }
    for (pgno, _) in old.iter().skip(k) {
        free_page(shared, *pgno)?;
    }

    // Write the output pages.
    for (p, &(start, end)) in ranges.iter().enumerate() {
        let right_child = if kind.is_leaf() {
            None
        } else if p == k - 1 {
            Some(
                final_right
                    .filter(|&x| x != 0)
                    .ok_or_else(|| Error::corrupt("interior window missing right child"))?,
            )
        } else {
            Some(cell_child(&run[ranges[p].1])?)
        };
        let snap = PageSnapshot {
            kind,
            cells: run[start..end].to_vec(),
            right_child,
        };
        write_snapshot(shared, out[p], &snap)?;
        ptrmap_put_if_on(shared, out[p], PTRMAP_BTREE, parent_pgno)?;
        snapshot_ptrmap_refs(shared, &snap, out[p])?;
    }

    // Build the new divider cells.
    let geom = shared.geom;
    let mut dividers: Vec<Vec<u8>> = Vec::with_capacity(k.saturating_sub(1));
    for p in 0..k - 1 {
        let (start, end) = ranges[p];
        let div = match kind {
            PageKind::TableLeaf => {
                if end == start {
                    return Err(Error::new(ErrorCode::Internal));
                }
                let last = &run[end - 1];
                let info = cell_info(kind, geom.max_leaf, geom.min_leaf, geom.usable_size, last)?;
                build_table_interior_cell(out[p], info.key)
            }
            PageKind::IndexLeaf => {
                let mut cell = Vec::with_capacity(4 + run[end].len());
                cell.extend_from_slice(&out[p].to_be_bytes());
                cell.extend_from_slice(&run[end]);
                cell
            }
            PageKind::TableInterior | PageKind::IndexInterior => {
                let mut cell = run[end].clone();
                set_cell_child(&mut cell, out[p])?;
                cell
            }
        };
        dividers.push(div);
    }

    // Splice the parent: the consumed dividers go, the new ones come in,
    // and whatever pointed at the window's last child now points at the
    // last output page.
    parent.cells.drain(first..first + count - 1);
    for (i, div) in dividers.into_iter().enumerate() {
        parent.cells.insert(first + i, div);
    }
    let after_idx = first + k - 1;
    if after_idx < parent.cells.len() {
        set_cell_child(&mut parent.cells[after_idx], out[k - 1])?;
    } else {
        parent.right_child = Some(out[k - 1]);
    }

    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::Geometry;

    impl PageSnapshot {
        fn empty(kind: PageKind) -> PageSnapshot {
            PageSnapshot {
                kind,
                cells: Vec::new(),
                right_child: None,
            }
        }
    }

    fn snap_with_cells(kind: PageKind, sizes: &[usize]) -> PageSnapshot {
        PageSnapshot {
            kind,
            cells: sizes
                .iter()
                .map(|&n| {
                    // A plausible table-leaf cell: payload varint, rowid
                    // varint, padding up to n bytes total.
                    let mut c = vec![(n - 2) as u8, 1];
                    c.resize(n, 0);
                    c
                })
                .collect(),
            right_child: None,
        }
    }

    #[test]
    fn test_snapshot_fits_accounting() {
        let limits = PageLimits::new(512, 512);
        let mut snap = snap_with_cells(PageKind::TableLeaf, &[100, 100]);
        assert!(snapshot_fits(&snap, limits));
        while snapshot_fits(&snap, limits) {
            snap.cells.push(vec![0u8; 100]);
        }
        // One cell back under the line fits again.
        snap.cells.pop();
        assert!(snapshot_fits(&snap, limits));
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let geom = Geometry::new(512, 64, 32, 32);
        let limits = PageLimits::new(512, 512);
        let snap = snap_with_cells(PageKind::TableLeaf, &[30, 40, 50]);
        let image = pack(&snap, limits).unwrap();
        let page = MemPage::from_bytes(7, image, limits, &geom).unwrap();
        assert_eq!(page.n_cell, 3);
        let back = unpack(&page, limits).unwrap();
        assert_eq!(back.cells, snap.cells);
        assert_eq!(back.right_child, None);
    }

    #[test]
    fn test_pack_preserves_cell_order() {
        let geom = Geometry::new(512, 64, 32, 32);
        let limits = PageLimits::new(512, 512);
        let mut snap = PageSnapshot::empty(PageKind::TableLeaf);
        for rowid in 1..=5u8 {
            snap.cells.push(vec![3, rowid, 0xaa, 0xbb, 0xcc]);
        }
        let image = pack(&snap, limits).unwrap();
        let page = MemPage::from_bytes(9, image, limits, &geom).unwrap();
        let keys: Vec<i64> = (0..page.n_cell)
            .map(|i| page.cell(i, limits).unwrap().key)
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_snapshot_underfull_threshold() {
        let limits = PageLimits::new(512, 512);
        assert!(snapshot_underfull(
            &snap_with_cells(PageKind::TableLeaf, &[40]),
            limits
        ));
        assert!(!snapshot_underfull(
            &snap_with_cells(PageKind::TableLeaf, &[120, 120, 120]),
            limits
        ));
    }
}
