//! Structural integrity checking.
//!
//! A bounded-cost diagnostic pass, not a repair pass: every reachable
//! tree, the freelist, and (with auto-vacuum) the pointer map are walked
//! while a one-bit-per-page bitmap records ownership. Findings
//! accumulate as text until `max_errors` is reached.

use std::collections::HashMap;

use crate::error::Result;
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::encoding::read_u32;
use super::freelist::trunk_capacity;
use super::ptrmap::{is_ptrmap_page, ptrmap_get};
use super::types::{
    AutoVacuum, DbHeader, PageKind, PTRMAP_BTREE, PTRMAP_FREEPAGE, PTRMAP_OVERFLOW1,
    PTRMAP_OVERFLOW2, PTRMAP_ROOTPAGE,
};
use super::BtShared;

/// Outcome of an integrity check.
#[derive(Debug)]
pub struct IntegrityCheckResult {
    pub errors: Vec<String>,
    pub pages_checked: u32,
    pub is_ok: bool,
}

struct CheckState {
    refs: BitVec,
    /// Page -> (type, parent) the walks expect the pointer map to hold.
    expected: HashMap<Pgno, (u8, Pgno)>,
    errors: Vec<String>,
    max_errors: usize,
    pages_checked: u32,
    n_page: Pgno,
}

impl CheckState {
    fn add(&mut self, message: String) {
        if self.errors.len() < self.max_errors {
            self.errors.push(message);
        }
    }

    fn full(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Mark a page as owned; reports a finding and returns false when
    /// it was already owned or out of range.
    fn claim(&mut self, pgno: Pgno, what: &str) -> bool {
        if pgno < 1 || pgno > self.n_page {
            self.add(format!("{} references page {} out of range", what, pgno));
            return false;
        }
        if self.refs.test_and_set(pgno as usize) {
            self.add(format!("page {} used twice ({})", pgno, what));
            return false;
        }
        self.pages_checked += 1;
        true
    }
}

/// Walk the trees rooted at `roots`, the freelist, and the pointer map,
/// verifying single ownership of every page. `max_errors == 0` means
/// unbounded.
pub(crate) fn integrity_check(
    shared: &mut BtShared,
    roots: &[Pgno],
    max_errors: usize,
) -> Result<IntegrityCheckResult> {
    let n_page = shared.n_page;
    let mut state = CheckState {
        refs: BitVec::new(n_page as usize + 1),
        expected: HashMap::new(),
        errors: Vec::new(),
        max_errors: if max_errors == 0 {
            usize::MAX
        } else {
            max_errors
        },
        pages_checked: 0,
        n_page,
    };

    if n_page == 0 {
        state.add("database has zero pages".to_string());
        return Ok(finish(state));
    }

    // File header.
    let page1 = shared.read_page_raw(1)?;
    let header = match DbHeader::parse(&page1) {
        Ok(header) => Some(header),
        Err(_) => {
            state.add(format!(
                "page 1: invalid file header (starts {})",
                hex::encode(&page1[..16.min(page1.len())])
            ));
            None
        }
    };

    // Pointer-map pages own themselves.
    if shared.auto_vacuum != AutoVacuum::None {
        for pgno in 2..=n_page {
            if is_ptrmap_page(shared.usable_size, pgno) {
                state.claim(pgno, "pointer map");
            }
        }
    }

    // Tree walks.
    if !roots.contains(&1) {
        // Page 1 is the header page even when tree 1 is not checked.
        state.claim(1, "file header");
    }
    for &root in roots {
        if state.full() {
            break;
        }
        state.expected.insert(root, (PTRMAP_ROOTPAGE, 0));
        check_tree(shared, &mut state, root)?;
    }

    // Freelist walk.
    if let Some(header) = &header {
        check_freelist(shared, &mut state, header)?;
    }

    // Pointer-map cross-check.
    if shared.auto_vacuum != AutoVacuum::None && !state.full() {
        let expected: Vec<(Pgno, (u8, Pgno))> =
            state.expected.iter().map(|(&k, &v)| (k, v)).collect();
        for (pgno, (ptype, parent)) in expected {
            if pgno == 1 {
                continue;
            }
            shared.check_interrupt()?;
            if state.full() {
                break;
            }
            match ptrmap_get(shared, pgno) {
                Ok((t, p)) if t == ptype && p == parent => {}
                Ok((t, p)) => state.add(format!(
                    "page {}: pointer map holds ({}, {}), tree walk expects ({}, {})",
                    pgno, t, p, ptype, parent
                )),
                Err(err) => state.add(format!("page {}: pointer map unreadable: {}", pgno, err)),
            }
        }
    }

    // Orphans.
    for pgno in 1..=n_page {
        shared.check_interrupt()?;
        if state.full() {
            break;
        }
        if shared.auto_vacuum != AutoVacuum::None && is_ptrmap_page(shared.usable_size, pgno) {
            continue;
        }
        if !state.refs.get(pgno as usize) {
            state.add(format!("page {} is never used", pgno));
        }
    }

    Ok(finish(state))
}

fn finish(state: CheckState) -> IntegrityCheckResult {
    IntegrityCheckResult {
        is_ok: state.errors.is_empty(),
        errors: state.errors,
        pages_checked: state.pages_checked,
    }
}

fn check_tree(shared: &mut BtShared, state: &mut CheckState, root: Pgno) -> Result<()> {
    // (page, depth); leaves of one tree must share a depth.
    let mut stack: Vec<(Pgno, u32)> = vec![(root, 0)];
    let mut leaf_depth: Option<u32> = None;

    if root < 1 || root > state.n_page {
        state.add(format!("root page {} out of range", root));
        return Ok(());
    }

    while let Some((pgno, depth)) = stack.pop() {
        shared.check_interrupt()?;
        if state.full() {
            return Ok(());
        }
        if !state.claim(pgno, "tree walk") {
            continue;
        }

        let page = match shared.read_page(pgno) {
            Ok(page) => page,
            Err(err) => {
                state.add(format!("page {}: not a valid tree page: {}", pgno, err));
                continue;
            }
        };
        let limits = shared.limits_for(pgno);
        if let Err(err) = page.compute_free_space(limits) {
            state.add(format!("page {}: {}", pgno, err));
            continue;
        }

        if page.is_leaf() {
            match leaf_depth {
                None => leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    state.add(format!(
                        "page {}: leaf at depth {}, expected {}",
                        pgno, depth, expected
                    ));
                }
                _ => {}
            }
        }

        let mut prev_key: Option<i64> = None;
        for i in 0..page.n_cell {
            if state.full() {
                return Ok(());
            }
            let info = match page.cell(i, limits) {
                Ok(info) => info,
                Err(err) => {
                    state.add(format!("page {}: cell {}: {}", pgno, i, err));
                    break;
                }
            };

            if page.kind.is_table() {
                if let Some(prev) = prev_key {
                    if info.key <= prev && page.kind == PageKind::TableLeaf {
                        state.add(format!(
                            "page {}: cell {} out of order (rowid {})",
                            pgno, i, info.key
                        ));
                    }
                    if info.key < prev && page.kind == PageKind::TableInterior {
                        state.add(format!(
                            "page {}: divider {} out of order (rowid {})",
                            pgno, i, info.key
                        ));
                    }
                }
                prev_key = Some(info.key);
            }

            if let Some(first) = info.overflow_page {
                state
                    .expected
                    .insert(first, (PTRMAP_OVERFLOW1, pgno));
                check_overflow_chain(
                    shared,
                    state,
                    first,
                    info.n_payload - info.n_local as u32,
                )?;
            }

            if !page.is_leaf() {
                match page.child(i, limits) {
                    Ok(child) => {
                        state.expected.insert(child, (PTRMAP_BTREE, pgno));
                        stack.push((child, depth + 1));
                    }
                    Err(_) => state.add(format!("page {}: bad child pointer {}", pgno, i)),
                }
            }
        }

        if !page.is_leaf() {
            match page.child(page.n_cell, limits) {
                Ok(child) => {
                    state.expected.insert(child, (PTRMAP_BTREE, pgno));
                    stack.push((child, depth + 1));
                }
                Err(_) => state.add(format!("page {}: bad rightmost pointer", pgno)),
            }
        }
    }
    Ok(())
}

fn check_overflow_chain(
    shared: &mut BtShared,
    state: &mut CheckState,
    first: Pgno,
    spilled: u32,
) -> Result<()> {
    let chunk = shared.geom.overflow_chunk();
    let expected_len = spilled.div_ceil(chunk);
    let mut pgno = first;
    let mut remaining = spilled;
    let mut links = 0u32;
    let mut prev = 0;
    while pgno != 0 {
        shared.check_interrupt()?;
        if state.full() {
            return Ok(());
        }
        if links >= expected_len {
            state.add(format!(
                "overflow chain starting at {} is longer than its {} payload bytes",
                first, spilled
            ));
            return Ok(());
        }
        if !state.claim(pgno, "overflow chain") {
            return Ok(());
        }
        if links > 0 {
            state.expected.insert(pgno, (PTRMAP_OVERFLOW2, prev));
        }
        let data = shared.read_page_raw(pgno)?;
        let next = read_u32(&data, 0).unwrap_or(0);
        remaining = remaining.saturating_sub(chunk.min(remaining));
        links += 1;
        prev = pgno;
        pgno = next;
    }
    if remaining > 0 {
        state.add(format!(
            "overflow chain starting at {} is {} bytes short",
            first, remaining
        ));
    }
    Ok(())
}

fn check_freelist(shared: &mut BtShared, state: &mut CheckState, header: &DbHeader) -> Result<()> {
    let capacity = trunk_capacity(shared);
    let mut counted = 0u32;
    let mut trunk_pgno = header.freelist_trunk;
    while trunk_pgno != 0 {
        shared.check_interrupt()?;
        if state.full() {
            return Ok(());
        }
        if !state.claim(trunk_pgno, "freelist trunk") {
            return Ok(());
        }
        state.expected.insert(trunk_pgno, (PTRMAP_FREEPAGE, 0));
        counted += 1;

        let trunk = shared.read_page_raw(trunk_pgno)?;
        let count = read_u32(&trunk, 4).unwrap_or(u32::MAX);
        if count > capacity {
            state.add(format!(
                "freelist trunk {} claims {} leaves",
                trunk_pgno, count
            ));
            return Ok(());
        }
        for i in 0..count as usize {
            let leaf = read_u32(&trunk, 8 + 4 * i).unwrap_or(0);
            if state.claim(leaf, "freelist leaf") {
                state.expected.insert(leaf, (PTRMAP_FREEPAGE, 0));
                counted += 1;
            }
        }
        trunk_pgno = read_u32(&trunk, 0).unwrap_or(0);
    }

    if counted != header.freelist_pages {
        state.add(format!(
            "freelist holds {} pages but the header records {}",
            counted, header.freelist_pages
        ));
    }
    Ok(())
}
