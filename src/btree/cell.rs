//! Cell encoding and decoding, including overflow-page chains.
//!
//! Cell layouts by page kind:
//!
//! - table leaf:      `[payload varint][rowid varint][local payload][overflow pgno?]`
//! - table interior:  `[child pgno][rowid varint]`
//! - index leaf:      `[payload varint][local key][overflow pgno?]`
//! - index interior:  `[child pgno][payload varint][local key][overflow pgno?]`
//!
//! Payload beyond the page-kind's local maximum spills to a chain of
//! overflow pages, each `[next pgno][payload bytes]`.

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Pgno, RowId};

use super::encoding::{read_u32, read_varint, read_varint32, varint_len, write_u32, write_varint};
use super::freelist::{allocate_page, free_page};
use super::ptrmap::ptrmap_put;
use super::types::{PageKind, MIN_CELL_SIZE, PTRMAP_OVERFLOW2};
use super::BtShared;

/// Decoded shape of one cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellInfo {
    /// Rowid for table pages; zero for index pages.
    pub key: RowId,
    /// Total payload length, inline plus overflow.
    pub n_payload: u32,
    /// Offset of the local payload within the cell.
    pub local_start: u16,
    /// Bytes of payload stored inline.
    pub n_local: u16,
    /// Total footprint of the cell in the content area (at least 4).
    pub n_size: u16,
    /// First page of the overflow chain, when the payload spills.
    pub overflow_page: Option<Pgno>,
}

/// How much of an `n_payload`-byte payload stays on the page.
///
/// Once the payload exceeds the kind's local maximum, the inline part
/// shrinks so the spilled part fills whole overflow pages, but never
/// below the minimum local size.
pub fn payload_local_size(
    kind: PageKind,
    max_local: u16,
    min_local: u16,
    usable_size: u32,
    n_payload: u32,
) -> u16 {
    debug_assert!(!matches!(kind, PageKind::TableInterior));
    let max_local = max_local as u32;
    if n_payload <= max_local {
        return n_payload as u16;
    }
    let min_local = min_local as u32;
    let surplus = min_local + (n_payload - min_local) % (usable_size - 4);
    if surplus <= max_local {
        surplus as u16
    } else {
        min_local as u16
    }
}

/// Parse the cell starting at `buf[0]`. `buf` may extend past the cell;
/// the computed size is bounds-checked against it.
pub fn cell_info(
    kind: PageKind,
    max_local: u16,
    min_local: u16,
    usable_size: u32,
    buf: &[u8],
) -> Result<CellInfo> {
    let mut pos = 0usize;
    if !kind.is_leaf() {
        pos = 4;
        if buf.len() < 4 {
            return Err(Error::corrupt("cell shorter than its child pointer"));
        }
    }

    if kind == PageKind::TableInterior {
        let (rowid, n) = read_varint(buf, pos)?;
        let n_size = (pos + n).max(MIN_CELL_SIZE) as u16;
        return Ok(CellInfo {
            key: rowid as i64,
            n_payload: 0,
            local_start: (pos + n) as u16,
            n_local: 0,
            n_size,
            overflow_page: None,
        });
    }

    let (n_payload, n) = read_varint32(buf, pos)?;
    pos += n;
    let mut key = 0i64;
    if kind == PageKind::TableLeaf {
        let (rowid, n) = read_varint(buf, pos)?;
        pos += n;
        key = rowid as i64;
    }

    let n_local = payload_local_size(kind, max_local, min_local, usable_size, n_payload);
    let local_end = pos + n_local as usize;
    let mut overflow_page = None;
    let mut n_size = local_end;
    if n_local as u32 != n_payload {
        if buf.len() < local_end + 4 {
            return Err(Error::corrupt("cell overflow pointer past end of page"));
        }
        overflow_page =
            Some(read_u32(buf, local_end).ok_or(Error::new(ErrorCode::Corrupt))?);
        n_size += 4;
    } else if buf.len() < local_end {
        return Err(Error::corrupt("cell payload past end of page"));
    }

    Ok(CellInfo {
        key,
        n_payload,
        local_start: pos as u16,
        n_local,
        n_size: n_size.max(MIN_CELL_SIZE) as u16,
        overflow_page,
    })
}

/// Child pointer of an interior cell's raw bytes.
pub fn cell_child(buf: &[u8]) -> Result<Pgno> {
    read_u32(buf, 0).ok_or(Error::new(ErrorCode::Corrupt))
}

/// Overwrite the child pointer of an interior cell's raw bytes.
pub fn set_cell_child(buf: &mut [u8], child: Pgno) -> Result<()> {
    write_u32(buf, 0, child)
}

/// Assemble a table-interior divider cell.
pub fn build_table_interior_cell(child: Pgno, rowid: RowId) -> Vec<u8> {
    let mut cell = Vec::with_capacity(4 + varint_len(rowid as u64));
    cell.extend_from_slice(&child.to_be_bytes());
    write_varint(rowid as u64, &mut cell);
    cell
}

/// Assemble a table-leaf cell, spilling payload past the local maximum
/// into a fresh overflow chain. `n_zero` appends that many zero bytes to
/// the payload without materializing them in the caller's buffer.
pub fn build_table_leaf_cell(
    shared: &mut BtShared,
    rowid: RowId,
    data: &[u8],
    n_zero: u32,
) -> Result<Vec<u8>> {
    build_payload_cell(shared, PageKind::TableLeaf, Some(rowid), data, n_zero)
}

/// Assemble an index-leaf cell from its key bytes.
pub fn build_index_leaf_cell(shared: &mut BtShared, key: &[u8]) -> Result<Vec<u8>> {
    build_payload_cell(shared, PageKind::IndexLeaf, None, key, 0)
}

fn build_payload_cell(
    shared: &mut BtShared,
    kind: PageKind,
    rowid: Option<RowId>,
    data: &[u8],
    n_zero: u32,
) -> Result<Vec<u8>> {
    let n_payload = data.len() as u32 + n_zero;
    let geom = shared.geom;
    let n_local = payload_local_size(
        kind,
        geom.max_local(kind),
        geom.min_local(kind),
        geom.usable_size,
        n_payload,
    );

    let mut cell = Vec::with_capacity(n_local as usize + 22);
    write_varint(n_payload as u64, &mut cell);
    if let Some(rowid) = rowid {
        write_varint(rowid as u64, &mut cell);
    }

    let take = (n_local as usize).min(data.len());
    cell.extend_from_slice(&data[..take]);
    if take < n_local as usize {
        cell.resize(cell.len() + (n_local as usize - take), 0);
    }

    if (n_local as u32) < n_payload {
        let mut rest = Vec::with_capacity((n_payload - n_local as u32) as usize);
        rest.extend_from_slice(&data[take..]);
        rest.resize((n_payload - n_local as u32) as usize, 0);
        let first = spill_payload(shared, &rest)?;
        cell.extend_from_slice(&first.to_be_bytes());
    }
    Ok(cell)
}

/// Write `rest` into a fresh overflow chain and return its first page.
/// The chain's OVERFLOW2 pointer-map entries are written here; the
/// OVERFLOW1 entry for the head is the inserting page's responsibility,
/// since the cell has not landed anywhere yet.
fn spill_payload(shared: &mut BtShared, rest: &[u8]) -> Result<Pgno> {
    let chunk = shared.geom.overflow_chunk() as usize;
    let mut first: Pgno = 0;
    let mut prev: Pgno = 0;
    let mut offset = 0usize;
    while offset < rest.len() {
        shared.check_interrupt()?;
        let pgno = allocate_page(shared)?;
        if first == 0 {
            first = pgno;
        } else {
            // Link the previous chain page forward.
            let mut prev_data = shared.read_page_raw(prev)?;
            write_u32(&mut prev_data, 0, pgno)?;
            shared.write_page_raw(prev, &prev_data)?;
            ptrmap_put(shared, pgno, PTRMAP_OVERFLOW2, prev)?;
        }

        let take = chunk.min(rest.len() - offset);
        let mut data = vec![0u8; shared.page_size as usize];
        data[4..4 + take].copy_from_slice(&rest[offset..offset + take]);
        shared.write_page_raw(pgno, &data)?;
        prev = pgno;
        offset += take;
    }
    Ok(first)
}

/// Read `amount` payload bytes from an overflow chain.
pub fn read_overflow_chain(shared: &mut BtShared, first: Pgno, amount: u32) -> Result<Vec<u8>> {
    let chunk = shared.geom.overflow_chunk();
    let mut out = Vec::with_capacity(amount as usize);
    let mut pgno = first;
    let mut remaining = amount;
    while remaining > 0 {
        shared.check_interrupt()?;
        if pgno == 0 || pgno > shared.n_page {
            return Err(Error::corrupt(format!(
                "overflow chain ends early at page {}",
                pgno
            )));
        }
        let data = shared.read_page_raw(pgno)?;
        let next = read_u32(&data, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        let take = chunk.min(remaining) as usize;
        out.extend_from_slice(&data[4..4 + take]);
        remaining -= take as u32;
        pgno = next;
    }
    Ok(out)
}

/// Free the overflow chain hanging off `info`, if any.
pub fn clear_cell_overflow(shared: &mut BtShared, info: &CellInfo) -> Result<()> {
    let Some(mut pgno) = info.overflow_page else {
        return Ok(());
    };
    let chunk = shared.geom.overflow_chunk();
    let spilled = info.n_payload - info.n_local as u32;
    let expected = spilled.div_ceil(chunk);
    let mut freed = 0u32;
    while pgno != 0 {
        shared.check_interrupt()?;
        if freed >= expected {
            return Err(Error::corrupt("overflow chain longer than its payload"));
        }
        if pgno > shared.n_page {
            return Err(Error::corrupt(format!(
                "overflow page {} past end of file",
                pgno
            )));
        }
        let data = shared.read_page_raw(pgno)?;
        let next = read_u32(&data, 0).ok_or(Error::new(ErrorCode::Corrupt))?;
        free_page(shared, pgno)?;
        freed += 1;
        pgno = next;
    }
    if freed != expected {
        return Err(Error::corrupt("overflow chain shorter than its payload"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_size_small_payload_stays_inline() {
        // usable 1024: max_leaf = 989.
        let n = payload_local_size(PageKind::TableLeaf, 989, 103, 1024, 500);
        assert_eq!(n, 500);
    }

    #[test]
    fn test_local_size_spill_fills_whole_overflow_pages() {
        let usable = 1024u32;
        let (max_local, min_local) = (230u16, 103u16);
        for payload in [240u32, 1020, 5000, 100_000] {
            let local =
                payload_local_size(PageKind::IndexLeaf, max_local, min_local, usable, payload);
            assert!(local >= min_local && local <= max_local);
            // The spilled remainder is a whole number of chain pages,
            // unless the inline part was clamped at the minimum.
            if local > min_local {
                assert_eq!((payload - local as u32) % (usable - 4), 0);
            }
        }
    }

    #[test]
    fn test_table_interior_cell_round_trip() {
        let cell = build_table_interior_cell(77, 123_456);
        let info = cell_info(PageKind::TableInterior, 0, 0, 1024, &cell).unwrap();
        assert_eq!(info.key, 123_456);
        assert_eq!(info.n_payload, 0);
        assert_eq!(cell_child(&cell).unwrap(), 77);
        assert_eq!(info.n_size as usize, cell.len());
    }

    #[test]
    fn test_set_cell_child() {
        let mut cell = build_table_interior_cell(77, 9);
        set_cell_child(&mut cell, 88).unwrap();
        assert_eq!(cell_child(&cell).unwrap(), 88);
    }

    #[test]
    fn test_cell_info_rejects_truncated_cell() {
        // Table leaf claiming 100 payload bytes in a 10-byte buffer.
        let mut cell = Vec::new();
        write_varint(100, &mut cell);
        write_varint(1, &mut cell);
        cell.resize(10, 0);
        let err = cell_info(PageKind::TableLeaf, 989, 103, 1024, &cell).unwrap_err();
        assert_eq!(err.code, ErrorCode::Corrupt);
    }

    #[test]
    fn test_cell_info_overflow_pointer() {
        // Payload larger than max_local carries a trailing chain head.
        let max_local = 50u16;
        let min_local = 20u16;
        let n_payload = 200u32;
        let local = payload_local_size(PageKind::IndexLeaf, max_local, min_local, 512, n_payload);
        let mut cell = Vec::new();
        write_varint(n_payload as u64, &mut cell);
        cell.resize(cell.len() + local as usize, 0xee);
        cell.extend_from_slice(&55u32.to_be_bytes());

        let info = cell_info(PageKind::IndexLeaf, max_local, min_local, 512, &cell).unwrap();
        assert_eq!(info.n_local, local);
        assert_eq!(info.n_payload, n_payload);
        assert_eq!(info.overflow_page, Some(55));
        assert_eq!(info.n_size as usize, cell.len());
    }
}
