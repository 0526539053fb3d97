//! B-tree type definitions, constants, and on-disk header structures.

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u16, read_u32, write_u16, write_u32};

/// Magic string at offset 0 of page 1. Kept byte-identical to the SQLite
/// format so files are mutually readable at the page level.
pub const FILE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the file header carried at the start of page 1.
pub const FILE_HEADER_SIZE: usize = 100;

/// Version number written to header offset 96.
pub const LIBRARY_VERSION_NUMBER: u32 = 3_045_000;

// Page-type flag byte (first byte of the page header).
pub const PTF_INTKEY: u8 = 0x01;
pub const PTF_ZERODATA: u8 = 0x02;
pub const PTF_LEAFDATA: u8 = 0x04;
pub const PTF_LEAF: u8 = 0x08;

pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;
pub const PTF_INDEX_LEAF: u8 = PTF_ZERODATA | PTF_LEAF;

/// Page header sizes (past the file header on page 1).
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;

/// Bytes per entry in the cell pointer array.
pub const CELL_PTR_SIZE: usize = 2;

/// Smallest legal cell footprint in the content area.
pub const MIN_CELL_SIZE: usize = 4;

// Default payload fractions (header offsets 21-23), in 255ths.
pub const DEFAULT_MAX_EMBEDDED_FRACTION: u8 = 64;
pub const DEFAULT_MIN_EMBEDDED_FRACTION: u8 = 32;
pub const DEFAULT_MIN_LEAF_FRACTION: u8 = 32;

// Pointer map entry types.
pub const PTRMAP_ROOTPAGE: u8 = 1;
pub const PTRMAP_FREEPAGE: u8 = 2;
pub const PTRMAP_OVERFLOW1: u8 = 3;
pub const PTRMAP_OVERFLOW2: u8 = 4;
pub const PTRMAP_BTREE: u8 = 5;

// Metadata slot indices for get_meta/update_meta. Slot i (1..=8) lives at
// header offset 36 + 4*i; slot 0 reads the freelist page count and slot
// 15 reads the in-memory data version.
pub const META_FREE_PAGE_COUNT: usize = 0;
pub const META_SCHEMA_VERSION: usize = 1;
pub const META_FILE_FORMAT: usize = 2;
pub const META_DEFAULT_CACHE_SIZE: usize = 3;
pub const META_LARGEST_ROOT_PAGE: usize = 4;
pub const META_TEXT_ENCODING: usize = 5;
pub const META_USER_VERSION: usize = 6;
pub const META_INCR_VACUUM: usize = 7;
pub const META_APPLICATION_ID: usize = 8;
pub const META_DATA_VERSION: usize = 15;
pub const N_BTREE_META: usize = 16;

/// Auto-vacuum mode of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum AutoVacuum {
    #[default]
    None = 0,
    /// Vacuum to a fully compact file at every commit.
    Full = 1,
    /// Maintain the pointer map; compaction happens only on demand.
    Incremental = 2,
}

/// Shared-state transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransState {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
}

/// Cursor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CursorState {
    /// Not positioned on any row.
    Invalid = 0,
    /// Positioned on a cell of its tree.
    Valid = 1,
    /// The tree changed underneath the cursor; the remembered key must be
    /// re-sought before the position can be used again.
    RequireSeek = 2,
    /// An unrecoverable error tripped the cursor.
    Fault = 3,
}

/// Table-level lock kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BtLock {
    Read = 1,
    Write = 2,
}

/// One entry in the shared lock list: connection `conn` holds `kind` on
/// the tree rooted at `root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableLockEntry {
    pub(crate) root: Pgno,
    pub(crate) conn: u64,
    pub(crate) kind: BtLock,
}

bitflags! {
    /// Flags accepted by cursor insert.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u8 {
        /// Hint that the new key sorts after every existing key, letting
        /// sequential loads skip the seek when the cursor is already on
        /// the rightmost leaf.
        const APPEND = 0x01;
    }
}

/// The four kinds of B-tree page, decoded from the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
}

impl PageKind {
    pub fn from_flags(flags: u8) -> Result<Self> {
        match flags {
            PTF_TABLE_LEAF => Ok(PageKind::TableLeaf),
            PTF_TABLE_INTERIOR => Ok(PageKind::TableInterior),
            PTF_INDEX_LEAF => Ok(PageKind::IndexLeaf),
            PTF_INDEX_INTERIOR => Ok(PageKind::IndexInterior),
            _ => Err(Error::corrupt(format!(
                "unrecognized page flag byte 0x{:02x}",
                flags
            ))),
        }
    }

    pub fn flag_byte(self) -> u8 {
        match self {
            PageKind::TableLeaf => PTF_TABLE_LEAF,
            PageKind::TableInterior => PTF_TABLE_INTERIOR,
            PageKind::IndexLeaf => PTF_INDEX_LEAF,
            PageKind::IndexInterior => PTF_INDEX_INTERIOR,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::IndexLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::TableInterior)
    }

    pub fn leaf_of(self) -> PageKind {
        if self.is_table() {
            PageKind::TableLeaf
        } else {
            PageKind::IndexLeaf
        }
    }

    pub fn interior_of(self) -> PageKind {
        if self.is_table() {
            PageKind::TableInterior
        } else {
            PageKind::IndexInterior
        }
    }

    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }
}

/// Kind of tree to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Rowid-keyed tree; payload stored at the leaves.
    Table,
    /// Byte-string-keyed tree; the key is the payload.
    Index,
}

/// Engine configuration supplied by the caller at open time. There is no
/// process-wide default state; every `Btree::open` call carries its own
/// copy.
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    /// Reserved bytes at the end of every page (header offset 20).
    pub reserve_bytes: u8,
    /// Auto-vacuum mode for a freshly created file. An existing file's
    /// header wins over this setting.
    pub auto_vacuum: AutoVacuum,
    /// Payload fill fractions in 255ths (header offsets 21-23).
    pub max_embedded_fraction: u8,
    pub min_embedded_fraction: u8,
    pub min_leaf_fraction: u8,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: 0,
            auto_vacuum: AutoVacuum::None,
            max_embedded_fraction: DEFAULT_MAX_EMBEDDED_FRACTION,
            min_embedded_fraction: DEFAULT_MIN_EMBEDDED_FRACTION,
            min_leaf_fraction: DEFAULT_MIN_LEAF_FRACTION,
        }
    }
}

/// Per-page geometry derived from the usable size and the header's
/// payload fractions. Decides how much of a cell's payload stays local
/// before spilling to an overflow chain.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub usable_size: u32,
    /// Largest local payload on index pages and table-interior math.
    pub max_local: u16,
    /// Smallest local payload once a cell overflows.
    pub min_local: u16,
    /// Largest local payload on table leaf pages.
    pub max_leaf: u16,
    pub min_leaf: u16,
}

impl Geometry {
    pub fn new(usable_size: u32, max_frac: u8, min_frac: u8, min_leaf_frac: u8) -> Self {
        let scaled = |frac: u8| -> u16 {
            ((usable_size.saturating_sub(12) * frac as u32) / 255).saturating_sub(23) as u16
        };
        Self {
            usable_size,
            max_local: scaled(max_frac),
            min_local: scaled(min_frac),
            max_leaf: usable_size.saturating_sub(35) as u16,
            min_leaf: scaled(min_leaf_frac),
        }
    }

    pub fn max_local(&self, kind: PageKind) -> u16 {
        match kind {
            PageKind::TableLeaf => self.max_leaf,
            _ => self.max_local,
        }
    }

    pub fn min_local(&self, kind: PageKind) -> u16 {
        match kind {
            PageKind::TableLeaf => self.min_leaf,
            _ => self.min_local,
        }
    }

    /// Bytes of payload carried per overflow page.
    pub fn overflow_chunk(&self) -> u32 {
        self.usable_size - 4
    }
}

/// Offsets that depend on which page is being decoded: page 1 carries
/// the 100-byte file header ahead of its page header.
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    pub header_offset: usize,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: 0,
        }
    }

    pub fn for_page1(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: FILE_HEADER_SIZE,
        }
    }

    pub fn for_page(page_size: u32, usable_size: u32, pgno: Pgno) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size, usable_size)
        } else {
            Self::new(page_size, usable_size)
        }
    }

    pub fn header_start(&self) -> usize {
        self.header_offset
    }

    pub fn usable_end(&self) -> usize {
        self.usable_size as usize
    }

    /// Upper bound on the cell count of one page.
    pub fn max_cell_count(&self) -> u32 {
        (self.page_size.saturating_sub(8)) / 6
    }
}

/// Decoded 100-byte file header.
#[derive(Debug, Clone)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserve: u8,
    pub max_embedded_fraction: u8,
    pub min_embedded_fraction: u8,
    pub min_leaf_fraction: u8,
    pub change_counter: u32,
    /// In-header database size in pages; trustworthy only while
    /// `change_counter == version_valid_for`.
    pub page_count: u32,
    pub freelist_trunk: Pgno,
    pub freelist_pages: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    /// Nonzero exactly when the file uses a pointer map (auto-vacuum).
    pub largest_root_page: Pgno,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incr_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub library_version: u32,
}

impl DbHeader {
    /// Build the header for a fresh database file.
    pub fn new(page_size: u32, config: &BtreeConfig) -> Self {
        Self {
            page_size,
            write_version: 1,
            read_version: 1,
            reserve: config.reserve_bytes,
            max_embedded_fraction: config.max_embedded_fraction,
            min_embedded_fraction: config.min_embedded_fraction,
            min_leaf_fraction: config.min_leaf_fraction,
            change_counter: 0,
            page_count: 1,
            freelist_trunk: 0,
            freelist_pages: 0,
            schema_cookie: 0,
            schema_format: 1,
            default_cache_size: 0,
            largest_root_page: if config.auto_vacuum == AutoVacuum::None {
                0
            } else {
                1
            },
            text_encoding: 1,
            user_version: 0,
            incr_vacuum: (config.auto_vacuum == AutoVacuum::Incremental) as u32,
            application_id: 0,
            version_valid_for: 0,
            library_version: LIBRARY_VERSION_NUMBER,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::NotADb));
        }
        if &data[0..16] != FILE_MAGIC {
            return Err(Error::with_message(
                ErrorCode::NotADb,
                format!("bad magic: {}", hex::encode(&data[0..16])),
            ));
        }
        let raw_size = read_u16(data, 16).ok_or(Error::new(ErrorCode::Corrupt))?;
        let page_size = if raw_size == 1 { 65536 } else { raw_size as u32 };
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::corrupt(format!("invalid page size {}", page_size)));
        }
        let reserve = data[20];
        if page_size.saturating_sub(reserve as u32) < 480 {
            return Err(Error::corrupt("usable page size below 480 bytes"));
        }
        let max_embedded_fraction = data[21];
        let min_embedded_fraction = data[22];
        let min_leaf_fraction = data[23];
        if max_embedded_fraction < 25
            || min_embedded_fraction == 0
            || min_embedded_fraction > max_embedded_fraction
        {
            return Err(Error::corrupt("invalid payload fractions"));
        }
        let u32_at = |offset: usize| read_u32(data, offset).unwrap_or(0);
        Ok(Self {
            page_size,
            write_version: data[18],
            read_version: data[19],
            reserve,
            max_embedded_fraction,
            min_embedded_fraction,
            min_leaf_fraction,
            change_counter: u32_at(24),
            page_count: u32_at(28),
            freelist_trunk: u32_at(32),
            freelist_pages: u32_at(36),
            schema_cookie: u32_at(40),
            schema_format: u32_at(44),
            default_cache_size: u32_at(48),
            largest_root_page: u32_at(52),
            text_encoding: u32_at(56),
            user_version: u32_at(60),
            incr_vacuum: u32_at(64),
            application_id: u32_at(68),
            version_valid_for: u32_at(92),
            library_version: u32_at(96),
        })
    }

    /// Serialize into the first 100 bytes of a page-1 image.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Internal));
        }
        data[0..16].copy_from_slice(FILE_MAGIC);
        let raw_size = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        write_u16(data, 16, raw_size)?;
        data[18] = self.write_version;
        data[19] = self.read_version;
        data[20] = self.reserve;
        data[21] = self.max_embedded_fraction;
        data[22] = self.min_embedded_fraction;
        data[23] = self.min_leaf_fraction;
        write_u32(data, 24, self.change_counter)?;
        write_u32(data, 28, self.page_count)?;
        write_u32(data, 32, self.freelist_trunk)?;
        write_u32(data, 36, self.freelist_pages)?;
        write_u32(data, 40, self.schema_cookie)?;
        write_u32(data, 44, self.schema_format)?;
        write_u32(data, 48, self.default_cache_size)?;
        write_u32(data, 52, self.largest_root_page)?;
        write_u32(data, 56, self.text_encoding)?;
        write_u32(data, 60, self.user_version)?;
        write_u32(data, 64, self.incr_vacuum)?;
        write_u32(data, 68, self.application_id)?;
        write_u32(data, 92, self.version_valid_for)?;
        write_u32(data, 96, self.library_version)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let config = BtreeConfig {
            auto_vacuum: AutoVacuum::Full,
            ..BtreeConfig::default()
        };
        let mut header = DbHeader::new(4096, &config);
        header.change_counter = 7;
        header.version_valid_for = 7;
        header.freelist_trunk = 12;
        header.freelist_pages = 3;

        let mut data = vec![0u8; 4096];
        header.write_to(&mut data).unwrap();
        let parsed = DbHeader::parse(&data).unwrap();

        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.change_counter, 7);
        assert_eq!(parsed.freelist_trunk, 12);
        assert_eq!(parsed.freelist_pages, 3);
        assert_eq!(parsed.largest_root_page, 1);
        assert_eq!(parsed.max_embedded_fraction, 64);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut data = vec![0u8; 512];
        data[0..16].copy_from_slice(b"Not a database!\0");
        let err = DbHeader::parse(&data).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotADb);
    }

    #[test]
    fn test_header_page_size_one_means_64k() {
        let header = DbHeader::new(65536, &BtreeConfig::default());
        let mut data = vec![0u8; 65536];
        header.write_to(&mut data).unwrap();
        assert_eq!(read_u16(&data, 16), Some(1));
        assert_eq!(DbHeader::parse(&data).unwrap().page_size, 65536);
    }

    #[test]
    fn test_page_kind_flags() {
        for kind in [
            PageKind::TableLeaf,
            PageKind::TableInterior,
            PageKind::IndexLeaf,
            PageKind::IndexInterior,
        ] {
            assert_eq!(PageKind::from_flags(kind.flag_byte()).unwrap(), kind);
        }
        assert!(PageKind::from_flags(0x03).is_err());
    }

    #[test]
    fn test_geometry_default_fractions() {
        let geom = Geometry::new(1024, 64, 32, 32);
        assert_eq!(geom.max_local, (1024 - 12) * 64 / 255 - 23);
        assert_eq!(geom.min_local, (1024 - 12) * 32 / 255 - 23);
        assert_eq!(geom.max_leaf, 1024 - 35);
        assert_eq!(geom.overflow_chunk(), 1020);
    }
}
