//! treefile — a paged B-tree storage engine with a SQLite-compatible
//! file format.
//!
//! The crate organizes a single file (or in-memory image) as fixed-size
//! pages and exposes ordered key/value access to any number of
//! independently rooted B-trees sharing that file: page and cell
//! codecs, overflow chains, a trunk/leaf freelist, the auto-vacuum
//! pointer map, cursors, and the sibling rebalancer. Durable page I/O
//! and atomic commit are consumed through the [`pager::Pager`]
//! interface, not implemented here.

pub mod btree;
pub mod error;
pub mod pager;
pub mod types;
pub mod util;

pub use error::{Error, ErrorCode, Result};

pub use btree::{
    AutoVacuum, BtCursor, Btree, BtreeConfig, BtreePayload, InsertFlags, IntegrityCheckResult,
    TransState, TreeKind,
};
pub use pager::{FilePager, MemPager, Pager, SavepointOp};
pub use types::{Pgno, RowId};
