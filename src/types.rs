//! Core type aliases shared across the engine.

/// Page number type. Pages are numbered starting at 1; page number 0 is
/// used on disk to mean "no page" (end of a chain, empty freelist).
pub type Pgno = u32;

/// Integer key of a table tree row.
pub type RowId = i64;
