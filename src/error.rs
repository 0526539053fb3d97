//! Error types and Result alias for treefile

use std::fmt;

/// Engine result codes.
///
/// The numeric values follow the SQLite primary result codes so that a
/// database file produced or rejected by this engine reports the same
/// class of failure as the reference format documentation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed.
    Ok = 0,
    /// Generic failure.
    Error = 1,
    /// Invariant broken inside the engine itself.
    Internal = 2,
    /// Another connection holds a conflicting transaction.
    Busy = 5,
    /// A table-level lock is held by another connection.
    Locked = 6,
    /// Allocation failed.
    NoMem = 7,
    /// Mutation attempted without a write transaction.
    ReadOnly = 8,
    /// Cooperative cancellation via the interrupt flag.
    Interrupt = 9,
    /// Error reported by the page I/O collaborator.
    IoErr = 10,
    /// A structural invariant of the file is violated.
    Corrupt = 11,
    /// Requested object does not exist.
    NotFound = 12,
    /// Page or cell space exhausted where the format requires room.
    Full = 13,
    /// API used in an unsupported way.
    Misuse = 21,
    /// The file is not a database file.
    NotADb = 26,
    /// Index or offset out of bounds.
    Range = 25,
    /// Tree or structure contains no entries.
    Empty = 16,
}

impl ErrorCode {
    /// Human readable description, in the style of sqlite3_errstr().
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "unspecified error",
            ErrorCode::Internal => "internal logic error",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "not found",
            ErrorCode::Full => "database or page is full",
            ErrorCode::Misuse => "library routine called out of sequence",
            ErrorCode::NotADb => "file is not a database",
            ErrorCode::Range => "index out of range",
            ErrorCode::Empty => "empty",
        }
    }
}

/// Error value carried through every fallible engine call.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Shorthand for corruption findings with context.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Corrupt, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({})", self.code.as_str(), msg),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErr, err.to_string())
    }
}

/// Result type alias for treefile operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_with_message() {
        let err = Error::with_message(ErrorCode::Corrupt, "page 7: bad cell pointer");
        assert_eq!(err.code, ErrorCode::Corrupt);
        assert_eq!(
            err.to_string(),
            "database disk image is malformed (page 7: bad cell pointer)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert_eq!(err.code, ErrorCode::IoErr);
    }
}
