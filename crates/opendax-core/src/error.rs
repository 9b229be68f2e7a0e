// SPDX-License-Identifier: MIT

//! Error taxonomy for the tag server core.
//!
//! Every handler in [`crate::dispatch`] returns a [`Result`]; the dispatcher
//! turns an `Err` into an error-flagged response frame carrying the variant's
//! [`Error::wire_code`].

/// Errors produced by the tag store, type system, and engines.
///
/// Variant names mirror the abstract taxonomy in the specification; the wire
/// representation is a single `i32` (see [`Error::wire_code`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed argument or out-of-range index.
    Arg,
    /// Unknown tag name, event id, map id, or group id.
    NotFound,
    /// Duplicate tag name or CDT member name.
    Duplicate,
    /// Request exceeds the frame budget, write past tag bounds, or group oversize.
    TooBig,
    /// Out of memory while growing arrays or buffers.
    Alloc,
    /// Operation not permitted on this type.
    BadType,
    /// Write to a read-only or unowned tag.
    ReadOnly,
    /// Read from a virtual tag with no read function installed.
    WriteOnly,
    /// Handle refers to a tag slot that has been freed.
    Deleted,
    /// Operation not permitted in this context.
    Illegal,
    /// Queue pop from an empty queue.
    Empty,
    /// Reserved opcode, not implemented.
    NotImplemented,
    /// I/O failure, usually from a retention backend.
    Io(String),
}

impl Error {
    /// The `i32` error code carried in an error-response frame.
    pub fn wire_code(&self) -> i32 {
        match self {
            Error::Arg => -1,
            Error::NotFound => -2,
            Error::Duplicate => -3,
            Error::TooBig => -4,
            Error::Alloc => -5,
            Error::BadType => -6,
            Error::ReadOnly => -7,
            Error::WriteOnly => -8,
            Error::Deleted => -9,
            Error::Illegal => -10,
            Error::Empty => -11,
            Error::NotImplemented => -12,
            Error::Io(_) => -13,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Arg => write!(f, "malformed argument"),
            Error::NotFound => write!(f, "not found"),
            Error::Duplicate => write!(f, "duplicate name"),
            Error::TooBig => write!(f, "request too big"),
            Error::Alloc => write!(f, "allocation failure"),
            Error::BadType => write!(f, "operation not permitted on this type"),
            Error::ReadOnly => write!(f, "tag is read-only"),
            Error::WriteOnly => write!(f, "tag has no read function"),
            Error::Deleted => write!(f, "tag has been deleted"),
            Error::Illegal => write!(f, "operation not permitted in this context"),
            Error::Empty => write!(f, "queue is empty"),
            Error::NotImplemented => write!(f, "opcode not implemented"),
            Error::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Convenience alias for results returned by core operations.
pub type Result<T> = core::result::Result<T, Error>;
