//! Request/response envelopes exchanged with the dispatcher.
//!
//! Envelopes are explicit sum types with one variant per operation kind,
//! matched exhaustively. The transport that carries them is expected to
//! be ordered and reliable; serialization is not this crate's concern,
//! requests arrive already decoded.

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::Error;

bitflags! {
    /// Open options, mirroring POSIX open semantics.
    ///
    /// Only `WRITE` changes how the storage capability is acquired
    /// (exclusive read-write instead of shared read-only); the remaining
    /// bits control creation, truncation and initial positioning, see
    /// the storage backends for the exact rules.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        /// Start the handle position at end-of-file.
        const APPEND = 0b0000_0001;
        /// Create the file if it does not exist. Requires `WRITE`.
        const CREATE = 0b0000_0010;
        /// Create the file, failing if it already exists. Requires `WRITE`.
        const CREATE_NEW = 0b0000_0100;
        /// Read access. Always granted, accepted for POSIX compatibility.
        const READ = 0b0000_1000;
        /// Empty the file on open. Requires `WRITE`.
        const TRUNCATE = 0b0001_0000;
        /// Exclusive read-write access instead of shared read-only.
        const WRITE = 0b0010_0000;
    }
}

/// Access mode derived from [`OpenFlags`] when acquiring a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl OpenFlags {
    pub fn access_mode(self) -> AccessMode {
        if self.contains(OpenFlags::WRITE) {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        }
    }
}

/// A request to the dispatcher.
///
/// `F` is the backend's logical-file reference type. `index` is an
/// opaque correlation token chosen by the caller and echoed back
/// unchanged in the response; the dispatcher assigns no meaning to it.
#[derive(Debug, Clone)]
pub enum Request<F> {
    /// Acquire an access handle and register it in the descriptor table.
    /// The only operation that may suspend waiting for the file's lock.
    Open {
        flags: OpenFlags,
        file: F,
        index: usize,
    },
    /// Release a descriptor, fire-and-forget. Produces no response, so
    /// it carries no correlation index. Dropping an unknown or already
    /// released descriptor is a logged no-op.
    Drop { fd: usize },
    /// Read up to `size` bytes at the handle's current position.
    Read {
        fd: usize,
        size: usize,
        index: usize,
    },
    /// Write `buf` at the handle's current position. Partial writes are
    /// surfaced through the response's `size`.
    Write {
        fd: usize,
        buf: Bytes,
        index: usize,
    },
    /// Persist the handle's buffered state.
    Flush { fd: usize, index: usize },
    /// Release the handle's underlying resource and vacate its slot. The
    /// descriptor is invalid as soon as the response is sent and may be
    /// reused by a later `Open`; a following `Drop` for the same fd is
    /// harmless.
    Close { fd: usize, index: usize },
    /// Set the file length, zero-filling on growth. The handle position
    /// is clamped to the new length.
    Truncate { fd: usize, size: u64, index: usize },
}

/// Success payload of [`Response::Open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fd: usize,
}

/// Success payload of [`Response::Read`].
///
/// `buf` keeps the full requested capacity; only the first `size` bytes
/// are valid. `size` is zero at end-of-stream.
#[derive(Debug, Clone)]
pub struct ReadDone {
    pub buf: Bytes,
    pub size: usize,
}

/// Success payload of [`Response::Write`]. `size` may be less than the
/// number of bytes submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    pub size: usize,
}

/// A response from the dispatcher.
///
/// Exactly one response is produced per correlated request, on success
/// and failure alike. `Drop` requests produce none.
#[derive(Debug)]
pub enum Response {
    Open {
        index: usize,
        result: Result<Opened, Error>,
    },
    Read {
        index: usize,
        result: Result<ReadDone, Error>,
    },
    Write {
        index: usize,
        result: Result<Written, Error>,
    },
    Flush {
        index: usize,
        result: Result<(), Error>,
    },
    Close {
        index: usize,
        result: Result<(), Error>,
    },
    Truncate {
        index: usize,
        result: Result<(), Error>,
    },
}

impl Response {
    /// The echoed correlation index.
    pub fn index(&self) -> usize {
        match self {
            Response::Open { index, .. }
            | Response::Read { index, .. }
            | Response::Write { index, .. }
            | Response::Flush { index, .. }
            | Response::Close { index, .. }
            | Response::Truncate { index, .. } => *index,
        }
    }

    /// Numeric kind tag used by transports that key responses the way
    /// the wire format does.
    pub fn kind(&self) -> u8 {
        match self {
            Response::Open { .. } => 0,
            Response::Read { .. } => 1,
            Response::Write { .. } => 2,
            Response::Flush { .. } => 3,
            Response::Close { .. } => 4,
            Response::Truncate { .. } => 5,
        }
    }

    /// Whether the response carries an error instead of a payload.
    pub fn is_err(&self) -> bool {
        match self {
            Response::Open { result, .. } => result.is_err(),
            Response::Read { result, .. } => result.is_err(),
            Response::Write { result, .. } => result.is_err(),
            Response::Flush { result, .. } => result.is_err(),
            Response::Close { result, .. } => result.is_err(),
            Response::Truncate { result, .. } => result.is_err(),
        }
    }
}
