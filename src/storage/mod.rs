//! Storage capability abstraction: asynchronous acquisition of access
//! handles plus synchronous per-handle I/O.
//!
//! Acquisition may suspend waiting for the file's lock to be releasable;
//! every operation on an acquired handle runs to completion without
//! yielding, which is what lets the dispatcher treat non-open requests
//! as atomic sections.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::protocol::{AccessMode, OpenFlags};

pub mod localdir;
pub mod memory;

pub use localdir::LocalDirBackend;
pub use memory::MemoryBackend;

/// An acquired access handle with a current read/write position.
///
/// The descriptor table exclusively owns every handle it holds; `close`
/// consumes the handle so a released one cannot be touched again.
pub trait FileHandle: Send + 'static {
    /// Fills `buf` from the current position, advancing it. Returns the
    /// number of bytes read, zero at end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf` at the current position, advancing it. May write
    /// fewer bytes than submitted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Persists buffered state.
    fn flush(&mut self) -> io::Result<()>;

    /// Sets the file length, zero-filling on growth. Clamps the current
    /// position to the new length if it now lies beyond it.
    fn truncate(&mut self, size: u64) -> io::Result<()>;

    /// Releases the underlying resource and the file's lock.
    fn close(self) -> io::Result<()>;
}

/// A storage backend the dispatcher can acquire handles from.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reference to a logical file, as chosen by the backend.
    type FileRef: Send + 'static;
    type Handle: FileHandle;

    /// Acquires an access handle for `file`.
    ///
    /// `OpenFlags::WRITE` selects exclusive read-write access, anything
    /// else shared read-only; the call suspends until the file's lock
    /// can be granted in that mode. Creation and truncation flags are
    /// honored here, see [`OpenFlags`]. Fails with `NotFound` when the
    /// file is missing and no creation flag is set, `AlreadyExists` for
    /// `CREATE_NEW` on an existing file, and `InvalidInput` when
    /// creation or truncation is requested without `WRITE`.
    async fn acquire(&self, file: &Self::FileRef, flags: OpenFlags) -> io::Result<Self::Handle>;
}

/// The per-file lock a live handle holds: shared for read-only handles,
/// exclusive for read-write ones. Dropping the handle releases it.
pub enum Gate {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Waits for the file's gate in the mode the flags ask for.
pub(crate) async fn lock_gate(gate: Arc<RwLock<()>>, mode: AccessMode) -> Gate {
    match mode {
        AccessMode::ReadOnly => Gate::Shared(gate.read_owned().await),
        AccessMode::ReadWrite => Gate::Exclusive(gate.write_owned().await),
    }
}

/// Flag validation shared by the backends: creation and truncation
/// require write access, matching `std::fs::OpenOptions`.
pub(crate) fn check_flags(flags: OpenFlags) -> io::Result<()> {
    if flags.access_mode() == AccessMode::ReadWrite {
        return Ok(());
    }
    if flags.intersects(OpenFlags::CREATE | OpenFlags::CREATE_NEW) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file creation requires write access",
        ));
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "truncate on open requires write access",
        ));
    }
    Ok(())
}
