use std::io;

use thiserror::Error;

/// Failures reported back to callers in error responses.
///
/// The `Display` text is the human-readable message carried in place of
/// the success payload; there are no structured wire codes.
#[derive(Debug, Error)]
pub enum Error {
    /// The descriptor was never issued, or has already been released.
    #[error("unknown file descriptor {0}")]
    UnknownFd(usize),

    /// Backend-level failure during acquisition or an I/O operation.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The broker has shut down; no further requests can be answered.
    #[error("file broker is shut down")]
    Closed,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
