//! Error taxonomy for the durable file I/O engine.
//!
//! Every fallible path in `engine` resolves to one of these variants. The
//! taxonomy mirrors the distinction the kernel AIO completion path draws
//! between a negative errno (a real failure) and a byte count (success):
//! callers see `Result<usize, Error>` instead of a signed integer.

use std::io;

/// Errors surfaced by the file I/O engine, either synchronously from a
/// host-facing call or asynchronously via a completion.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocating a kernel resource (eventfd, AIO context, poller
    /// registration) failed before any file was touched.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[source] io::Error),

    /// `open()` of the target path failed.
    #[error("open failed: {0}")]
    Open(#[source] io::Error),

    /// Pre-allocation (`fallocate`) of the requested size failed; the file
    /// has already been unlinked by the time this is returned.
    #[error("allocation failed: {0}")]
    Allocation(#[source] io::Error),

    /// `fsync` of the file or its containing directory failed; the file has
    /// already been unlinked by the time this is returned.
    #[error("durability sync failed: {0}")]
    Durability(#[source] io::Error),

    /// The kernel refused a submission with a non-recoverable error (not
    /// `EAGAIN`/`EOPNOTSUPP` retried internally).
    #[error("submission failed: {0}")]
    Submission(#[source] io::Error),

    /// The request was in flight when `close()` was called; reported via
    /// the normal completion path, not as a synchronous error.
    #[error("cancelled by close")]
    Cancelled,

    /// A completion carried a negative result from the kernel (short write
    /// or a plain I/O error at the target offset).
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// A write was attempted with the handle not in the `Ready` state, with
    /// `closing` already set, or in violation of the admission policy for
    /// `max_writes` == 1.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// Size was zero, or another input validation failure on `create`.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// True for failures that leave the handle unusable (`Errored`).
    pub fn is_fatal_to_handle(&self) -> bool {
        matches!(
            self,
            Error::Allocation(_) | Error::Durability(_) | Error::ResourceExhausted(_)
        )
    }

    pub(crate) fn from_errno(context: &'static str, errno: i32) -> Error {
        let io_err = io::Error::from_raw_os_error(errno);
        match context {
            "open" => Error::Open(io_err),
            "allocate" => Error::Allocation(io_err),
            "sync" => Error::Durability(io_err),
            "submit" => Error::Submission(io_err),
            _ => Error::Io(io_err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
