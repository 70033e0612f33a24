//! Event-loop bindings: the poller on the completion counter descriptor.
//!
//! The host loop is a single-threaded `tokio::task::LocalSet`; a readable
//! eventfd is surfaced to it as a `tokio::io::unix::AsyncFd` wrapping an
//! `eventfd(2)` counter rather than owned directly.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

/// A non-blocking `eventfd(2)` counter descriptor.
pub struct EventCounter {
    fd: OwnedFd,
}

impl EventCounter {
    /// Allocates a new counter, non-blocking from the start so `AsyncFd`
    /// registration and manual reads never risk blocking the loop thread.
    pub fn new() -> io::Result<Self> {
        let rv = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if rv < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(rv) };
        Ok(EventCounter { fd })
    }

    /// Reads the 64-bit counter. `Ok(None)` means the read would have
    /// blocked (no completion pending yet) — the only short-read case the
    /// kernel contract allows. A `read()` that succeeds but returns fewer
    /// than 8 bytes is a platform contract violation, not a benign
    /// not-ready-yet signal, and surfaces as `Err`.
    pub fn try_read_count(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        let rv = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            };
        }
        if rv as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("eventfd read returned {rv} bytes, expected 8"),
            ));
        }
        Ok(Some(u64::from_ne_bytes(buf)))
    }
}

impl AsRawFd for EventCounter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Registers `counter` with the reactor for readability notifications.
/// Allocated during initialization, armed (started) only once the file
/// transitions to `Ready` (see `engine::handle`).
pub fn register(counter: EventCounter) -> io::Result<AsyncFd<EventCounter>> {
    AsyncFd::new(counter)
}
