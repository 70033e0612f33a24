//! durafile - asynchronous, durable, pre-allocated file I/O
//!
//! A single-threaded, event-driven engine for the write path of a
//! consensus log: a file is created at a fixed size up front, and every
//! subsequent write lands at a caller-given offset with no growth, no
//! buffered I/O, and no overlapping writers. The fast path rides kernel AIO
//! (`io_submit`/`io_getevents` with `RWF_NOWAIT`); anything the kernel can't
//! service without blocking falls back to a worker thread.
//!
//! # Architecture
//!
//! - **Platform probe**: `engine::platform` discovers, once per target
//!   filesystem, whether `RWF_NOWAIT`, `RWF_DSYNC` and `O_DIRECT` actually
//!   behave the way the fast path needs them to.
//! - **File handle**: `engine::handle::FileHandle` is the central object —
//!   it owns the descriptor, the AIO context, the completion counter and
//!   the in-flight write queue.
//! - **Worker offload**: `worker::WorkerPool` runs the slow path (and file
//!   creation) off the loop thread.
//! - **Event-loop bindings**: `runtime` adapts the kernel completion
//!   counter to Tokio's reactor.

pub mod cli;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod util;
pub mod worker;

pub use engine::{Capabilities, FileHandle, FileState};
pub use error::{Error, Result};
