//! Asynchronous, durable, pre-allocated file I/O.
//!
//! `aio` binds the four raw kernel AIO syscalls; `platform` probes which of
//! their behaviours the target filesystem actually honours; `state`
//! describes a handle's lifecycle; `handle` is the engine proper — the
//! `FileHandle` that owns the descriptor, the AIO context, and the
//! completion queue.

pub mod aio;
pub mod handle;
pub mod platform;
pub mod state;

pub use handle::FileHandle;
pub use platform::Capabilities;
pub use state::FileState;
