//! The file handle's lifecycle state.
//!
//! ```text
//!             init ok          create ok                         close ok
//!   [-] ───────────────► Creating ─────► Ready ───────────► Closed
//!                          │                │                  ▲
//!                          │ create fail    │                  │
//!                          ▼                │                  │
//!                       Errored ────────────┴── close drain ───┘
//! ```
//!
//! Transitions are serial on the loop thread: `Creating` is entered
//! synchronously when `create` is called, `Ready`/`Errored` only once the
//! create worker body returns, and `Closed` only once the write queue has
//! drained and the poller has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Creating,
    Ready,
    Errored,
    Closed,
}
