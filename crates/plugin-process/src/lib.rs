//! Process management for out-of-process media plugins.
//!
//! ```text
//!   host process                         slplugin process
//! ┌──────────────────────┐   loopback  ┌───────────────────────┐
//! │ MediaSession         │    TCP      │ ProcessChild          │
//! │   └─ ProcessParent ──┼─────────────┼─▶  └─ PluginInstance  │
//! │        (shm creator) │  messages   │        (backend dylib)│
//! └──────────────────────┘             └───────────────────────┘
//!            └──────── shared memory regions ────────┘
//! ```
//!
//! The host never blocks on the child: every wait is bounded, and a child
//! that crashes, hangs or fails to load is reported as an event instead.

pub mod child;
pub mod error;
pub mod heartbeat;
pub mod launcher;
pub mod media;
pub mod parent;

#[cfg(test)]
mod tests;

pub use child::{ChildOptions, ChildState, DylibLoader, PluginLoader, ProcessChild};
pub use error::{ProcessError, ProcessResult};
pub use heartbeat::HeartbeatMonitor;
pub use launcher::{ChildLauncher, ExecutableLauncher};
pub use media::{
    next_power_of_2, DirtyRect, KeyEventType, MediaEvent, MediaOptions, MediaSession, MediaStatus,
    Modifiers, MouseEventType, Priority,
};
pub use parent::{ParentEvent, ParentOptions, ParentState, ProcessParent};
