//! In-process boundary between the plugin child and a media backend.
//!
//! A backend is a dynamic module exporting one C entry point. Loading it
//! exchanges two function-pointer/context pairs:
//!
//! ```text
//!   child ── plugin_init_entry_point(host_send, host_ctx) ──▶ backend
//!   child ◀─────────────── (plugin_send, plugin_ctx) ──────── backend
//! ```
//!
//! After that all traffic is message text passed through those pointers.
//! Messages the backend sends back are queued and drained by the child
//! between calls; the callback itself never runs child logic.
//!
//! # Module Structure
//!
//! - [`ffi`] - C ABI types and exported symbol names.
//! - [`instance`] - [`PluginInstance`], which owns the loaded module.

mod error;
pub mod ffi;
pub mod instance;

pub use error::{PluginLoadError, PluginResult};
pub use ffi::{
    PluginIdleFn, PluginInitFn, SendMessageFn, PLUGIN_IDLE_ENTRY_POINT, PLUGIN_INIT_ENTRY_POINT,
};
pub use instance::PluginInstance;
