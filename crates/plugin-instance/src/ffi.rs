//! C ABI shared with backend modules.

use std::ffi::{c_char, c_int, c_void};

/// Delivers one NUL-terminated message to the other side.
///
/// `user_data` points at the context the receiver handed out during init;
/// the receiver may replace the context through it.
pub type SendMessageFn = unsafe extern "C" fn(message: *const c_char, user_data: *mut *mut c_void);

/// Backend entry point.
///
/// Receives the host's send function and context, and writes the backend's
/// send function and context into the out-parameters. Returns 0 on success.
pub type PluginInitFn = unsafe extern "C" fn(
    host_send: SendMessageFn,
    host_user_data: *mut c_void,
    plugin_send: *mut Option<SendMessageFn>,
    plugin_user_data: *mut *mut c_void,
) -> c_int;

/// Optional per-tick hook, called with the backend's context.
pub type PluginIdleFn = unsafe extern "C" fn(plugin_user_data: *mut c_void);

/// Symbol every backend module exports.
pub const PLUGIN_INIT_ENTRY_POINT: &[u8] = b"plugin_init_entry_point\0";

/// Symbol a backend may export to be ticked directly.
pub const PLUGIN_IDLE_ENTRY_POINT: &[u8] = b"plugin_idle_entry_point\0";

/// Printable form of a symbol constant.
pub(crate) fn symbol_name(symbol: &[u8]) -> String {
    String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol)).into_owned()
}
